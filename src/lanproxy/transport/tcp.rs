use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::lanproxy::transport::{BoxedStream, Dialer};

pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            timeout
        };
        Self { timeout }
    }

    pub async fn connect(&self, addr: &str) -> anyhow::Result<TcpStream> {
        let c = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("dial {addr}: timed out after {}", humantime::format_duration(self.timeout)))?
            .with_context(|| format!("dial {addr}"))?;
        c.set_nodelay(true)?;
        Ok(c)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream> {
        Ok(Box::new(self.connect(addr).await?))
    }
}
