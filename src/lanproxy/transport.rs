use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

/// A bidirectional async byte stream.
///
/// Trait objects can only name one non-auto principal trait, so
/// `AsyncRead + AsyncWrite` is folded into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Dial capability: `(address) -> duplex byte stream | failure`.
#[async_trait]
pub trait Dialer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream>;
}

pub mod tcp;
pub mod tls;

/// Builds the dialer used for relay connections: plain TCP, or TCP wrapped in
/// TLS when `tls` is set.
pub fn relay_dialer(
    tls: Option<&tls::TlsOptions>,
    dial_timeout: Duration,
) -> anyhow::Result<Arc<dyn Dialer>> {
    let tcp = tcp::TcpDialer::new(dial_timeout);
    match tls {
        None => Ok(Arc::new(tcp)),
        Some(opts) => Ok(Arc::new(tls::TlsDialer::new(tcp, opts)?)),
    }
}

/// Splits `host:port` (or `[v6]:port`) and returns the host part.
pub fn host_of(addr: &str) -> &str {
    let addr = addr.trim();
    let host = match addr.rsplit_once(':') {
        Some((h, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
