use std::{sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::lanproxy::{
    conn::Framing,
    handler::ControlChannelHandler,
    pool::ConnectionPool,
    transport::{BoxedStream, Dialer},
    tunnel::Tunnel,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Keeps exactly one authenticated control connection to the relay host
/// alive until shutdown.
pub struct Supervisor {
    client_key: String,
    relay_addr: String,
    dialer: Arc<dyn Dialer>,
    tunnel: Arc<Tunnel>,
    pool: Arc<ConnectionPool>,
}

impl Supervisor {
    pub fn new(
        client_key: String,
        relay_addr: String,
        dialer: Arc<dyn Dialer>,
        tunnel: Arc<Tunnel>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            client_key,
            relay_addr,
            dialer,
            tunnel,
            pool,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if self.relay_addr.trim().is_empty() {
            anyhow::bail!("supervisor: relay address is required");
        }
        if self.client_key.is_empty() {
            anyhow::bail!("supervisor: client key is required");
        }

        loop {
            let Some(stream) = self.connect(&mut shutdown).await else {
                return Ok(());
            };

            let handler = Arc::new(ControlChannelHandler::primary(
                self.client_key.clone(),
                self.tunnel.clone(),
                Arc::downgrade(&self.pool),
            ));
            let (conn, reader) = self.tunnel.attach(
                stream,
                Framing::Frames,
                format!("control {}", self.relay_addr),
                handler,
            );
            let serve = self.tunnel.serve(conn.clone(), reader);
            tokio::pin!(serve);

            tokio::select! {
                _ = &mut serve => {
                    metrics::counter!("lanproxy_control_reconnects_total").increment(1);
                    tracing::info!(relay = %self.relay_addr, "supervisor: control connection ended; reconnecting");
                }
                _ = shutdown_signalled(&mut shutdown) => {
                    conn.close().await;
                    if tokio::time::timeout(SHUTDOWN_GRACE, serve).await.is_err() {
                        tracing::warn!("supervisor: control connection did not stop in time");
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Dials the relay until it answers, pausing the reconnect backoff between
    /// attempts. `None` once shutdown is signalled.
    async fn connect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<BoxedStream> {
        let backoff = self.tunnel.timing().reconnect_backoff;
        loop {
            if *shutdown.borrow() {
                return None;
            }

            let dial = tokio::select! {
                r = self.dialer.dial(&self.relay_addr) => r,
                _ = shutdown_signalled(shutdown) => return None,
            };
            match dial {
                Ok(st) => {
                    tracing::info!(
                        relay = %self.relay_addr,
                        transport = %self.dialer.name(),
                        "supervisor: relay reached"
                    );
                    return Some(st);
                }
                Err(err) => {
                    tracing::warn!(
                        relay = %self.relay_addr,
                        err = %format!("{err:#}"),
                        backoff = %humantime::format_duration(backoff),
                        "supervisor: dial failed; retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown_signalled(shutdown) => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

/// Resolves once shutdown is requested or its sender is gone.
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
