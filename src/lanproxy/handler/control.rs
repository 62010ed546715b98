use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::lanproxy::{
    conn::{Connection, Framing, Inbound},
    handler::{BackendRelayHandler, SessionHandler},
    pool::ConnectionPool,
    protocol::{Frame, FrameType},
    tunnel::Tunnel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Connecting,
    Authenticating,
    Active,
    Closing,
}

/// Tunnel-side handler.
///
/// With a client key it drives the primary control connection: it
/// authenticates, heartbeats and turns CONNECT requests into backend
/// sessions. Without one it serves a pooled connection that carries a single
/// session's TRANSFER frames at a time.
pub struct ControlChannelHandler {
    client_key: Option<String>,
    tunnel: Arc<Tunnel>,
    pool: Weak<ConnectionPool>,
    state: Mutex<ControlState>,
    heartbeat_stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for ControlChannelHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannelHandler")
            .field("client_key", &self.client_key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ControlChannelHandler {
    pub fn primary(client_key: String, tunnel: Arc<Tunnel>, pool: Weak<ConnectionPool>) -> Self {
        let client_key = Some(client_key).filter(|k| !k.is_empty());
        Self::new(client_key, tunnel, pool)
    }

    pub fn pooled(tunnel: Arc<Tunnel>, pool: Weak<ConnectionPool>) -> Self {
        Self::new(None, tunnel, pool)
    }

    fn new(client_key: Option<String>, tunnel: Arc<Tunnel>, pool: Weak<ConnectionPool>) -> Self {
        Self {
            client_key,
            tunnel,
            pool,
            state: Mutex::new(ControlState::Connecting),
            heartbeat_stop: Mutex::new(None),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.client_key.is_none()
    }

    pub fn state(&self) -> ControlState {
        *lock(&self.state)
    }

    fn set_state(&self, conn: &Connection, next: ControlState) {
        let prev = std::mem::replace(&mut *lock(&self.state), next);
        if prev != next {
            tracing::trace!(conn = %conn, from = ?prev, to = ?next, "control: state");
        }
    }

    fn start_heartbeat(&self, conn: &Arc<Connection>) {
        let (tx, rx) = oneshot::channel();
        if let Some(old) = lock(&self.heartbeat_stop).replace(tx) {
            let _ = old.send(());
        }
        let timing = self.tunnel.timing();
        tokio::spawn(heartbeat(
            conn.clone(),
            timing.heartbeat_interval,
            timing.liveness_timeout(),
            rx,
        ));
    }

    fn stop_heartbeat(&self) {
        if let Some(tx) = lock(&self.heartbeat_stop).take() {
            let _ = tx.send(());
        }
    }

    async fn open_session(&self, conn: &Arc<Connection>, frame: Frame) -> anyhow::Result<()> {
        let session = frame.uri;
        let addr = String::from_utf8_lossy(&frame.payload).trim().to_string();
        tracing::info!(conn = %conn, session = %session, backend = %addr, "control: connect request");
        metrics::counter!("lanproxy_sessions_total").increment(1);

        let relay = BackendRelayHandler::new(
            session.clone(),
            self.client_key.clone().unwrap_or_default(),
            self.tunnel.clone(),
            self.pool.clone(),
            Arc::downgrade(conn),
        );

        let stream = match self.tunnel.backend().dial(&addr).await {
            Ok(st) => st,
            Err(err) => {
                tracing::warn!(
                    session = %session,
                    backend = %addr,
                    err = %format!("{err:#}"),
                    "control: backend dial failed"
                );
                metrics::counter!("lanproxy_backend_dial_failures_total").increment(1);
                return relay.conn_failed().await;
            }
        };

        let (backend, reader) = self.tunnel.attach(
            stream,
            Framing::Raw,
            format!("backend {addr} session {session}"),
            Arc::new(relay),
        );
        tokio::spawn(self.tunnel.serve(backend, reader));
        Ok(())
    }

    async fn disconnect(&self, conn: &Arc<Connection>, session: &str) {
        let Some(peer) = self.tunnel.registry().unlink_session(conn.id(), session) else {
            tracing::trace!(conn = %conn, session = %session, "control: disconnect for unbound session");
            return;
        };
        tracing::debug!(conn = %conn, peer = %peer, session = %session, "control: session closed by relay");
        peer.close().await;
        if self.is_anonymous() {
            if let Some(pool) = self.pool.upgrade() {
                pool.release(conn).await;
            }
        }
    }
}

#[async_trait]
impl SessionHandler for ControlChannelHandler {
    async fn on_connected(&self, conn: &Arc<Connection>) -> anyhow::Result<()> {
        if let Some(key) = &self.client_key {
            self.set_state(conn, ControlState::Authenticating);
            conn.write_frame(&Frame::auth(key))
                .await
                .context("control: send auth")?;
            tracing::info!(conn = %conn, client_key = %key, "control: connected");
        } else {
            tracing::debug!(conn = %conn, "control: pooled connection ready");
        }
        self.set_state(conn, ControlState::Active);
        self.start_heartbeat(conn);
        Ok(())
    }

    async fn on_message(&self, conn: &Arc<Connection>, msg: Inbound) -> anyhow::Result<()> {
        let Inbound::Frame(frame) = msg else {
            anyhow::bail!("control: unexpected raw payload");
        };

        match frame.kind {
            FrameType::Connect => self.open_session(conn, frame).await,
            FrameType::Transfer => {
                let Some(peer) = self.tunnel.registry().session_peer(conn.id(), &frame.uri) else {
                    tracing::trace!(
                        conn = %conn,
                        session = %frame.uri,
                        bytes = frame.payload.len(),
                        "control: transfer for unbound session; dropping"
                    );
                    return Ok(());
                };
                peer.write_raw(&frame.payload)
                    .await
                    .with_context(|| format!("control: forward to {peer}"))
            }
            FrameType::Disconnect => {
                self.disconnect(conn, &frame.uri).await;
                Ok(())
            }
            FrameType::Heartbeat | FrameType::Auth | FrameType::Unknown(_) => {
                tracing::trace!(conn = %conn, kind = %frame.kind, "control: ignored frame");
                Ok(())
            }
        }
    }

    async fn on_error(&self, conn: &Arc<Connection>) {
        self.set_state(conn, ControlState::Closing);
        self.stop_heartbeat();

        let registry = self.tunnel.registry();
        if let Some(peer) = registry.unlink(conn.id()) {
            peer.close().await;
        }

        match &self.client_key {
            None => {
                if let Some(pool) = self.pool.upgrade() {
                    pool.remove(conn).await;
                }
                tracing::debug!(conn = %conn, "control: pooled connection lost");
            }
            Some(key) => {
                // Sessions cannot outlive the control connection that opened them.
                let backends = registry.connections(Framing::Raw);
                for b in &backends {
                    b.close().await;
                }
                tracing::warn!(
                    conn = %conn,
                    client_key = %key,
                    closed_sessions = backends.len(),
                    "control: connection lost"
                );
            }
        }

        tokio::time::sleep(self.tunnel.timing().reconnect_backoff).await;
    }
}

async fn heartbeat(
    conn: Arc<Connection>,
    interval: Duration,
    timeout: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let idle = conn.idle_for();
        if idle >= timeout {
            tracing::warn!(
                conn = %conn,
                idle = %humantime::format_duration(idle),
                "control: relay timed out; closing"
            );
            conn.close().await;
            return;
        }

        if let Err(err) = conn.write_frame(&Frame::heartbeat()).await {
            tracing::debug!(conn = %conn, err = %err, "control: heartbeat failed");
            return;
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
