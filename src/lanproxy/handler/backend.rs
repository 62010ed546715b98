use std::sync::{Arc, Weak};

use anyhow::Context;
use async_trait::async_trait;

use crate::lanproxy::{
    conn::{Connection, Inbound},
    handler::SessionHandler,
    pool::ConnectionPool,
    protocol::Frame,
    tunnel::Tunnel,
};

/// Local-service side of one session: relays the backend socket's bytes into
/// TRANSFER frames on the pooled tunnel connection it is linked to.
pub struct BackendRelayHandler {
    session: String,
    client_key: String,
    tunnel: Arc<Tunnel>,
    pool: Weak<ConnectionPool>,
    // Control connection that delivered the CONNECT request.
    control: Weak<Connection>,
}

impl std::fmt::Debug for BackendRelayHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRelayHandler")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl BackendRelayHandler {
    pub fn new(
        session: String,
        client_key: String,
        tunnel: Arc<Tunnel>,
        pool: Weak<ConnectionPool>,
        control: Weak<Connection>,
    ) -> Self {
        Self {
            session,
            client_key,
            tunnel,
            pool,
            control,
        }
    }

    /// Tells the relay, over the originating control connection, that the
    /// session could not be opened.
    pub async fn conn_failed(&self) -> anyhow::Result<()> {
        let Some(control) = self.control.upgrade() else {
            tracing::debug!(session = %self.session, "backend: control connection already gone");
            return Ok(());
        };
        control
            .write_frame(&Frame::disconnect(&self.session))
            .await
            .with_context(|| format!("backend: report failure of session {}", self.session))
    }

    async fn bind_tunnel(&self, conn: &Arc<Connection>) -> anyhow::Result<()> {
        let pool = self
            .pool
            .upgrade()
            .context("backend: connection pool is shut down")?;
        let tunnel_conn = pool.acquire().await?;
        self.tunnel
            .registry()
            .link(conn.id(), tunnel_conn.id(), &self.session);

        let bind = Frame::connect(format!("{}@{}", self.session, self.client_key));
        if let Err(err) = tunnel_conn.write_frame(&bind).await {
            self.tunnel.registry().unlink(conn.id());
            pool.remove(&tunnel_conn).await;
            return Err(err).context("backend: bind pooled connection");
        }
        tracing::debug!(
            conn = %conn,
            tunnel = %tunnel_conn,
            session = %self.session,
            "backend: session bound"
        );
        Ok(())
    }
}

#[async_trait]
impl SessionHandler for BackendRelayHandler {
    async fn on_connected(&self, conn: &Arc<Connection>) -> anyhow::Result<()> {
        if let Err(err) = self.bind_tunnel(conn).await {
            if let Err(report) = self.conn_failed().await {
                tracing::debug!(session = %self.session, err = %format!("{report:#}"), "backend: failure report lost");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn on_message(&self, conn: &Arc<Connection>, msg: Inbound) -> anyhow::Result<()> {
        let Inbound::Raw(data) = msg else {
            anyhow::bail!("backend: unexpected frame on raw connection");
        };
        let Some(peer) = self.tunnel.registry().peer_of(conn.id()) else {
            tracing::trace!(conn = %conn, bytes = data.len(), "backend: no peer; dropping");
            return Ok(());
        };
        peer.write_frame(&Frame::transfer(&self.session, data))
            .await
            .with_context(|| format!("backend: forward to {peer}"))
    }

    async fn on_error(&self, conn: &Arc<Connection>) {
        let Some(peer) = self.tunnel.registry().unlink(conn.id()) else {
            return;
        };
        tracing::debug!(conn = %conn, peer = %peer, session = %self.session, "backend: session closed locally");

        let Some(pool) = self.pool.upgrade() else {
            peer.close().await;
            return;
        };
        match peer.write_frame(&Frame::disconnect(&self.session)).await {
            Ok(()) => pool.release(&peer).await,
            Err(err) => {
                tracing::debug!(peer = %peer, err = %err, "backend: disconnect not delivered");
                pool.remove(&peer).await;
            }
        }
    }
}
