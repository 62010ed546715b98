use std::{future::Future, sync::Arc, time::Duration};

use crate::lanproxy::{
    conn::{ConnReader, Connection, Framing, Registry},
    handler::SessionHandler,
    transport::{BoxedStream, Dialer},
};

#[derive(Debug, Clone)]
pub struct Timing {
    /// Heartbeat period. A connection that received nothing for twice this
    /// long is considered dead.
    pub heartbeat_interval: Duration,
    /// Pause after a fatal error on a control connection, and between failed
    /// relay dials.
    pub reconnect_backoff: Duration,
    pub dial_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

impl Timing {
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

/// State shared by every handler: the connection registry, timing knobs and
/// the dialer used to reach local backend services.
pub struct Tunnel {
    registry: Arc<Registry>,
    timing: Timing,
    backend: Arc<dyn Dialer>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("timing", &self.timing)
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    pub fn new(timing: Timing, backend: Arc<dyn Dialer>) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            timing,
            backend,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn backend(&self) -> &Arc<dyn Dialer> {
        &self.backend
    }

    pub fn attach(
        &self,
        stream: BoxedStream,
        framing: Framing,
        label: impl Into<String>,
        handler: Arc<dyn SessionHandler>,
    ) -> (Arc<Connection>, ConnReader) {
        self.registry.register(stream, framing, label, handler)
    }

    /// Receive loop of `conn`; resolves once the connection is torn down and
    /// its handler's error path has returned.
    pub fn serve(
        &self,
        conn: Arc<Connection>,
        reader: ConnReader,
    ) -> impl Future<Output = ()> + Send + use<> {
        conn.listen(self.registry.clone(), reader)
    }
}
