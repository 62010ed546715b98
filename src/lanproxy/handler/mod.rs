//! Session handlers: the per-connection role attached to every [`Connection`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::lanproxy::conn::{Connection, Inbound};

pub mod backend;
pub mod control;

pub use backend::BackendRelayHandler;
pub use control::ControlChannelHandler;

/// Callbacks driven by a connection's receive loop.
///
/// `on_connected` runs exactly once before the first read. `on_message` runs on
/// the receive loop for every inbound message, except CONNECT frames which are
/// dispatched on their own task. `on_error` runs exactly once after the loop
/// has stopped, whatever the reason.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    async fn on_connected(&self, conn: &Arc<Connection>) -> anyhow::Result<()>;
    async fn on_message(&self, conn: &Arc<Connection>, msg: Inbound) -> anyhow::Result<()>;
    async fn on_error(&self, conn: &Arc<Connection>);
}
