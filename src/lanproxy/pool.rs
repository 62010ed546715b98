//! Bounded pool of tunnel-side connections to the relay host.
//!
//! Members are either idle (FIFO, ready for the next session) or active (bound
//! to a session). In-flight dials hold a reservation so the capacity is never
//! exceeded even while dialing happens outside the lock.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;

use crate::lanproxy::{
    conn::{ConnId, Connection, Framing},
    handler::ControlChannelHandler,
    transport::Dialer,
    tunnel::Tunnel,
};

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_WARM: usize = 4;

/// Materializes new pool members.
#[async_trait]
pub trait Pooler: Send + Sync {
    async fn create(&self, pool: &Arc<ConnectionPool>) -> anyhow::Result<Arc<Connection>>;
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool exhausted (capacity {capacity})")]
    Exhausted { capacity: usize },
    #[error("create pooled connection: {0:#}")]
    Create(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub active: usize,
    pub dialing: usize,
}

#[derive(Default)]
struct Members {
    idle: VecDeque<Arc<Connection>>,
    active: HashMap<ConnId, Arc<Connection>>,
    dialing: usize,
}

impl Members {
    fn len(&self) -> usize {
        self.idle.len() + self.active.len() + self.dialing
    }

    fn take(&mut self, id: ConnId) -> Option<Arc<Connection>> {
        if let Some(c) = self.active.remove(&id) {
            return Some(c);
        }
        let pos = self.idle.iter().position(|c| c.id() == id)?;
        self.idle.remove(pos)
    }
}

pub struct ConnectionPool {
    capacity: usize,
    pooler: Arc<dyn Pooler>,
    members: Mutex<Members>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new(capacity: usize, pooler: Arc<dyn Pooler>) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            pooler,
            members: Mutex::new(Members::default()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Dials up to `warm` idle members ahead of demand. Stops at the first
    /// failure; returns how many were created.
    pub async fn init(self: &Arc<Self>, warm: usize) -> usize {
        let want = warm.min(self.capacity);
        let mut created = 0;
        while created < want {
            match self.grow(true).await {
                Ok(_) => created += 1,
                Err(err) => {
                    tracing::warn!(err = %err, created, want, "pool: warm-up stopped");
                    break;
                }
            }
        }
        if created > 0 {
            tracing::info!(created, capacity = self.capacity, "pool: warmed up");
        }
        created
    }

    /// Hands out the oldest live idle member, or dials a new one.
    pub async fn acquire(self: &Arc<Self>) -> Result<Arc<Connection>, PoolError> {
        {
            let mut m = self.lock();
            while let Some(c) = m.idle.pop_front() {
                if c.is_active() {
                    m.active.insert(c.id(), c.clone());
                    drop(m);
                    self.publish();
                    tracing::trace!(conn = %c, "pool: reuse");
                    return Ok(c);
                }
                tracing::debug!(conn = %c, "pool: dropping dead idle member");
            }
        }
        self.create().await
    }

    /// Dials a new member straight into the active set.
    pub async fn create(self: &Arc<Self>) -> Result<Arc<Connection>, PoolError> {
        self.grow(false).await
    }

    async fn grow(self: &Arc<Self>, idle: bool) -> Result<Arc<Connection>, PoolError> {
        let slot = self.reserve()?;
        let conn = match self.pooler.create(self).await {
            Ok(c) => c,
            Err(err) => {
                metrics::counter!("lanproxy_pool_dial_failures_total").increment(1);
                return Err(PoolError::Create(err));
            }
        };

        let admitted = slot.finish(|m| {
            if !conn.is_active() {
                return false;
            }
            if idle {
                m.idle.push_back(conn.clone());
            } else {
                m.active.insert(conn.id(), conn.clone());
            }
            true
        });
        self.publish();
        if !admitted {
            return Err(PoolError::Create(anyhow::anyhow!(
                "pool: {conn} closed during setup"
            )));
        }
        tracing::debug!(conn = %conn, idle, "pool: member created");
        Ok(conn)
    }

    fn reserve(&self) -> Result<DialSlot<'_>, PoolError> {
        let mut m = self.lock();
        if m.len() >= self.capacity {
            metrics::counter!("lanproxy_pool_exhausted_total").increment(1);
            return Err(PoolError::Exhausted {
                capacity: self.capacity,
            });
        }
        m.dialing += 1;
        Ok(DialSlot {
            pool: self,
            armed: true,
        })
    }

    /// Returns a member to the idle set without closing it. Closed members and
    /// connections the pool does not know are closed and dropped instead.
    pub async fn release(&self, conn: &Arc<Connection>) {
        let outcome = {
            let mut m = self.lock();
            if m.idle.iter().any(|c| c.id() == conn.id()) {
                return;
            }
            match m.active.remove(&conn.id()) {
                Some(c) if c.is_active() => {
                    m.idle.push_back(c);
                    Ok(())
                }
                Some(_) => Err("closed"),
                None => Err("unknown"),
            }
        };
        self.publish();

        match outcome {
            Ok(()) => tracing::trace!(conn = %conn, "pool: released"),
            Err(why) => {
                tracing::debug!(conn = %conn, why, "pool: release dropped member");
                conn.close().await;
            }
        }
    }

    /// Evicts `conn` from the pool and closes it.
    pub async fn remove(&self, conn: &Arc<Connection>) {
        let known = self.lock().take(conn.id()).is_some();
        self.publish();
        if known {
            tracing::debug!(conn = %conn, "pool: removed");
        }
        conn.close().await;
    }

    pub fn is_active(&self, conn: &Connection) -> bool {
        conn.is_active()
    }

    /// Evicts every member whose connection has died. Returns how many.
    pub async fn sweep(&self) -> usize {
        let dead: Vec<Arc<Connection>> = {
            let mut m = self.lock();
            let mut dead = Vec::new();
            m.idle.retain(|c| {
                let alive = c.is_active();
                if !alive {
                    dead.push(c.clone());
                }
                alive
            });
            m.active.retain(|_, c| {
                let alive = c.is_active();
                if !alive {
                    dead.push(c.clone());
                }
                alive
            });
            dead
        };
        self.publish();

        for c in &dead {
            c.close().await;
        }
        if !dead.is_empty() {
            tracing::debug!(evicted = dead.len(), "pool: sweep");
        }
        dead.len()
    }

    pub fn stats(&self) -> PoolStats {
        let m = self.lock();
        PoolStats {
            capacity: self.capacity,
            idle: m.idle.len(),
            active: m.active.len(),
            dialing: m.dialing,
        }
    }

    fn publish(&self) {
        let s = self.stats();
        metrics::gauge!("lanproxy_pool_idle").set(s.idle as f64);
        metrics::gauge!("lanproxy_pool_active").set(s.active as f64);
    }

    fn lock(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Capacity reservation for one in-flight dial; released on drop.
struct DialSlot<'a> {
    pool: &'a ConnectionPool,
    armed: bool,
}

impl DialSlot<'_> {
    fn finish<R>(mut self, f: impl FnOnce(&mut Members) -> R) -> R {
        let mut m = self.pool.lock();
        m.dialing -= 1;
        self.armed = false;
        f(&mut m)
    }
}

impl Drop for DialSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.lock().dialing -= 1;
        }
    }
}

/// Dials the relay host and attaches an anonymous control handler, so every
/// member answers heartbeats and relays TRANSFER frames on its own.
pub struct RelayPooler {
    relay_addr: String,
    dialer: Arc<dyn Dialer>,
    tunnel: Arc<Tunnel>,
}

impl RelayPooler {
    pub fn new(relay_addr: String, dialer: Arc<dyn Dialer>, tunnel: Arc<Tunnel>) -> Self {
        Self {
            relay_addr,
            dialer,
            tunnel,
        }
    }
}

#[async_trait]
impl Pooler for RelayPooler {
    async fn create(&self, pool: &Arc<ConnectionPool>) -> anyhow::Result<Arc<Connection>> {
        let stream = self
            .dialer
            .dial(&self.relay_addr)
            .await
            .with_context(|| format!("pool: dial relay {} via {}", self.relay_addr, self.dialer.name()))?;
        let handler = Arc::new(ControlChannelHandler::pooled(
            self.tunnel.clone(),
            Arc::downgrade(pool),
        ));
        let (conn, reader) = self.tunnel.attach(
            stream,
            Framing::Frames,
            format!("pool {}", self.relay_addr),
            handler,
        );
        tokio::spawn(self.tunnel.serve(conn.clone(), reader));
        Ok(conn)
    }
}
