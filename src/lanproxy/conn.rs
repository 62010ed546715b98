//! Linked connections and the registry that pairs them.
//!
//! A [`Connection`] owns one duplex stream: the write half sits behind an async
//! mutex so any task may write whole frames, and the read half is driven by
//! [`Connection::listen`]. Peers are not referenced directly; the
//! [`Registry`] keeps connections by id and links two ids into a relay pair.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::watch,
    time::Instant,
};

use crate::lanproxy::{
    handler::SessionHandler,
    protocol::{self, Frame, FrameType, ProtocolError},
    transport::BoxedStream,
};

const READ_CHUNK: usize = 32 * 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub type ConnId = u64;
pub type ConnReader = ReadHalf<BoxedStream>;

/// How the receive loop interprets incoming bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Tunnel side: length-prefixed protocol frames.
    Frames,
    /// Backend side: the local service's own byte stream.
    Raw,
}

#[derive(Debug)]
pub enum Inbound {
    Frame(Frame),
    Raw(Bytes),
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
enum Ended {
    Eof,
    Closed,
    Io(std::io::Error),
    Protocol(ProtocolError),
}

pub struct Connection {
    id: ConnId,
    framing: Framing,
    label: String,
    handler: Arc<dyn SessionHandler>,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    started: Instant,
    // Millis since `started` at which the last frame (or raw chunk) arrived.
    last_read_ms: AtomicU64,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("framing", &self.framing)
            .field("label", &self.label)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}", self.id, self.label)
    }
}

impl Connection {
    fn new(
        id: ConnId,
        framing: Framing,
        label: String,
        handler: Arc<dyn SessionHandler>,
        writer: WriteHalf<BoxedStream>,
    ) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            id,
            framing,
            label,
            handler,
            writer: tokio::sync::Mutex::new(writer),
            started: Instant::now(),
            last_read_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_tx,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Time since the last inbound frame, or since creation if none arrived yet.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_read_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_read_ms.store(now, Ordering::Relaxed);
    }

    pub async fn write_frame(&self, frame: &Frame) -> Result<(), ConnError> {
        let b = protocol::encode(Some(frame))?;
        self.write_raw(&b).await
    }

    /// Writes `data` in full under the write lock. Concurrent writers never
    /// interleave partial buffers.
    pub async fn write_raw(&self, data: &[u8]) -> Result<(), ConnError> {
        if !self.is_active() {
            return Err(ConnError::Closed);
        }
        let mut w = self.writer.lock().await;
        w.write_all(data).await?;
        w.flush().await?;
        metrics::counter!("lanproxy_bytes_written_total").increment(data.len() as u64);
        Ok(())
    }

    /// Marks the connection inactive, stops its receive loop and shuts the
    /// write half down. Only the first call has any effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_tx.send_replace(true);
        let shutdown = async {
            let mut w = self.writer.lock().await;
            let _ = w.shutdown().await;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await.is_err() {
            tracing::debug!(conn = %self, "conn: shutdown timed out");
        }
    }

    /// Runs the connection to completion.
    ///
    /// Calls the handler's `on_connected` once, reads until EOF, error,
    /// protocol violation or [`close`](Self::close), then deregisters and
    /// calls `on_error` once.
    pub async fn listen(self: Arc<Self>, registry: Arc<Registry>, mut reader: ConnReader) {
        let handler = self.handler.clone();
        match handler.on_connected(&self).await {
            Ok(()) => {
                let ended = self.read_loop(&mut reader).await;
                match &ended {
                    Ended::Eof | Ended::Closed => {
                        tracing::debug!(conn = %self, reason = ?ended, "conn: receive loop ended")
                    }
                    Ended::Io(err) => tracing::debug!(conn = %self, err = %err, "conn: read failed"),
                    Ended::Protocol(err) => {
                        tracing::warn!(conn = %self, err = %err, "conn: protocol violation")
                    }
                }
            }
            Err(err) => {
                tracing::warn!(conn = %self, err = %format!("{err:#}"), "conn: setup failed");
            }
        }

        drop(reader);
        self.close().await;
        registry.deregister(self.id);
        handler.on_error(&self).await;
    }

    async fn read_loop(self: &Arc<Self>, reader: &mut ConnReader) -> Ended {
        let mut closed = self.close_tx.subscribe();
        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        loop {
            if *closed.borrow_and_update() {
                return Ended::Closed;
            }
            buf.reserve(READ_CHUNK);

            let res = tokio::select! {
                _ = closed.changed() => None,
                r = reader.read_buf(&mut buf) => Some(r),
            };
            match res {
                None => continue,
                Some(Ok(0)) => return Ended::Eof,
                Some(Err(err)) => return Ended::Io(err),
                Some(Ok(n)) => {
                    metrics::counter!("lanproxy_bytes_read_total").increment(n as u64);
                }
            }

            match self.framing {
                Framing::Raw => {
                    self.touch();
                    self.dispatch(Inbound::Raw(buf.split().freeze())).await;
                }
                Framing::Frames => loop {
                    match protocol::decode_buf(&mut buf) {
                        Ok(Some(frame)) => {
                            self.touch();
                            self.dispatch(Inbound::Frame(frame)).await;
                        }
                        Ok(None) => break,
                        Err(err) => return Ended::Protocol(err),
                    }
                },
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, msg: Inbound) {
        // A backend dial can take a while; keep it off the receive loop.
        if matches!(&msg, Inbound::Frame(f) if f.kind == FrameType::Connect) {
            let conn = self.clone();
            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Err(err) = handler.on_message(&conn, msg).await {
                    tracing::warn!(conn = %conn, err = %format!("{err:#}"), "conn: connect handling failed");
                }
            });
            return;
        }

        if let Err(err) = self.handler.on_message(self, msg).await {
            tracing::debug!(conn = %self, err = %format!("{err:#}"), "conn: message handling failed");
        }
    }
}

/// Live connections by id, plus the peer links between them.
pub struct Registry {
    seq: AtomicU64,
    conns: DashMap<ConnId, Arc<Connection>>,
    links: Mutex<HashMap<ConnId, Link>>,
}

/// One side of a relay pair and the session it carries.
#[derive(Debug)]
struct Link {
    peer: ConnId,
    session: Arc<str>,
}

impl Link {
    fn carries(&self, session: &str) -> bool {
        session.is_empty() || *self.session == *session
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("conns", &self.conns.len())
            .finish_non_exhaustive()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(1),
            conns: DashMap::new(),
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Wraps `stream` into a registered connection. The caller drives the
    /// returned read half through [`Connection::listen`].
    pub fn register(
        &self,
        stream: BoxedStream,
        framing: Framing,
        label: impl Into<String>,
        handler: Arc<dyn SessionHandler>,
    ) -> (Arc<Connection>, ConnReader) {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(Connection::new(id, framing, label.into(), handler, writer));
        self.conns.insert(id, conn.clone());
        metrics::gauge!("lanproxy_connections").set(self.conns.len() as f64);
        (conn, reader)
    }

    pub fn deregister(&self, id: ConnId) {
        self.conns.remove(&id);
        metrics::gauge!("lanproxy_connections").set(self.conns.len() as f64);
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.conns.get(&id).map(|c| c.value().clone())
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn connections(&self, framing: Framing) -> Vec<Arc<Connection>> {
        self.conns
            .iter()
            .filter(|c| c.value().framing() == framing)
            .map(|c| c.value().clone())
            .collect()
    }

    /// Pairs `a` and `b` for `session`, replacing any earlier link either
    /// side had.
    pub fn link(&self, a: ConnId, b: ConnId, session: &str) {
        let session: Arc<str> = Arc::from(session);
        let mut links = self.links();
        for id in [a, b] {
            if let Some(old) = links.remove(&id) {
                links.remove(&old.peer);
            }
        }
        links.insert(a, Link { peer: b, session: session.clone() });
        links.insert(b, Link { peer: a, session });
    }

    pub fn peer_of(&self, id: ConnId) -> Option<Arc<Connection>> {
        let peer = self.links().get(&id)?.peer;
        self.get(peer)
    }

    /// Peer of `id` if the link carries `session`. An empty `session`
    /// matches whatever session the link carries.
    pub fn session_peer(&self, id: ConnId, session: &str) -> Option<Arc<Connection>> {
        let peer = {
            let links = self.links();
            let link = links.get(&id)?;
            if !link.carries(session) {
                return None;
            }
            link.peer
        };
        self.get(peer)
    }

    /// Severs the link of `id` in both directions and returns the former
    /// peer if it is still registered. Severing an unlinked id is a no-op.
    pub fn unlink(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.unlink_if(id, |_| true)
    }

    /// Like [`unlink`](Self::unlink), but only when the link carries
    /// `session` (an empty `session` matches any).
    pub fn unlink_session(&self, id: ConnId, session: &str) -> Option<Arc<Connection>> {
        self.unlink_if(id, |link| link.carries(session))
    }

    fn unlink_if(&self, id: ConnId, pred: impl FnOnce(&Link) -> bool) -> Option<Arc<Connection>> {
        let peer = {
            let mut links = self.links();
            if !pred(links.get(&id)?) {
                return None;
            }
            let peer = links.remove(&id)?.peer;
            if links.get(&peer).is_some_and(|l| l.peer == id) {
                links.remove(&peer);
            }
            peer
        };
        self.get(peer)
    }

    fn links(&self) -> MutexGuard<'_, HashMap<ConnId, Link>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::{io::AsyncWriteExt, sync::Notify};

    use super::*;
    use crate::lanproxy::testutil::{NoopHandler, read_frame};

    #[derive(Default)]
    struct Recorder {
        connected: AtomicUsize,
        errors: AtomicUsize,
        seen: Mutex<Vec<String>>,
        release_connect: Notify,
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionHandler for Recorder {
        async fn on_connected(&self, _conn: &Arc<Connection>) -> anyhow::Result<()> {
            self.connected.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_message(&self, _conn: &Arc<Connection>, msg: Inbound) -> anyhow::Result<()> {
            match msg {
                Inbound::Frame(f) if f.kind == FrameType::Connect => {
                    self.release_connect.notified().await;
                    self.seen.lock().unwrap().push(format!("connect:{}", f.uri));
                }
                Inbound::Frame(f) => self.seen.lock().unwrap().push(format!("{}:{}", f.kind, f.uri)),
                Inbound::Raw(b) => self
                    .seen
                    .lock()
                    .unwrap()
                    .push(format!("raw:{}", String::from_utf8_lossy(&b))),
            }
            Ok(())
        }

        async fn on_error(&self, _conn: &Arc<Connection>) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn duplex_conn(
        registry: &Registry,
        framing: Framing,
        handler: Arc<dyn SessionHandler>,
    ) -> (Arc<Connection>, ConnReader, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (conn, reader) = registry.register(Box::new(a), framing, "test", handler);
        (conn, reader, b)
    }

    #[tokio::test]
    async fn listen_reports_success_and_error_once() {
        let registry = Arc::new(Registry::new());
        let rec = Arc::new(Recorder::default());
        let (conn, reader, mut remote) = duplex_conn(&registry, Framing::Frames, rec.clone());
        let task = tokio::spawn(conn.clone().listen(registry.clone(), reader));

        let b = protocol::encode(Some(&Frame::disconnect("s1"))).unwrap();
        // Split the frame across two writes.
        remote.write_all(&b[..3]).await.unwrap();
        remote.flush().await.unwrap();
        remote.write_all(&b[3..]).await.unwrap();
        remote.shutdown().await.unwrap();

        task.await.unwrap();
        assert_eq!(rec.connected.load(Ordering::SeqCst), 1);
        assert_eq!(rec.errors.load(Ordering::SeqCst), 1);
        assert_eq!(rec.seen(), vec!["disconnect:s1".to_string()]);
        assert!(!conn.is_active());
        assert!(registry.get(conn.id()).is_none());
    }

    #[tokio::test]
    async fn connect_does_not_block_later_frames() {
        let registry = Arc::new(Registry::new());
        let rec = Arc::new(Recorder::default());
        let (conn, reader, mut remote) = duplex_conn(&registry, Framing::Frames, rec.clone());
        let task = tokio::spawn(conn.clone().listen(registry.clone(), reader));

        let mut out = BytesMut::new();
        protocol::encode_into(&Frame::new(FrameType::Connect, "s1", Bytes::from_static(b"x")), &mut out)
            .unwrap();
        protocol::encode_into(&Frame::transfer("s1", Bytes::from_static(b"d")), &mut out).unwrap();
        remote.write_all(&out).await.unwrap();

        // The transfer is handled while the connect is still parked.
        for _ in 0..100 {
            if !rec.seen().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rec.seen(), vec!["transfer:s1".to_string()]);

        rec.release_connect.notify_one();
        for _ in 0..100 {
            if rec.seen().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rec.seen()[1], "connect:s1");

        conn.close().await;
        task.await.unwrap();
        assert_eq!(rec.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn raw_connections_deliver_bytes_unframed() {
        let registry = Arc::new(Registry::new());
        let rec = Arc::new(Recorder::default());
        let (conn, reader, mut remote) = duplex_conn(&registry, Framing::Raw, rec.clone());
        let task = tokio::spawn(conn.clone().listen(registry.clone(), reader));

        remote.write_all(b"GET / HTTP/1.0\r\n").await.unwrap();
        remote.shutdown().await.unwrap();
        task.await.unwrap();

        assert_eq!(rec.seen().concat(), "raw:GET / HTTP/1.0\r\n");
    }

    #[tokio::test]
    async fn oversized_frame_terminates_the_connection() {
        let registry = Arc::new(Registry::new());
        let rec = Arc::new(Recorder::default());
        let (conn, reader, mut remote) = duplex_conn(&registry, Framing::Frames, rec.clone());
        let task = tokio::spawn(conn.clone().listen(registry.clone(), reader));

        remote
            .write_all(&(protocol::MAX_FRAME_BYTES + 1).to_be_bytes())
            .await
            .unwrap();
        task.await.unwrap();

        assert!(rec.seen().is_empty());
        assert_eq!(rec.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_after_close_fails_and_close_is_idempotent() {
        let registry = Registry::new();
        let (conn, _reader, mut remote) = duplex_conn(&registry, Framing::Frames, Arc::new(NoopHandler));

        conn.write_frame(&Frame::heartbeat()).await.unwrap();
        assert_eq!(read_frame(&mut remote).await.unwrap(), Frame::heartbeat());

        conn.close().await;
        conn.close().await;
        assert!(matches!(conn.write_frame(&Frame::heartbeat()).await, Err(ConnError::Closed)));
        assert!(read_frame(&mut remote).await.is_none());
    }

    #[tokio::test]
    async fn unlink_is_symmetric_and_idempotent() {
        let registry = Registry::new();
        let (a, _ra, _a_remote) = duplex_conn(&registry, Framing::Frames, Arc::new(NoopHandler));
        let (b, _rb, _b_remote) = duplex_conn(&registry, Framing::Raw, Arc::new(NoopHandler));

        registry.link(a.id(), b.id(), "s1");
        assert_eq!(registry.peer_of(a.id()).unwrap().id(), b.id());
        assert_eq!(registry.peer_of(b.id()).unwrap().id(), a.id());

        let peer = registry.unlink(b.id()).expect("linked");
        assert_eq!(peer.id(), a.id());
        assert!(registry.peer_of(a.id()).is_none());
        assert!(registry.peer_of(b.id()).is_none());

        assert!(registry.unlink(a.id()).is_none());
        assert!(registry.unlink(b.id()).is_none());
    }

    #[tokio::test]
    async fn relinking_drops_stale_pairs() {
        let registry = Registry::new();
        let (a, _ra, _x) = duplex_conn(&registry, Framing::Raw, Arc::new(NoopHandler));
        let (b, _rb, _y) = duplex_conn(&registry, Framing::Frames, Arc::new(NoopHandler));
        let (c, _rc, _z) = duplex_conn(&registry, Framing::Frames, Arc::new(NoopHandler));

        registry.link(a.id(), b.id(), "s1");
        registry.link(a.id(), c.id(), "s2");
        assert!(registry.peer_of(b.id()).is_none());
        assert_eq!(registry.peer_of(a.id()).unwrap().id(), c.id());
        assert_eq!(registry.connections(Framing::Frames).len(), 2);
    }

    #[tokio::test]
    async fn links_only_answer_for_their_own_session() {
        let registry = Registry::new();
        let (pooled, _rp, _x) = duplex_conn(&registry, Framing::Frames, Arc::new(NoopHandler));
        let (backend, _rb, _y) = duplex_conn(&registry, Framing::Raw, Arc::new(NoopHandler));

        registry.link(backend.id(), pooled.id(), "s2");
        assert!(registry.session_peer(pooled.id(), "s1").is_none());
        assert_eq!(registry.session_peer(pooled.id(), "s2").unwrap().id(), backend.id());
        assert_eq!(registry.session_peer(pooled.id(), "").unwrap().id(), backend.id());

        assert!(registry.unlink_session(pooled.id(), "s1").is_none());
        assert_eq!(registry.peer_of(backend.id()).unwrap().id(), pooled.id());

        let peer = registry.unlink_session(pooled.id(), "s2").expect("linked");
        assert_eq!(peer.id(), backend.id());
        assert!(registry.peer_of(backend.id()).is_none());
    }
}
