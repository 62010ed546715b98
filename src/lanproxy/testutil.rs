use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
    sync::{Mutex, mpsc},
};

use crate::lanproxy::{
    conn::{ConnReader, Connection, Framing, Inbound},
    handler::{ControlChannelHandler, SessionHandler},
    pool::{ConnectionPool, Pooler},
    protocol::{self, Frame},
    tunnel::{Timing, Tunnel},
};

/// Default heartbeat, near-instant backoff.
pub fn fast_timing() -> Timing {
    Timing {
        heartbeat_interval: Duration::from_secs(30),
        reconnect_backoff: Duration::from_millis(10),
        dial_timeout: Duration::from_secs(2),
    }
}

/// Reads exactly one frame; `None` on EOF. Never consumes bytes past it.
pub async fn read_frame<R: AsyncRead + Unpin>(rd: &mut R) -> Option<Frame> {
    let mut len = [0u8; 4];
    match rd.read_exact(&mut len).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return None,
        Err(err) => panic!("read: {err}"),
    }
    let body = u32::from_be_bytes(len) as usize;
    let mut buf = BytesMut::zeroed(4 + body);
    buf[..4].copy_from_slice(&len);
    rd.read_exact(&mut buf[4..]).await.expect("frame body");
    protocol::decode_buf(&mut buf).expect("valid frame")
}

pub async fn write_frame<W: AsyncWrite + Unpin>(wr: &mut W, frame: &Frame) {
    let b = protocol::encode(Some(frame)).expect("encode");
    wr.write_all(&b).await.expect("write");
    wr.flush().await.expect("flush");
}

/// Loopback address nothing listens on.
pub async fn unused_addr() -> String {
    let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = ln.local_addr().expect("addr").to_string();
    drop(ln);
    addr
}

pub struct NoopHandler;

#[async_trait]
impl SessionHandler for NoopHandler {
    async fn on_connected(&self, _conn: &Arc<Connection>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_message(&self, _conn: &Arc<Connection>, _msg: Inbound) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_error(&self, _conn: &Arc<Connection>) {}
}

/// Pool members backed by in-memory streams. The remote end of each member is
/// handed out through [`DuplexPooler::next_remote`].
pub struct DuplexPooler {
    tunnel: Arc<Tunnel>,
    // Serve members with a pooled control handler instead of parking them.
    serve: bool,
    created: AtomicUsize,
    remotes_tx: mpsc::UnboundedSender<DuplexStream>,
    remotes_rx: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    // Read halves are parked here; members are never served.
    readers: std::sync::Mutex<Vec<ConnReader>>,
}

impl DuplexPooler {
    pub fn new(tunnel: Arc<Tunnel>) -> Self {
        let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
        Self {
            tunnel,
            serve: false,
            created: AtomicUsize::new(0),
            remotes_tx,
            remotes_rx: Mutex::new(remotes_rx),
            readers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Members run their receive loop, so relay frames reach them.
    pub fn serving(tunnel: Arc<Tunnel>) -> Self {
        Self {
            serve: true,
            ..Self::new(tunnel)
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub async fn next_remote(&self) -> DuplexStream {
        self.remotes_rx.lock().await.recv().await.expect("member created")
    }
}

#[async_trait]
impl Pooler for DuplexPooler {
    async fn create(&self, pool: &Arc<ConnectionPool>) -> anyhow::Result<Arc<Connection>> {
        let (a, b) = tokio::io::duplex(64 * 1024);
        if self.serve {
            let handler = ControlChannelHandler::pooled(self.tunnel.clone(), Arc::downgrade(pool));
            let (conn, reader) = self.tunnel.attach(
                Box::new(a),
                Framing::Frames,
                "pooled",
                Arc::new(handler),
            );
            tokio::spawn(self.tunnel.serve(conn.clone(), reader));
            self.created.fetch_add(1, Ordering::SeqCst);
            let _ = self.remotes_tx.send(b);
            return Ok(conn);
        }

        let (conn, reader) = self
            .tunnel
            .attach(Box::new(a), Framing::Frames, "pooled", Arc::new(NoopHandler));
        self.readers.lock().expect("readers").push(reader);
        self.created.fetch_add(1, Ordering::SeqCst);
        let _ = self.remotes_tx.send(b);
        Ok(conn)
    }
}

pub struct FailingPooler;

#[async_trait]
impl Pooler for FailingPooler {
    async fn create(&self, _pool: &Arc<ConnectionPool>) -> anyhow::Result<Arc<Connection>> {
        anyhow::bail!("relay unreachable")
    }
}
