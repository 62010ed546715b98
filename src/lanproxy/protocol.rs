use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const LEN_SIZE: usize = 4;
const TYPE_SIZE: usize = 1;
const URI_LENGTH_SIZE: usize = 1;
const HEADER_SIZE: usize = TYPE_SIZE + URI_LENGTH_SIZE;

pub const MAX_URI_BYTES: usize = u8::MAX as usize;
/// Upper bound on a declared body length. Anything larger is treated as a
/// protocol violation instead of being buffered.
pub const MAX_FRAME_BYTES: u32 = 1 << 20; // 1 MiB

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("uri too long: {0} bytes")]
    UriTooLong(usize),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u64),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Heartbeat,
    /// Client to server only.
    Auth,
    /// Server to client on the control connection; client to server when
    /// binding a pooled connection to a session.
    Connect,
    Disconnect,
    Transfer,
    Unknown(u8),
}

impl FrameType {
    pub fn code(self) -> u8 {
        match self {
            FrameType::Heartbeat => 0x01,
            FrameType::Auth => 0x02,
            FrameType::Connect => 0x03,
            FrameType::Disconnect => 0x04,
            FrameType::Transfer => 0x05,
            FrameType::Unknown(c) => c,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => FrameType::Heartbeat,
            0x02 => FrameType::Auth,
            0x03 => FrameType::Connect,
            0x04 => FrameType::Disconnect,
            0x05 => FrameType::Transfer,
            c => FrameType::Unknown(c),
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameType::Heartbeat => write!(f, "heartbeat"),
            FrameType::Auth => write!(f, "auth"),
            FrameType::Connect => write!(f, "connect"),
            FrameType::Disconnect => write!(f, "disconnect"),
            FrameType::Transfer => write!(f, "transfer"),
            FrameType::Unknown(c) => write!(f, "unknown(0x{c:02x})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub uri: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameType, uri: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            uri: uri.into(),
            payload: payload.into(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(FrameType::Heartbeat, String::new(), Bytes::new())
    }

    pub fn auth(client_key: &str) -> Self {
        Self::new(FrameType::Auth, client_key, Bytes::new())
    }

    pub fn connect(uri: impl Into<String>) -> Self {
        Self::new(FrameType::Connect, uri, Bytes::new())
    }

    pub fn disconnect(session: &str) -> Self {
        Self::new(FrameType::Disconnect, session, Bytes::new())
    }

    pub fn transfer(session: &str, payload: Bytes) -> Self {
        Self::new(FrameType::Transfer, session, payload)
    }

    /// Size of the frame on the wire, including the length prefix.
    pub fn encoded_len(&self) -> usize {
        LEN_SIZE + HEADER_SIZE + self.uri.len() + self.payload.len()
    }
}

/// Encodes `frame` into a fresh buffer. `None` encodes to nothing.
pub fn encode(frame: Option<&Frame>) -> Result<Bytes, ProtocolError> {
    let Some(frame) = frame else {
        return Ok(Bytes::new());
    };
    let mut out = BytesMut::with_capacity(frame.encoded_len());
    encode_into(frame, &mut out)?;
    Ok(out.freeze())
}

pub fn encode_into(frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let uri = frame.uri.as_bytes();
    if uri.len() > MAX_URI_BYTES {
        return Err(ProtocolError::UriTooLong(uri.len()));
    }

    let body_len = (HEADER_SIZE + uri.len()) as u64 + frame.payload.len() as u64;
    let body_len: u32 = body_len
        .try_into()
        .map_err(|_| ProtocolError::FrameTooLarge(body_len))?;

    dst.reserve(LEN_SIZE + body_len as usize);
    dst.put_u32(body_len);
    dst.put_u8(frame.kind.code());
    dst.put_u8(uri.len() as u8);
    dst.put_slice(uri);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` while the buffer holds less than one whole frame; the
/// caller is expected to read more input and retry. On success the second
/// tuple element is the number of bytes the frame occupied.
pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let Some(body_len) = peek_body_len(buf)? else {
        return Ok(None);
    };
    let n = LEN_SIZE + body_len;
    let frame = parse_body(Bytes::copy_from_slice(&buf[LEN_SIZE..n]))?;
    Ok(Some((frame, n)))
}

/// Streaming variant of [`decode`] that consumes the frame from `buf`.
/// The payload shares the buffer's allocation.
pub fn decode_buf(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(body_len) = peek_body_len(buf)? else {
        return Ok(None);
    };
    let mut frame = buf.split_to(LEN_SIZE + body_len);
    frame.advance(LEN_SIZE);
    parse_body(frame.freeze()).map(Some)
}

fn peek_body_len(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if buf.len() < LEN_SIZE {
        return Ok(None);
    }
    let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if body_len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(body_len as u64));
    }
    if (body_len as usize) < HEADER_SIZE {
        return Err(ProtocolError::Malformed("body shorter than header"));
    }
    let body_len = body_len as usize;
    if buf.len() < LEN_SIZE + body_len {
        return Ok(None);
    }
    Ok(Some(body_len))
}

fn parse_body(mut body: Bytes) -> Result<Frame, ProtocolError> {
    let kind = FrameType::from_code(body.get_u8());
    let uri_len = body.get_u8() as usize;
    if uri_len > body.len() {
        return Err(ProtocolError::Malformed("uri length exceeds body"));
    }
    let uri = body.split_to(uri_len);
    let uri = std::str::from_utf8(&uri)
        .map_err(|_| ProtocolError::Malformed("uri is not valid utf-8"))?
        .to_owned();
    Ok(Frame {
        kind,
        uri,
        payload: body,
    })
}
