//! Hole-punch negotiation messages
//!
//! Custom binary framing carried over a signaling stream. Every message
//! starts with a type byte and is self-delimiting:
//!
//! ```text
//! Request  0x01 | str initiator_id | list initiator_addrs | str responder_id
//! Connect  0x02 | list initiator_addrs | list responder_addrs | nonce[16]
//! Sync     0x03 | nonce[16]
//! Response 0x04 | u8 success | nonce[16] | str error
//!
//! str  = u8 length | UTF-8 bytes (at most 255)
//! list = u8 count (at most 16) | str * count
//! ```

use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Nonce length in bytes
pub const NONCE_LEN: usize = 16;

/// Maximum entries in an address list
pub const MAX_ADDRESSES: usize = 16;

/// Maximum encoded length of one string field
pub const MAX_FIELD_LEN: usize = 255;

const TYPE_REQUEST: u8 = 0x01;
const TYPE_CONNECT: u8 = 0x02;
const TYPE_SYNC: u8 = 0x03;
const TYPE_RESPONSE: u8 = 0x04;

/// Negotiation message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HolePunchMessage {
    /// Ask the responder to initiate a punch toward us (reverse connect)
    Request {
        /// Requesting peer
        initiator_id: String,
        /// Addresses the responder should dial
        initiator_addrs: Vec<String>,
        /// Peer expected to handle the request
        responder_id: String,
    },

    /// Address exchange
    Connect {
        /// Initiator's observed addresses
        initiator_addrs: Vec<String>,
        /// Responder's observed addresses (empty in the first Connect)
        responder_addrs: Vec<String>,
        /// Session nonce
        nonce: Vec<u8>,
    },

    /// Timing rendezvous
    Sync {
        /// Session nonce
        nonce: Vec<u8>,
    },

    /// Accept or refuse a request
    Response {
        /// Whether the peer accepted
        success: bool,
        /// Session nonce
        nonce: Vec<u8>,
        /// Reason for a refusal, empty on success
        error: String,
    },
}

/// Wire codec error
#[derive(Debug, Error)]
pub enum WireError {
    /// Address list longer than 16 entries
    #[error("too many addresses: {0} (max {MAX_ADDRESSES})")]
    TooManyAddresses(usize),

    /// String field longer than 255 bytes
    #[error("field too long: {0} bytes (max {MAX_FIELD_LEN})")]
    FieldTooLong(usize),

    /// Nonce is not exactly 16 bytes
    #[error("invalid nonce length: {0} (expected {NONCE_LEN})")]
    InvalidNonce(usize),

    /// Unknown message type byte
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    /// Message ends before its last field
    #[error("truncated message")]
    Truncated,

    /// Bytes left over after a complete message
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// String field is not UTF-8
    #[error("field is not valid UTF-8")]
    InvalidUtf8,

    /// Success flag other than 0 or 1
    #[error("invalid success flag {0}")]
    InvalidFlag(u8),

    /// Stream error
    #[error("stream error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(err)
        }
    }
}

/// Fresh random session nonce
#[must_use]
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

impl HolePunchMessage {
    /// Message type name for logs
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Request { .. } => "Request",
            Self::Connect { .. } => "Connect",
            Self::Sync { .. } => "Sync",
            Self::Response { .. } => "Response",
        }
    }

    /// Nonce carried by the message, if any
    #[must_use]
    pub fn nonce(&self) -> Option<&[u8]> {
        match self {
            Self::Request { .. } => None,
            Self::Connect { nonce, .. } | Self::Sync { nonce } | Self::Response { nonce, .. } => {
                Some(nonce.as_slice())
            }
        }
    }

    /// Build a Response, truncating `error` to 255 bytes on a char boundary
    #[must_use]
    pub fn response(success: bool, nonce: &[u8], error: &str) -> Self {
        let mut end = error.len().min(MAX_FIELD_LEN);
        while !error.is_char_boundary(end) {
            end -= 1;
        }
        Self::Response {
            success,
            nonce: nonce.to_vec(),
            error: error[..end].to_string(),
        }
    }

    /// Encode to bytes
    ///
    /// # Errors
    ///
    /// Returns `WireError::TooManyAddresses`, `WireError::FieldTooLong` or
    /// `WireError::InvalidNonce` when a field violates the format limits.
    /// Nothing is truncated.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(64);
        match self {
            Self::Request {
                initiator_id,
                initiator_addrs,
                responder_id,
            } => {
                out.push(TYPE_REQUEST);
                put_str(&mut out, initiator_id)?;
                put_list(&mut out, initiator_addrs)?;
                put_str(&mut out, responder_id)?;
            }
            Self::Connect {
                initiator_addrs,
                responder_addrs,
                nonce,
            } => {
                out.push(TYPE_CONNECT);
                put_list(&mut out, initiator_addrs)?;
                put_list(&mut out, responder_addrs)?;
                put_nonce(&mut out, nonce)?;
            }
            Self::Sync { nonce } => {
                out.push(TYPE_SYNC);
                put_nonce(&mut out, nonce)?;
            }
            Self::Response {
                success,
                nonce,
                error,
            } => {
                out.push(TYPE_RESPONSE);
                out.push(u8::from(*success));
                put_nonce(&mut out, nonce)?;
                put_str(&mut out, error)?;
            }
        }
        Ok(out)
    }

    /// Decode exactly one message from `bytes`
    ///
    /// # Errors
    ///
    /// Returns `WireError` on unknown type, truncation, trailing bytes, an
    /// oversized address list, invalid UTF-8 or a bad success flag.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader { buf: bytes };
        let msg = match r.u8()? {
            TYPE_REQUEST => Self::Request {
                initiator_id: r.str()?,
                initiator_addrs: r.list()?,
                responder_id: r.str()?,
            },
            TYPE_CONNECT => Self::Connect {
                initiator_addrs: r.list()?,
                responder_addrs: r.list()?,
                nonce: r.nonce()?,
            },
            TYPE_SYNC => Self::Sync { nonce: r.nonce()? },
            TYPE_RESPONSE => {
                let success = match r.u8()? {
                    0 => false,
                    1 => true,
                    flag => return Err(WireError::InvalidFlag(flag)),
                };
                Self::Response {
                    success,
                    nonce: r.nonce()?,
                    error: r.str()?,
                }
            }
            other => return Err(WireError::UnknownType(other)),
        };
        if !r.buf.is_empty() {
            return Err(WireError::TrailingBytes(r.buf.len()));
        }
        Ok(msg)
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), WireError> {
    let len = u8::try_from(s.len()).map_err(|_| WireError::FieldTooLong(s.len()))?;
    out.push(len);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_list(out: &mut Vec<u8>, items: &[String]) -> Result<(), WireError> {
    if items.len() > MAX_ADDRESSES {
        return Err(WireError::TooManyAddresses(items.len()));
    }
    out.push(items.len() as u8);
    for item in items {
        put_str(out, item)?;
    }
    Ok(())
}

fn put_nonce(out: &mut Vec<u8>, nonce: &[u8]) -> Result<(), WireError> {
    if nonce.len() != NONCE_LEN {
        return Err(WireError::InvalidNonce(nonce.len()));
    }
    out.extend_from_slice(nonce);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn str(&mut self) -> Result<String, WireError> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    fn list(&mut self) -> Result<Vec<String>, WireError> {
        let count = self.u8()? as usize;
        if count > MAX_ADDRESSES {
            return Err(WireError::TooManyAddresses(count));
        }
        (0..count).map(|_| self.str()).collect()
    }

    fn nonce(&mut self) -> Result<Vec<u8>, WireError> {
        Ok(self.take(NONCE_LEN)?.to_vec())
    }
}

/// Write one message and flush
///
/// # Errors
///
/// Returns `WireError` if encoding or the write fails.
pub async fn write_message<W>(writer: &mut W, msg: &HolePunchMessage) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = msg.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message
///
/// Fields are read by structure until the message is complete, so nothing
/// past the message is consumed from the stream.
///
/// # Errors
///
/// Returns `WireError::Truncated` if the stream ends mid-message and the
/// decode errors of [`HolePunchMessage::decode`].
pub async fn read_message<R>(reader: &mut R) -> Result<HolePunchMessage, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let msg_type = reader.read_u8().await?;
    let mut raw = vec![msg_type];
    match msg_type {
        TYPE_REQUEST => {
            read_str(reader, &mut raw).await?;
            read_list(reader, &mut raw).await?;
            read_str(reader, &mut raw).await?;
        }
        TYPE_CONNECT => {
            read_list(reader, &mut raw).await?;
            read_list(reader, &mut raw).await?;
            read_exact(reader, &mut raw, NONCE_LEN).await?;
        }
        TYPE_SYNC => read_exact(reader, &mut raw, NONCE_LEN).await?,
        TYPE_RESPONSE => {
            read_exact(reader, &mut raw, 1 + NONCE_LEN).await?;
            read_str(reader, &mut raw).await?;
        }
        other => return Err(WireError::UnknownType(other)),
    }
    HolePunchMessage::decode(&raw)
}

async fn read_exact<R>(reader: &mut R, raw: &mut Vec<u8>, n: usize) -> Result<(), WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let start = raw.len();
    raw.resize(start + n, 0);
    reader.read_exact(&mut raw[start..]).await?;
    Ok(())
}

async fn read_str<R>(reader: &mut R, raw: &mut Vec<u8>) -> Result<(), WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u8().await?;
    raw.push(len);
    read_exact(reader, raw, len as usize).await
}

async fn read_list<R>(reader: &mut R, raw: &mut Vec<u8>) -> Result<(), WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let count = reader.read_u8().await?;
    if count as usize > MAX_ADDRESSES {
        return Err(WireError::TooManyAddresses(count as usize));
    }
    raw.push(count);
    for _ in 0..count {
        read_str(reader, raw).await?;
    }
    Ok(())
}
