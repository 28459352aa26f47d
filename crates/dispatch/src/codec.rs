//! Versioned binary encoding for command payloads.
//!
//! Every command starts with a two byte header:
//! ```text
//! [version: u8][kind: u8]
//! ```
//! followed by the command's fields. Strings are `[len: u32][utf8]`, byte
//! strings are `[len: u32][bytes]`, optional fields are `[present: u8][value]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Errors that can occur while encoding or decoding payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Buffer ended before the value was complete.
    #[error("buffer too small")]
    BufferTooSmall,

    /// The payload was written by an unknown format version.
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    /// The header names a command kind this decoder does not know.
    #[error("unknown command kind: {0}")]
    UnknownKind(u8),

    /// The command kind is valid but not accepted by this decoder.
    #[error("unexpected command kind: {0:?}")]
    UnexpectedKind(CommandKind),

    /// A tag byte had no meaning for the value being decoded.
    #[error("invalid {what} tag: {tag}")]
    InvalidTag {
        /// The value being decoded.
        what: &'static str,
        /// The offending tag.
        tag: u8,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Bytes remained after the value was decoded.
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

/// The kind tag of a command record.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Activate a database node.
    Activate = 1,
    /// Deactivate a database node.
    Deactivate = 2,
    /// Acquire a read lock on a member.
    AcquireRead = 3,
    /// Acquire a write lock on a member.
    AcquireWrite = 4,
    /// Release a lock held on behalf of a remote owner.
    Release = 5,
    /// State snapshot a joining member requests from the coordinator.
    StateSnapshotRequest = 6,
    /// An invocation is about to run.
    BeforeInvocation = 7,
    /// An invocation completed.
    AfterInvocation = 8,
    /// A per-node call is about to run.
    BeforeInvoker = 9,
    /// A per-node call completed.
    AfterInvoker = 10,
}

impl TryFrom<u8> for CommandKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Activate,
            2 => Self::Deactivate,
            3 => Self::AcquireRead,
            4 => Self::AcquireWrite,
            5 => Self::Release,
            6 => Self::StateSnapshotRequest,
            7 => Self::BeforeInvocation,
            8 => Self::AfterInvocation,
            9 => Self::BeforeInvoker,
            10 => Self::AfterInvoker,
            other => return Err(CodecError::UnknownKind(other)),
        })
    }
}

/// A value with an explicit binary encoding.
pub trait Wire: Sized {
    /// Appends the encoding of `self` to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Decodes a value from the front of `buf`, advancing it.
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError>;

    /// Encodes `self` into a fresh buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a value that must span the whole of `bytes`.
    fn from_bytes(mut bytes: Bytes) -> Result<Self, CodecError> {
        let value = Self::decode(&mut bytes)?;
        if bytes.has_remaining() {
            return Err(CodecError::TrailingBytes(bytes.remaining()));
        }
        Ok(value)
    }
}

/// Writes the command header.
pub fn put_header(buf: &mut BytesMut, kind: CommandKind) {
    buf.put_u8(WIRE_VERSION);
    buf.put_u8(kind as u8);
}

/// Reads and checks the command header.
pub fn get_header(buf: &mut Bytes) -> Result<CommandKind, CodecError> {
    let version = get_u8(buf)?;
    if version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    CommandKind::try_from(get_u8(buf)?)
}

fn ensure(buf: &Bytes, len: usize) -> Result<(), CodecError> {
    if buf.remaining() < len {
        Err(CodecError::BufferTooSmall)
    } else {
        Ok(())
    }
}

/// Reads a single byte.
pub fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

/// Reads a big-endian `u32`.
pub fn get_u32(buf: &mut Bytes) -> Result<u32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

/// Reads a big-endian `u64`.
pub fn get_u64(buf: &mut Bytes) -> Result<u64, CodecError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

/// Reads exactly `len` bytes.
pub fn get_fixed(buf: &mut Bytes, len: usize) -> Result<Bytes, CodecError> {
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

/// Writes a length-prefixed string.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

/// Reads a length-prefixed string.
pub fn get_string(buf: &mut Bytes) -> Result<String, CodecError> {
    let bytes = get_bytes(buf)?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// Writes a `u32` length-prefixed byte string.
#[allow(clippy::cast_possible_truncation)]
pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// Reads a `u32` length-prefixed byte string.
pub fn get_bytes(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = get_u32(buf)? as usize;
    get_fixed(buf, len)
}

impl Wire for () {
    fn encode(&self, _buf: &mut BytesMut) {}

    fn decode(_buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(())
    }
}

impl Wire for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match get_u8(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(CodecError::InvalidTag { what: "bool", tag }),
        }
    }
}

impl Wire for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(*self);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        get_u64(buf)
    }
}

impl Wire for String {
    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, self);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        get_string(buf)
    }
}

impl Wire for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        put_bytes(buf, self);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        get_bytes(buf)
    }
}

impl<T: Wire> Wire for Option<T> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Some(value) => {
                buf.put_u8(1);
                value.encode(buf);
            }
            None => buf.put_u8(0),
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match get_u8(buf)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(buf)?)),
            tag => Err(CodecError::InvalidTag {
                what: "option",
                tag,
            }),
        }
    }
}

impl<T: Wire> Wire for Vec<T> {
    #[allow(clippy::cast_possible_truncation)]
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len() as u32);
        for item in self {
            item.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let len = get_u32(buf)? as usize;
        // each item takes at least one byte, cap the preallocation accordingly
        let mut items = Vec::with_capacity(len.min(buf.remaining()));
        for _ in 0..len {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}
