//! Group member identity.

use std::fmt;

use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use crate::codec::{self, CodecError, Wire};

/// A participant process in a group view.
///
/// Equality is by identity: a process that restarts under the same name is a
/// different member, because its incarnation differs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Member {
    name: String,
    incarnation: Uuid,
}

impl Member {
    /// Creates a member with a fresh incarnation.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_incarnation(name, Uuid::new_v4())
    }

    /// Creates a member with a known incarnation.
    pub fn with_incarnation(name: impl Into<String>, incarnation: Uuid) -> Self {
        Self {
            name: name.into(),
            incarnation,
        }
    }

    /// The configured name of the member's process.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The incarnation distinguishing restarts of the same process.
    #[must_use]
    pub const fn incarnation(&self) -> Uuid {
        self.incarnation
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let incarnation = self.incarnation.simple().to_string();
        write!(f, "{}@{}", self.name, &incarnation[..8])
    }
}

impl Wire for Member {
    fn encode(&self, buf: &mut BytesMut) {
        codec::put_string(buf, &self.name);
        buf.extend_from_slice(self.incarnation.as_bytes());
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let name = codec::get_string(buf)?;
        let raw = codec::get_fixed(buf, 16)?;
        let mut incarnation = [0u8; 16];
        incarnation.copy_from_slice(&raw);
        Ok(Self {
            name,
            incarnation: Uuid::from_bytes(incarnation),
        })
    }
}
