use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tandem_dispatch::codec::{self, CodecError};
use tandem_dispatch::{Member, Wire};
use tandem_locks::LockMode;
use uuid::Uuid;

/// The holder of a cluster-wide lock: a member and one of its acquisitions.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockOwner {
    member: Member,
    token: Uuid,
}

impl LockOwner {
    /// A new acquisition by `member`.
    #[must_use]
    pub fn new(member: Member) -> Self {
        Self {
            member,
            token: Uuid::new_v4(),
        }
    }

    /// The member that requested the lock.
    #[must_use]
    pub const fn member(&self) -> &Member {
        &self.member
    }
}

/// A lock requested on behalf of a member.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockDescriptor {
    resource: String,
    mode: LockMode,
    owner: LockOwner,
}

impl LockDescriptor {
    /// Describes a lock on `resource` in `mode` held by `owner`.
    pub fn new(resource: impl Into<String>, mode: LockMode, owner: LockOwner) -> Self {
        Self {
            resource: resource.into(),
            mode,
            owner,
        }
    }

    /// The locked resource. Empty for the global lock.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The lock mode.
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    /// The lock holder.
    #[must_use]
    pub const fn owner(&self) -> &LockOwner {
        &self.owner
    }
}

impl fmt::Display for LockDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resource = if self.resource.is_empty() {
            "<global>"
        } else {
            &self.resource
        };
        write!(f, "{} {} for {}", self.mode, resource, self.owner.member)
    }
}

pub(crate) const fn mode_tag(mode: LockMode) -> u8 {
    match mode {
        LockMode::Read => 0,
        LockMode::Write => 1,
    }
}

impl Wire for LockDescriptor {
    fn encode(&self, buf: &mut BytesMut) {
        codec::put_string(buf, &self.resource);
        buf.put_u8(mode_tag(self.mode));
        self.owner.member.encode(buf);
        buf.put_slice(self.owner.token.as_bytes());
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let resource = codec::get_string(buf)?;
        let mode = match codec::get_u8(buf)? {
            0 => LockMode::Read,
            1 => LockMode::Write,
            tag => {
                return Err(CodecError::InvalidTag {
                    what: "lock mode",
                    tag,
                });
            }
        };
        let member = Member::decode(buf)?;
        let raw = codec::get_fixed(buf, 16)?;
        let mut token = [0u8; 16];
        token.copy_from_slice(&raw);

        Ok(Self {
            resource,
            mode,
            owner: LockOwner {
                member,
                token: Uuid::from_bytes(token),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn test_acquisitions_by_same_member_are_distinct() {
        let member = Member::new("proxy-1");
        let first = LockDescriptor::new("T", LockMode::Write, LockOwner::new(member.clone()));
        let second = LockDescriptor::new("T", LockMode::Write, LockOwner::new(member));
        assert_ne!(first, second);
        assert_eq!(first.owner().member(), second.owner().member());
    }

    #[test]
    fn test_decode_rejects_unknown_mode() {
        let descriptor = LockDescriptor::new("", LockMode::Read, LockOwner::new(Member::new("a")));
        let mut bytes = BytesMut::from(&descriptor.to_bytes()[..]);
        // resource length prefix is 4 bytes, the mode follows the empty name
        bytes[4] = 7;
        assert_matches!(
            LockDescriptor::from_bytes(bytes.freeze()),
            Err(CodecError::InvalidTag { what: "lock mode", tag: 7 })
        );
    }
}
