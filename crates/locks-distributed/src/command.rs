use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tandem_dispatch::codec::{self, CodecError, CommandKind};
use tandem_dispatch::{Command, Wire};
use tandem_locks::LockMode;

use crate::context::LockContext;
use crate::descriptor::LockDescriptor;

/// Commands exchanged between lock managers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockCommand {
    /// Acquire the local lock for a remote owner, waiting at most `wait`.
    Acquire {
        /// The requested lock.
        descriptor: LockDescriptor,
        /// Longest time the receiver may wait.
        wait: Duration,
    },
    /// Release the local lock held for a remote owner, if any.
    Release {
        /// The lock to release.
        descriptor: LockDescriptor,
    },
}

impl Wire for LockCommand {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Acquire { descriptor, wait } => {
                let kind = match descriptor.mode() {
                    LockMode::Read => CommandKind::AcquireRead,
                    LockMode::Write => CommandKind::AcquireWrite,
                };
                codec::put_header(buf, kind);
                descriptor.encode(buf);
                u64::try_from(wait.as_millis())
                    .unwrap_or(u64::MAX)
                    .encode(buf);
            }
            Self::Release { descriptor } => {
                codec::put_header(buf, CommandKind::Release);
                descriptor.encode(buf);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match codec::get_header(buf)? {
            kind @ (CommandKind::AcquireRead | CommandKind::AcquireWrite) => {
                let descriptor = LockDescriptor::decode(buf)?;
                let expected = if kind == CommandKind::AcquireRead {
                    LockMode::Read
                } else {
                    LockMode::Write
                };
                if descriptor.mode() != expected {
                    return Err(CodecError::UnexpectedKind(kind));
                }
                let wait = Duration::from_millis(codec::get_u64(buf)?);
                Ok(Self::Acquire { descriptor, wait })
            }
            CommandKind::Release => Ok(Self::Release {
                descriptor: LockDescriptor::decode(buf)?,
            }),
            other => Err(CodecError::UnexpectedKind(other)),
        }
    }
}

#[async_trait]
impl Command<LockContext> for LockCommand {
    /// Whether the receiver holds (for acquire) or released (for release)
    /// the lock.
    type Output = bool;

    async fn execute(self, context: &LockContext) -> bool {
        match self {
            Self::Acquire { descriptor, wait } => context.acquire(descriptor, wait).await,
            Self::Release { descriptor } => context.release(&descriptor).await,
        }
    }
}
