//! Abstract interface for named read/write locks.
//!
//! Every resource has a read lock and a write lock. The resource named
//! [`GLOBAL`] sits above all others: a named lock is only held together with
//! the global lock in the same mode, so a global write lock excludes every
//! named lock.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::LockError;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Name of the resource every named lock depends on.
pub const GLOBAL: &str = "";

/// Whether a lock is shared or exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Shared with other readers.
    Read,
    /// Exclusive.
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// A lock on one resource in one mode.
///
/// Locks are not reentrant and not bound to the task that acquired them:
/// `unlock` releases one hold, whoever calls it. A failed acquisition never
/// leaves part of the lock held.
#[async_trait]
pub trait Lock: Send + Sync + 'static {
    /// Waits until the lock is acquired.
    async fn lock(&self) -> Result<(), LockError>;

    /// Waits until the lock is acquired or `interrupt` is cancelled.
    ///
    /// Dropping the returned future abandons the attempt in the same way.
    async fn lock_interruptibly(&self, interrupt: &CancellationToken) -> Result<(), LockError>;

    /// Acquires the lock if it is immediately available.
    async fn try_lock(&self) -> Result<bool, LockError>;

    /// Acquires the lock if it becomes available within `timeout`.
    async fn try_lock_for(&self, timeout: Duration) -> Result<bool, LockError>;

    /// Releases one hold of the lock.
    async fn unlock(&self) -> Result<(), LockError>;
}

/// Hands out read and write locks by resource name.
pub trait LockManager: Send + Sync + 'static {
    /// The read lock of `name`, or the global read lock for [`GLOBAL`].
    fn read_lock(&self, name: &str) -> Arc<dyn Lock>;

    /// The write lock of `name`, or the global write lock for [`GLOBAL`].
    fn write_lock(&self, name: &str) -> Arc<dyn Lock>;

    /// The lock of `name` in `mode`.
    fn lock(&self, name: &str, mode: LockMode) -> Arc<dyn Lock> {
        match mode {
            LockMode::Read => self.read_lock(name),
            LockMode::Write => self.write_lock(name),
        }
    }
}
