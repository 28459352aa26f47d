//! Error types for locks.

use thiserror::Error;

/// Errors that can occur when acquiring or releasing a lock.
///
/// A lock that is merely unavailable is not an error: timed and
/// non-blocking acquisitions report it as `Ok(false)`.
#[derive(Debug, Error)]
pub enum LockError {
    /// The wait was interrupted before the lock was acquired.
    #[error("lock acquisition interrupted")]
    Interrupted,

    /// `unlock` was called on a lock that is not held.
    #[error("{0} lock '{1}' is not held")]
    NotHeld(crate::LockMode, String),

    /// The lock's semaphore was closed.
    #[error("lock '{0}' is closed")]
    Closed(String),

    /// The members of the group could not be reached.
    #[error("group communication failed: {0}")]
    Group(#[source] Box<dyn std::error::Error + Send + Sync>),
}
