//! Read/write lock built on a single counting semaphore.
//!
//! The semaphore starts with [`MAX_PERMITS`] permits. A reader takes one, a
//! writer takes all of them. Held permits are forgotten and handed back with
//! `add_permits` on unlock, so a hold outlives the task that acquired it.
//!
//! In unfair mode a waiting writer first drains whatever permits are free and
//! then waits only for the remainder. Readers arriving meanwhile find nothing
//! left, which keeps a steady stream of readers from starving the writer.
//! Drained permits are ordinary owned permits: they return to the semaphore as
//! soon as a timed out, interrupted or cancelled wait drops them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tandem_locks::{LockError, LockMode};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Permits of one read/write lock. Also the maximum number of concurrent
/// readers.
pub const MAX_PERMITS: u32 = 1 << 28;

/// How long an acquisition may wait.
#[derive(Clone, Copy, Debug)]
pub enum Wait<'a> {
    /// Do not wait.
    Never,
    /// Until the lock is acquired.
    Forever,
    /// Until the deadline.
    Until(Instant),
    /// Until the lock is acquired or the token is cancelled.
    Interruptible(&'a CancellationToken),
}

/// One mode of a semaphore read/write lock.
#[derive(Debug)]
pub struct SemaphoreLock {
    name: String,
    mode: LockMode,
    semaphore: Arc<Semaphore>,
    fair: bool,
    holders: AtomicUsize,
}

impl SemaphoreLock {
    /// The read and write halves of a new lock on `name`.
    pub fn pair(name: &str, fair: bool) -> (Arc<Self>, Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(MAX_PERMITS as usize));
        let half = |mode| {
            Arc::new(Self {
                name: name.to_string(),
                mode,
                semaphore: semaphore.clone(),
                fair,
                holders: AtomicUsize::new(0),
            })
        };
        (half(LockMode::Read), half(LockMode::Write))
    }

    const fn permits(&self) -> u32 {
        match self.mode {
            LockMode::Read => 1,
            LockMode::Write => MAX_PERMITS,
        }
    }

    /// Acquires the permits without holding them yet. Returns `None` if the
    /// wait ran out. The permits go back to the semaphore when the returned
    /// value is dropped, unless it is passed to [`Self::hold`].
    pub async fn acquire(&self, wait: Wait<'_>) -> Result<Option<OwnedSemaphorePermit>, LockError> {
        match wait {
            Wait::Never => self.try_acquire(),
            Wait::Forever => self.wait().await.map(Some),
            Wait::Until(deadline) => match tokio::time::timeout_at(deadline, self.wait()).await {
                Ok(permit) => permit.map(Some),
                Err(_elapsed) => {
                    trace!(resource = %self.name, mode = %self.mode, "Lock wait timed out");
                    Ok(None)
                }
            },
            Wait::Interruptible(interrupt) => {
                tokio::select! {
                    biased;
                    () = interrupt.cancelled() => Err(LockError::Interrupted),
                    permit = self.wait() => permit.map(Some),
                }
            }
        }
    }

    fn try_acquire(&self) -> Result<Option<OwnedSemaphorePermit>, LockError> {
        match self.semaphore.clone().try_acquire_many_owned(self.permits()) {
            Ok(permit) => Ok(Some(permit)),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(LockError::Closed(self.name.clone())),
        }
    }

    async fn wait(&self) -> Result<OwnedSemaphorePermit, LockError> {
        let permits = self.permits();
        let closed = |_| LockError::Closed(self.name.clone());

        if self.fair || self.mode == LockMode::Read {
            return self
                .semaphore
                .clone()
                .acquire_many_owned(permits)
                .await
                .map_err(closed);
        }

        #[allow(clippy::cast_possible_truncation)]
        let available = self.semaphore.available_permits().min(permits as usize) as u32;
        let drained = if available == 0 {
            None
        } else {
            self.semaphore.clone().try_acquire_many_owned(available).ok()
        };
        let Some(mut drained) = drained else {
            return self
                .semaphore
                .clone()
                .acquire_many_owned(permits)
                .await
                .map_err(closed);
        };
        if available == permits {
            return Ok(drained);
        }

        trace!(resource = %self.name, drained = available, "Writer drained available permits");
        let rest = self
            .semaphore
            .clone()
            .acquire_many_owned(permits - available)
            .await
            .map_err(closed)?;
        drained.merge(rest);
        Ok(drained)
    }

    /// Turns acquired permits into a hold released by [`Self::release`].
    pub fn hold(&self, permit: OwnedSemaphorePermit) {
        permit.forget();
        self.holders.fetch_add(1, Ordering::SeqCst);
        trace!(resource = %self.name, mode = %self.mode, "Lock acquired");
    }

    /// Releases one hold.
    pub fn release(&self) -> Result<(), LockError> {
        self.holders
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |holders| {
                holders.checked_sub(1)
            })
            .map_err(|_| LockError::NotHeld(self.mode, self.name.clone()))?;
        self.semaphore.add_permits(self.permits() as usize);
        trace!(resource = %self.name, mode = %self.mode, "Lock released");
        Ok(())
    }

    /// Permits currently free.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}
