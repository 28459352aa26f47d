//! In-memory (single process) implementation of read/write locks.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod semaphore;

pub use semaphore::MAX_PERMITS;

use semaphore::{SemaphoreLock, Wait};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tandem_locks::{GLOBAL, Lock, LockError, LockManager};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct ReadWriteLock {
    read: Arc<SemaphoreLock>,
    write: Arc<SemaphoreLock>,
}

impl ReadWriteLock {
    fn new(name: &str, fair: bool) -> Self {
        let (read, write) = SemaphoreLock::pair(name, fair);
        Self { read, write }
    }
}

/// A lock handed out by [`MemoryLockManager`].
#[derive(Debug)]
enum LocalLock {
    /// The global lock.
    Global(Arc<SemaphoreLock>),
    /// A named lock, held only together with the global lock.
    Named {
        global: Arc<SemaphoreLock>,
        named: Arc<SemaphoreLock>,
    },
}

impl LocalLock {
    async fn acquire(&self, wait: Wait<'_>) -> Result<bool, LockError> {
        match self {
            Self::Global(lock) => {
                let Some(permit) = lock.acquire(wait).await? else {
                    return Ok(false);
                };
                lock.hold(permit);
            }
            Self::Named { global, named } => {
                let Some(outer) = global.acquire(wait).await? else {
                    return Ok(false);
                };
                // `outer` goes back to the semaphore if this fails or is dropped
                let Some(inner) = named.acquire(wait).await? else {
                    return Ok(false);
                };
                global.hold(outer);
                named.hold(inner);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl Lock for LocalLock {
    async fn lock(&self) -> Result<(), LockError> {
        self.acquire(Wait::Forever).await.map(|_| ())
    }

    async fn lock_interruptibly(&self, interrupt: &CancellationToken) -> Result<(), LockError> {
        self.acquire(Wait::Interruptible(interrupt)).await.map(|_| ())
    }

    async fn try_lock(&self) -> Result<bool, LockError> {
        self.acquire(Wait::Never).await
    }

    async fn try_lock_for(&self, timeout: Duration) -> Result<bool, LockError> {
        self.acquire(Wait::Until(Instant::now() + timeout)).await
    }

    async fn unlock(&self) -> Result<(), LockError> {
        match self {
            Self::Global(lock) => lock.release(),
            Self::Named { global, named } => {
                named.release()?;
                global.release()
            }
        }
    }
}

/// Read/write locks local to this process.
///
/// Lock table entries are created on first use and kept for the lifetime of
/// the manager.
#[derive(Debug)]
pub struct MemoryLockManager {
    fair: bool,
    global: ReadWriteLock,
    locks: DashMap<String, Arc<ReadWriteLock>>,
}

impl MemoryLockManager {
    /// Creates a lock manager. With `fair` unset, waiting writers drain free
    /// permits ahead of readers queued behind them.
    #[must_use]
    pub fn new(fair: bool) -> Self {
        Self {
            fair,
            global: ReadWriteLock::new(GLOBAL, fair),
            locks: DashMap::new(),
        }
    }

    fn named(&self, name: &str) -> Arc<ReadWriteLock> {
        if let Some(lock) = self.locks.get(name) {
            return lock.clone();
        }
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ReadWriteLock::new(name, self.fair)))
            .clone()
    }
}

impl Default for MemoryLockManager {
    fn default() -> Self {
        Self::new(false)
    }
}

impl LockManager for MemoryLockManager {
    fn read_lock(&self, name: &str) -> Arc<dyn Lock> {
        if name == GLOBAL {
            return Arc::new(LocalLock::Global(self.global.read.clone()));
        }
        Arc::new(LocalLock::Named {
            global: self.global.read.clone(),
            named: self.named(name).read.clone(),
        })
    }

    fn write_lock(&self, name: &str) -> Arc<dyn Lock> {
        if name == GLOBAL {
            return Arc::new(LocalLock::Global(self.global.write.clone()));
        }
        Arc::new(LocalLock::Named {
            global: self.global.write.clone(),
            named: self.named(name).write.clone(),
        })
    }
}
