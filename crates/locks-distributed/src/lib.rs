//! Cluster-wide read/write locks over group command dispatch.
//!
//! Read locks are local: a reader only has to be excluded by writers, and a
//! writer holds the local write lock on every member. A write lock is granted
//! first by the coordinator, which serializes competing writers, and then by
//! every member of the view, the requesting member included. Whatever was
//! granted is released again by broadcast if the attempt fails.
//!
//! When a member leaves the group, every survivor releases the locks it held
//! on that member's behalf.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod command;
mod context;
mod descriptor;

pub use command::LockCommand;
pub use context::LockContext;
pub use descriptor::{LockDescriptor, LockOwner};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tandem_dispatch::{CommandDispatcher, CommandDispatcherFactory, DispatchError, Member};
use tandem_locks::{Lock, LockError, LockManager, LockMode};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

type LockDispatcher = dyn CommandDispatcher<LockContext, LockCommand>;

/// Configuration for the `DistributedLockManager`.
#[derive(Clone, Debug)]
pub struct DistributedLockManagerConfig {
    /// The group channel lock commands travel on.
    pub channel: String,

    /// The local member.
    pub local: Member,

    /// Length of each attempt while `lock` or `lock_interruptibly` waits.
    /// Defaults to one second if not set.
    pub retry_interval: Option<Duration>,
}

/// Lock manager whose write locks exclude writers and readers on every member
/// of the group.
pub struct DistributedLockManager {
    context: Arc<LockContext>,
    dispatcher: Arc<LockDispatcher>,
    retry_interval: Duration,
}

impl DistributedLockManager {
    /// Creates a lock manager wrapping `local`. It joins the group when
    /// started.
    pub fn new<F>(
        factory: &F,
        DistributedLockManagerConfig {
            channel,
            local,
            retry_interval,
        }: DistributedLockManagerConfig,
        local_locks: Arc<dyn LockManager>,
    ) -> Self
    where
        F: CommandDispatcherFactory,
    {
        let context = Arc::new(LockContext::new(local_locks));
        let dispatcher = factory.create::<LockContext, LockCommand>(
            &channel,
            local,
            context.clone(),
            Some(context.clone()),
            Some(context.clone()),
        );

        Self {
            context,
            dispatcher,
            retry_interval: retry_interval.unwrap_or(Duration::from_secs(1)),
        }
    }

    /// Joins the group, receiving the current lock table.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be joined.
    pub async fn start(&self) -> Result<(), DispatchError> {
        self.dispatcher.start().await
    }

    /// Leaves the group. The other members release every lock held on behalf
    /// of this member.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be left cleanly.
    pub async fn stop(&self) -> Result<(), DispatchError> {
        self.dispatcher.stop().await
    }

    /// The local member.
    #[must_use]
    pub fn local(&self) -> &Member {
        self.dispatcher.local()
    }

    /// The per-member lock state.
    #[must_use]
    pub const fn context(&self) -> &Arc<LockContext> {
        &self.context
    }
}

impl LockManager for DistributedLockManager {
    fn read_lock(&self, name: &str) -> Arc<dyn Lock> {
        self.context.local().read_lock(name)
    }

    fn write_lock(&self, name: &str) -> Arc<dyn Lock> {
        Arc::new(DistributedWriteLock {
            resource: name.to_string(),
            dispatcher: self.dispatcher.clone(),
            retry_interval: self.retry_interval,
            held: Mutex::new(None),
        })
    }
}

/// Releases a partially granted write lock unless disarmed.
///
/// If the attempt is abandoned mid-flight, the release is broadcast from a
/// spawned task.
struct Rollback {
    pending: Option<(Arc<LockDispatcher>, LockDescriptor)>,
}

impl Rollback {
    fn new(dispatcher: Arc<LockDispatcher>, descriptor: LockDescriptor) -> Self {
        Self {
            pending: Some((dispatcher, descriptor)),
        }
    }

    fn disarm(&mut self) {
        self.pending = None;
    }

    async fn release(&mut self) {
        if let Some((dispatcher, descriptor)) = self.pending.take() {
            broadcast_release(&*dispatcher, descriptor).await;
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        let Some((dispatcher, descriptor)) = self.pending.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    broadcast_release(&*dispatcher, descriptor).await;
                });
            }
            Err(_) => warn!(lock = %descriptor, "No runtime to release abandoned lock"),
        }
    }
}

async fn broadcast_release(dispatcher: &LockDispatcher, descriptor: LockDescriptor) {
    let command = LockCommand::Release {
        descriptor: descriptor.clone(),
    };
    if let Err(e) = dispatcher.execute_all(command).await {
        warn!(lock = %descriptor, error = %e, "Failed to release partially granted lock");
    }
}

struct DistributedWriteLock {
    resource: String,
    dispatcher: Arc<LockDispatcher>,
    retry_interval: Duration,
    held: Mutex<Option<LockDescriptor>>,
}

impl DistributedWriteLock {
    /// One round: the coordinator, then every member.
    async fn grant(
        &self,
        descriptor: &LockDescriptor,
        deadline: Instant,
    ) -> Result<bool, DispatchError> {
        let acquire = |wait| LockCommand::Acquire {
            descriptor: descriptor.clone(),
            wait,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !self.dispatcher.execute_coordinator(acquire(remaining)).await? {
            return Ok(false);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let grants = self.dispatcher.execute_all(acquire(remaining)).await?;
        Ok(grants.values().all(|granted| *granted))
    }

    #[instrument(skip(self), fields(resource = %self.resource))]
    async fn attempt(&self, wait: Duration) -> Result<bool, LockError> {
        let deadline = Instant::now() + wait;
        let descriptor = LockDescriptor::new(
            self.resource.clone(),
            LockMode::Write,
            LockOwner::new(self.dispatcher.local().clone()),
        );
        let mut rollback = Rollback::new(self.dispatcher.clone(), descriptor.clone());

        let granted = loop {
            match self.grant(&descriptor, deadline).await {
                Ok(granted) => break granted,
                Err(DispatchError::MemberUnavailable(member)) if Instant::now() < deadline => {
                    debug!(%member, "Member left during lock round, retrying");
                    rollback.release().await;
                    rollback = Rollback::new(self.dispatcher.clone(), descriptor.clone());
                }
                Err(e) => {
                    rollback.release().await;
                    return Err(LockError::Group(Box::new(e)));
                }
            }
        };

        if !granted {
            rollback.release().await;
            return Ok(false);
        }

        rollback.disarm();
        *self.held.lock() = Some(descriptor);
        debug!("Cluster-wide write lock acquired");
        Ok(true)
    }
}

#[async_trait]
impl Lock for DistributedWriteLock {
    async fn lock(&self) -> Result<(), LockError> {
        while !self.attempt(self.retry_interval).await? {}
        Ok(())
    }

    async fn lock_interruptibly(&self, interrupt: &CancellationToken) -> Result<(), LockError> {
        loop {
            tokio::select! {
                biased;
                () = interrupt.cancelled() => return Err(LockError::Interrupted),
                granted = self.attempt(self.retry_interval) => {
                    if granted? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn try_lock(&self) -> Result<bool, LockError> {
        self.attempt(Duration::ZERO).await
    }

    async fn try_lock_for(&self, timeout: Duration) -> Result<bool, LockError> {
        self.attempt(timeout).await
    }

    #[instrument(skip(self), fields(resource = %self.resource))]
    async fn unlock(&self) -> Result<(), LockError> {
        let Some(descriptor) = self.held.lock().take() else {
            return Err(LockError::NotHeld(LockMode::Write, self.resource.clone()));
        };
        self.dispatcher
            .execute_all(LockCommand::Release { descriptor })
            .await
            .map_err(|e| LockError::Group(Box::new(e)))?;
        debug!("Cluster-wide write lock released");
        Ok(())
    }
}
