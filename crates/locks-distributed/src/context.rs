use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tandem_dispatch::{DispatchError, Member, MembershipListener, Stateful, Wire};
use tandem_locks::{Lock, LockManager};
use tracing::{debug, info, warn};

use crate::descriptor::LockDescriptor;

#[derive(Default)]
struct RemoteLocks {
    held: HashMap<Member, HashMap<LockDescriptor, Arc<dyn Lock>>>,
    /// Members removed from the view. Nothing is recorded for them again.
    departed: HashSet<Member>,
}

/// Per-member state every lock command executes against: the local locks and
/// the table of those held on behalf of lock owners.
pub struct LockContext {
    local: Arc<dyn LockManager>,
    remote: Mutex<RemoteLocks>,
}

impl LockContext {
    pub(crate) fn new(local: Arc<dyn LockManager>) -> Self {
        Self {
            local,
            remote: Mutex::new(RemoteLocks::default()),
        }
    }

    pub(crate) fn local(&self) -> &Arc<dyn LockManager> {
        &self.local
    }

    /// Descriptors currently held on behalf of `member`.
    pub fn held_for(&self, member: &Member) -> Vec<LockDescriptor> {
        self.remote
            .lock()
            .held
            .get(member)
            .map(|locks| locks.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) async fn acquire(&self, descriptor: LockDescriptor, wait: Duration) -> bool {
        let member = descriptor.owner().member().clone();
        {
            let remote = self.remote.lock();
            if remote.departed.contains(&member) {
                debug!(lock = %descriptor, "Refusing lock for departed member");
                return false;
            }
            if remote
                .held
                .get(&member)
                .is_some_and(|locks| locks.contains_key(&descriptor))
            {
                return true;
            }
        }

        let lock = self.local.lock(descriptor.resource(), descriptor.mode());
        match lock.try_lock_for(wait).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!(lock = %descriptor, error = %e, "Local lock acquisition failed");
                return false;
            }
        }

        let departed = {
            let mut remote = self.remote.lock();
            if remote.departed.contains(&member) {
                true
            } else {
                remote
                    .held
                    .entry(member)
                    .or_default()
                    .insert(descriptor.clone(), lock.clone());
                false
            }
        };
        if departed {
            debug!(lock = %descriptor, "Owner departed while waiting, releasing");
            if let Err(e) = lock.unlock().await {
                warn!(lock = %descriptor, error = %e, "Failed to release lock");
            }
            return false;
        }

        debug!(lock = %descriptor, "Lock held for owner");
        true
    }

    pub(crate) async fn release(&self, descriptor: &LockDescriptor) -> bool {
        let lock = {
            let mut remote = self.remote.lock();
            let member = descriptor.owner().member();
            let Some(locks) = remote.held.get_mut(member) else {
                return false;
            };
            let lock = locks.remove(descriptor);
            if locks.is_empty() {
                remote.held.remove(member);
            }
            lock
        };

        let Some(lock) = lock else {
            return false;
        };
        if let Err(e) = lock.unlock().await {
            warn!(lock = %descriptor, error = %e, "Failed to release lock");
        }
        debug!(lock = %descriptor, "Lock released for owner");
        true
    }
}

#[async_trait]
impl MembershipListener for LockContext {
    async fn added(&self, member: &Member) {
        debug!(%member, "Member joined lock group");
    }

    async fn removed(&self, member: &Member) {
        let orphaned = {
            let mut remote = self.remote.lock();
            remote.departed.insert(member.clone());
            remote.held.remove(member).unwrap_or_default()
        };

        for (descriptor, lock) in orphaned {
            match lock.unlock().await {
                Ok(()) => info!(lock = %descriptor, "Released lock of departed member"),
                Err(e) => {
                    warn!(
                        lock = %descriptor,
                        error = %e,
                        "Failed to release lock of departed member"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl Stateful for LockContext {
    async fn snapshot(&self) -> Result<Bytes, DispatchError> {
        let descriptors: Vec<LockDescriptor> = self
            .remote
            .lock()
            .held
            .values()
            .flat_map(|locks| locks.keys().cloned())
            .collect();
        Ok(descriptors.to_bytes())
    }

    async fn restore(&self, snapshot: Bytes) -> Result<(), DispatchError> {
        let descriptors = Vec::<LockDescriptor>::from_bytes(snapshot)?;

        for descriptor in descriptors {
            let lock = self.local.lock(descriptor.resource(), descriptor.mode());
            let acquired = lock
                .try_lock()
                .await
                .map_err(|e| DispatchError::StateTransfer(e.to_string()))?;
            if !acquired {
                return Err(DispatchError::StateTransfer(format!(
                    "lock {descriptor} is not available locally"
                )));
            }
            let member = descriptor.owner().member().clone();
            self.remote
                .lock()
                .held
                .entry(member)
                .or_default()
                .insert(descriptor, lock);
        }

        Ok(())
    }
}
