//! A cluster of replicated databases driven by one member of a group.
//!
//! Writes run on every active database node, reads on the node the balancer
//! picks. Every invocation is journaled by the configured durability level so
//! that, after a crash, the survivors can tell which nodes diverged and take
//! them out of service.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
mod connector;
pub mod error;
mod strategy;

pub use config::{ClusterConfig, LockConfig, NodeConfig, StateConfig};
pub use connector::{NodeConnector, NoopConnector};
pub use error::{ClusterError, ConfigError};
pub use strategy::{InvokeOnAll, InvokeOnNext, Target};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tandem_balancer::{Balancer, Node, NodeId};
use tandem_dispatch::{CommandDispatcherFactory, Member};
use tandem_durability::{
    Durability, DurabilityLevel, EventLog, ExceptionType, InvocationResults, Invoker, Phase,
    TransactionId, TransactionIdFactory,
};
use tandem_locks::{GLOBAL, Lock, LockManager};
use tandem_locks_distributed::{DistributedLockManager, DistributedLockManagerConfig};
use tandem_state::{StateEvent, StateListener, StateManager};
use tandem_state_distributed::{DistributedStateManager, DistributedStateManagerConfig};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// One call to run against the cluster.
#[derive(Clone, Copy, Debug)]
pub struct Invocation {
    /// Transaction phase the call belongs to.
    pub phase: Phase,

    /// How failures of the call are classified.
    pub exception_type: ExceptionType,

    /// Which nodes the call runs on.
    pub target: Target,

    /// Transaction the call belongs to. A fresh id is created if not set.
    pub transaction_id: Option<TransactionId>,
}

impl Invocation {
    /// A write running on every active node.
    #[must_use]
    pub const fn write(phase: Phase, exception_type: ExceptionType) -> Self {
        Self {
            phase,
            exception_type,
            target: Target::All,
            transaction_id: None,
        }
    }

    /// A read running on the node the balancer picks.
    #[must_use]
    pub const fn read(phase: Phase, exception_type: ExceptionType) -> Self {
        Self {
            phase,
            exception_type,
            target: Target::Next,
            transaction_id: None,
        }
    }

    /// Ties the call to `transaction_id`.
    #[must_use]
    pub const fn in_transaction(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }
}

/// Everything the state event listener shares with the cluster.
struct Shared {
    id: String,
    nodes: BTreeMap<NodeId, Node>,
    balancer: Arc<dyn Balancer>,
    state: Arc<dyn StateManager>,
    durability: Arc<dyn Durability>,
    connector: Arc<dyn NodeConnector>,
}

impl Shared {
    fn node(&self, id: &NodeId) -> Result<&Node, ClusterError> {
        self.nodes
            .get(id)
            .ok_or_else(|| ClusterError::UnknownNode(id.to_string()))
    }

    async fn activate(&self, node: &Node) -> Result<bool, ClusterError> {
        if self.balancer.active_nodes().contains(node.id()) {
            return Ok(false);
        }

        self.connector
            .connect(node)
            .await
            .map_err(|source| ClusterError::Connect {
                node: node.id().to_string(),
                source,
            })?;
        self.balancer.add(node.clone());
        self.state.activated(node.id()).await?;

        info!(node = %node.id(), "Node activated");
        Ok(true)
    }

    async fn deactivate(&self, id: &NodeId) -> Result<bool, ClusterError> {
        let node = self.node(id)?;
        if !self.balancer.remove(node) {
            return Ok(false);
        }

        self.connector.disconnect(node).await;
        self.state.deactivated(id).await?;

        warn!(node = %id, "Node deactivated");
        Ok(true)
    }

    /// Deactivates the nodes `log` shows to have diverged.
    async fn recover(&self, log: EventLog) -> Result<(), ClusterError> {
        if log.is_empty() {
            return Ok(());
        }

        let report = self.durability.recover(log).await;
        for id in &report.deactivate {
            self.deactivate(id).await?;
        }
        Ok(())
    }

    /// Applies a change made by another member.
    async fn apply(&self, event: StateEvent) {
        match event {
            StateEvent::Activated(id) => {
                let Some(node) = self.nodes.get(&id) else {
                    warn!(node = %id, "Ignoring activation of unknown node");
                    return;
                };
                if self.balancer.active_nodes().contains(&id) {
                    return;
                }
                match self.connector.connect(node).await {
                    Ok(()) => {
                        self.balancer.add(node.clone());
                        info!(node = %id, "Node activated by peer");
                    }
                    Err(e) => {
                        error!(node = %id, error = %e, "Failed to connect node activated by peer");
                    }
                }
            }
            StateEvent::Deactivated(id) => {
                let Some(node) = self.nodes.get(&id) else {
                    return;
                };
                if self.balancer.remove(node) {
                    self.connector.disconnect(node).await;
                    warn!(node = %id, "Node deactivated by peer");
                }
            }
            StateEvent::Orphaned { member, log } => {
                info!(
                    %member,
                    invocations = log.len(),
                    "Recovering invocations of departed member"
                );
                if let Err(e) = self.recover(log).await {
                    error!(%member, error = %e, "Failed to recover invocations of departed member");
                }
            }
        }
    }
}

async fn listen(
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<StateEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            event = events.recv() => event,
        };

        match event {
            Ok(event) => shared.apply(event).await,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Missed state events, local view may be stale");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// A held cluster lock. Released from a spawned task if dropped while held.
struct Held {
    lock: Option<Arc<dyn Lock>>,
}

impl Held {
    async fn acquire(lock: Arc<dyn Lock>) -> Result<Self, ClusterError> {
        lock.lock().await?;
        Ok(Self { lock: Some(lock) })
    }

    async fn release(mut self) -> Result<(), ClusterError> {
        if let Some(lock) = self.lock.take() {
            lock.unlock().await?;
        }
        Ok(())
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.unlock().await {
                        warn!(error = %e, "Failed to release abandoned cluster lock");
                    }
                });
            }
            Err(_) => warn!("No runtime to release abandoned cluster lock"),
        }
    }
}

struct Running {
    shutdown: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

/// A cluster of replicated database nodes.
pub struct DatabaseCluster {
    shared: Arc<Shared>,
    locks: Arc<dyn LockManager>,
    lock_group: Option<Arc<DistributedLockManager>>,
    transaction_ids: Arc<dyn TransactionIdFactory>,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for DatabaseCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseCluster")
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl DatabaseCluster {
    /// Creates a cluster managed by this process alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: ClusterConfig,
        connector: Arc<dyn NodeConnector>,
    ) -> Result<Self, ClusterError> {
        config.validate()?;
        let state = config.state.build_local();
        let locks = config.locks.build_local();
        Self::assemble(&config, connector, state, locks, None)
    }

    /// Creates a cluster shared by every member of a group. Cluster state
    /// and locks travel on channels named after the cluster id.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn distributed<F>(
        factory: &F,
        member: Member,
        config: ClusterConfig,
        connector: Arc<dyn NodeConnector>,
    ) -> Result<Self, ClusterError>
    where
        F: CommandDispatcherFactory,
    {
        config.validate()?;
        let state = Arc::new(DistributedStateManager::new(
            factory,
            DistributedStateManagerConfig {
                channel: format!("{}.state", config.id),
                local: member.clone(),
                event_capacity: None,
            },
            config.state.build_local(),
        ));
        let locks = Arc::new(DistributedLockManager::new(
            factory,
            DistributedLockManagerConfig {
                channel: format!("{}.locks", config.id),
                local: member,
                retry_interval: config.locks.retry_interval(),
            },
            config.locks.build_local(),
        ));
        Self::assemble(&config, connector, state, locks.clone(), Some(locks))
    }

    fn assemble(
        config: &ClusterConfig,
        connector: Arc<dyn NodeConnector>,
        state: Arc<dyn StateManager>,
        locks: Arc<dyn LockManager>,
        lock_group: Option<Arc<DistributedLockManager>>,
    ) -> Result<Self, ClusterError> {
        let balancer = config.build_balancer()?;
        let durability = config
            .durability_level()?
            .create(balancer.clone(), Arc::new(StateListener::new(state.clone())));
        let transaction_ids = config.build_transaction_ids()?;
        let nodes = config
            .build_nodes()
            .into_iter()
            .map(|node| (node.id().clone(), node))
            .collect();

        Ok(Self {
            shared: Arc::new(Shared {
                id: config.id.clone(),
                nodes,
                balancer,
                state,
                durability,
                connector,
            }),
            locks,
            lock_group,
            transaction_ids,
            started: AtomicBool::new(false),
            running: Mutex::new(None),
        })
    }

    /// Brings the cluster up.
    ///
    /// Nodes recorded as active (every configured node on first start) are
    /// connected and activated. Invocations left open by a crash are then
    /// recovered before any new invocation is accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster is already started, if its state or
    /// group cannot be started, or if recovery cannot record its decisions.
    #[instrument(skip(self), fields(cluster = %self.shared.id))]
    pub async fn start(&self) -> Result<(), ClusterError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ClusterError::AlreadyStarted(self.shared.id.clone()));
        }
        let shared = &self.shared;

        shared.state.start().await?;
        if let Err(e) = self.bring_up().await {
            self.abandon_start().await;
            return Err(e);
        }
        let active = shared.balancer.active_nodes();

        let shutdown = CancellationToken::new();
        let listener = shared
            .state
            .subscribe()
            .map(|events| tokio::spawn(listen(shared.clone(), events, shutdown.clone())));
        *running = Some(Running { shutdown, listener });
        self.started.store(true, Ordering::Release);

        info!(active = active.len(), "Cluster started");
        Ok(())
    }

    /// Everything `start` does once the state is loaded: joins the lock
    /// group, connects nodes and recovers what a crash left open.
    async fn bring_up(&self) -> Result<(), ClusterError> {
        let shared = &self.shared;
        if let Some(group) = &self.lock_group {
            group.start().await?;
        }

        let recorded = shared.state.active_nodes();
        let candidates = shared
            .nodes
            .values()
            .filter(|node| recorded.is_empty() || recorded.contains(node.id()));
        for node in candidates {
            match shared.connector.connect(node).await {
                Ok(()) => {
                    shared.balancer.add(node.clone());
                }
                Err(e) => {
                    warn!(
                        node = %node.id(),
                        error = %e,
                        "Failed to connect node, leaving it inactive"
                    );
                }
            }
        }

        let log = shared.state.recoverable_event_log().await;
        if !log.is_empty() {
            info!(invocations = log.len(), "Recovering invocations left open by a crash");
        }
        shared.recover(log).await?;

        let active = shared.balancer.active_nodes();
        shared
            .state
            .set_active_nodes(active.ids().cloned().collect())
            .await?;
        Ok(())
    }

    /// Undoes a failed `start`: leaves the lock group, disconnects nodes and
    /// stops the state.
    async fn abandon_start(&self) {
        let shared = &self.shared;
        if let Some(group) = &self.lock_group {
            if let Err(e) = group.stop().await {
                warn!(error = %e, "Failed to leave lock group after failed start");
            }
        }
        for node in shared.balancer.active_nodes().iter() {
            shared.balancer.remove(node);
            shared.connector.disconnect(node).await;
        }
        if let Err(e) = shared.state.stop().await {
            warn!(error = %e, "Failed to stop state after failed start");
        }
    }

    /// Takes the cluster down. Invocations are refused until it is started
    /// again.
    ///
    /// # Errors
    ///
    /// Returns an error if the state or group cannot be stopped cleanly.
    #[instrument(skip(self), fields(cluster = %self.shared.id))]
    pub async fn stop(&self) -> Result<(), ClusterError> {
        let Some(Running { shutdown, listener }) = self.running.lock().await.take() else {
            return Ok(());
        };
        self.started.store(false, Ordering::Release);

        shutdown.cancel();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                error!(error = %e, "State event listener failed");
            }
        }

        if let Some(group) = &self.lock_group {
            group.stop().await?;
        }
        self.shared.state.stop().await?;

        for node in self.shared.balancer.active_nodes().iter() {
            self.shared.connector.disconnect(node).await;
        }

        info!("Cluster stopped");
        Ok(())
    }

    /// Puts a node back into service. Waits for in-flight writes to finish
    /// first, on every member of the group.
    ///
    /// Returns `false` if the node was already active.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster is not started, if the node is unknown
    /// or cannot be connected, or if the change cannot be recorded.
    #[instrument(skip(self), fields(cluster = %self.shared.id))]
    pub async fn activate(&self, id: &NodeId) -> Result<bool, ClusterError> {
        self.ensure_started()?;
        let node = self.shared.node(id)?.clone();

        let held = Held::acquire(self.locks.write_lock(GLOBAL)).await?;
        let result = self.shared.activate(&node).await;
        held.release().await?;
        result
    }

    /// Takes a node out of service.
    ///
    /// Returns `false` if the node was not active.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster is not started, if the node is unknown
    /// or if the change cannot be recorded.
    #[instrument(skip(self), fields(cluster = %self.shared.id))]
    pub async fn deactivate(&self, id: &NodeId) -> Result<bool, ClusterError> {
        self.ensure_started()?;
        self.shared.deactivate(id).await
    }

    /// Runs `invoker` as described by `invocation`, journaled by the
    /// configured durability level.
    ///
    /// Writes hold the cluster read lock, so they never overlap an
    /// activation.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster is not started, if there are no active
    /// nodes, or if the cluster lock cannot be taken.
    pub async fn invoke(
        &self,
        invocation: Invocation,
        invoker: Arc<dyn Invoker>,
    ) -> Result<InvocationResults, ClusterError> {
        self.ensure_started()?;

        let Invocation {
            phase,
            exception_type,
            target,
            transaction_id,
        } = invocation;
        let transaction_id = transaction_id.unwrap_or_else(|| self.transaction_ids.create());

        let durability = &self.shared.durability;
        let strategy = durability.wrap_invocation(
            phase,
            transaction_id,
            exception_type,
            target.strategy(self.shared.balancer.clone()),
        );
        let invoker = durability.wrap_invoker(phase, transaction_id, exception_type, invoker);

        match target {
            Target::All => {
                let held = Held::acquire(self.locks.read_lock(GLOBAL)).await?;
                let results = strategy.invoke(&*invoker).await;
                held.release().await?;
                Ok(results?)
            }
            Target::Next => Ok(strategy.invoke(&*invoker).await?),
        }
    }

    /// A fresh transaction id.
    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_ids.create()
    }

    fn ensure_started(&self) -> Result<(), ClusterError> {
        if self.started.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ClusterError::NotStarted(self.shared.id.clone()))
        }
    }

    /// Whether the cluster accepts invocations.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// The cluster id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// The configured node with `id`.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.shared.nodes.get(id)
    }

    /// The balancer over the active nodes.
    #[must_use]
    pub fn balancer(&self) -> &Arc<dyn Balancer> {
        &self.shared.balancer
    }

    /// The durability level invocations are journaled with.
    #[must_use]
    pub fn durability(&self) -> DurabilityLevel {
        self.shared.durability.level()
    }

    /// The cluster locks.
    #[must_use]
    pub fn locks(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    /// The cluster state.
    #[must_use]
    pub fn state(&self) -> &Arc<dyn StateManager> {
        &self.shared.state
    }
}
