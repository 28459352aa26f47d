//! Persistent cluster state.
//!
//! A state manager keeps what a cluster member has to remember between
//! restarts, or hand over to the surviving members when it dies:
//! - The set of active nodes
//! - The durability events of invocations still in flight
//!
//! Specific backends (in-memory, filesystem, replicated) are provided in
//! separate crates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod error;
mod journal;

pub use error::StateError;
pub use journal::Journal;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tandem_balancer::NodeId;
use tandem_dispatch::Member;
use tandem_durability::{DurabilityListener, EventLog, InvocationEvent, InvokerEvent};
use tokio::sync::broadcast;

/// A change made by another member of the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateEvent {
    /// A node was activated.
    Activated(NodeId),

    /// A node was deactivated.
    Deactivated(NodeId),

    /// A member left while invocations were in flight. The survivors have
    /// to recover them.
    Orphaned {
        /// The departed member.
        member: Member,
        /// Its open invocations.
        log: EventLog,
    },
}

/// Keeps the active node set and the event log of a cluster member.
///
/// Durability hooks are infallible. Implementations log failures to record
/// an event and carry on.
#[async_trait]
pub trait StateManager: DurabilityListener {
    /// Loads persisted state, or joins the group the state is shared with.
    async fn start(&self) -> Result<(), StateError>;

    /// Releases whatever `start` acquired.
    async fn stop(&self) -> Result<(), StateError>;

    /// The nodes recorded as active.
    fn active_nodes(&self) -> BTreeSet<NodeId>;

    /// Replaces the recorded active set.
    async fn set_active_nodes(&self, nodes: BTreeSet<NodeId>) -> Result<(), StateError>;

    /// Records that `node` was activated.
    async fn activated(&self, node: &NodeId) -> Result<(), StateError>;

    /// Records that `node` was deactivated.
    async fn deactivated(&self, node: &NodeId) -> Result<(), StateError>;

    /// The invocations left open, including those a previous run of this
    /// member never closed.
    async fn recoverable_event_log(&self) -> EventLog;

    /// Changes made by other members, if this state is shared.
    fn subscribe(&self) -> Option<broadcast::Receiver<StateEvent>> {
        None
    }
}

/// Reports durability events to a state manager.
#[derive(Clone)]
pub struct StateListener(Arc<dyn StateManager>);

impl StateListener {
    /// Wraps `state`.
    #[must_use]
    pub fn new(state: Arc<dyn StateManager>) -> Self {
        Self(state)
    }
}

#[async_trait]
impl DurabilityListener for StateListener {
    async fn before_invocation(&self, event: &InvocationEvent) {
        self.0.before_invocation(event).await;
    }

    async fn after_invocation(&self, event: &InvocationEvent) {
        self.0.after_invocation(event).await;
    }

    async fn before_invoker(&self, event: &InvokerEvent) {
        self.0.before_invoker(event).await;
    }

    async fn after_invoker(&self, event: &InvokerEvent) {
        self.0.after_invoker(event).await;
    }
}
