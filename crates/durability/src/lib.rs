//! Durability of cluster-wide invocations and recovery after a crash.
//!
//! Every logical operation against the cluster is an *invocation*, run by an
//! [`InvocationStrategy`] that calls one or more nodes through an [`Invoker`].
//! A [`Durability`] level wraps both and reports what is in flight to a
//! [`DurabilityListener`], usually the state manager, which persists it. What
//! a crash leaves behind is handed back to [`Durability::recover`], which
//! decides which backups can no longer be trusted to match the primary.
//!
//! Three levels are provided:
//! - [`NoDurability`]: nothing is tracked
//! - [`CoarseDurability`]: invocations are tracked, and any leftover one
//!   costs every backup
//! - [`FineDurability`]: per-node outcomes are tracked too, so only the
//!   backups that actually diverged from the primary are dropped
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod error;
pub mod event;
pub mod exception;
mod level;
mod strategy;
pub mod transaction;

pub use error::DurabilityError;
pub use event::{EventLog, InvocationEvent, InvokerEvent, InvokerResult, Phase};
pub use exception::{CapturedError, ExceptionClassifier, ExceptionType};
pub use level::{DurabilityFactory, DurabilityLevel};
pub use strategy::{CoarseDurability, FineDurability, NoDurability};
pub use transaction::{
    TransactionId, TransactionIdFactory, lookup_transaction_id_factory,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tandem_balancer::{Node, NodeId};

/// Receives the lifecycle of every tracked invocation.
///
/// Hooks cannot fail: a listener that cannot record an event logs the
/// failure itself. An invocation stays recorded from `before_invocation`
/// until `after_invocation`, which also discards its invoker events.
#[async_trait]
pub trait DurabilityListener: Send + Sync + 'static {
    /// An invocation is about to start.
    async fn before_invocation(&self, event: &InvocationEvent);

    /// An invocation has finished, or was closed by recovery.
    async fn after_invocation(&self, event: &InvocationEvent);

    /// A call against one node is about to start.
    async fn before_invoker(&self, event: &InvokerEvent);

    /// A call against one node returned. The event carries the outcome.
    async fn after_invoker(&self, event: &InvokerEvent);
}

/// Makes one call against one node.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Calls `node`. A failure on the node is returned as data.
    async fn invoke(&self, node: &Node) -> Result<Bytes, CapturedError>;
}

/// Per-node outcomes of one invocation.
pub type InvocationResults = BTreeMap<NodeId, Result<Bytes, CapturedError>>;

/// Decides which nodes an invocation runs on.
#[async_trait]
pub trait InvocationStrategy: Send + Sync {
    /// Runs `invoker` against the chosen nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the invocation could not be run on any node.
    /// Failures of individual nodes are part of the results.
    async fn invoke(&self, invoker: &dyn Invoker) -> Result<InvocationResults, DurabilityError>;
}

/// What recovery decided.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Nodes that may have diverged from the primary.
    pub deactivate: BTreeSet<NodeId>,

    /// Number of leftover invocations closed through the listener.
    pub closed: usize,
}

/// One durability level.
#[async_trait]
pub trait Durability: Send + Sync + 'static {
    /// The level this implements.
    fn level(&self) -> DurabilityLevel;

    /// Wraps the strategy running one invocation.
    fn wrap_invocation(
        &self,
        phase: Phase,
        transaction_id: TransactionId,
        exception_type: ExceptionType,
        strategy: Arc<dyn InvocationStrategy>,
    ) -> Arc<dyn InvocationStrategy>;

    /// Wraps the invoker making each per-node call of one invocation.
    fn wrap_invoker(
        &self,
        phase: Phase,
        transaction_id: TransactionId,
        exception_type: ExceptionType,
        invoker: Arc<dyn Invoker>,
    ) -> Arc<dyn Invoker>;

    /// Decides which nodes to deactivate given the events a crash left
    /// behind.
    async fn recover(&self, log: EventLog) -> RecoveryReport;
}
