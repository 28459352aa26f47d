//! In-memory (single process) implementation of cluster state, for tests and
//! deployments that accept losing state on restart.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::BTreeSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use tandem_balancer::NodeId;
use tandem_durability::{DurabilityListener, EventLog, InvocationEvent, InvokerEvent};
use tandem_state::{Journal, StateError, StateManager};
use tracing::debug;

/// Cluster state that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStateManager {
    active: Mutex<BTreeSet<NodeId>>,
    journal: Mutex<Journal>,
}

impl MemoryStateManager {
    /// Creates an empty `MemoryStateManager`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurabilityListener for MemoryStateManager {
    async fn before_invocation(&self, event: &InvocationEvent) {
        self.journal.lock().begin(event);
    }

    async fn after_invocation(&self, event: &InvocationEvent) {
        self.journal.lock().end(event);
    }

    async fn before_invoker(&self, event: &InvokerEvent) {
        self.journal.lock().record(event);
    }

    async fn after_invoker(&self, event: &InvokerEvent) {
        self.journal.lock().record(event);
    }
}

#[async_trait]
impl StateManager for MemoryStateManager {
    async fn start(&self) -> Result<(), StateError> {
        debug!("Memory state manager started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), StateError> {
        Ok(())
    }

    fn active_nodes(&self) -> BTreeSet<NodeId> {
        self.active.lock().clone()
    }

    async fn set_active_nodes(&self, nodes: BTreeSet<NodeId>) -> Result<(), StateError> {
        *self.active.lock() = nodes;
        Ok(())
    }

    async fn activated(&self, node: &NodeId) -> Result<(), StateError> {
        self.active.lock().insert(node.clone());
        Ok(())
    }

    async fn deactivated(&self, node: &NodeId) -> Result<(), StateError> {
        self.active.lock().remove(node);
        Ok(())
    }

    async fn recoverable_event_log(&self) -> EventLog {
        self.journal.lock().log().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use tandem_durability::{ExceptionType, InvokerResult, Phase, TransactionId};

    #[tokio::test]
    async fn test_active_set() {
        let state = MemoryStateManager::new();
        state.activated(&NodeId::from("db2")).await.unwrap();
        state.activated(&NodeId::from("db1")).await.unwrap();
        state.deactivated(&NodeId::from("db2")).await.unwrap();

        assert_eq!(state.active_nodes(), BTreeSet::from([NodeId::from("db1")]));
    }

    #[tokio::test]
    async fn test_open_invocations_are_recoverable() {
        let state = MemoryStateManager::new();
        let tx = TransactionId::Counter(1);
        let open = InvocationEvent::new(tx, Phase::Prepare, ExceptionType::Xa);
        let closed = InvocationEvent::new(tx, Phase::Commit, ExceptionType::Xa);

        state.before_invocation(&open).await;
        state.before_invocation(&closed).await;
        let mut event = InvokerEvent::new(tx, Phase::Prepare, NodeId::from("db1"));
        state.before_invoker(&event).await;
        event.result = Some(InvokerResult::Value(Bytes::new()));
        state.after_invoker(&event).await;
        state.after_invocation(&closed).await;

        let log = state.recoverable_event_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[&open][&NodeId::from("db1")], event);
    }
}
