use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use tandem_balancer::NodeId;
use tandem_dispatch::Member;
use tandem_dispatch_memory::MemoryGroup;
use tandem_durability::{
    DurabilityListener, EventLog, ExceptionType, InvocationEvent, InvokerEvent, Phase,
    TransactionId,
};
use tandem_state::{StateError, StateEvent, StateManager};
use tandem_state_distributed::{DistributedStateManager, DistributedStateManagerConfig};
use tandem_state_memory::MemoryStateManager;
use tokio::sync::broadcast;

fn member(
    group: &MemoryGroup,
    name: &str,
    local: Arc<dyn StateManager>,
) -> DistributedStateManager {
    DistributedStateManager::new(
        group,
        DistributedStateManagerConfig {
            channel: "state".to_string(),
            local: Member::new(name),
            event_capacity: None,
        },
        local,
    )
}

async fn join(group: &MemoryGroup, name: &str) -> DistributedStateManager {
    let state = member(group, name, Arc::new(MemoryStateManager::new()));
    state.start().await.unwrap();
    state
}

/// Memory state that takes its time installing an active node set.
#[derive(Default)]
struct SlowInstall(MemoryStateManager);

#[async_trait]
impl DurabilityListener for SlowInstall {
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

#[async_trait]
impl StateManager for SlowInstall {
    async fn start(&self) -> Result<(), StateError> {
        self.0.start().await
    }

    async fn stop(&self) -> Result<(), StateError> {
        self.0.stop().await
    }

    fn active_nodes(&self) -> BTreeSet<NodeId> {
        self.0.active_nodes()
    }

    async fn set_active_nodes(&self, nodes: BTreeSet<NodeId>) -> Result<(), StateError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.0.set_active_nodes(nodes).await
    }

    async fn activated(&self, node: &NodeId) -> Result<(), StateError> {
        self.0.activated(node).await
    }

    async fn deactivated(&self, node: &NodeId) -> Result<(), StateError> {
        self.0.deactivated(node).await
    }

    async fn recoverable_event_log(&self) -> EventLog {
        self.0.recoverable_event_log().await
    }
}

async fn next_event(events: &mut broadcast::Receiver<StateEvent>) -> StateEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_activation_reaches_every_member() {
    let group = MemoryGroup::new();
    let a = join(&group, "a").await;
    let b = join(&group, "b").await;
    let mut events = b.subscribe().unwrap();

    a.activated(&NodeId::from("db1")).await.unwrap();
    a.activated(&NodeId::from("db2")).await.unwrap();
    a.deactivated(&NodeId::from("db1")).await.unwrap();

    assert_eq!(next_event(&mut events).await, StateEvent::Activated(NodeId::from("db1")));
    assert_eq!(next_event(&mut events).await, StateEvent::Activated(NodeId::from("db2")));
    assert_eq!(next_event(&mut events).await, StateEvent::Deactivated(NodeId::from("db1")));
    assert_eq!(b.active_nodes(), BTreeSet::from([NodeId::from("db2")]));
}

#[tokio::test]
async fn test_originator_does_not_hear_itself() {
    let group = MemoryGroup::new();
    let a = join(&group, "a").await;
    let mut events = a.subscribe().unwrap();

    a.activated(&NodeId::from("db1")).await.unwrap();

    assert_matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty));
    assert_eq!(a.active_nodes(), BTreeSet::from([NodeId::from("db1")]));
}

#[tokio::test]
async fn test_joiner_takes_active_nodes_from_coordinator() {
    let group = MemoryGroup::new();
    let a = join(&group, "a").await;
    a.set_active_nodes(BTreeSet::from([NodeId::from("db1"), NodeId::from("db3")]))
        .await
        .unwrap();

    let c = join(&group, "c").await;
    assert_eq!(c.active_nodes(), a.active_nodes());
}

#[tokio::test]
async fn test_change_during_join_is_applied_after_snapshot() {
    let group = MemoryGroup::new();
    let a = join(&group, "a").await;
    a.set_active_nodes(BTreeSet::from([NodeId::from("db1"), NodeId::from("db2")]))
        .await
        .unwrap();

    let c = Arc::new(member(&group, "c", Arc::new(SlowInstall::default())));
    let joining = tokio::spawn({
        let c = c.clone();
        async move { c.start().await }
    });

    // c is in the view and still installing the snapshot
    tokio::time::sleep(Duration::from_millis(30)).await;
    a.deactivated(&NodeId::from("db2")).await.unwrap();
    joining.await.unwrap().unwrap();

    assert_eq!(a.active_nodes(), BTreeSet::from([NodeId::from("db1")]));
    assert_eq!(c.active_nodes(), a.active_nodes());
}

#[tokio::test]
async fn test_crash_publishes_open_invocations() {
    let group = MemoryGroup::new();
    let a = join(&group, "a").await;
    let b = join(&group, "b").await;
    let mut events = b.subscribe().unwrap();

    let tx = TransactionId::Counter(1);
    let open = InvocationEvent::new(tx, Phase::Commit, ExceptionType::Sql);
    let done = InvocationEvent::new(tx, Phase::Prepare, ExceptionType::Sql);
    a.before_invocation(&done).await;
    a.after_invocation(&done).await;
    a.before_invocation(&open).await;
    a.before_invoker(&InvokerEvent::new(tx, Phase::Commit, NodeId::from("db2")))
        .await;
    assert_eq!(b.context().open_invocations(a.local()).len(), 1);

    // crash with the commit in flight
    a.stop().await.unwrap();

    let (member, log) = assert_matches!(
        next_event(&mut events).await,
        StateEvent::Orphaned { member, log } => (member, log)
    );
    assert_eq!(&member, a.local());
    assert_eq!(log.keys().collect::<Vec<_>>(), [&open]);
    assert!(log[&open].contains_key(&NodeId::from("db2")));
    assert!(b.context().open_invocations(a.local()).is_empty());
}

#[tokio::test]
async fn test_clean_departure_publishes_nothing() {
    let group = MemoryGroup::new();
    let a = join(&group, "a").await;
    let b = join(&group, "b").await;
    let mut events = b.subscribe().unwrap();

    let event = InvocationEvent::new(TransactionId::Counter(7), Phase::Rollback, ExceptionType::Xa);
    a.before_invocation(&event).await;
    a.after_invocation(&event).await;
    a.stop().await.unwrap();

    assert_matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty));
}
