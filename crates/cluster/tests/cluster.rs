use std::collections::BTreeSet;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tandem_balancer::{Node, NodeId};
use tandem_cluster::{
    ClusterConfig, ClusterError, DatabaseCluster, Invocation, NodeConfig, NodeConnector,
    NoopConnector,
};
use tandem_durability::{
    CapturedError, DurabilityListener, ExceptionType, InvocationEvent, InvokerEvent, InvokerResult,
    Phase, TransactionId,
};
use tandem_state::StateManager;
use tandem_state_fs::FsStateManager;

fn config(nodes: &[&str]) -> ClusterConfig {
    ClusterConfig::new("orders", nodes.iter().map(|id| NodeConfig::new(*id)).collect())
}

fn ids(nodes: &[&str]) -> BTreeSet<NodeId> {
    nodes.iter().map(|id| NodeId::from(*id)).collect()
}

fn active(cluster: &DatabaseCluster) -> BTreeSet<NodeId> {
    cluster.balancer().active_nodes().ids().cloned().collect()
}

/// Answers every call with the id of the node it ran on.
struct Echo;

#[async_trait]
impl tandem_durability::Invoker for Echo {
    async fn invoke(&self, node: &Node) -> Result<Bytes, CapturedError> {
        Ok(Bytes::copy_from_slice(node.id().as_str().as_bytes()))
    }
}

/// Tracks connections, refusing nodes listed in `refuse`.
#[derive(Default)]
struct Connections {
    open: Mutex<BTreeSet<NodeId>>,
    refuse: Mutex<BTreeSet<NodeId>>,
}

#[async_trait]
impl NodeConnector for Connections {
    async fn connect(&self, node: &Node) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.refuse.lock().contains(node.id()) {
            return Err(format!("{} is unreachable", node.id()).into());
        }
        self.open.lock().insert(node.id().clone());
        Ok(())
    }

    async fn disconnect(&self, node: &Node) {
        self.open.lock().remove(node.id());
    }
}

#[tokio::test]
async fn test_invocations_refused_until_started() {
    let cluster = DatabaseCluster::new(config(&["db1", "db2"]), Arc::new(NoopConnector)).unwrap();

    assert!(!cluster.is_started());
    assert_matches!(
        cluster
            .invoke(Invocation::write(Phase::Commit, ExceptionType::Sql), Arc::new(Echo))
            .await,
        Err(ClusterError::NotStarted(id)) if id == "orders"
    );
    assert_matches!(
        cluster.deactivate(&NodeId::from("db1")).await,
        Err(ClusterError::NotStarted(_))
    );
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    assert_matches!(
        DatabaseCluster::new(config(&[]), Arc::new(NoopConnector)),
        Err(ClusterError::Config(_))
    );
}

#[tokio::test]
async fn test_writes_reach_every_node_and_reads_one() {
    let connections = Arc::new(Connections::default());
    let cluster =
        DatabaseCluster::new(config(&["db1", "db2", "db3"]), connections.clone()).unwrap();
    cluster.start().await.unwrap();

    assert_eq!(*connections.open.lock(), ids(&["db1", "db2", "db3"]));
    assert_eq!(cluster.state().active_nodes(), ids(&["db1", "db2", "db3"]));

    let writes = cluster
        .invoke(Invocation::write(Phase::Commit, ExceptionType::Sql), Arc::new(Echo))
        .await
        .unwrap();
    assert_eq!(writes.len(), 3);
    assert_eq!(writes[&NodeId::from("db2")], Ok(Bytes::from_static(b"db2")));

    let reads = cluster
        .invoke(Invocation::read(Phase::Prepare, ExceptionType::Sql), Arc::new(Echo))
        .await
        .unwrap();
    assert_eq!(reads.len(), 1);

    // finished invocations leave nothing to recover
    assert!(cluster.state().recoverable_event_log().await.is_empty());

    cluster.stop().await.unwrap();
    assert!(connections.open.lock().is_empty());
    assert_matches!(
        cluster
            .invoke(Invocation::read(Phase::Prepare, ExceptionType::Sql), Arc::new(Echo))
            .await,
        Err(ClusterError::NotStarted(_))
    );
}

#[tokio::test]
async fn test_start_twice_fails() {
    let cluster = DatabaseCluster::new(config(&["db1"]), Arc::new(NoopConnector)).unwrap();
    cluster.start().await.unwrap();

    assert_matches!(cluster.start().await, Err(ClusterError::AlreadyStarted(_)));
}

#[tokio::test]
async fn test_unreachable_node_stays_inactive_until_activated() {
    let connections = Arc::new(Connections::default());
    connections.refuse.lock().insert(NodeId::from("db2"));
    let cluster = DatabaseCluster::new(config(&["db1", "db2"]), connections.clone()).unwrap();
    cluster.start().await.unwrap();

    assert_eq!(active(&cluster), ids(&["db1"]));
    assert_eq!(cluster.state().active_nodes(), ids(&["db1"]));

    let db2 = NodeId::from("db2");
    assert_matches!(
        cluster.activate(&db2).await,
        Err(ClusterError::Connect { node, .. }) if node == "db2"
    );

    connections.refuse.lock().clear();
    assert!(cluster.activate(&db2).await.unwrap());
    assert!(!cluster.activate(&db2).await.unwrap());
    assert_eq!(active(&cluster), ids(&["db1", "db2"]));
    assert_eq!(cluster.state().active_nodes(), ids(&["db1", "db2"]));
}

#[tokio::test]
async fn test_deactivated_node_leaves_writes() {
    let connections = Arc::new(Connections::default());
    let cluster =
        DatabaseCluster::new(config(&["db1", "db2", "db3"]), connections.clone()).unwrap();
    cluster.start().await.unwrap();

    assert!(cluster.deactivate(&NodeId::from("db2")).await.unwrap());
    assert!(!cluster.deactivate(&NodeId::from("db2")).await.unwrap());
    assert_matches!(
        cluster.deactivate(&NodeId::from("db9")).await,
        Err(ClusterError::UnknownNode(id)) if id == "db9"
    );

    let writes = cluster
        .invoke(Invocation::write(Phase::Commit, ExceptionType::Sql), Arc::new(Echo))
        .await
        .unwrap();
    assert_eq!(writes.keys().cloned().collect::<BTreeSet<_>>(), ids(&["db1", "db3"]));
    assert_eq!(*connections.open.lock(), ids(&["db1", "db3"]));
    assert_eq!(cluster.state().active_nodes(), ids(&["db1", "db3"]));
}

#[tokio::test]
async fn test_given_transaction_id_is_kept() {
    let cluster = DatabaseCluster::new(config(&["db1"]), Arc::new(NoopConnector)).unwrap();
    cluster.start().await.unwrap();

    let tx = cluster.transaction_id();
    assert_ne!(tx, cluster.transaction_id());

    let results = cluster
        .invoke(
            Invocation::write(Phase::Prepare, ExceptionType::Xa).in_transaction(tx),
            Arc::new(Echo),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn test_restart_deactivates_diverged_backup() {
    let dir = tempfile::tempdir().unwrap();

    // a previous run crashed with one commit in flight
    {
        let state = FsStateManager::new(dir.path());
        state.start().await.unwrap();
        state
            .set_active_nodes(ids(&["db1", "db2", "db3"]))
            .await
            .unwrap();

        let tx = TransactionId::Counter(42);
        state
            .before_invocation(&InvocationEvent::new(tx, Phase::Commit, ExceptionType::Sql))
            .await;
        for (node, value) in [("db1", "1"), ("db2", "0"), ("db3", "1")] {
            let mut event = InvokerEvent::new(tx, Phase::Commit, NodeId::from(node));
            state.before_invoker(&event).await;
            event.result = Some(InvokerResult::Value(Bytes::from(value)));
            state.after_invoker(&event).await;
        }
        state.stop().await.unwrap();
    }

    let mut config = config(&["db1", "db2", "db3"]);
    config.state.dir = Some(dir.path().to_path_buf());
    let cluster = DatabaseCluster::new(config, Arc::new(NoopConnector)).unwrap();
    cluster.start().await.unwrap();

    assert_eq!(active(&cluster), ids(&["db1", "db3"]));
    assert_eq!(cluster.state().active_nodes(), ids(&["db1", "db3"]));
    assert!(cluster.state().recoverable_event_log().await.is_empty());
    cluster.stop().await.unwrap();

    // the decision is persisted
    let state = FsStateManager::new(dir.path());
    state.start().await.unwrap();
    assert_eq!(state.active_nodes(), ids(&["db1", "db3"]));
    assert!(state.recoverable_event_log().await.is_empty());
}

#[tokio::test]
async fn test_restart_keeps_recorded_active_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&["db1", "db2", "db3"]);
    config.state.dir = Some(dir.path().to_path_buf());

    let cluster = DatabaseCluster::new(config.clone(), Arc::new(NoopConnector)).unwrap();
    cluster.start().await.unwrap();
    cluster.deactivate(&NodeId::from("db1")).await.unwrap();
    cluster.stop().await.unwrap();

    let cluster = DatabaseCluster::new(config, Arc::new(NoopConnector)).unwrap();
    cluster.start().await.unwrap();
    assert_eq!(active(&cluster), ids(&["db2", "db3"]));
}

#[tokio::test]
async fn test_none_durability_journals_nothing() {
    let mut config = config(&["db1", "db2"]);
    config.durability = "none".to_string();
    let cluster = DatabaseCluster::new(config, Arc::new(NoopConnector)).unwrap();
    cluster.start().await.unwrap();

    assert_eq!(cluster.durability(), tandem_durability::DurabilityLevel::None);
    cluster
        .invoke(Invocation::write(Phase::Commit, ExceptionType::Sql), Arc::new(Echo))
        .await
        .unwrap();
    assert!(cluster.state().recoverable_event_log().await.is_empty());
}

#[tokio::test]
async fn test_empty_cluster_refuses_invocations() {
    let connections = Arc::new(Connections::default());
    connections.refuse.lock().insert(NodeId::from("db1"));
    let cluster = DatabaseCluster::new(config(&["db1"]), connections).unwrap();
    cluster.start().await.unwrap();

    assert_matches!(
        cluster
            .invoke(Invocation::read(Phase::Commit, ExceptionType::Sql), Arc::new(Echo))
            .await,
        Err(ClusterError::Durability(
            tandem_durability::DurabilityError::NoActiveNodes
        ))
    );
}

#[tokio::test]
async fn test_abandoned_write_releases_cluster_lock() {
    struct Slow;

    #[async_trait]
    impl tandem_durability::Invoker for Slow {
        async fn invoke(&self, _node: &Node) -> Result<Bytes, CapturedError> {
            std::future::pending().await
        }
    }

    let connections = Arc::new(Connections::default());
    connections.refuse.lock().insert(NodeId::from("db2"));
    let cluster = DatabaseCluster::new(config(&["db1", "db2"]), connections.clone()).unwrap();
    cluster.start().await.unwrap();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        cluster.invoke(Invocation::write(Phase::Commit, ExceptionType::Sql), Arc::new(Slow)),
    )
    .await;
    assert!(abandoned.is_err());

    // the abandoned write released its share of the cluster lock
    connections.refuse.lock().clear();
    let activated =
        tokio::time::timeout(Duration::from_secs(1), cluster.activate(&NodeId::from("db2"))).await;
    assert!(activated.unwrap().unwrap());
}
