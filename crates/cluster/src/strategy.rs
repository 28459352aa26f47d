//! Which nodes an invocation runs on.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tandem_balancer::{Balancer, BalancerExt};
use tandem_durability::{DurabilityError, InvocationResults, InvocationStrategy, Invoker};

/// Where an invocation goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// Every active node, concurrently. For writes.
    All,
    /// The node the balancer picks. For reads.
    Next,
}

impl Target {
    pub(crate) fn strategy(self, balancer: Arc<dyn Balancer>) -> Arc<dyn InvocationStrategy> {
        match self {
            Self::All => Arc::new(InvokeOnAll { balancer }),
            Self::Next => Arc::new(InvokeOnNext { balancer }),
        }
    }
}

/// Runs the invoker on every active node concurrently.
pub struct InvokeOnAll {
    balancer: Arc<dyn Balancer>,
}

impl InvokeOnAll {
    /// Creates the strategy over `balancer`.
    #[must_use]
    pub fn new(balancer: Arc<dyn Balancer>) -> Self {
        Self { balancer }
    }
}

#[async_trait]
impl InvocationStrategy for InvokeOnAll {
    async fn invoke(&self, invoker: &dyn Invoker) -> Result<InvocationResults, DurabilityError> {
        let nodes = self.balancer.active_nodes();
        if nodes.is_empty() {
            return Err(DurabilityError::NoActiveNodes);
        }

        let calls = nodes.iter().map(|node| async move {
            let result = self.balancer.invoke(node, invoker.invoke(node)).await;
            (node.id().clone(), result)
        });
        Ok(join_all(calls).await.into_iter().collect())
    }
}

/// Runs the invoker on the node the balancer picks.
pub struct InvokeOnNext {
    balancer: Arc<dyn Balancer>,
}

impl InvokeOnNext {
    /// Creates the strategy over `balancer`.
    #[must_use]
    pub fn new(balancer: Arc<dyn Balancer>) -> Self {
        Self { balancer }
    }
}

#[async_trait]
impl InvocationStrategy for InvokeOnNext {
    async fn invoke(&self, invoker: &dyn Invoker) -> Result<InvocationResults, DurabilityError> {
        let node = self.balancer.next().ok_or(DurabilityError::NoActiveNodes)?;
        let result = self.balancer.invoke(&node, invoker.invoke(&node)).await;
        Ok(InvocationResults::from([(node.id().clone(), result)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use assert_matches::assert_matches;
    use bytes::Bytes;
    use tandem_balancer::{LoadBalancer, Node, NodeId};
    use tandem_durability::CapturedError;

    struct Echo;

    #[async_trait]
    impl Invoker for Echo {
        async fn invoke(&self, node: &Node) -> Result<Bytes, CapturedError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if node.weight() == 0 {
                return Err(CapturedError::sql(1, None, "read only"));
            }
            Ok(Bytes::copy_from_slice(node.id().as_str().as_bytes()))
        }
    }

    fn balancer() -> Arc<LoadBalancer> {
        let balancer = LoadBalancer::new();
        balancer.add(Node::new("db1", 1));
        balancer.add(Node::new("db2", 0));
        Arc::new(balancer)
    }

    #[tokio::test]
    async fn test_all_reaches_every_node() {
        let results = InvokeOnAll::new(balancer()).invoke(&Echo).await.unwrap();

        assert_eq!(results[&NodeId::from("db1")], Ok(Bytes::from_static(b"db1")));
        assert!(results[&NodeId::from("db2")].is_err());
    }

    #[tokio::test]
    async fn test_next_uses_balancer_and_releases_load() {
        let balancer = balancer();
        let results = InvokeOnNext::new(balancer.clone()).invoke(&Echo).await.unwrap();

        assert_eq!(results.keys().collect::<Vec<_>>(), [&NodeId::from("db1")]);
        assert_eq!(balancer.load(&Node::new("db1", 1)), 0);
    }

    #[tokio::test]
    async fn test_empty_cluster() {
        let balancer = Arc::new(LoadBalancer::new());
        assert_matches!(
            InvokeOnAll::new(balancer.clone()).invoke(&Echo).await,
            Err(DurabilityError::NoActiveNodes)
        );
        assert_matches!(
            InvokeOnNext::new(balancer).invoke(&Echo).await,
            Err(DurabilityError::NoActiveNodes)
        );
    }
}
