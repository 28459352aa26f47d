use std::sync::Arc;

use crate::Balancer;
use crate::active::ActiveSet;
use crate::node::Node;
use crate::set::NodeSet;

/// Sends every read to the highest weight node. Ties go to the lowest id.
pub struct SimpleBalancer {
    active: ActiveSet<Option<Node>>,
}

impl SimpleBalancer {
    /// Creates an empty balancer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: ActiveSet::new(None, heaviest),
        }
    }
}

impl Default for SimpleBalancer {
    fn default() -> Self {
        Self::new()
    }
}

fn heaviest(nodes: &NodeSet, _previous: &Option<Node>) -> Option<Node> {
    let mut best: Option<&Node> = None;
    for node in nodes {
        if best.is_none_or(|best| node.weight() > best.weight()) {
            best = Some(node);
        }
    }
    best.cloned()
}

impl Balancer for SimpleBalancer {
    fn active_nodes(&self) -> Arc<NodeSet> {
        self.active.load().nodes.clone()
    }

    fn next(&self) -> Option<Node> {
        self.active.load().derived.clone()
    }

    fn add(&self, node: Node) -> bool {
        self.active.add(node)
    }

    fn remove(&self, node: &Node) -> bool {
        self.active.remove(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_highest_weight_wins() {
        let balancer = SimpleBalancer::new();
        balancer.add(Node::new("db1", 1));
        balancer.add(Node::new("db2", 3));
        balancer.add(Node::new("db3", 3));

        assert_eq!(balancer.next().unwrap().id().as_str(), "db2");

        balancer.remove(&Node::new("db2", 3));
        assert_eq!(balancer.next().unwrap().id().as_str(), "db3");
    }

    #[test]
    fn test_all_zero_weight_falls_back_to_primary() {
        let balancer = SimpleBalancer::new();
        balancer.add(Node::new("db2", 0));
        balancer.add(Node::new("db1", 0));

        assert_eq!(balancer.next(), balancer.primary());
    }
}
