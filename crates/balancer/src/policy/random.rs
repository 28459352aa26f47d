use std::sync::Arc;

use rand::Rng;

use crate::Balancer;
use crate::active::ActiveSet;
use crate::node::Node;
use crate::set::NodeSet;

/// Picks a random node with probability proportional to its weight.
pub struct RandomBalancer {
    active: ActiveSet<u64>,
}

impl RandomBalancer {
    /// Creates an empty balancer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: ActiveSet::new(0, total_weight),
        }
    }
}

impl Default for RandomBalancer {
    fn default() -> Self {
        Self::new()
    }
}

fn total_weight(nodes: &NodeSet, _previous: &u64) -> u64 {
    nodes.iter().map(|node| u64::from(node.weight())).sum()
}

impl Balancer for RandomBalancer {
    fn active_nodes(&self) -> Arc<NodeSet> {
        self.active.load().nodes.clone()
    }

    fn next(&self) -> Option<Node> {
        let view = self.active.load();
        if view.derived == 0 {
            return view.nodes.primary().cloned();
        }

        let mut point = rand::thread_rng().gen_range(0..view.derived);
        for node in view.nodes.iter() {
            let weight = u64::from(node.weight());
            if point < weight {
                return Some(node.clone());
            }
            point -= weight;
        }
        view.nodes.primary().cloned()
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
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_zero_weight_never_picked_while_others_exist() {
        let balancer = RandomBalancer::new();
        balancer.add(Node::new("db1", 0));
        balancer.add(Node::new("db2", 1));
        balancer.add(Node::new("db3", 3));

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..2000 {
            let node = balancer.next().unwrap();
            *counts.entry(node.id().to_string()).or_default() += 1;
        }

        assert!(!counts.contains_key("db1"));
        // expected ratio 1:3
        assert!(counts["db3"] > counts["db2"]);
    }

    #[test]
    fn test_single_node() {
        let balancer = RandomBalancer::new();
        balancer.add(Node::new("db1", 0));
        assert_eq!(balancer.next().unwrap().id().as_str(), "db1");
    }
}
