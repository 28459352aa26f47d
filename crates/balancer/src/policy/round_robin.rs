use std::sync::Arc;

use parking_lot::Mutex;

use crate::Balancer;
use crate::active::ActiveSet;
use crate::node::Node;
use crate::set::NodeSet;

/// Rotates reads through the active nodes. A node of weight `w` is picked
/// `w` times in a row before the rotation moves on; weight zero nodes are
/// only reached when nothing else is eligible, as the primary.
pub struct RoundRobinBalancer {
    active: ActiveSet<Rotation>,
}

impl RoundRobinBalancer {
    /// Creates an empty balancer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: ActiveSet::new(Rotation::default(), rotation),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Rotation {
    /// Nodes with a non-zero weight, in set order.
    eligible: Vec<Node>,
    cursor: Mutex<Cursor>,
}

#[derive(Default)]
struct Cursor {
    index: usize,
    /// Picks of `eligible[index]` so far in this turn.
    served: u32,
}

fn rotation(nodes: &NodeSet, _previous: &Rotation) -> Rotation {
    Rotation {
        eligible: nodes.iter().filter(|node| node.weight() > 0).cloned().collect(),
        cursor: Mutex::new(Cursor::default()),
    }
}

impl Balancer for RoundRobinBalancer {
    fn active_nodes(&self) -> Arc<NodeSet> {
        self.active.load().nodes.clone()
    }

    fn next(&self) -> Option<Node> {
        let view = self.active.load();
        let rotation = &view.derived;
        if rotation.eligible.is_empty() {
            return view.nodes.primary().cloned();
        }

        let mut cursor = rotation.cursor.lock();
        let node = rotation.eligible[cursor.index].clone();
        cursor.served += 1;
        if cursor.served >= node.weight() {
            cursor.served = 0;
            cursor.index = (cursor.index + 1) % rotation.eligible.len();
        }
        Some(node)
    }

    fn add(&self, node: Node) -> bool {
        self.active.add(node)
    }

    fn remove(&self, node: &Node) -> bool {
        self.active.remove(node)
    }
}
