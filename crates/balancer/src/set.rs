//! Immutable snapshot of the active node set.

use std::collections::BTreeMap;

use crate::node::{Node, NodeId};

/// An immutable set of active nodes ordered by [`NodeId`].
///
/// Mutation produces a new set; existing snapshots never change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeSet {
    nodes: BTreeMap<NodeId, Node>,
}

impl NodeSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether a node with `id` is in the set.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// The node with `id`, if present.
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Node ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    /// The lowest-ordered node.
    #[must_use]
    pub fn primary(&self) -> Option<&Node> {
        self.nodes.values().next()
    }

    /// Every node except the primary.
    pub fn backups(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().skip(1)
    }

    /// A copy of this set with `node` added, or `None` if it is already
    /// present.
    #[must_use]
    pub fn with(&self, node: Node) -> Option<Self> {
        if self.nodes.contains_key(node.id()) {
            return None;
        }
        let mut nodes = self.nodes.clone();
        nodes.insert(node.id().clone(), node);
        Some(Self { nodes })
    }

    /// A copy of this set without `id`, or `None` if it is absent.
    #[must_use]
    pub fn without(&self, id: &NodeId) -> Option<Self> {
        if !self.nodes.contains_key(id) {
            return None;
        }
        let mut nodes = self.nodes.clone();
        nodes.remove(id);
        Some(Self { nodes })
    }
}

impl FromIterator<Node> for NodeSet {
    fn from_iter<I: IntoIterator<Item = Node>>(iter: I) -> Self {
        Self {
            nodes: iter
                .into_iter()
                .map(|node| (node.id().clone(), node))
                .collect(),
        }
    }
}

impl<'a> IntoIterator for &'a NodeSet {
    type Item = &'a Node;
    type IntoIter = std::collections::btree_map::Values<'a, NodeId, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.values()
    }
}
