//! Database node identity.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Unique identifier of a configured database node.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Where a node runs relative to this process. Informational only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locality {
    /// Same host.
    Local,
    /// Another host.
    #[default]
    Remote,
}

/// A configured backend database.
///
/// Identity, equality and ordering are by [`NodeId`] alone, so a node whose
/// weight was reconfigured is still the same node.
#[derive(Clone, Debug)]
pub struct Node {
    id: NodeId,
    weight: u32,
    locality: Locality,
}

impl Node {
    /// Creates a remote node.
    pub fn new(id: impl Into<NodeId>, weight: u32) -> Self {
        Self {
            id: id.into(),
            weight,
            locality: Locality::default(),
        }
    }

    /// Sets the node's locality.
    #[must_use]
    pub const fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    /// The node's id.
    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.id
    }

    /// Relative share of read traffic. Zero excludes the node from load
    /// sharing; it is still written to.
    #[must_use]
    pub const fn weight(&self) -> u32 {
        self.weight
    }

    /// The node's locality.
    #[must_use]
    pub const fn locality(&self) -> Locality {
        self.locality
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_weight() {
        let a = Node::new("db1", 1);
        let b = Node::new("db1", 5).with_locality(Locality::Local);
        assert_eq!(a, b);
        assert!(Node::new("db1", 1) < Node::new("db2", 1));
    }
}
