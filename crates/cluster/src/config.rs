//! Configuration structures for a database cluster.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_balancer::{Balancer, Locality, Node};
use tandem_durability::{DurabilityLevel, TransactionIdFactory, lookup_transaction_id_factory};
use tandem_locks::LockManager;
use tandem_locks_memory::MemoryLockManager;
use tandem_state::StateManager;
use tandem_state_fs::FsStateManager;
use tandem_state_memory::MemoryStateManager;

use crate::error::ConfigError;

/// Main configuration of a database cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Identifies the cluster. Group channels are named after it.
    pub id: String,

    /// Every database node, active or not.
    pub nodes: Vec<NodeConfig>,

    /// Balancer id: `simple`, `round-robin`, `random` or `load`.
    #[serde(default = "default_balancer")]
    pub balancer: String,

    /// Durability level id: `none`, `coarse` or `fine`.
    #[serde(default = "default_durability")]
    pub durability: String,

    /// Transaction id factory id: `simple` or `uuid`.
    #[serde(default = "default_transaction_id_factory")]
    pub transaction_id_factory: String,

    /// Lock configuration.
    #[serde(default)]
    pub locks: LockConfig,

    /// State configuration.
    #[serde(default)]
    pub state: StateConfig,
}

/// One database node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique id. Nodes are ordered by it.
    pub id: String,

    /// Share of read traffic. Zero excludes the node from reads.
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Whether the node runs on the same host.
    #[serde(default)]
    pub locality: Locality,
}

/// Lock configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockConfig {
    /// Grant locks in request order.
    #[serde(default)]
    pub fair: bool,

    /// Length of each attempt of a cluster-wide lock, in milliseconds.
    pub retry_interval_ms: Option<u64>,
}

/// State configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// Directory persisting the state. State is kept in memory if not set.
    pub dir: Option<PathBuf>,
}

fn default_balancer() -> String {
    "simple".to_string()
}

fn default_durability() -> String {
    "fine".to_string()
}

fn default_transaction_id_factory() -> String {
    "uuid".to_string()
}

const fn default_weight() -> u32 {
    1
}

impl ClusterConfig {
    /// A configuration over `nodes` with every other setting defaulted.
    pub fn new(id: impl Into<String>, nodes: Vec<NodeConfig>) -> Self {
        Self {
            id: id.into(),
            nodes,
            balancer: default_balancer(),
            durability: default_durability(),
            transaction_id_factory: default_transaction_id_factory(),
            locks: LockConfig::default(),
            state: StateConfig::default(),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a strategy id is not registered, if there are no
    /// nodes, or if node ids are empty or repeated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::EmptyNodes(self.id.clone()));
        }

        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(ConfigError::EmptyNodeId);
            }
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::DuplicateNode(node.id.clone()));
            }
        }

        tandem_balancer::lookup(&self.balancer)?;
        self.durability.parse::<DurabilityLevel>()?;
        lookup_transaction_id_factory(&self.transaction_id_factory)?;
        Ok(())
    }

    pub(crate) fn build_nodes(&self) -> Vec<Node> {
        self.nodes
            .iter()
            .map(|node| Node::new(node.id.as_str(), node.weight).with_locality(node.locality))
            .collect()
    }

    pub(crate) fn build_balancer(&self) -> Result<Arc<dyn Balancer>, ConfigError> {
        Ok(tandem_balancer::lookup(&self.balancer)?())
    }

    pub(crate) fn durability_level(&self) -> Result<DurabilityLevel, ConfigError> {
        Ok(self.durability.parse()?)
    }

    pub(crate) fn build_transaction_ids(
        &self,
    ) -> Result<Arc<dyn TransactionIdFactory>, ConfigError> {
        Ok(lookup_transaction_id_factory(&self.transaction_id_factory)?())
    }
}

impl LockConfig {
    pub(crate) fn build_local(&self) -> Arc<dyn LockManager> {
        Arc::new(MemoryLockManager::new(self.fair))
    }

    pub(crate) fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval_ms.map(Duration::from_millis)
    }
}

impl StateConfig {
    pub(crate) fn build_local(&self) -> Arc<dyn StateManager> {
        match &self.dir {
            Some(dir) => Arc::new(FsStateManager::new(dir.clone())),
            None => Arc::new(MemoryStateManager::new()),
        }
    }
}

impl NodeConfig {
    /// A node of weight 1.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            weight: default_weight(),
            locality: Locality::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use tandem_balancer::BalancerError;
    use tandem_durability::DurabilityError;

    const CONFIG: &str = r#"
        id = "orders"
        balancer = "load"
        durability = "coarse"

        [[nodes]]
        id = "db1"
        weight = 2
        locality = "local"

        [[nodes]]
        id = "db2"

        [locks]
        fair = true
        retry_interval_ms = 250

        [state]
        dir = "/var/lib/tandem/orders"
    "#;

    #[test]
    fn test_parse_toml() {
        let config: ClusterConfig = toml::from_str(CONFIG).unwrap();
        config.validate().unwrap();

        assert_eq!(config.transaction_id_factory, "uuid");
        assert_eq!(config.nodes[0].locality, Locality::Local);
        assert_eq!(config.nodes[1].weight, 1);
        assert_eq!(config.nodes[1].locality, Locality::Remote);
        assert_eq!(config.locks.retry_interval(), Some(Duration::from_millis(250)));
        assert_eq!(config.durability_level().unwrap(), DurabilityLevel::Coarse);
        assert_eq!(config.state.dir, Some(PathBuf::from("/var/lib/tandem/orders")));
    }

    #[test]
    fn test_minimal_config_takes_defaults() {
        let config: ClusterConfig = toml::from_str(
            r#"
            id = "orders"
            nodes = [{ id = "db1" }]
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.balancer, "simple");
        assert_eq!(config.durability, "fine");
        assert!(!config.locks.fair);
        assert!(config.state.dir.is_none());
    }

    #[test]
    fn test_rejects_unknown_ids() {
        let mut config = ClusterConfig::new("orders", vec![NodeConfig::new("db1")]);
        config.balancer = "fastest".to_string();
        assert_matches!(
            config.validate(),
            Err(ConfigError::Balancer(BalancerError::UnknownBalancer(id))) if id == "fastest"
        );

        let mut config = ClusterConfig::new("orders", vec![NodeConfig::new("db1")]);
        config.durability = "paranoid".to_string();
        assert_matches!(
            config.validate(),
            Err(ConfigError::Durability(DurabilityError::UnknownLevel(_)))
        );

        let mut config = ClusterConfig::new("orders", vec![NodeConfig::new("db1")]);
        config.transaction_id_factory = "jta".to_string();
        assert_matches!(
            config.validate(),
            Err(ConfigError::Durability(DurabilityError::UnknownTransactionIdFactory(_)))
        );
    }

    #[test]
    fn test_rejects_bad_node_lists() {
        let config = ClusterConfig::new("orders", vec![]);
        assert_matches!(config.validate(), Err(ConfigError::EmptyNodes(id)) if id == "orders");

        let config =
            ClusterConfig::new("orders", vec![NodeConfig::new("db1"), NodeConfig::new("db1")]);
        assert_matches!(config.validate(), Err(ConfigError::DuplicateNode(id)) if id == "db1");

        let config = ClusterConfig::new("orders", vec![NodeConfig::new("")]);
        assert_matches!(config.validate(), Err(ConfigError::EmptyNodeId));
    }
}
