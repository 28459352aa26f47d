//! Error types for the cluster.

use std::error::Error as StdError;

use tandem_balancer::BalancerError;
use tandem_dispatch::DispatchError;
use tandem_durability::DurabilityError;
use tandem_locks::LockError;
use tandem_state::StateError;
use thiserror::Error;

/// Errors found while validating a cluster configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The balancer id is not registered.
    #[error(transparent)]
    Balancer(#[from] BalancerError),

    /// Two nodes share an id.
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    /// The durability level or transaction id factory is not registered.
    #[error(transparent)]
    Durability(#[from] DurabilityError),

    /// The cluster has no nodes.
    #[error("cluster '{0}' has no nodes")]
    EmptyNodes(String),

    /// A node id is empty.
    #[error("node ids must not be empty")]
    EmptyNodeId,
}

/// Errors that can occur while running a cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The cluster is already running.
    #[error("cluster '{0}' is already started")]
    AlreadyStarted(String),

    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A node could not be connected.
    #[error("failed to connect node '{node}'")]
    Connect {
        /// The node.
        node: String,
        /// What went wrong.
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The group could not be reached.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The invocation could not be run.
    #[error(transparent)]
    Durability(#[from] DurabilityError),

    /// A cluster lock could not be taken or released.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Invocations are refused until recovery has run.
    #[error("cluster '{0}' is not started")]
    NotStarted(String),

    /// Cluster state could not be recorded.
    #[error(transparent)]
    State(#[from] StateError),

    /// The node is not part of the configuration.
    #[error("unknown node '{0}'")]
    UnknownNode(String),
}
