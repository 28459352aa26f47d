//! Error types for balancers.

use thiserror::Error;

/// Errors that can occur when selecting a balancer.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// No balancer is registered under the id.
    #[error("unknown balancer '{0}'")]
    UnknownBalancer(String),
}
