//! Balancers by configuration id.

use std::sync::Arc;

use crate::error::BalancerError;
use crate::policy::{LoadBalancer, RandomBalancer, RoundRobinBalancer, SimpleBalancer};
use crate::Balancer;

/// Creates an empty balancer.
pub type BalancerFactory = fn() -> Arc<dyn Balancer>;

static REGISTRY: [(&str, BalancerFactory); 4] = [
    ("simple", simple),
    ("round-robin", round_robin),
    ("random", random),
    ("load", load),
];

fn simple() -> Arc<dyn Balancer> {
    Arc::new(SimpleBalancer::new())
}

fn round_robin() -> Arc<dyn Balancer> {
    Arc::new(RoundRobinBalancer::new())
}

fn random() -> Arc<dyn Balancer> {
    Arc::new(RandomBalancer::new())
}

fn load() -> Arc<dyn Balancer> {
    Arc::new(LoadBalancer::new())
}

/// Looks up the factory registered under `id`.
///
/// # Errors
///
/// Returns [`BalancerError::UnknownBalancer`] if nothing is registered under `id`.
pub fn lookup(id: &str) -> Result<BalancerFactory, BalancerError> {
    REGISTRY
        .iter()
        .find(|(registered, _)| *registered == id)
        .map(|(_, factory)| *factory)
        .ok_or_else(|| BalancerError::UnknownBalancer(id.to_string()))
}

/// Every registered id.
pub fn ids() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(id, _)| *id)
}
