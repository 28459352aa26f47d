//! Active node tracking and read target selection.
//!
//! A balancer holds the set of currently active database nodes. Its primary
//! is the lowest-ordered active node, so every member of a cluster agrees on
//! it without communicating. Read traffic goes to [`Balancer::next`], whose
//! choice depends on the policy:
//! - [`SimpleBalancer`]: the highest weight node
//! - [`RoundRobinBalancer`]: a rotation in which each node appears `weight` times
//! - [`RandomBalancer`]: a random node, with probability proportional to weight
//! - [`LoadBalancer`]: the node with the lowest in-flight calls per unit of weight
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod active;
pub mod error;
mod node;
mod policy;
mod registry;
mod set;

pub use error::BalancerError;
pub use node::{Locality, Node, NodeId};
pub use policy::{LoadBalancer, RandomBalancer, RoundRobinBalancer, SimpleBalancer};
pub use registry::{BalancerFactory, ids, lookup};
pub use set::NodeSet;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Tracks active nodes and picks targets for read traffic.
pub trait Balancer: Send + Sync + 'static {
    /// The current snapshot of active nodes.
    fn active_nodes(&self) -> Arc<NodeSet>;

    /// The lowest-ordered active node.
    fn primary(&self) -> Option<Node> {
        self.active_nodes().primary().cloned()
    }

    /// Every active node except the primary.
    fn backups(&self) -> Vec<Node> {
        self.active_nodes().backups().cloned().collect()
    }

    /// The node the next read should go to.
    fn next(&self) -> Option<Node>;

    /// Activates `node`. Returns whether the active set changed.
    fn add(&self, node: Node) -> bool;

    /// Deactivates `node`. Returns whether the active set changed.
    fn remove(&self, node: &Node) -> bool;

    /// Records the start of a call against `node`. The call ends when the
    /// returned guard drops.
    fn begin(&self, _node: &Node) -> InFlight {
        InFlight::untracked()
    }
}

/// An in-flight call against a node.
#[derive(Debug)]
#[must_use = "the call ends as soon as the guard is dropped"]
pub struct InFlight {
    counter: Option<Arc<AtomicUsize>>,
}

impl InFlight {
    /// A call the balancer does not keep count of.
    pub const fn untracked() -> Self {
        Self { counter: None }
    }

    pub(crate) fn tracked(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: Some(counter),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(counter) = &self.counter {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Extension methods for every [`Balancer`].
pub trait BalancerExt: Balancer {
    /// Runs `call` against `node`, keeping the balancer's load bookkeeping
    /// consistent whether the call succeeds, fails or is cancelled.
    fn invoke<F>(&self, node: &Node, call: F) -> impl Future<Output = F::Output> + Send
    where
        F: Future + Send,
        F::Output: Send;
}

impl<B: Balancer + ?Sized> BalancerExt for B {
    fn invoke<F>(&self, node: &Node, call: F) -> impl Future<Output = F::Output> + Send
    where
        F: Future + Send,
        F::Output: Send,
    {
        let in_flight = self.begin(node);
        async move {
            let _in_flight = in_flight;
            call.await
        }
    }
}
