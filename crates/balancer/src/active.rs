//! Copy-on-write holder shared by every policy.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

use crate::node::Node;
use crate::set::NodeSet;

/// A node set snapshot together with the policy state derived from it.
pub struct View<D> {
    pub nodes: Arc<NodeSet>,
    pub derived: D,
}

/// Builds the policy state for a new set, given the previous state.
pub type Derive<D> = fn(&NodeSet, &D) -> D;

/// Atomically swapped [`View`]. Writers serialize on a mutex and build the
/// next view from the current one; readers load whichever view is current.
pub struct ActiveSet<D> {
    view: ArcSwap<View<D>>,
    update: Mutex<()>,
    derive: Derive<D>,
}

impl<D> ActiveSet<D> {
    pub fn new(initial: D, derive: Derive<D>) -> Self {
        Self {
            view: ArcSwap::from_pointee(View {
                nodes: Arc::new(NodeSet::new()),
                derived: initial,
            }),
            update: Mutex::new(()),
            derive,
        }
    }

    pub fn load(&self) -> Arc<View<D>> {
        self.view.load_full()
    }

    pub fn add(&self, node: Node) -> bool {
        let _update = self.update.lock();
        let current = self.view.load();
        let id = node.id().clone();
        let Some(nodes) = current.nodes.with(node) else {
            return false;
        };
        self.swap(&current, nodes);
        debug!(node = %id, "Node activated in balancer");
        true
    }

    pub fn remove(&self, node: &Node) -> bool {
        let _update = self.update.lock();
        let current = self.view.load();
        let Some(nodes) = current.nodes.without(node.id()) else {
            return false;
        };
        self.swap(&current, nodes);
        debug!(node = %node.id(), "Node deactivated in balancer");
        true
    }

    fn swap(&self, current: &View<D>, nodes: NodeSet) {
        let derived = (self.derive)(&nodes, &current.derived);
        self.view.store(Arc::new(View {
            nodes: Arc::new(nodes),
            derived,
        }));
    }
}
