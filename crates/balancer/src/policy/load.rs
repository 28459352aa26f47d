use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::active::ActiveSet;
use crate::node::{Node, NodeId};
use crate::set::NodeSet;
use crate::{Balancer, InFlight};

type Loads = BTreeMap<NodeId, Arc<AtomicUsize>>;

/// Sends reads to the node with the fewest in-flight calls per unit of
/// weight. Calls are counted through [`Balancer::begin`], usually via
/// [`BalancerExt::invoke`](crate::BalancerExt::invoke).
pub struct LoadBalancer {
    active: ActiveSet<Loads>,
}

impl LoadBalancer {
    /// Creates an empty balancer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: ActiveSet::new(Loads::new(), carry_over),
        }
    }

    /// Calls currently in flight against `node`.
    #[must_use]
    pub fn load(&self, node: &Node) -> usize {
        self.active
            .load()
            .derived
            .get(node.id())
            .map_or(0, |counter| counter.load(Ordering::SeqCst))
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

fn carry_over(nodes: &NodeSet, previous: &Loads) -> Loads {
    nodes
        .ids()
        .map(|id| {
            let counter = previous.get(id).cloned().unwrap_or_default();
            (id.clone(), counter)
        })
        .collect()
}

/// Compares `load_a / weight_a` with `load_b / weight_b` without division.
/// Weight zero counts as infinite load.
fn compare(load_a: usize, weight_a: u32, load_b: usize, weight_b: u32) -> CmpOrdering {
    match (weight_a, weight_b) {
        (0, 0) => CmpOrdering::Equal,
        (0, _) => CmpOrdering::Greater,
        (_, 0) => CmpOrdering::Less,
        _ => {
            let a = load_a as u128 * u128::from(weight_b);
            let b = load_b as u128 * u128::from(weight_a);
            a.cmp(&b)
        }
    }
}

impl Balancer for LoadBalancer {
    fn active_nodes(&self) -> Arc<NodeSet> {
        self.active.load().nodes.clone()
    }

    fn next(&self) -> Option<Node> {
        let view = self.active.load();
        let mut best: Option<(&Node, usize)> = None;
        for node in view.nodes.iter() {
            let load = view
                .derived
                .get(node.id())
                .map_or(0, |counter| counter.load(Ordering::SeqCst));
            let better = best.is_none_or(|(current, current_load)| {
                compare(load, node.weight(), current_load, current.weight()) == CmpOrdering::Less
            });
            if better {
                best = Some((node, load));
            }
        }
        best.map(|(node, _)| node.clone())
    }

    fn add(&self, node: Node) -> bool {
        self.active.add(node)
    }

    fn remove(&self, node: &Node) -> bool {
        self.active.remove(node)
    }

    fn begin(&self, node: &Node) -> InFlight {
        self.active
            .load()
            .derived
            .get(node.id())
            .map_or_else(InFlight::untracked, |counter| {
                InFlight::tracked(counter.clone())
            })
    }
}
