use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tandem_balancer::Balancer;

use crate::error::DurabilityError;
use crate::strategy::{CoarseDurability, FineDurability, NoDurability};
use crate::{Durability, DurabilityListener};

/// Creates a durability level over the given balancer and listener.
pub type DurabilityFactory =
    fn(Arc<dyn Balancer>, Arc<dyn DurabilityListener>) -> Arc<dyn Durability>;

/// The available durability levels, weakest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DurabilityLevel {
    /// Nothing is tracked.
    None,
    /// Invocations are tracked.
    Coarse,
    /// Invocations and per-node outcomes are tracked.
    Fine,
}

// indexed by `DurabilityLevel` discriminant
static LEVELS: [(&str, DurabilityLevel, DurabilityFactory); 3] = [
    ("none", DurabilityLevel::None, none),
    ("coarse", DurabilityLevel::Coarse, coarse),
    ("fine", DurabilityLevel::Fine, fine),
];

fn none(
    balancer: Arc<dyn Balancer>,
    _listener: Arc<dyn DurabilityListener>,
) -> Arc<dyn Durability> {
    Arc::new(NoDurability::new(balancer))
}

fn coarse(
    balancer: Arc<dyn Balancer>,
    listener: Arc<dyn DurabilityListener>,
) -> Arc<dyn Durability> {
    Arc::new(CoarseDurability::new(balancer, listener))
}

fn fine(balancer: Arc<dyn Balancer>, listener: Arc<dyn DurabilityListener>) -> Arc<dyn Durability> {
    Arc::new(FineDurability::new(balancer, listener))
}

impl DurabilityLevel {
    /// The configuration id of this level.
    #[must_use]
    pub fn id(self) -> &'static str {
        LEVELS[self as usize].0
    }

    /// Every registered id.
    pub fn ids() -> impl Iterator<Item = &'static str> {
        LEVELS.iter().map(|(id, _, _)| *id)
    }

    /// Creates this level over `balancer`, reporting to `listener`.
    #[must_use]
    pub fn create(
        self,
        balancer: Arc<dyn Balancer>,
        listener: Arc<dyn DurabilityListener>,
    ) -> Arc<dyn Durability> {
        (LEVELS[self as usize].2)(balancer, listener)
    }
}

impl FromStr for DurabilityLevel {
    type Err = DurabilityError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        LEVELS
            .iter()
            .find(|(registered, _, _)| *registered == id)
            .map(|(_, level, _)| *level)
            .ok_or_else(|| DurabilityError::UnknownLevel(id.to_string()))
    }
}

impl fmt::Display for DurabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}
