mod coarse;
mod fine;
mod none;

pub use coarse::CoarseDurability;
pub use fine::FineDurability;
pub use none::NoDurability;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DurabilityError;
use crate::event::{EventLog, InvocationEvent};
use crate::{DurabilityListener, InvocationResults, InvocationStrategy, Invoker};

/// Reports an invocation to the listener around the inner strategy.
///
/// If the invocation is abandoned midway, `after_invocation` never fires and
/// the event is left for recovery.
struct LoggedInvocation {
    event: InvocationEvent,
    listener: Arc<dyn DurabilityListener>,
    inner: Arc<dyn InvocationStrategy>,
}

#[async_trait]
impl InvocationStrategy for LoggedInvocation {
    async fn invoke(&self, invoker: &dyn Invoker) -> Result<InvocationResults, DurabilityError> {
        self.listener.before_invocation(&self.event).await;
        let results = self.inner.invoke(invoker).await;
        self.listener.after_invocation(&self.event).await;
        results
    }
}

/// Closes every leftover invocation. Returns how many were closed.
async fn close_all(listener: &dyn DurabilityListener, log: &EventLog) -> usize {
    let mut closed = 0;
    for invocation in log.keys() {
        listener.after_invocation(invocation).await;
        closed += 1;
    }
    closed
}
