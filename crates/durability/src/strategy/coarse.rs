use std::sync::Arc;

use async_trait::async_trait;
use tandem_balancer::Balancer;
use tracing::{info, warn};

use super::{LoggedInvocation, close_all};
use crate::event::{EventLog, InvocationEvent, Phase};
use crate::exception::ExceptionType;
use crate::transaction::TransactionId;
use crate::{
    Durability, DurabilityLevel, DurabilityListener, InvocationStrategy, Invoker, RecoveryReport,
};

/// Tracks invocations but not the calls they make.
///
/// Recovery cannot tell which backups an interrupted invocation reached, so
/// any leftover invocation deactivates every backup.
pub struct CoarseDurability {
    balancer: Arc<dyn Balancer>,
    listener: Arc<dyn DurabilityListener>,
}

impl CoarseDurability {
    /// Creates the level over `balancer`, reporting to `listener`.
    #[must_use]
    pub fn new(balancer: Arc<dyn Balancer>, listener: Arc<dyn DurabilityListener>) -> Self {
        Self { balancer, listener }
    }
}

#[async_trait]
impl Durability for CoarseDurability {
    fn level(&self) -> DurabilityLevel {
        DurabilityLevel::Coarse
    }

    fn wrap_invocation(
        &self,
        phase: Phase,
        transaction_id: TransactionId,
        exception_type: ExceptionType,
        strategy: Arc<dyn InvocationStrategy>,
    ) -> Arc<dyn InvocationStrategy> {
        Arc::new(LoggedInvocation {
            event: InvocationEvent::new(transaction_id, phase, exception_type),
            listener: self.listener.clone(),
            inner: strategy,
        })
    }

    fn wrap_invoker(
        &self,
        _phase: Phase,
        _transaction_id: TransactionId,
        _exception_type: ExceptionType,
        invoker: Arc<dyn Invoker>,
    ) -> Arc<dyn Invoker> {
        invoker
    }

    async fn recover(&self, log: EventLog) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        if !log.is_empty() {
            for backup in self.balancer.backups() {
                warn!(
                    node = %backup.id(),
                    leftover = log.len(),
                    "Deactivating backup after interrupted invocations"
                );
                report.deactivate.insert(backup.id().clone());
            }
        }
        report.closed = close_all(&*self.listener, &log).await;
        info!(closed = report.closed, deactivated = report.deactivate.len(), "Recovery complete");
        report
    }
}
