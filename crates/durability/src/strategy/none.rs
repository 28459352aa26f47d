use std::sync::Arc;

use async_trait::async_trait;
use tandem_balancer::Balancer;
use tracing::warn;

use crate::event::{EventLog, Phase};
use crate::exception::ExceptionType;
use crate::transaction::TransactionId;
use crate::{
    Durability, DurabilityLevel, InvocationStrategy, Invoker, RecoveryReport,
};

/// Tracks nothing. Partial failures go unnoticed.
pub struct NoDurability {
    balancer: Arc<dyn Balancer>,
}

impl NoDurability {
    /// Creates the level over `balancer`.
    #[must_use]
    pub fn new(balancer: Arc<dyn Balancer>) -> Self {
        Self { balancer }
    }
}

#[async_trait]
impl Durability for NoDurability {
    fn level(&self) -> DurabilityLevel {
        DurabilityLevel::None
    }

    fn wrap_invocation(
        &self,
        _phase: Phase,
        _transaction_id: TransactionId,
        _exception_type: ExceptionType,
        strategy: Arc<dyn InvocationStrategy>,
    ) -> Arc<dyn InvocationStrategy> {
        strategy
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
        let backups = self.balancer.backups().len();
        for (invocation, invokers) in &log {
            warn!(
                %invocation,
                nodes = invokers.len(),
                backups,
                "Leftover invocation found, replicas may have diverged"
            );
        }
        RecoveryReport::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use tracing_test::traced_test;

    use crate::event::InvocationEvent;
    use crate::strategy::testing::balancer;

    #[tokio::test]
    #[traced_test]
    async fn test_recover_only_reports() {
        let durability = NoDurability::new(balancer(&["db1", "db2"]));
        let mut log = EventLog::new();
        log.insert(
            InvocationEvent::new(TransactionId::Counter(1), Phase::Commit, ExceptionType::Sql),
            BTreeMap::new(),
        );

        let report = durability.recover(log).await;
        assert_eq!(report, RecoveryReport::default());
        assert!(logs_contain("Leftover invocation found"));
    }
}
