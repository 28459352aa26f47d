use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tandem_balancer::{Balancer, Node};
use tracing::{debug, info, warn};

use super::{LoggedInvocation, close_all};
use crate::event::{EventLog, InvocationEvent, InvokerEvent, InvokerResult, Phase};
use crate::exception::{CapturedError, ExceptionClassifier, ExceptionType};
use crate::transaction::TransactionId;
use crate::{
    Durability, DurabilityLevel, DurabilityListener, InvocationStrategy, Invoker, RecoveryReport,
};

/// Tracks invocations and the outcome of every call they make.
///
/// Recovery compares each backup's recorded outcome with the primary's and
/// only deactivates the backups that cannot be shown to match.
pub struct FineDurability {
    balancer: Arc<dyn Balancer>,
    listener: Arc<dyn DurabilityListener>,
}

impl FineDurability {
    /// Creates the level over `balancer`, reporting to `listener`.
    #[must_use]
    pub fn new(balancer: Arc<dyn Balancer>, listener: Arc<dyn DurabilityListener>) -> Self {
        Self { balancer, listener }
    }
}

struct LoggedInvoker {
    phase: Phase,
    transaction_id: TransactionId,
    exception_type: ExceptionType,
    listener: Arc<dyn DurabilityListener>,
    inner: Arc<dyn Invoker>,
}

#[async_trait]
impl Invoker for LoggedInvoker {
    async fn invoke(&self, node: &Node) -> Result<Bytes, CapturedError> {
        let mut event = InvokerEvent::new(self.transaction_id, self.phase, node.id().clone());
        self.listener.before_invoker(&event).await;

        let result = match self.inner.invoke(node).await {
            Err(error)
                if self
                    .exception_type
                    .classifier()
                    .corrects_heuristic(&error, self.phase) =>
            {
                debug!(
                    node = %node.id(),
                    phase = %self.phase,
                    %error,
                    "Heuristic outcome matches phase"
                );
                Ok(Bytes::new())
            }
            result => result,
        };

        event.result = Some(InvokerResult::from(&result));
        self.listener.after_invoker(&event).await;
        result
    }
}

/// Whether `backup` cannot be shown to have reached the same state as the
/// primary.
fn diverged(
    classifier: &dyn ExceptionClassifier,
    primary: Option<&InvokerResult>,
    backup: Option<&InvokerEvent>,
) -> bool {
    let Some(expected) = primary else {
        // without a primary outcome, a backup is only suspect if it did work
        return backup.is_some();
    };
    match (expected, backup.and_then(|event| event.result.as_ref())) {
        (InvokerResult::Value(expected), Some(InvokerResult::Value(actual))) => expected != actual,
        (InvokerResult::Exception(expected), Some(InvokerResult::Exception(actual))) => {
            !classifier.equivalent(expected, actual)
        }
        _ => true,
    }
}

#[async_trait]
impl Durability for FineDurability {
    fn level(&self) -> DurabilityLevel {
        DurabilityLevel::Fine
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
        phase: Phase,
        transaction_id: TransactionId,
        exception_type: ExceptionType,
        invoker: Arc<dyn Invoker>,
    ) -> Arc<dyn Invoker> {
        Arc::new(LoggedInvoker {
            phase,
            transaction_id,
            exception_type,
            listener: self.listener.clone(),
            inner: invoker,
        })
    }

    async fn recover(&self, log: EventLog) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let nodes = self.balancer.active_nodes();

        for (invocation, invokers) in &log {
            if invokers.is_empty() {
                continue;
            }
            let classifier = invocation.exception_type.classifier();
            let primary = nodes
                .primary()
                .and_then(|primary| invokers.get(primary.id()))
                .and_then(|event| event.result.as_ref());

            for backup in nodes.backups() {
                if diverged(classifier, primary, invokers.get(backup.id())) {
                    warn!(%invocation, node = %backup.id(), "Backup diverged from primary");
                    report.deactivate.insert(backup.id().clone());
                }
            }
        }

        report.closed = close_all(&*self.listener, &log).await;
        info!(closed = report.closed, deactivated = report.deactivate.len(), "Recovery complete");
        report
    }
}
