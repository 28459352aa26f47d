//! In-flight durability events of one member.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use tandem_dispatch::Wire;
use tandem_dispatch::codec::{self, CodecError};
use tandem_durability::event::parent;
use tandem_durability::{EventLog, InvocationEvent, InvokerEvent};
use tracing::warn;

/// The event log of one member, kept consistent as events arrive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Journal {
    log: EventLog,
}

impl Journal {
    /// An empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A journal continuing `log`.
    #[must_use]
    pub const fn from_log(log: EventLog) -> Self {
        Self { log }
    }

    /// Opens `event`. Opening it again keeps the invoker events recorded so
    /// far.
    pub fn begin(&mut self, event: &InvocationEvent) {
        self.log.entry(event.clone()).or_default();
    }

    /// Closes `event` together with its invoker events. Returns whether it
    /// was open.
    pub fn end(&mut self, event: &InvocationEvent) -> bool {
        self.log.remove(event).is_some()
    }

    /// Records the latest state of a per-node call. Returns whether its
    /// invocation was open.
    pub fn record(&mut self, event: &InvokerEvent) -> bool {
        let Some(invocation) = parent(&self.log, event).cloned() else {
            warn!(
                transaction = %event.transaction_id,
                phase = %event.phase,
                node = %event.node_id,
                "Invoker event without open invocation"
            );
            return false;
        };
        self.log
            .entry(invocation)
            .or_default()
            .insert(event.node_id.clone(), event.clone());
        true
    }

    /// The open invocations.
    #[must_use]
    pub const fn log(&self) -> &EventLog {
        &self.log
    }

    /// Consumes the journal, returning its open invocations.
    #[must_use]
    pub fn into_log(self) -> EventLog {
        self.log
    }

    /// Whether no invocation is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}

/// `[count: u32]` followed by each invocation event and its invoker events.
#[allow(clippy::cast_possible_truncation)]
impl Wire for Journal {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.log.len() as u32);
        for (invocation, invokers) in &self.log {
            invocation.encode(buf);
            invokers.values().cloned().collect::<Vec<_>>().encode(buf);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let count = codec::get_u32(buf)?;
        let mut log = EventLog::new();
        for _ in 0..count {
            let invocation = InvocationEvent::decode(buf)?;
            let invokers = Vec::<InvokerEvent>::decode(buf)?
                .into_iter()
                .filter(|event| event.belongs_to(&invocation))
                .map(|event| (event.node_id.clone(), event))
                .collect::<BTreeMap<_, _>>();
            log.insert(invocation, invokers);
        }
        Ok(Self { log })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tandem_balancer::NodeId;
    use tandem_durability::{ExceptionType, InvokerResult, Phase, TransactionId};
    use tracing_test::traced_test;

    fn commit(tx: u64) -> InvocationEvent {
        InvocationEvent::new(TransactionId::Counter(tx), Phase::Commit, ExceptionType::Sql)
    }

    #[test]
    fn test_invoker_event_replaces_earlier_state() {
        let mut journal = Journal::new();
        journal.begin(&commit(1));

        let mut event =
            InvokerEvent::new(TransactionId::Counter(1), Phase::Commit, NodeId::from("db1"));
        assert!(journal.record(&event));
        event.result = Some(InvokerResult::Value(Bytes::from_static(b"ok")));
        assert!(journal.record(&event));

        let invokers = &journal.log()[&commit(1)];
        assert_eq!(invokers.len(), 1);
        assert_eq!(invokers[&NodeId::from("db1")], event);

        assert!(journal.end(&commit(1)));
        assert!(!journal.end(&commit(1)));
        assert!(journal.is_empty());
    }

    #[test]
    #[traced_test]
    fn test_invoker_event_needs_open_invocation() {
        let mut journal = Journal::new();
        journal.begin(&commit(1));

        let stray =
            InvokerEvent::new(TransactionId::Counter(2), Phase::Commit, NodeId::from("db1"));
        assert!(!journal.record(&stray));
        assert!(journal.log()[&commit(1)].is_empty());
        assert!(logs_contain("Invoker event without open invocation"));
    }

    #[test]
    fn test_encoding_keeps_open_invocations() {
        let mut journal = Journal::new();
        journal.begin(&commit(1));
        journal.begin(&commit(2));
        journal.record(&InvokerEvent::new(
            TransactionId::Counter(2),
            Phase::Commit,
            NodeId::from("db2"),
        ));

        assert_eq!(Journal::from_bytes(journal.to_bytes()).unwrap(), journal);
    }
}
