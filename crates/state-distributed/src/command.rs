use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tandem_balancer::NodeId;
use tandem_dispatch::codec::{self, CodecError, CommandKind};
use tandem_dispatch::{Command, Member, Wire};
use tandem_durability::{InvocationEvent, InvokerEvent};

use crate::context::StateContext;

/// Commands exchanged between state managers.
///
/// Every change carries the member it originated from. The originator has
/// already applied it locally and ignores its own copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateCommand {
    /// A node was activated.
    Activate {
        /// The member that activated it.
        origin: Member,
        /// The node.
        node: NodeId,
    },
    /// A node was deactivated.
    Deactivate {
        /// The member that deactivated it.
        origin: Member,
        /// The node.
        node: NodeId,
    },
    /// An invocation started on `origin`.
    BeforeInvocation {
        /// The member running the invocation.
        origin: Member,
        /// The invocation.
        event: InvocationEvent,
    },
    /// An invocation finished on `origin`.
    AfterInvocation {
        /// The member that ran the invocation.
        origin: Member,
        /// The invocation.
        event: InvocationEvent,
    },
    /// A per-node call started on `origin`.
    BeforeInvoker {
        /// The member making the call.
        origin: Member,
        /// The call.
        event: InvokerEvent,
    },
    /// A per-node call returned on `origin`.
    AfterInvoker {
        /// The member that made the call.
        origin: Member,
        /// The call, with its outcome.
        event: InvokerEvent,
    },
}

impl StateCommand {
    const fn kind(&self) -> CommandKind {
        match self {
            Self::Activate { .. } => CommandKind::Activate,
            Self::Deactivate { .. } => CommandKind::Deactivate,
            Self::BeforeInvocation { .. } => CommandKind::BeforeInvocation,
            Self::AfterInvocation { .. } => CommandKind::AfterInvocation,
            Self::BeforeInvoker { .. } => CommandKind::BeforeInvoker,
            Self::AfterInvoker { .. } => CommandKind::AfterInvoker,
        }
    }
}

impl Wire for StateCommand {
    fn encode(&self, buf: &mut BytesMut) {
        codec::put_header(buf, self.kind());
        match self {
            Self::Activate { origin, node } | Self::Deactivate { origin, node } => {
                origin.encode(buf);
                codec::put_string(buf, node.as_str());
            }
            Self::BeforeInvocation { origin, event } | Self::AfterInvocation { origin, event } => {
                origin.encode(buf);
                event.encode(buf);
            }
            Self::BeforeInvoker { origin, event } | Self::AfterInvoker { origin, event } => {
                origin.encode(buf);
                event.encode(buf);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let command = match codec::get_header(buf)? {
            CommandKind::Activate => Self::Activate {
                origin: Member::decode(buf)?,
                node: NodeId::new(codec::get_string(buf)?),
            },
            CommandKind::Deactivate => Self::Deactivate {
                origin: Member::decode(buf)?,
                node: NodeId::new(codec::get_string(buf)?),
            },
            CommandKind::BeforeInvocation => Self::BeforeInvocation {
                origin: Member::decode(buf)?,
                event: InvocationEvent::decode(buf)?,
            },
            CommandKind::AfterInvocation => Self::AfterInvocation {
                origin: Member::decode(buf)?,
                event: InvocationEvent::decode(buf)?,
            },
            CommandKind::BeforeInvoker => Self::BeforeInvoker {
                origin: Member::decode(buf)?,
                event: InvokerEvent::decode(buf)?,
            },
            CommandKind::AfterInvoker => Self::AfterInvoker {
                origin: Member::decode(buf)?,
                event: InvokerEvent::decode(buf)?,
            },
            other => return Err(CodecError::UnexpectedKind(other)),
        };
        Ok(command)
    }
}

#[async_trait]
impl Command<StateContext> for StateCommand {
    type Output = ();

    async fn execute(self, context: &StateContext) {
        match self {
            Self::Activate { origin, node } => context.activate(&origin, node).await,
            Self::Deactivate { origin, node } => context.deactivate(&origin, node).await,
            Self::BeforeInvocation { origin, event } => {
                context.record(origin, |journal| journal.begin(&event));
            }
            Self::AfterInvocation { origin, event } => {
                context.record(origin, |journal| {
                    journal.end(&event);
                });
            }
            Self::BeforeInvoker { origin, event } | Self::AfterInvoker { origin, event } => {
                context.record(origin, |journal| {
                    journal.record(&event);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use tandem_durability::{Phase, TransactionId};

    #[test]
    fn test_invoker_event_kind() {
        let command = StateCommand::AfterInvoker {
            origin: Member::new("a"),
            event: InvokerEvent::new(
                TransactionId::Counter(1),
                Phase::Rollback,
                NodeId::from("db1"),
            ),
        };

        let bytes = command.to_bytes();
        assert_eq!(bytes[1], CommandKind::AfterInvoker as u8);
        assert_eq!(StateCommand::from_bytes(bytes).unwrap(), command);
    }

    #[test]
    fn test_rejects_lock_commands() {
        let mut buf = BytesMut::new();
        codec::put_header(&mut buf, CommandKind::Release);
        assert_matches!(
            StateCommand::from_bytes(buf.freeze()),
            Err(CodecError::UnexpectedKind(CommandKind::Release))
        );
    }
}
