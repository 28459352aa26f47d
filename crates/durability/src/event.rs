//! Durability events and their binary encoding.
//!
//! ```text
//! invocation: [version][1][transaction id][phase][exception type]
//! invoker:    [version][2][transaction id][phase][node id][result?]
//! result:     [0][value] | [1][captured error]
//! ```
//! A transaction id is a kind byte followed by 8 (counter) or 16 (UUID)
//! bytes. Optional fields are prefixed with a presence byte.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tandem_balancer::NodeId;
use tandem_dispatch::Wire;
use tandem_dispatch::codec::{self, CodecError};

use crate::exception::{CapturedError, ExceptionType};
use crate::transaction::TransactionId;

/// Version of the event encoding.
pub const EVENT_VERSION: u8 = 1;

const INVOCATION_TAG: u8 = 1;
const INVOKER_TAG: u8 = 2;

/// Stage of a two-phase lifecycle an invocation belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// First phase of a two-phase commit.
    Prepare,
    /// Commit, one- or two-phase.
    Commit,
    /// Rollback.
    Rollback,
    /// Discard of a heuristically completed branch.
    Forget,
}

impl Phase {
    const fn tag(self) -> u8 {
        match self {
            Self::Prepare => 0,
            Self::Commit => 1,
            Self::Rollback => 2,
            Self::Forget => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Self::Prepare),
            1 => Ok(Self::Commit),
            2 => Ok(Self::Rollback),
            3 => Ok(Self::Forget),
            tag => Err(CodecError::InvalidTag { what: "phase", tag }),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Forget => "forget",
        };
        f.write_str(name)
    }
}

/// One logical cluster-wide operation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InvocationEvent {
    /// The transaction the operation belongs to.
    pub transaction_id: TransactionId,
    /// The lifecycle stage.
    pub phase: Phase,
    /// How errors of this operation are compared.
    pub exception_type: ExceptionType,
}

impl InvocationEvent {
    /// Creates an invocation event.
    #[must_use]
    pub const fn new(
        transaction_id: TransactionId,
        phase: Phase,
        exception_type: ExceptionType,
    ) -> Self {
        Self {
            transaction_id,
            phase,
            exception_type,
        }
    }
}

impl fmt::Display for InvocationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of transaction {}", self.phase, self.transaction_id)
    }
}

/// Outcome of a call against one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvokerResult {
    /// The call returned a value.
    Value(Bytes),
    /// The call failed.
    Exception(CapturedError),
}

impl From<&Result<Bytes, CapturedError>> for InvokerResult {
    fn from(result: &Result<Bytes, CapturedError>) -> Self {
        match result {
            Ok(value) => Self::Value(value.clone()),
            Err(error) => Self::Exception(error.clone()),
        }
    }
}

/// The call of one invocation against one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvokerEvent {
    /// The transaction the call belongs to.
    pub transaction_id: TransactionId,
    /// The lifecycle stage.
    pub phase: Phase,
    /// The node called.
    pub node_id: NodeId,
    /// The outcome, once the call returned.
    pub result: Option<InvokerResult>,
}

impl InvokerEvent {
    /// A call that has not returned yet.
    #[must_use]
    pub const fn new(transaction_id: TransactionId, phase: Phase, node_id: NodeId) -> Self {
        Self {
            transaction_id,
            phase,
            node_id,
            result: None,
        }
    }

    /// Whether this call was made on behalf of `invocation`.
    #[must_use]
    pub fn belongs_to(&self, invocation: &InvocationEvent) -> bool {
        self.transaction_id == invocation.transaction_id && self.phase == invocation.phase
    }
}

/// In-flight invocations and the calls made for each, by node.
///
/// An invoker event is only ever stored under the invocation it
/// [belongs to](InvokerEvent::belongs_to).
pub type EventLog = BTreeMap<InvocationEvent, BTreeMap<NodeId, InvokerEvent>>;

/// The invocation in `log` that `event` belongs to.
#[must_use]
pub fn parent<'a>(log: &'a EventLog, event: &InvokerEvent) -> Option<&'a InvocationEvent> {
    log.keys().find(|invocation| event.belongs_to(invocation))
}

fn put_record_header(buf: &mut BytesMut, tag: u8) {
    buf.put_u8(EVENT_VERSION);
    buf.put_u8(tag);
}

fn get_record_header(buf: &mut Bytes, expected: u8, what: &'static str) -> Result<(), CodecError> {
    let version = codec::get_u8(buf)?;
    if version != EVENT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    match codec::get_u8(buf)? {
        tag if tag == expected => Ok(()),
        tag => Err(CodecError::InvalidTag { what, tag }),
    }
}

impl Wire for InvocationEvent {
    fn encode(&self, buf: &mut BytesMut) {
        put_record_header(buf, INVOCATION_TAG);
        self.transaction_id.encode(buf);
        buf.put_u8(self.phase.tag());
        buf.put_u8(self.exception_type.tag());
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        get_record_header(buf, INVOCATION_TAG, "invocation event")?;
        Ok(Self {
            transaction_id: TransactionId::decode(buf)?,
            phase: Phase::from_tag(codec::get_u8(buf)?)?,
            exception_type: ExceptionType::from_tag(codec::get_u8(buf)?)?,
        })
    }
}

impl Wire for InvokerResult {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Value(value) => {
                buf.put_u8(0);
                codec::put_bytes(buf, value);
            }
            Self::Exception(error) => {
                buf.put_u8(1);
                error.encode(buf);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match codec::get_u8(buf)? {
            0 => Ok(Self::Value(codec::get_bytes(buf)?)),
            1 => Ok(Self::Exception(CapturedError::decode(buf)?)),
            tag => Err(CodecError::InvalidTag {
                what: "invoker result",
                tag,
            }),
        }
    }
}

impl Wire for InvokerEvent {
    fn encode(&self, buf: &mut BytesMut) {
        put_record_header(buf, INVOKER_TAG);
        self.transaction_id.encode(buf);
        buf.put_u8(self.phase.tag());
        codec::put_string(buf, self.node_id.as_str());
        self.result.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        get_record_header(buf, INVOKER_TAG, "invoker event")?;
        Ok(Self {
            transaction_id: TransactionId::decode(buf)?,
            phase: Phase::from_tag(codec::get_u8(buf)?)?,
            node_id: NodeId::new(codec::get_string(buf)?),
            result: Option::<InvokerResult>::decode(buf)?,
        })
    }
}
