//! Transaction identifiers and their factories.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use tandem_dispatch::Wire;
use tandem_dispatch::codec::{self, CodecError};
use uuid::Uuid;

use crate::error::DurabilityError;

/// Identifies the logical transaction an invocation belongs to.
///
/// Encodes to a fixed size per kind: 8 bytes for counters, 16 for UUIDs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransactionId {
    /// A process-local counter value.
    Counter(u64),
    /// A random UUID.
    Uuid(Uuid),
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter(value) => write!(f, "{value}"),
            Self::Uuid(value) => write!(f, "{value}"),
        }
    }
}

impl Wire for TransactionId {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Counter(value) => {
                buf.put_u8(0);
                buf.put_u64(*value);
            }
            Self::Uuid(value) => {
                buf.put_u8(1);
                buf.put_slice(value.as_bytes());
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match codec::get_u8(buf)? {
            0 => Ok(Self::Counter(codec::get_u64(buf)?)),
            1 => {
                let raw = codec::get_fixed(buf, 16)?;
                let mut value = [0u8; 16];
                value.copy_from_slice(&raw);
                Ok(Self::Uuid(Uuid::from_bytes(value)))
            }
            tag => Err(CodecError::InvalidTag {
                what: "transaction id",
                tag,
            }),
        }
    }
}

/// Produces transaction identifiers.
pub trait TransactionIdFactory: Send + Sync + 'static {
    /// A new identifier, distinct from every one this factory produced before.
    fn create(&self) -> TransactionId;
}

/// Hands out increasing counter values. Unique within one process lifetime.
#[derive(Debug, Default)]
pub struct CounterTransactionIdFactory {
    next: AtomicU64,
}

impl TransactionIdFactory for CounterTransactionIdFactory {
    fn create(&self) -> TransactionId {
        TransactionId::Counter(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Hands out random UUIDs. Unique across processes.
#[derive(Debug, Default)]
pub struct UuidTransactionIdFactory;

impl TransactionIdFactory for UuidTransactionIdFactory {
    fn create(&self) -> TransactionId {
        TransactionId::Uuid(Uuid::new_v4())
    }
}

/// Creates a transaction id factory.
pub type TransactionIdFactoryConstructor = fn() -> Arc<dyn TransactionIdFactory>;

static FACTORIES: [(&str, TransactionIdFactoryConstructor); 2] =
    [("simple", counter_factory), ("uuid", uuid_factory)];

fn counter_factory() -> Arc<dyn TransactionIdFactory> {
    Arc::new(CounterTransactionIdFactory::default())
}

fn uuid_factory() -> Arc<dyn TransactionIdFactory> {
    Arc::new(UuidTransactionIdFactory)
}

/// Looks up the transaction id factory registered under `id`.
///
/// # Errors
///
/// Returns [`DurabilityError::UnknownTransactionIdFactory`] if nothing is
/// registered under `id`.
pub fn lookup_transaction_id_factory(
    id: &str,
) -> Result<TransactionIdFactoryConstructor, DurabilityError> {
    FACTORIES
        .iter()
        .find(|(registered, _)| *registered == id)
        .map(|(_, constructor)| *constructor)
        .ok_or_else(|| DurabilityError::UnknownTransactionIdFactory(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_ids_are_distinct() {
        let factory = lookup_transaction_id_factory("simple").unwrap()();
        let first = factory.create();
        let second = factory.create();
        assert_ne!(first, second);
        assert!(first < second);
    }

    #[test]
    fn test_fixed_size_encoding() {
        assert_eq!(TransactionId::Counter(7).to_bytes().len(), 1 + 8);
        let uuid = lookup_transaction_id_factory("uuid").unwrap()().create();
        assert_eq!(uuid.to_bytes().len(), 1 + 16);
        assert_eq!(TransactionId::from_bytes(uuid.to_bytes()).unwrap(), uuid);
    }

    #[test]
    fn test_unknown_factory() {
        assert!(lookup_transaction_id_factory("jta").is_err());
    }
}
