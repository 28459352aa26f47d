//! Error types for durability.

use tandem_dispatch::CodecError;
use thiserror::Error;

/// Errors that can occur while configuring durability or running an
/// invocation.
#[derive(Debug, Error)]
pub enum DurabilityError {
    /// An event could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// No durability level is registered under the id.
    #[error("unknown durability level '{0}'")]
    UnknownLevel(String),

    /// No transaction id factory is registered under the id.
    #[error("unknown transaction id factory '{0}'")]
    UnknownTransactionIdFactory(String),

    /// The invocation had no node to run on.
    #[error("no active nodes")]
    NoActiveNodes,
}
