//! Error types for state managers.

use tandem_dispatch::{CodecError, DispatchError};
use thiserror::Error;

/// Errors that can occur while persisting or replicating cluster state.
#[derive(Debug, Error)]
pub enum StateError {
    /// Persisted state could not be decoded.
    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// An event record could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The group could not be reached.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// IO operation failed.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),

    /// State could not be encoded for persistence.
    #[error("serialization error: {0}")]
    Serialize(String),
}
