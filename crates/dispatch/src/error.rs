//! Error types for command dispatch.

use thiserror::Error;

use crate::{CodecError, Member};

/// Errors that can occur while dispatching commands.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The target member left the group before answering.
    #[error("member {0} is unavailable")]
    MemberUnavailable(Member),

    /// The view is empty, so there is no coordinator.
    #[error("no coordinator: group view is empty")]
    NoCoordinator,

    /// The dispatcher has not joined the group.
    #[error("dispatcher for channel {0} is not started")]
    NotStarted(String),

    /// The local member already joined this channel.
    #[error("member {member} already joined channel {channel}")]
    AlreadyJoined {
        /// The channel being joined.
        channel: String,
        /// The member that joined twice.
        member: Member,
    },

    /// Capturing or installing a state snapshot failed.
    #[error("state transfer failed: {0}")]
    StateTransfer(String),
}
