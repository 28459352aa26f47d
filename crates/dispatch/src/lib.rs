//! Group command dispatch abstraction.
//!
//! This crate provides the interface every cluster-wide service uses to reach
//! the other members of its group:
//! - Broadcast a command to all members, or run it on the coordinator only
//! - Observe membership changes
//! - Transfer shared state to a member joining the group
//!
//! Specific group implementations (in-process, network) are provided in
//! separate crates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod codec;
pub mod error;
mod member;

pub use codec::{CodecError, CommandKind, Wire};
pub use error::DispatchError;
pub use member::Member;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// A unit of work executed by every receiving member against its own context.
///
/// The context is injected locally by the receiver and never crosses the wire,
/// so a command must be self-contained data. Implementations encode themselves
/// with [`Wire`]; dispatchers are free to ship only the encoded bytes.
#[async_trait]
pub trait Command<C>: Wire + Send + Sync + 'static
where
    C: Send + Sync + 'static,
{
    /// The result returned to the dispatching member.
    type Output: Wire + Send + 'static;

    /// Executes this command against the receiving member's context.
    async fn execute(self, context: &C) -> Self::Output;
}

/// Dispatches commands of type `K` to the members of a group.
#[async_trait]
pub trait CommandDispatcher<C, K>: Send + Sync + 'static
where
    C: Send + Sync + 'static,
    K: Command<C>,
{
    /// The member this dispatcher represents.
    fn local(&self) -> &Member;

    /// The current coordinator, i.e. the oldest member of the view.
    fn coordinator(&self) -> Option<Member>;

    /// Whether the local member is the current coordinator.
    fn is_coordinator(&self) -> bool {
        self.coordinator().as_ref() == Some(self.local())
    }

    /// The current view, oldest member first.
    fn members(&self) -> Vec<Member>;

    /// Executes the command on every member of the view, the local member
    /// included.
    ///
    /// Members that leave the group while the command is in flight are
    /// omitted from the returned map.
    async fn execute_all(&self, command: K) -> Result<HashMap<Member, K::Output>, DispatchError>;

    /// Executes the command on the coordinator only.
    async fn execute_coordinator(&self, command: K) -> Result<K::Output, DispatchError>;

    /// Joins the group. State transfer completes before this returns.
    async fn start(&self) -> Result<(), DispatchError>;

    /// Leaves the group.
    async fn stop(&self) -> Result<(), DispatchError>;
}

/// Receives group membership changes.
#[async_trait]
pub trait MembershipListener: Send + Sync + 'static {
    /// Called after a member joined the group.
    async fn added(&self, member: &Member);

    /// Called after a member left the group, gracefully or not.
    async fn removed(&self, member: &Member);
}

/// Shared state handed from the coordinator to a joining member.
#[async_trait]
pub trait Stateful: Send + Sync + 'static {
    /// Captures the current state. Called on the coordinator.
    async fn snapshot(&self) -> Result<Bytes, DispatchError>;

    /// Installs a snapshot. Called on the joining member before it processes
    /// any command.
    async fn restore(&self, snapshot: Bytes) -> Result<(), DispatchError>;
}

/// Creates dispatchers bound to a named channel of a group.
pub trait CommandDispatcherFactory: Send + Sync + 'static {
    /// Creates a dispatcher for `channel`. The dispatcher does not join the
    /// group until it is started.
    fn create<C, K>(
        &self,
        channel: &str,
        local: Member,
        context: Arc<C>,
        stateful: Option<Arc<dyn Stateful>>,
        listener: Option<Arc<dyn MembershipListener>>,
    ) -> Arc<dyn CommandDispatcher<C, K>>
    where
        C: Send + Sync + 'static,
        K: Command<C>;
}
