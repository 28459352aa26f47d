//! Cluster state replicated over group command dispatch.
//!
//! Wraps a local state manager. Every change made on this member is applied
//! locally and then broadcast, so that each member knows:
//! - The active node set, handed to joining members by the coordinator
//! - The open invocations of every other member
//!
//! When a member leaves with invocations still open, the survivors publish
//! them as [`StateEvent::Orphaned`] so they get recovered.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod command;
mod context;

pub use command::StateCommand;
pub use context::StateContext;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tandem_balancer::NodeId;
use tandem_dispatch::{CommandDispatcher, CommandDispatcherFactory, Member};
use tandem_durability::{DurabilityListener, EventLog, InvocationEvent, InvokerEvent};
use tandem_state::{StateError, StateEvent, StateManager};
use tokio::sync::broadcast;
use tracing::{instrument, warn};

type StateDispatcher = dyn CommandDispatcher<StateContext, StateCommand>;

/// Configuration for the `DistributedStateManager`.
#[derive(Clone, Debug)]
pub struct DistributedStateManagerConfig {
    /// The group channel state commands travel on.
    pub channel: String,

    /// The local member.
    pub local: Member,

    /// How many state events a slow subscriber may lag behind.
    /// Defaults to 64 if not set.
    pub event_capacity: Option<usize>,
}

/// State manager sharing its state with every member of the group.
pub struct DistributedStateManager {
    context: Arc<StateContext>,
    dispatcher: Arc<StateDispatcher>,
}

impl DistributedStateManager {
    /// Creates a state manager wrapping `local_state`. It joins the group
    /// when started.
    pub fn new<F>(
        factory: &F,
        DistributedStateManagerConfig {
            channel,
            local,
            event_capacity,
        }: DistributedStateManagerConfig,
        local_state: Arc<dyn StateManager>,
    ) -> Self
    where
        F: CommandDispatcherFactory,
    {
        let context = Arc::new(StateContext::new(
            local.clone(),
            local_state,
            event_capacity.unwrap_or(64),
        ));
        let dispatcher = factory.create::<StateContext, StateCommand>(
            &channel,
            local,
            context.clone(),
            Some(context.clone()),
            Some(context.clone()),
        );

        Self {
            context,
            dispatcher,
        }
    }

    /// The local member.
    #[must_use]
    pub fn local(&self) -> &Member {
        self.dispatcher.local()
    }

    /// The replicated state of the other members.
    #[must_use]
    pub const fn context(&self) -> &Arc<StateContext> {
        &self.context
    }

    fn origin(&self) -> Member {
        self.dispatcher.local().clone()
    }

    /// Sends a durability event to the other members. Losing it only weakens
    /// what they can recover should this member die.
    async fn replicate(&self, command: StateCommand) {
        if let Err(e) = self.dispatcher.execute_all(command).await {
            warn!(error = %e, "Failed to replicate durability event");
        }
    }
}

#[async_trait]
impl DurabilityListener for DistributedStateManager {
    async fn before_invocation(&self, event: &InvocationEvent) {
        self.context.local().before_invocation(event).await;
        self.replicate(StateCommand::BeforeInvocation {
            origin: self.origin(),
            event: event.clone(),
        })
        .await;
    }

    async fn after_invocation(&self, event: &InvocationEvent) {
        self.context.local().after_invocation(event).await;
        self.replicate(StateCommand::AfterInvocation {
            origin: self.origin(),
            event: event.clone(),
        })
        .await;
    }

    async fn before_invoker(&self, event: &InvokerEvent) {
        self.context.local().before_invoker(event).await;
        self.replicate(StateCommand::BeforeInvoker {
            origin: self.origin(),
            event: event.clone(),
        })
        .await;
    }

    async fn after_invoker(&self, event: &InvokerEvent) {
        self.context.local().after_invoker(event).await;
        self.replicate(StateCommand::AfterInvoker {
            origin: self.origin(),
            event: event.clone(),
        })
        .await;
    }
}

#[async_trait]
impl StateManager for DistributedStateManager {
    /// Starts the local state manager and joins the group. A member that is
    /// not the coordinator installs the coordinator's active node set before
    /// it applies any command.
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), StateError> {
        self.context.local().start().await?;
        self.dispatcher.start().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), StateError> {
        self.dispatcher.stop().await?;
        self.context.local().stop().await
    }

    fn active_nodes(&self) -> BTreeSet<NodeId> {
        self.context.local().active_nodes()
    }

    async fn set_active_nodes(&self, nodes: BTreeSet<NodeId>) -> Result<(), StateError> {
        self.context.local().set_active_nodes(nodes).await
    }

    async fn activated(&self, node: &NodeId) -> Result<(), StateError> {
        self.context.local().activated(node).await?;
        self.dispatcher
            .execute_all(StateCommand::Activate {
                origin: self.origin(),
                node: node.clone(),
            })
            .await?;
        Ok(())
    }

    async fn deactivated(&self, node: &NodeId) -> Result<(), StateError> {
        self.context.local().deactivated(node).await?;
        self.dispatcher
            .execute_all(StateCommand::Deactivate {
                origin: self.origin(),
                node: node.clone(),
            })
            .await?;
        Ok(())
    }

    async fn recoverable_event_log(&self) -> EventLog {
        self.context.local().recoverable_event_log().await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<StateEvent>> {
        Some(self.context.subscribe())
    }
}
