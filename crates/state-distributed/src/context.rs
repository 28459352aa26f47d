use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tandem_balancer::NodeId;
use tandem_dispatch::codec::{self, CodecError, CommandKind};
use tandem_dispatch::{DispatchError, Member, MembershipListener, Stateful, Wire};
use tandem_durability::EventLog;
use tandem_state::{Journal, StateEvent, StateManager};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Default)]
struct RemoteJournals {
    open: HashMap<Member, Journal>,
    /// Members removed from the view. Nothing is recorded for them again.
    departed: HashSet<Member>,
}

/// Per-member state every state command executes against: the local state
/// manager and the open invocations of every other member.
pub struct StateContext {
    member: Member,
    local: Arc<dyn StateManager>,
    remote: Mutex<RemoteJournals>,
    events: broadcast::Sender<StateEvent>,
}

impl StateContext {
    pub(crate) fn new(member: Member, local: Arc<dyn StateManager>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            member,
            local,
            remote: Mutex::new(RemoteJournals::default()),
            events,
        }
    }

    pub(crate) fn local(&self) -> &Arc<dyn StateManager> {
        &self.local
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Invocations `member` has open, as far as this member knows.
    pub fn open_invocations(&self, member: &Member) -> EventLog {
        self.remote
            .lock()
            .open
            .get(member)
            .map(|journal| journal.log().clone())
            .unwrap_or_default()
    }

    fn publish(&self, event: StateEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    pub(crate) async fn activate(&self, origin: &Member, node: NodeId) {
        if *origin == self.member {
            return;
        }
        if let Err(e) = self.local.activated(&node).await {
            warn!(%node, %origin, error = %e, "Failed to record remote activation");
        }
        debug!(%node, %origin, "Node activated by peer");
        self.publish(StateEvent::Activated(node));
    }

    pub(crate) async fn deactivate(&self, origin: &Member, node: NodeId) {
        if *origin == self.member {
            return;
        }
        if let Err(e) = self.local.deactivated(&node).await {
            warn!(%node, %origin, error = %e, "Failed to record remote deactivation");
        }
        debug!(%node, %origin, "Node deactivated by peer");
        self.publish(StateEvent::Deactivated(node));
    }

    /// Applies a durability event of `origin` to its journal.
    pub(crate) fn record<F>(&self, origin: Member, update: F)
    where
        F: FnOnce(&mut Journal),
    {
        if origin == self.member {
            return;
        }
        let mut remote = self.remote.lock();
        if remote.departed.contains(&origin) {
            debug!(%origin, "Ignoring event of departed member");
            return;
        }
        let journal = remote.open.entry(origin).or_default();
        update(journal);
    }
}

#[async_trait]
impl MembershipListener for StateContext {
    async fn added(&self, member: &Member) {
        debug!(%member, "Member joined state group");
    }

    async fn removed(&self, member: &Member) {
        let orphaned = {
            let mut remote = self.remote.lock();
            remote.departed.insert(member.clone());
            remote.open.remove(member).unwrap_or_default()
        };

        if orphaned.is_empty() {
            return;
        }
        info!(%member, invocations = orphaned.log().len(), "Member left with open invocations");
        self.publish(StateEvent::Orphaned {
            member: member.clone(),
            log: orphaned.into_log(),
        });
    }
}

/// Hands the active node set to joining members.
///
/// ```text
/// [version: u8][kind: u8][count: u32]([len: u32][node id])*
/// ```
#[async_trait]
impl Stateful for StateContext {
    async fn snapshot(&self) -> Result<Bytes, DispatchError> {
        let active: Vec<String> = self
            .local
            .active_nodes()
            .into_iter()
            .map(|node| node.as_str().to_string())
            .collect();

        let mut buf = BytesMut::new();
        codec::put_header(&mut buf, CommandKind::StateSnapshotRequest);
        active.encode(&mut buf);
        Ok(buf.freeze())
    }

    async fn restore(&self, mut snapshot: Bytes) -> Result<(), DispatchError> {
        match codec::get_header(&mut snapshot)? {
            CommandKind::StateSnapshotRequest => {}
            other => return Err(CodecError::UnexpectedKind(other).into()),
        }
        let active: BTreeSet<NodeId> = Vec::<String>::from_bytes(snapshot)?
            .into_iter()
            .map(NodeId::new)
            .collect();

        info!(active = active.len(), "Received active nodes from coordinator");
        self.local
            .set_active_nodes(active)
            .await
            .map_err(|e| DispatchError::StateTransfer(e.to_string()))
    }
}
