//! In-process group communication for tests and single-process deployments.
//!
//! Members of a [`MemoryGroup`] live in the same process, but every command
//! still crosses an encode/decode boundary, so nothing process-local can leak
//! into a payload. Stopping a member behaves like a crash: deliveries to or
//! from it are abandoned and the survivors are told it was removed.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tandem_dispatch::{
    Command, CommandDispatcher, CommandDispatcherFactory, DispatchError, Member,
    MembershipListener, Stateful, Wire,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
trait Handler: Send + Sync {
    async fn handle(&self, payload: Bytes) -> Result<Bytes, DispatchError>;
}

struct CommandHandler<C, K> {
    context: Arc<C>,
    _command: PhantomData<fn() -> K>,
}

#[async_trait]
impl<C, K> Handler for CommandHandler<C, K>
where
    C: Send + Sync + 'static,
    K: Command<C>,
{
    async fn handle(&self, payload: Bytes) -> Result<Bytes, DispatchError> {
        let command = K::from_bytes(payload)?;
        let output = command.execute(&self.context).await;
        Ok(output.to_bytes())
    }
}

/// A member's presence in a channel view.
struct Endpoint {
    member: Member,
    handler: Arc<dyn Handler>,
    stateful: Option<Arc<dyn Stateful>>,
    listener: Option<Arc<dyn MembershipListener>>,
    /// Held for writing until state transfer completes.
    ready: Arc<tokio::sync::RwLock<()>>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct Channel {
    /// Oldest member first.
    view: RwLock<Vec<Arc<Endpoint>>>,
}

/// An in-process group. Cloning yields another handle to the same group.
#[derive(Clone, Default)]
pub struct MemoryGroup {
    channels: Arc<DashMap<String, Arc<Channel>>>,
}

impl MemoryGroup {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, id: &str) -> Arc<Channel> {
        self.channels.entry(id.to_string()).or_default().clone()
    }

    /// The current view of `channel`, oldest member first.
    #[must_use]
    pub fn members(&self, channel: &str) -> Vec<Member> {
        self.channels.get(channel).map_or_else(Vec::new, |channel| {
            channel
                .view
                .read()
                .iter()
                .map(|endpoint| endpoint.member.clone())
                .collect()
        })
    }

    /// Creates a dispatcher for `channel` on behalf of `local`.
    pub fn dispatcher<C, K>(
        &self,
        channel: &str,
        local: Member,
        context: Arc<C>,
        stateful: Option<Arc<dyn Stateful>>,
        listener: Option<Arc<dyn MembershipListener>>,
    ) -> MemoryDispatcher<C, K>
    where
        C: Send + Sync + 'static,
        K: Command<C>,
    {
        MemoryDispatcher {
            channel_id: channel.to_string(),
            channel: self.channel(channel),
            local,
            handler: Arc::new(CommandHandler::<C, K> {
                context,
                _command: PhantomData,
            }),
            stateful,
            listener,
            endpoint: Mutex::new(None),
            _marker: PhantomData,
        }
    }
}

impl Debug for MemoryGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryGroup")
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl CommandDispatcherFactory for MemoryGroup {
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
        K: Command<C>,
    {
        Arc::new(self.dispatcher::<C, K>(channel, local, context, stateful, listener))
    }
}

/// Dispatcher for one member of one channel of a [`MemoryGroup`].
pub struct MemoryDispatcher<C, K> {
    channel_id: String,
    channel: Arc<Channel>,
    local: Member,
    handler: Arc<dyn Handler>,
    stateful: Option<Arc<dyn Stateful>>,
    listener: Option<Arc<dyn MembershipListener>>,
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    _marker: PhantomData<fn() -> (Arc<C>, K)>,
}

impl<C, K> MemoryDispatcher<C, K> {
    fn joined(&self) -> Result<Arc<Endpoint>, DispatchError> {
        self.endpoint
            .lock()
            .clone()
            .ok_or_else(|| DispatchError::NotStarted(self.channel_id.clone()))
    }

    async fn deliver(
        &self,
        origin: &Endpoint,
        target: Arc<Endpoint>,
        payload: Bytes,
    ) -> Result<Bytes, DispatchError> {
        tokio::select! {
            biased;
            () = target.shutdown.cancelled() => {
                Err(DispatchError::MemberUnavailable(target.member.clone()))
            }
            () = origin.shutdown.cancelled() => {
                Err(DispatchError::NotStarted(self.channel_id.clone()))
            }
            result = async {
                let _ready = target.ready.read().await;
                target.handler.handle(payload).await
            } => result,
        }
    }

    fn leave(&self, endpoint: &Arc<Endpoint>) -> Vec<Arc<Endpoint>> {
        let survivors = {
            let mut view = self.channel.view.write();
            view.retain(|other| !Arc::ptr_eq(other, endpoint));
            view.clone()
        };
        endpoint.shutdown.cancel();
        self.endpoint.lock().take();
        survivors
    }
}

#[async_trait]
impl<C, K> CommandDispatcher<C, K> for MemoryDispatcher<C, K>
where
    C: Send + Sync + 'static,
    K: Command<C>,
{
    fn local(&self) -> &Member {
        &self.local
    }

    fn coordinator(&self) -> Option<Member> {
        self.channel
            .view
            .read()
            .first()
            .map(|endpoint| endpoint.member.clone())
    }

    fn members(&self) -> Vec<Member> {
        self.channel
            .view
            .read()
            .iter()
            .map(|endpoint| endpoint.member.clone())
            .collect()
    }

    async fn execute_all(&self, command: K) -> Result<HashMap<Member, K::Output>, DispatchError> {
        let origin = self.joined()?;
        let view = self.channel.view.read().clone();
        let payload = command.to_bytes();

        let deliveries = view.into_iter().map(|target| {
            let payload = payload.clone();
            let origin = &origin;
            async move {
                let member = target.member.clone();
                (member, self.deliver(origin, target, payload).await)
            }
        });

        let mut results = HashMap::new();
        for (member, result) in join_all(deliveries).await {
            match result {
                Ok(bytes) => {
                    results.insert(member, K::Output::from_bytes(bytes)?);
                }
                Err(DispatchError::MemberUnavailable(departed)) => {
                    debug!(
                        channel = %self.channel_id,
                        member = %departed,
                        "Member left before answering"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(results)
    }

    async fn execute_coordinator(&self, command: K) -> Result<K::Output, DispatchError> {
        let origin = self.joined()?;
        let coordinator = self
            .channel
            .view
            .read()
            .first()
            .cloned()
            .ok_or(DispatchError::NoCoordinator)?;

        let bytes = self.deliver(&origin, coordinator, command.to_bytes()).await?;
        Ok(K::Output::from_bytes(bytes)?)
    }

    async fn start(&self) -> Result<(), DispatchError> {
        if self.endpoint.lock().is_some() {
            return Ok(());
        }

        let endpoint = Arc::new(Endpoint {
            member: self.local.clone(),
            handler: self.handler.clone(),
            stateful: self.stateful.clone(),
            listener: self.listener.clone(),
            ready: Arc::new(tokio::sync::RwLock::new(())),
            shutdown: CancellationToken::new(),
        });

        // Commands delivered before the snapshot is installed wait on this
        let gate = endpoint.ready.clone().write_owned().await;

        let (coordinator, peers) = {
            let mut view = self.channel.view.write();
            if view.iter().any(|other| other.member == self.local) {
                return Err(DispatchError::AlreadyJoined {
                    channel: self.channel_id.clone(),
                    member: self.local.clone(),
                });
            }
            view.push(endpoint.clone());
            let peers: Vec<_> = view
                .iter()
                .filter(|other| !Arc::ptr_eq(other, &endpoint))
                .cloned()
                .collect();
            (view[0].clone(), peers)
        };
        *self.endpoint.lock() = Some(endpoint.clone());

        if !Arc::ptr_eq(&coordinator, &endpoint) {
            if let (Some(source), Some(target)) = (&coordinator.stateful, &endpoint.stateful) {
                let transfer = async {
                    let snapshot = source.snapshot().await?;
                    target.restore(snapshot).await
                };
                if let Err(e) = transfer.await {
                    warn!(
                        channel = %self.channel_id,
                        member = %self.local,
                        error = %e,
                        "State transfer failed, leaving group"
                    );
                    self.leave(&endpoint);
                    return Err(e);
                }
                debug!(
                    channel = %self.channel_id,
                    member = %self.local,
                    coordinator = %coordinator.member,
                    "State transferred"
                );
            }
        }
        drop(gate);

        for peer in peers {
            if let Some(listener) = &peer.listener {
                listener.added(&self.local).await;
            }
        }

        info!(channel = %self.channel_id, member = %self.local, "Joined group");
        Ok(())
    }

    async fn stop(&self) -> Result<(), DispatchError> {
        let Some(endpoint) = self.endpoint.lock().clone() else {
            return Ok(());
        };

        let survivors = self.leave(&endpoint);
        for peer in survivors {
            if let Some(listener) = &peer.listener {
                listener.removed(&self.local).await;
            }
        }

        info!(channel = %self.channel_id, member = %self.local, "Left group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use bytes::{Buf, BufMut, BytesMut};
    use tandem_dispatch::CodecError;
    use tandem_dispatch::codec;
    use tokio::sync::Notify;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Counter {
        total: AtomicU64,
        parked: Notify,
        removed: Mutex<Vec<Member>>,
        added: Mutex<Vec<Member>>,
    }

    enum CounterCommand {
        Add(u64),
        Park,
    }

    impl Wire for CounterCommand {
        fn encode(&self, buf: &mut BytesMut) {
            match self {
                Self::Add(amount) => {
                    buf.put_u8(0);
                    buf.put_u64(*amount);
                }
                Self::Park => buf.put_u8(1),
            }
        }

        fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
            match codec::get_u8(buf)? {
                0 => Ok(Self::Add(codec::get_u64(buf)?)),
                1 => Ok(Self::Park),
                tag => Err(CodecError::InvalidTag {
                    what: "counter command",
                    tag,
                }),
            }
        }
    }

    #[async_trait]
    impl Command<Counter> for CounterCommand {
        type Output = u64;

        async fn execute(self, context: &Counter) -> u64 {
            match self {
                Self::Add(amount) => context.total.fetch_add(amount, Ordering::SeqCst) + amount,
                Self::Park => {
                    context.parked.notified().await;
                    context.total.load(Ordering::SeqCst)
                }
            }
        }
    }

    #[async_trait]
    impl MembershipListener for Counter {
        async fn added(&self, member: &Member) {
            self.added.lock().push(member.clone());
        }

        async fn removed(&self, member: &Member) {
            self.removed.lock().push(member.clone());
        }
    }

    #[async_trait]
    impl Stateful for Counter {
        async fn snapshot(&self) -> Result<Bytes, DispatchError> {
            Ok(self.total.load(Ordering::SeqCst).to_bytes())
        }

        async fn restore(&self, snapshot: Bytes) -> Result<(), DispatchError> {
            let mut snapshot = snapshot;
            self.total.store(snapshot.get_u64(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn join(
        group: &MemoryGroup,
        name: &str,
    ) -> (Arc<Counter>, MemoryDispatcher<Counter, CounterCommand>) {
        let counter = Arc::new(Counter::default());
        let dispatcher = group.dispatcher::<Counter, CounterCommand>(
            "counter",
            Member::new(name),
            counter.clone(),
            Some(counter.clone()),
            Some(counter.clone()),
        );
        (counter, dispatcher)
    }

    #[tokio::test]
    async fn test_execute_all_reaches_every_member() {
        let group = MemoryGroup::new();
        let (first, a) = join(&group, "a");
        let (second, b) = join(&group, "b");
        a.start().await.unwrap();
        b.start().await.unwrap();

        let results = b.execute_all(CounterCommand::Add(5)).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[a.local()], 5);
        assert_eq!(results[b.local()], 5);
        assert_eq!(first.total.load(Ordering::SeqCst), 5);
        assert_eq!(second.total.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_oldest_member_is_coordinator() {
        let group = MemoryGroup::new();
        let (first, a) = join(&group, "a");
        let (second, b) = join(&group, "b");
        a.start().await.unwrap();
        b.start().await.unwrap();

        assert!(a.is_coordinator());
        assert!(!b.is_coordinator());
        assert_eq!(b.coordinator().as_ref(), Some(a.local()));

        b.execute_coordinator(CounterCommand::Add(3)).await.unwrap();
        assert_eq!(first.total.load(Ordering::SeqCst), 3);
        assert_eq!(second.total.load(Ordering::SeqCst), 0);

        a.stop().await.unwrap();
        assert!(b.is_coordinator());
        assert_eq!(group.members("counter"), vec![b.local().clone()]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_membership_callbacks() {
        let group = MemoryGroup::new();
        let (first, a) = join(&group, "a");
        let (_second, b) = join(&group, "b");
        a.start().await.unwrap();
        b.start().await.unwrap();

        assert_eq!(*first.added.lock(), vec![b.local().clone()]);

        b.stop().await.unwrap();
        assert_eq!(*first.removed.lock(), vec![b.local().clone()]);
        assert!(logs_contain("Left group"));
    }

    #[tokio::test]
    async fn test_joining_member_receives_state() {
        let group = MemoryGroup::new();
        let (_first, a) = join(&group, "a");
        a.start().await.unwrap();
        a.execute_all(CounterCommand::Add(42)).await.unwrap();

        let (second, b) = join(&group, "b");
        b.start().await.unwrap();

        assert_eq!(second.total.load(Ordering::SeqCst), 42);
        let results = a.execute_all(CounterCommand::Add(1)).await.unwrap();
        assert_eq!(results[b.local()], 43);
    }

    #[tokio::test]
    async fn test_departed_member_is_omitted() {
        let group = MemoryGroup::new();
        let (_first, a) = join(&group, "a");
        let (_second, b) = join(&group, "b");
        a.start().await.unwrap();
        b.start().await.unwrap();

        // `a` parks every delivery; stopping it must release the caller
        let caller = tokio::spawn(async move {
            let result = b.execute_coordinator(CounterCommand::Park).await;
            (b, result)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.stop().await.unwrap();

        let (b, result) = caller.await.unwrap();
        assert_matches!(
            result,
            Err(DispatchError::MemberUnavailable(member)) if &member == a.local()
        );

        let results = b.execute_all(CounterCommand::Add(1)).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_not_started() {
        let group = MemoryGroup::new();
        let (_counter, a) = join(&group, "a");
        assert_matches!(
            a.execute_all(CounterCommand::Add(1)).await,
            Err(DispatchError::NotStarted(_))
        );
    }
}
