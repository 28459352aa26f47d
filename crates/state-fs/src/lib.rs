//! Implementation of cluster state using files on disk, so that a member
//! restarting after a crash can recover what it left in flight.
//!
//! The directory holds two files, each replaced atomically on every change:
//! - `active-nodes.cbor`: the active node set
//! - `events.bin`: the open invocations, in the durability event encoding
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tandem_balancer::NodeId;
use tandem_dispatch::Wire;
use tandem_durability::{DurabilityListener, EventLog, InvocationEvent, InvokerEvent};
use tandem_state::{Journal, StateError, StateManager};
use tokio::fs;
use tokio::io::{self, AsyncWriteExt};
use tracing::{error, info};

const ACTIVE_NODES_FILE: &str = "active-nodes.cbor";
const EVENTS_FILE: &str = "events.bin";

/// Cluster state persisted in a directory.
#[derive(Debug)]
pub struct FsStateManager {
    dir: PathBuf,
    active: Mutex<BTreeSet<NodeId>>,
    // serializes writes of the active set file
    active_file: tokio::sync::Mutex<()>,
    journal: tokio::sync::Mutex<Journal>,
}

impl FsStateManager {
    /// Creates a new `FsStateManager` keeping its files in `dir`. Nothing is
    /// read until started.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            active: Mutex::new(BTreeSet::new()),
            active_file: tokio::sync::Mutex::new(()),
            journal: tokio::sync::Mutex::new(Journal::new()),
        }
    }

    async fn read(&self, name: &str) -> Result<Option<Bytes>, StateError> {
        match fs::read(self.dir.join(name)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::Io("error reading file", e)),
        }
    }

    /// Writes `name` through a temporary file, so a crash leaves either the
    /// old or the new content. The rename is synced with the directory.
    async fn write(&self, name: &str, bytes: &[u8]) -> Result<(), StateError> {
        let path = self.dir.join(name);
        let temporary = self.dir.join(format!("{name}.tmp"));

        let mut file = fs::File::create(&temporary)
            .await
            .map_err(|e| StateError::Io("error creating file", e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StateError::Io("error writing file", e))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::Io("error syncing file", e))?;
        drop(file);

        fs::rename(&temporary, &path)
            .await
            .map_err(|e| StateError::Io("error replacing file", e))?;

        fs::File::open(&self.dir)
            .await
            .map_err(|e| StateError::Io("error opening directory", e))?
            .sync_all()
            .await
            .map_err(|e| StateError::Io("error syncing directory", e))
    }

    /// Persists the updated active set, then makes it visible. A failed
    /// write leaves the set as it was.
    async fn update_active<F>(&self, update: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut BTreeSet<NodeId>) + Send,
    {
        let _file = self.active_file.lock().await;
        let mut next = self.active.lock().clone();
        update(&mut next);

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&next, &mut bytes)
            .map_err(|e| StateError::Serialize(e.to_string()))?;
        self.write(ACTIVE_NODES_FILE, &bytes).await?;

        *self.active.lock() = next;
        Ok(())
    }

    async fn update_journal<F>(&self, update: F)
    where
        F: FnOnce(&mut Journal) -> bool + Send,
    {
        let mut journal = self.journal.lock().await;
        if !update(&mut journal) {
            return;
        }
        if let Err(e) = self.write(EVENTS_FILE, &journal.to_bytes()).await {
            error!(error = %e, "Failed to persist durability events");
        }
    }
}

#[async_trait]
impl DurabilityListener for FsStateManager {
    async fn before_invocation(&self, event: &InvocationEvent) {
        self.update_journal(|journal| {
            journal.begin(event);
            true
        })
        .await;
    }

    async fn after_invocation(&self, event: &InvocationEvent) {
        self.update_journal(|journal| journal.end(event)).await;
    }

    async fn before_invoker(&self, event: &InvokerEvent) {
        self.update_journal(|journal| journal.record(event)).await;
    }

    async fn after_invoker(&self, event: &InvokerEvent) {
        self.update_journal(|journal| journal.record(event)).await;
    }
}

#[async_trait]
impl StateManager for FsStateManager {
    async fn start(&self) -> Result<(), StateError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StateError::Io("error creating directory", e))?;

        let active: BTreeSet<NodeId> = match self.read(ACTIVE_NODES_FILE).await? {
            Some(bytes) => ciborium::de::from_reader(&bytes[..])
                .map_err(|e| StateError::Deserialize(e.to_string()))?,
            None => BTreeSet::new(),
        };
        let journal = match self.read(EVENTS_FILE).await? {
            Some(bytes) => Journal::from_bytes(bytes)?,
            None => Journal::new(),
        };

        info!(
            dir = %self.dir.display(),
            active = active.len(),
            open_invocations = journal.log().len(),
            "Loaded cluster state"
        );
        *self.active.lock() = active;
        *self.journal.lock().await = journal;
        Ok(())
    }

    async fn stop(&self) -> Result<(), StateError> {
        Ok(())
    }

    fn active_nodes(&self) -> BTreeSet<NodeId> {
        self.active.lock().clone()
    }

    async fn set_active_nodes(&self, nodes: BTreeSet<NodeId>) -> Result<(), StateError> {
        self.update_active(|active| *active = nodes).await
    }

    async fn activated(&self, node: &NodeId) -> Result<(), StateError> {
        self.update_active(|active| {
            active.insert(node.clone());
        })
        .await
    }

    async fn deactivated(&self, node: &NodeId) -> Result<(), StateError> {
        self.update_active(|active| {
            active.remove(node);
        })
        .await
    }

    async fn recoverable_event_log(&self) -> EventLog {
        self.journal.lock().await.log().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use tandem_dispatch::CodecError;
    use tandem_durability::{ExceptionType, InvokerResult, Phase, TransactionId};
    use tempfile::tempdir;

    fn commit(tx: u64) -> InvocationEvent {
        InvocationEvent::new(TransactionId::Counter(tx), Phase::Commit, ExceptionType::Sql)
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempdir().unwrap();

        let state = FsStateManager::new(dir.path());
        state.start().await.unwrap();
        state.activated(&NodeId::from("db1")).await.unwrap();
        state.activated(&NodeId::from("db2")).await.unwrap();
        state.before_invocation(&commit(1)).await;
        state.before_invocation(&commit(2)).await;
        let mut event =
            InvokerEvent::new(TransactionId::Counter(1), Phase::Commit, NodeId::from("db1"));
        event.result = Some(InvokerResult::Value(Bytes::from_static(b"3 rows")));
        state.after_invoker(&event).await;
        state.after_invocation(&commit(2)).await;
        drop(state);

        let restarted = FsStateManager::new(dir.path());
        assert!(restarted.active_nodes().is_empty());
        restarted.start().await.unwrap();

        assert_eq!(
            restarted.active_nodes(),
            BTreeSet::from([NodeId::from("db1"), NodeId::from("db2")])
        );
        let log = restarted.recoverable_event_log().await;
        assert_eq!(log.keys().collect::<Vec<_>>(), [&commit(1)]);
        assert_eq!(log[&commit(1)][&NodeId::from("db1")], event);
    }

    #[tokio::test]
    async fn test_fresh_directory_is_created() {
        let dir = tempdir().unwrap();
        let state = FsStateManager::new(dir.path().join("cluster").join("state"));

        state.start().await.unwrap();
        state.set_active_nodes(BTreeSet::from([NodeId::from("db1")])).await.unwrap();

        assert!(dir.path().join("cluster/state").join(ACTIVE_NODES_FILE).exists());
        assert!(!dir.path().join("cluster/state").join("active-nodes.cbor.tmp").exists());
        assert!(state.recoverable_event_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_active_nodes() {
        let dir = tempdir().unwrap();
        let state = FsStateManager::new(dir.path().join("state"));
        state.start().await.unwrap();
        state.activated(&NodeId::from("db1")).await.unwrap();

        std::fs::remove_dir_all(dir.path().join("state")).unwrap();

        assert_matches!(
            state.activated(&NodeId::from("db2")).await,
            Err(StateError::Io(_, _))
        );
        assert_matches!(
            state.deactivated(&NodeId::from("db1")).await,
            Err(StateError::Io(_, _))
        );
        assert_matches!(
            state.set_active_nodes(BTreeSet::new()).await,
            Err(StateError::Io(_, _))
        );
        assert_eq!(state.active_nodes(), BTreeSet::from([NodeId::from("db1")]));
    }

    #[tokio::test]
    async fn test_corrupt_event_file_fails_start() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(EVENTS_FILE), [0, 0, 0, 1, 9]).unwrap();

        let state = FsStateManager::new(dir.path());
        assert_matches!(
            state.start().await,
            Err(StateError::Codec(CodecError::UnsupportedVersion(9)))
        );
    }
}
