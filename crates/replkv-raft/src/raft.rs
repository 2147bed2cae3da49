//! Main Raft consensus module - wires everything together.
//!
//! The Raft struct implements the ReplicatedLog trait and manages:
//! - Recovery (snapshot restore, log replay up to the commit hint)
//! - RaftState (core state machine)
//! - Background tasks (timer, election, heartbeat, apply, RPC handler)
//! - Lifecycle (start/shutdown)

use crate::apply::{ApplyLoop, ApplyMsg};
use crate::config::RaftConfig;
use crate::election::election_loop;
use crate::error::{RaftError, Result};
use crate::fsm::StateMachine;
use crate::log::RaftLog;
use crate::replication::heartbeat_loop;
use crate::rpc_handler::rpc_handler_loop;
use crate::snapshot::SnapshotStore;
use crate::state::{RaftState, RaftStatus};
use crate::timer::ElectionTimer;
use crate::transport::{RaftTransport, RpcReceiver};
use crate::types::*;
use crate::ReplicatedLog;
use bytes::Bytes;
use parking_lot::Mutex;
use replkv_observe::Meter;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// A proposal that made it through the state machine.
#[derive(Debug, Clone)]
pub struct Applied {
    pub index: LogIndex,
    pub term: Term,
    /// Whatever `StateMachine::apply` returned for the command.
    pub response: Bytes,
}

/// Pieces built by `open` and consumed by `start`.
struct Pending {
    apply_loop: ApplyLoop,
    apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
    rpc_rx: RpcReceiver,
}

/// Main Raft consensus module.
pub struct Raft {
    state: Arc<RaftState>,
    transport: Arc<dyn RaftTransport>,
    election_timer: Arc<ElectionTimer>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    shutdown_tx: broadcast::Sender<()>,
    pending: Mutex<Option<Pending>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Raft {
    /// Open (or recover) a Raft node rooted at `dir`.
    ///
    /// The state machine is restored from the newest snapshot in
    /// `dir/snapshots`, then committed entries from `dir/log` are replayed
    /// into it. Nothing runs until [`Raft::start`].
    pub async fn open(
        node_id: NodeId,
        config: RaftConfig,
        dir: impl AsRef<Path>,
        transport: Arc<dyn RaftTransport>,
        mut state_machine: Box<dyn StateMachine>,
        rpc_rx: RpcReceiver,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|reason| RaftError::ConfigError { reason })?;
        let dir = dir.as_ref();

        let (log, _) = RaftLog::open(dir.join("log"), config.node_tag, meter.clone()).await?;
        let snapshots = SnapshotStore::open(dir.join("snapshots"), config.snapshot_retain).await?;

        let mut applied = LogIndex::ZERO;
        if let Some(snapshot) = snapshots.latest().await? {
            let meta = snapshot.metadata.clone();
            state_machine.restore(&snapshot.data)?;
            applied = meta.last_included_index;

            // Crashed between storing a snapshot and rewriting the log.
            if meta.last_included_index > log.snapshot_meta().last_included_index {
                if log.term_at(meta.last_included_index) == Some(meta.last_included_term) {
                    log.compact(&meta, config.trailing_logs).await?;
                } else {
                    log.install_snapshot(&meta).await?;
                }
            }
            tracing::info!(
                node = %node_id,
                index = %meta.last_included_index,
                term = %meta.last_included_term,
                "Restored state machine from snapshot"
            );
        }

        let base = log.snapshot_meta().last_included_index;
        if base > applied {
            return Err(RaftError::SnapshotCorrupt {
                reason: format!(
                    "log compacted through {} but newest snapshot covers {}",
                    base, applied
                ),
            });
        }
        let last_snapshot = applied;

        let replay_to = log.commit_hint().min(log.last_index());
        let mut replayed = 0usize;
        while applied < replay_to {
            let batch = log.entries(applied.next(), config.apply_batch_size);
            if batch.first().map(|e| e.index) != Some(applied.next()) {
                return Err(RaftError::Internal {
                    reason: format!("log has no entry at {} during replay", applied.next()),
                });
            }
            for entry in batch.into_iter().take_while(|e| e.index <= replay_to) {
                if let EntryPayload::Command(command) = &entry.payload {
                    if let Err(e) = state_machine.apply(entry.index, command) {
                        tracing::warn!(index = %entry.index, error = %e, "Command rejected during replay");
                    }
                }
                applied = entry.index;
                replayed += 1;
            }
        }
        if replayed > 0 {
            tracing::info!(node = %node_id, replayed, applied = %applied, "Replayed committed log entries");
        }

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RaftState::new(
            node_id,
            config.clone(),
            log,
            Arc::new(snapshots),
            applied,
            apply_tx.clone(),
            meter,
        ));
        let apply_loop = ApplyLoop::new(state.clone(), state_machine, applied, last_snapshot);
        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            state,
            transport,
            election_timer: Arc::new(ElectionTimer::new(config)),
            apply_tx,
            shutdown_tx,
            pending: Mutex::new(Some(Pending {
                apply_loop,
                apply_rx,
                rpc_rx,
            })),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn the background tasks. Fails if called twice.
    pub fn start(&self) -> Result<()> {
        let Some(pending) = self.pending.lock().take() else {
            return Err(RaftError::Internal {
                reason: "raft already started".to_string(),
            });
        };

        let (timeout_tx, timeout_rx) = mpsc::channel(1);
        let commit_rx = self.state.subscribe_commit();
        let tasks = vec![
            tokio::spawn(
                self.election_timer
                    .clone()
                    .run(timeout_tx, self.shutdown_tx.subscribe()),
            ),
            tokio::spawn(election_loop(
                self.state.clone(),
                self.transport.clone(),
                timeout_rx,
                self.shutdown_tx.subscribe(),
            )),
            tokio::spawn(heartbeat_loop(
                self.state.clone(),
                self.transport.clone(),
                self.shutdown_tx.subscribe(),
            )),
            tokio::spawn(pending.apply_loop.run(
                commit_rx,
                pending.apply_rx,
                self.shutdown_tx.subscribe(),
            )),
            tokio::spawn(rpc_handler_loop(
                self.state.clone(),
                pending.rpc_rx,
                self.election_timer.clone(),
                self.shutdown_tx.subscribe(),
            )),
        ];
        self.tasks.lock().extend(tasks);

        tracing::info!(node = %self.state.node_id(), "Raft started");
        Ok(())
    }

    /// Stop all background tasks and wait for them to exit.
    ///
    /// Waiting proposers get `Shutdown`. Durable state is untouched, so the
    /// same directory can be reopened afterwards.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Raft task panicked");
            }
        }
        self.state.tracker().shutdown();
        tracing::info!(node = %self.state.node_id(), "Raft shut down");
    }

    fn check_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(RaftError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Write the initial membership into an empty log.
    ///
    /// Returns false if the log already had entries (already bootstrapped
    /// or joined).
    pub async fn bootstrap(&self, membership: Membership) -> Result<bool> {
        self.state.bootstrap(membership).await
    }

    /// Append a command and return without waiting for commit.
    pub async fn propose(&self, command: Bytes) -> Result<(LogIndex, Term)> {
        self.check_running()?;
        let (index, term, _rx) = self.state.propose(EntryPayload::Command(command)).await?;
        Ok((index, term))
    }

    /// Append a command and wait until it is applied.
    ///
    /// On timeout the entry may still commit later; the caller cannot tell.
    pub async fn propose_and_wait(&self, command: Bytes, timeout: Duration) -> Result<Applied> {
        self.check_running()?;
        let started = Instant::now();
        let (index, term, rx) = self.state.propose(EntryPayload::Command(command)).await?;
        let response = self.wait(index, rx, started, timeout).await?;
        Ok(Applied {
            index,
            term,
            response,
        })
    }

    /// Add `node` as a voter and wait for the change to apply.
    ///
    /// Leader only. A no-op if `node` already votes.
    pub async fn add_voter(&self, node: NodeId, timeout: Duration) -> Result<()> {
        self.check_running()?;
        let started = Instant::now();
        let Some((index, _, rx)) = self.state.add_voter(node).await? else {
            return Ok(());
        };
        self.wait(index, rx, started, timeout).await.map(|_| ())
    }

    async fn wait(
        &self,
        index: LogIndex,
        rx: oneshot::Receiver<Result<Bytes>>,
        started: Instant,
        timeout: Duration,
    ) -> Result<Bytes> {
        match tokio::time::timeout(timeout.saturating_sub(started.elapsed()), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => {
                self.state.tracker().forget(index);
                Err(RaftError::CommitTimeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Snapshot the state machine now and compact the log behind it.
    pub async fn snapshot_now(&self) -> Result<SnapshotMetadata> {
        self.check_running()?;
        let (done, rx) = oneshot::channel();
        self.apply_tx
            .send(ApplyMsg::Snapshot { done })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    pub fn node_id(&self) -> &NodeId {
        self.state.node_id()
    }

    pub fn config(&self) -> &RaftConfig {
        self.state.config()
    }

    pub fn status(&self) -> RaftStatus {
        self.state.status()
    }

    /// Watch the applied index.
    pub fn applied_index(&self) -> watch::Receiver<LogIndex> {
        self.state.subscribe_applied()
    }

    /// Up to `max` local log entries starting at `from`. Compacted entries
    /// are not returned.
    pub fn entries(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        self.state.log_ref().entries(from, max)
    }
}

#[async_trait::async_trait]
impl ReplicatedLog for Raft {
    async fn propose(&self, cmd: Bytes) -> Result<LogIndex> {
        Raft::propose(self, cmd).await.map(|(index, _)| index)
    }

    fn is_leader(&self) -> bool {
        self.state.role() == Role::Leader
    }

    fn leader(&self) -> Option<NodeId> {
        self.state.leader()
    }

    fn subscribe_applied(&self) -> watch::Receiver<LogIndex> {
        self.state.subscribe_applied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{Command, KvStateMachine};
    use crate::transport::InMemoryTransport;
    use replkv_observe::NoopMeter;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn fast_config() -> RaftConfig {
        let mut config = RaftConfig::default();
        config.heartbeat_interval = Duration::from_millis(20);
        config.election_timeout_min = Duration::from_millis(60);
        config.election_timeout_max = Duration::from_millis(120);
        config.rpc_timeout = Duration::from_millis(20);
        config
    }

    async fn open_single(dir: &Path, config: RaftConfig) -> Result<(Raft, crate::fsm::KvReader)> {
        let id = NodeId::new("n1");
        let (_rpc_tx, rpc_rx) = mpsc::channel(16);
        let transport: Arc<dyn RaftTransport> =
            Arc::new(InMemoryTransport::new(id.clone(), HashMap::new()));
        let fsm = KvStateMachine::new();
        let reader = fsm.reader();
        let raft = Raft::open(id, config, dir, transport, Box::new(fsm), rpc_rx, Arc::new(NoopMeter)).await?;
        Ok((raft, reader))
    }

    async fn wait_leader(raft: &Raft) {
        for _ in 0..100 {
            if ReplicatedLog::is_leader(raft) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader elected");
    }

    fn set(key: &str, value: &str) -> Bytes {
        Command::set(key, value).serialize().unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let temp = TempDir::new().unwrap();
        let mut config = RaftConfig::default();
        config.election_timeout_min = Duration::from_millis(10);
        let result = open_single(temp.path(), config).await;
        assert!(matches!(result, Err(RaftError::ConfigError { .. })));
    }

    #[tokio::test]
    async fn test_single_node_write_and_restart() {
        let temp = TempDir::new().unwrap();
        {
            let (raft, reader) = open_single(temp.path(), fast_config()).await.unwrap();
            assert!(raft.bootstrap(Membership::single(NodeId::new("n1"))).await.unwrap());
            raft.start().unwrap();
            wait_leader(&raft).await;

            let applied = raft
                .propose_and_wait(set("k", "v1"), Duration::from_secs(2))
                .await
                .unwrap();
            assert!(applied.index > LogIndex(1));
            assert_eq!(reader.get("k"), Some("v1".to_string()));
            raft.shutdown().await;
        }

        let (raft, reader) = open_single(temp.path(), fast_config()).await.unwrap();
        assert_eq!(reader.get("k"), Some("v1".to_string()));
        assert!(!raft.bootstrap(Membership::single(NodeId::new("n1"))).await.unwrap());
    }

    #[tokio::test]
    async fn test_restart_from_snapshot_and_suffix() {
        let temp = TempDir::new().unwrap();
        {
            let (raft, _) = open_single(temp.path(), fast_config()).await.unwrap();
            raft.bootstrap(Membership::single(NodeId::new("n1"))).await.unwrap();
            raft.start().unwrap();
            wait_leader(&raft).await;

            raft.propose_and_wait(set("a", "1"), Duration::from_secs(2)).await.unwrap();
            let meta = raft.snapshot_now().await.unwrap();
            assert!(meta.last_included_index > LogIndex::ZERO);
            raft.propose_and_wait(set("b", "2"), Duration::from_secs(2)).await.unwrap();
            raft.shutdown().await;
        }

        let (raft, reader) = open_single(temp.path(), fast_config()).await.unwrap();
        assert_eq!(reader.get("a"), Some("1".to_string()));
        assert_eq!(reader.get("b"), Some("2".to_string()));
        assert!(raft.status().snapshot_index > LogIndex::ZERO);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_fails_open() {
        let temp = TempDir::new().unwrap();
        {
            let (raft, _) = open_single(temp.path(), fast_config()).await.unwrap();
            raft.bootstrap(Membership::single(NodeId::new("n1"))).await.unwrap();
            raft.start().unwrap();
            wait_leader(&raft).await;

            raft.propose_and_wait(set("a", "1"), Duration::from_secs(2)).await.unwrap();
            raft.snapshot_now().await.unwrap();
            raft.shutdown().await;
        }

        let store = SnapshotStore::open(temp.path().join("snapshots"), 1).await.unwrap();
        let (_, _, path) = store.list().await.unwrap().pop().unwrap();
        let mut raw = std::fs::read(&path).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        let result = open_single(temp.path(), fast_config()).await;
        assert!(matches!(result, Err(RaftError::SnapshotCorrupt { .. })));
    }

    #[tokio::test]
    async fn test_log_entries_visible_after_write() {
        let temp = TempDir::new().unwrap();
        let (raft, _) = open_single(temp.path(), fast_config()).await.unwrap();
        raft.bootstrap(Membership::single(NodeId::new("n1"))).await.unwrap();
        raft.start().unwrap();
        wait_leader(&raft).await;

        let applied = raft
            .propose_and_wait(set("k", "v"), Duration::from_secs(2))
            .await
            .unwrap();
        let entries = raft.entries(LogIndex(1), usize::MAX);
        assert_eq!(entries.first().map(|e| e.index), Some(LogIndex(1)));
        let last = entries.last().unwrap();
        assert_eq!(last.index, applied.index);
        assert_eq!(last.payload, EntryPayload::Command(set("k", "v")));
        raft.shutdown().await;
    }

    #[tokio::test]
    async fn test_propose_on_follower_is_not_leader() {
        let temp = TempDir::new().unwrap();
        let (raft, _) = open_single(temp.path(), fast_config()).await.unwrap();
        let result = raft.propose_and_wait(set("k", "v"), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(RaftError::NotLeader { .. })));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let temp = TempDir::new().unwrap();
        let (raft, _) = open_single(temp.path(), fast_config()).await.unwrap();
        raft.start().unwrap();
        assert!(raft.start().is_err());
        raft.shutdown().await;
        assert!(matches!(
            raft.propose(set("k", "v")).await,
            Err(RaftError::Shutdown)
        ));
    }
}
