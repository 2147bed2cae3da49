//! Key/value node: a [`Raft`] instance driving a [`KvStateMachine`].
//!
//! Writes go through consensus and return once applied locally. Reads are
//! served from the local state machine: on the leader they observe every
//! acknowledged write, on followers they may lag.

use crate::config::RaftConfig;
use crate::error::{KvError, RaftError};
use crate::fsm::{decode_previous, Command, KvReader, KvStateMachine};
use crate::raft::Raft;
use crate::state::RaftStatus;
use crate::transport::{RaftTransport, RpcReceiver};
use crate::types::*;
use replkv_observe::{Meter, NoopMeter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything needed to open a node.
#[derive(Clone)]
pub struct NodeOptions {
    pub node_id: NodeId,
    /// Root directory; the log and snapshots live in subdirectories.
    pub data_dir: PathBuf,
    pub raft: RaftConfig,
    pub meter: Arc<dyn Meter>,
}

impl NodeOptions {
    pub fn new(node_id: NodeId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            data_dir: data_dir.into(),
            raft: RaftConfig::default(),
            meter: Arc::new(NoopMeter),
        }
    }

    pub fn with_raft_config(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    pub fn with_meter(mut self, meter: Arc<dyn Meter>) -> Self {
        self.meter = meter;
        self
    }
}

/// Acknowledgement of a committed and applied write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub index: LogIndex,
    pub term: Term,
    /// Value the key held before this write.
    pub previous: Option<String>,
}

pub struct KvNode {
    raft: Raft,
    reader: KvReader,
}

impl KvNode {
    /// Open the node, restoring the state machine from disk.
    ///
    /// `rpc_rx` receives the RPCs peers send to this node.
    pub async fn open(
        options: NodeOptions,
        transport: Arc<dyn RaftTransport>,
        rpc_rx: RpcReceiver,
    ) -> Result<Self, RaftError> {
        let fsm = KvStateMachine::new();
        let reader = fsm.reader();
        let raft = Raft::open(
            options.node_id,
            options.raft,
            &options.data_dir,
            transport,
            Box::new(fsm),
            rpc_rx,
            options.meter,
        )
        .await?;
        Ok(Self { raft, reader })
    }

    pub fn start(&self) -> Result<(), RaftError> {
        self.raft.start()
    }

    pub async fn shutdown(&self) {
        self.raft.shutdown().await
    }

    /// Start a new cluster with this node as its only voter.
    ///
    /// Returns false if the node already has a log.
    pub async fn bootstrap(&self) -> Result<bool, KvError> {
        let me = self.raft.node_id().clone();
        Ok(self.raft.bootstrap(Membership::single(me)).await?)
    }

    /// Start a new cluster with a fixed voter set. Every listed node must be
    /// bootstrapped with the same list.
    pub async fn bootstrap_with(
        &self,
        voters: impl IntoIterator<Item = NodeId>,
    ) -> Result<bool, KvError> {
        Ok(self.raft.bootstrap(Membership::new(voters)).await?)
    }

    /// Add a voter to the cluster. Must run on the leader.
    pub async fn add_voter(&self, node: NodeId) -> Result<(), KvError> {
        let timeout = self.raft.config().commit_timeout;
        Ok(self.raft.add_voter(node, timeout).await?)
    }

    /// Set `key` to `value` and wait for it to apply.
    pub async fn write(&self, key: &str, value: &str) -> Result<WriteAck, KvError> {
        let timeout = self.raft.config().commit_timeout;
        self.write_with_timeout(key, value, timeout).await
    }

    /// [`KvNode::write`] with a caller-chosen deadline.
    ///
    /// On `Timeout` the write may or may not have happened.
    pub async fn write_with_timeout(
        &self,
        key: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<WriteAck, KvError> {
        let command = Command::set(key, value).serialize()?;
        let applied = self.raft.propose_and_wait(command, timeout).await?;
        let previous = decode_previous(&applied.response)?;
        tracing::trace!(key, index = %applied.index, "Write applied");
        Ok(WriteAck {
            index: applied.index,
            term: applied.term,
            previous,
        })
    }

    /// Read `key` from the local state machine.
    pub fn read(&self, key: &str) -> Result<Option<String>, KvError> {
        if let Some(reason) = self.raft.status().failed {
            return Err(KvError::Unavailable { reason });
        }
        Ok(self.reader.get(key))
    }

    /// Snapshot the state machine now.
    pub async fn snapshot(&self) -> Result<SnapshotMetadata, KvError> {
        Ok(self.raft.snapshot_now().await?)
    }

    pub fn node_id(&self) -> &NodeId {
        self.raft.node_id()
    }

    pub fn status(&self) -> RaftStatus {
        self.raft.status()
    }

    pub fn is_leader(&self) -> bool {
        self.status().role == Role::Leader
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.status().leader
    }

    /// The underlying consensus module.
    pub fn raft(&self) -> &Raft {
        &self.raft
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn fast_config() -> RaftConfig {
        let mut config = RaftConfig::default();
        config.heartbeat_interval = Duration::from_millis(20);
        config.election_timeout_min = Duration::from_millis(60);
        config.election_timeout_max = Duration::from_millis(120);
        config.rpc_timeout = Duration::from_millis(20);
        config.commit_timeout = Duration::from_secs(2);
        config
    }

    async fn open(temp: &TempDir) -> KvNode {
        let id = NodeId::new("n1");
        let (_rpc_tx, rpc_rx) = mpsc::channel(16);
        let transport = Arc::new(InMemoryTransport::new(id.clone(), HashMap::new()));
        let options = NodeOptions::new(id, temp.path()).with_raft_config(fast_config());
        KvNode::open(options, transport, rpc_rx).await.unwrap()
    }

    async fn wait_leader(node: &KvNode) {
        for _ in 0..100 {
            if node.is_leader() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node never became leader");
    }

    #[tokio::test]
    async fn test_write_returns_previous_value() {
        let temp = TempDir::new().unwrap();
        let node = open(&temp).await;
        assert!(node.bootstrap().await.unwrap());
        node.start().unwrap();
        wait_leader(&node).await;

        let ack = node.write("user_id", "12345").await.unwrap();
        assert_eq!(ack.previous, None);
        let ack2 = node.write("user_id", "67890").await.unwrap();
        assert_eq!(ack2.previous, Some("12345".to_string()));
        assert!(ack2.index > ack.index);
        assert_eq!(node.read("user_id").unwrap(), Some("67890".to_string()));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_values_with_spaces() {
        let temp = TempDir::new().unwrap();
        let node = open(&temp).await;
        node.bootstrap().await.unwrap();
        node.start().unwrap();
        wait_leader(&node).await;

        node.write("greeting", "hello big world\nsecond line").await.unwrap();
        node.write("key with spaces", "").await.unwrap();
        assert_eq!(
            node.read("greeting").unwrap(),
            Some("hello big world\nsecond line".to_string())
        );
        assert_eq!(node.read("key with spaces").unwrap(), Some(String::new()));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_without_cluster_is_not_leader() {
        let temp = TempDir::new().unwrap();
        let node = open(&temp).await;
        node.start().unwrap();

        let err = node.write("k", "v").await.unwrap_err();
        assert_eq!(err, KvError::NotLeader { leader: None });
        assert_eq!(node.read("k").unwrap(), None);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_empty_voters() {
        let temp = TempDir::new().unwrap();
        let node = open(&temp).await;
        let err = node.bootstrap_with(Vec::new()).await.unwrap_err();
        assert!(matches!(err, KvError::Unavailable { .. }));
    }
}
