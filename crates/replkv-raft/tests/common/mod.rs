//! Cluster harness for integration tests.
//!
//! Every node gets its own directory under one `TempDir`, so a stopped node
//! can be reopened on the same data. Links are `InMemoryTransport` peers;
//! cutting a link removes the peer on both sides.

#![allow(dead_code)]

use replkv_raft::{InMemoryTransport, KvError, KvNode, NodeId, NodeOptions, RaftConfig, Role, RpcSender, WriteAck};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Timeouts short enough for tests, still with heartbeat < election.
pub fn fast_config() -> RaftConfig {
    let mut config = RaftConfig::default();
    config.heartbeat_interval = Duration::from_millis(20);
    config.election_timeout_min = Duration::from_millis(120);
    config.election_timeout_max = Duration::from_millis(240);
    config.rpc_timeout = Duration::from_millis(40);
    config.commit_timeout = Duration::from_secs(3);
    config
}

pub fn node_ids(n: usize) -> Vec<NodeId> {
    (1..=n).map(|i| NodeId::new(format!("n{}", i))).collect()
}

pub struct Cluster {
    dir: TempDir,
    config: RaftConfig,
    pub ids: Vec<NodeId>,
    nodes: HashMap<NodeId, KvNode>,
    transports: HashMap<NodeId, Arc<InMemoryTransport>>,
    senders: HashMap<NodeId, RpcSender>,
    cut: HashSet<(NodeId, NodeId)>,
}

impl Cluster {
    pub fn new(ids: Vec<NodeId>, config: RaftConfig) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            config,
            ids,
            nodes: HashMap::new(),
            transports: HashMap::new(),
            senders: HashMap::new(),
            cut: HashSet::new(),
        }
    }

    /// `n` nodes bootstrapped with the same voter set, all running.
    pub async fn bootstrapped(n: usize, config: RaftConfig) -> Self {
        let ids = node_ids(n);
        let mut cluster = Self::new(ids.clone(), config);
        for id in &ids {
            cluster.open_node(id).await;
            assert!(cluster.node(id).bootstrap_with(ids.clone()).await.unwrap());
        }
        for id in &ids {
            cluster.node(id).start().unwrap();
        }
        cluster
    }

    /// Open `id` on its data directory and link it to every live node.
    /// The node is not started.
    pub async fn open_node(&mut self, id: &NodeId) {
        let (tx, rx) = mpsc::channel(256);
        let transport = Arc::new(InMemoryTransport::new(id.clone(), HashMap::new()));
        for (peer, peer_tx) in &self.senders {
            if self.linked(id, peer) {
                transport.add_peer(peer.clone(), peer_tx.clone());
                self.transports[peer].add_peer(id.clone(), tx.clone());
            }
        }

        let options = NodeOptions::new(id.clone(), self.dir.path().join(id.as_str()))
            .with_raft_config(self.config.clone());
        let node = KvNode::open(options, transport.clone(), rx).await.unwrap();

        self.senders.insert(id.clone(), tx);
        self.transports.insert(id.clone(), transport);
        self.nodes.insert(id.clone(), node);
    }

    pub async fn restart_node(&mut self, id: &NodeId) {
        self.open_node(id).await;
        self.node(id).start().unwrap();
    }

    /// Shut `id` down and unlink it. Its data stays on disk.
    pub async fn stop_node(&mut self, id: &NodeId) {
        if let Some(node) = self.nodes.remove(id) {
            node.shutdown().await;
        }
        self.senders.remove(id);
        self.transports.remove(id);
        for transport in self.transports.values() {
            transport.remove_peer(id);
        }
    }

    pub async fn shutdown(mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        for id in ids {
            self.stop_node(&id).await;
        }
    }

    pub fn node(&self, id: &NodeId) -> &KvNode {
        &self.nodes[id]
    }

    pub fn live(&self) -> Vec<NodeId> {
        self.ids
            .iter()
            .filter(|id| self.nodes.contains_key(*id))
            .cloned()
            .collect()
    }

    fn linked(&self, a: &NodeId, b: &NodeId) -> bool {
        !self.cut.contains(&(a.clone(), b.clone()))
    }

    /// Cut every link between `id` and the rest.
    pub fn isolate(&mut self, id: &NodeId) {
        for other in self.ids.clone() {
            if &other == id {
                continue;
            }
            self.cut.insert((id.clone(), other.clone()));
            self.cut.insert((other.clone(), id.clone()));
            if let Some(t) = self.transports.get(id) {
                t.remove_peer(&other);
            }
            if let Some(t) = self.transports.get(&other) {
                t.remove_peer(id);
            }
        }
    }

    /// Restore every link of `id`.
    pub fn heal(&mut self, id: &NodeId) {
        self.cut.retain(|(a, b)| a != id && b != id);
        for other in self.live() {
            if &other == id {
                continue;
            }
            if let (Some(t), Some(tx)) = (self.transports.get(id), self.senders.get(&other)) {
                t.add_peer(other.clone(), tx.clone());
            }
            if let (Some(t), Some(tx)) = (self.transports.get(&other), self.senders.get(id)) {
                t.add_peer(id.clone(), tx.clone());
            }
        }
    }

    /// Wait until one of `among` leads and a majority of `among` agrees.
    pub async fn wait_for_leader(&self, among: &[NodeId], timeout: Duration) -> NodeId {
        let deadline = Instant::now() + timeout;
        loop {
            for candidate in among {
                let Some(node) = self.nodes.get(candidate) else { continue };
                let status = node.status();
                if status.role != Role::Leader {
                    continue;
                }
                let agree = among
                    .iter()
                    .filter_map(|id| self.nodes.get(id))
                    .filter(|n| n.leader().as_ref() == Some(candidate))
                    .count();
                if agree > among.len() / 2 {
                    return candidate.clone();
                }
            }
            assert!(Instant::now() < deadline, "no leader among {:?}", among);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Write through whichever of `among` currently leads, retrying across
    /// elections.
    pub async fn write_via(&self, among: &[NodeId], key: &str, value: &str) -> WriteAck {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let leader = self.wait_for_leader(among, Duration::from_secs(5)).await;
            match self.node(&leader).write(key, value).await {
                Ok(ack) => return ack,
                Err(KvError::NotLeader { .. }) | Err(KvError::Timeout) => {}
                Err(e) => panic!("write failed: {}", e),
            }
            assert!(Instant::now() < deadline, "write of {} never succeeded", key);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn write(&self, key: &str, value: &str) -> WriteAck {
        let live = self.live();
        self.write_via(&live, key, value).await
    }

    /// Poll `id` until `key` reads as `value`.
    pub async fn wait_for_value(&self, id: &NodeId, key: &str, value: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.node(id).read(key).unwrap().as_deref() == Some(value) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}
