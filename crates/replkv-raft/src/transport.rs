//! Transport abstraction for Raft RPC communication.
//!
//! The consensus module only needs three request/response calls to a named
//! peer. How they travel (gRPC, TCP, channels) is up to the implementation.
//! Callers wrap every call in `rpc_timeout`, so a transport may simply hang
//! on a dead peer.

use crate::error::{RaftError, Result};
use crate::types::*;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Transport abstraction for Raft RPC communication.
///
/// The protocol tolerates lost, duplicated and reordered messages, so an
/// implementation may retry freely. Errors are ordinary results: the caller
/// treats them as "no response".
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Send RequestVote RPC to a peer.
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Send AppendEntries RPC to a peer (heartbeat when `entries` is empty).
    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Send InstallSnapshot RPC to a peer. The whole snapshot goes in one call.
    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// RPC message envelope (tagged union of all RPC types)
#[derive(Debug)]
pub enum RpcMessage {
    RequestVote {
        request: RequestVoteRequest,
        response_tx: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        response_tx: oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response_tx: oneshot::Sender<InstallSnapshotResponse>,
    },
}

pub type RpcSender = mpsc::Sender<RpcMessage>;
pub type RpcReceiver = mpsc::Receiver<RpcMessage>;

/// In-memory transport (local channels, no network).
///
/// Each node owns an [`RpcReceiver`]; peers hold the matching sender.
/// Removing a peer makes every call to it fail, which is how tests cut
/// links to simulate partitions.
///
/// ```ignore
/// let (tx1, rx1) = tokio::sync::mpsc::channel(256);
/// let t2 = InMemoryTransport::new(NodeId::new("n2"), HashMap::new());
/// t2.add_peer(NodeId::new("n1"), tx1);
/// ```
pub struct InMemoryTransport {
    local_id: NodeId,
    peers: Arc<RwLock<HashMap<NodeId, RpcSender>>>,
}

impl InMemoryTransport {
    pub fn new(local_id: NodeId, peers: HashMap<NodeId, RpcSender>) -> Self {
        Self {
            local_id,
            peers: Arc::new(RwLock::new(peers)),
        }
    }

    /// Add (or reconnect) a peer.
    pub fn add_peer(&self, peer_id: NodeId, sender: RpcSender) {
        self.peers.write().insert(peer_id, sender);
    }

    /// Cut the link to a peer.
    pub fn remove_peer(&self, peer_id: &NodeId) {
        self.peers.write().remove(peer_id);
    }

    fn get_peer(&self, peer_id: &NodeId) -> Result<RpcSender> {
        self.peers.read().get(peer_id).cloned().ok_or_else(|| RaftError::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("peer not reachable from {}: {}", self.local_id, peer_id),
            ),
        })
    }

    async fn call<Resp>(
        &self,
        target: &NodeId,
        envelope: impl FnOnce(oneshot::Sender<Resp>) -> RpcMessage,
    ) -> Result<Resp> {
        let peer = self.get_peer(target)?;
        let (response_tx, response_rx) = oneshot::channel();
        peer.send(envelope(response_tx))
            .await
            .map_err(|e| broken_pipe(e.to_string()))?;
        response_rx.await.map_err(|e| broken_pipe(e.to_string()))
    }
}

fn broken_pipe(reason: String) -> RaftError {
    RaftError::Io {
        source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, reason),
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.call(target, |response_tx| RpcMessage::RequestVote {
            request,
            response_tx,
        })
        .await
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.call(target, |response_tx| RpcMessage::AppendEntries {
            request,
            response_tx,
        })
        .await
    }

    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.call(target, |response_tx| RpcMessage::InstallSnapshot {
            request,
            response_tx,
        })
        .await
    }
}
