//! replkv-raft: Raft consensus for a replicated key/value store.
//!
//! - Leader election with randomized timeouts
//! - Log replication with conflict-term backtracking
//! - Durable log and hard state on top of `replkv-wal`
//! - Snapshots with CRC-checked files, log compaction, InstallSnapshot
//! - Single-server membership changes through the log
//! - A key/value state machine and the [`KvNode`] that serves it
//! - VizEvent observability integration
//!
//! Based on the Raft paper (Ongaro & Ousterhout, 2014).

pub mod apply;
pub mod config;
pub mod election;
pub mod error;
pub mod fsm;
pub mod log;
pub mod node;
pub mod raft;
pub mod replication;
pub mod rpc_handler;
pub mod snapshot;
pub mod state;
pub mod timer;
pub mod tracker;
pub mod transport;
pub mod types;

pub use config::RaftConfig;
pub use error::{KvError, RaftError, Result};
pub use fsm::{Command, KvReader, KvStateMachine, StateMachine};
pub use node::{KvNode, NodeOptions, WriteAck};
pub use raft::{Applied, Raft};
pub use state::RaftStatus;
pub use transport::{InMemoryTransport, RaftTransport, RpcMessage, RpcReceiver, RpcSender};
pub use types::*;

/// High-level interface to the consensus module, implemented by [`Raft`].
#[async_trait::async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Propose a new command to be replicated.
    ///
    /// Returns the log index where the command was stored, or `NotLeader`.
    async fn propose(&self, cmd: bytes::Bytes) -> Result<LogIndex>;

    /// Check if this node is the leader.
    fn is_leader(&self) -> bool;

    /// Get the current leader (if known).
    fn leader(&self) -> Option<NodeId>;

    /// Watch the index of the last entry applied to the state machine.
    fn subscribe_applied(&self) -> tokio::sync::watch::Receiver<LogIndex>;
}
