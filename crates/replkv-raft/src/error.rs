//! Raft error types.

use thiserror::Error;

use crate::types::{LogIndex, NodeId, Term};

/// Raft errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader (cannot handle write/propose).
    #[error("Not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// Commit timeout. The entry may still commit later.
    #[error("Commit timeout after {elapsed_ms}ms")]
    CommitTimeout { elapsed_ms: u64 },

    /// Request from an outdated term. Handled locally, never surfaced to clients.
    #[error("Stale term (current: {current}, request: {request})")]
    StaleTerm { current: Term, request: Term },

    /// Follower log doesn't match leader's prev_log. Handled by backing off.
    #[error("Log inconsistency at index {index} (expected term {expected_term}, got {actual_term:?})")]
    LogInconsistency {
        index: LogIndex,
        expected_term: Term,
        actual_term: Option<Term>,
    },

    /// A durable write failed. The node stops voting and leading.
    #[error("Storage failure: {reason}")]
    StorageFailure { reason: String },

    /// Snapshot failed checksum or decode.
    #[error("Snapshot corrupt: {reason}")]
    SnapshotCorrupt { reason: String },

    /// A membership change is already in flight.
    #[error("Membership change already in progress at index {index}")]
    ConfigChangeInProgress { index: LogIndex },

    /// Configuration error (invalid Raft config).
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    /// The node is shutting down.
    #[error("Raft is shut down")]
    Shutdown,

    /// I/O error (snapshot files, transport, etc.).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },

    /// WAL error.
    #[error("Storage error: {source}")]
    Storage {
        #[from]
        source: replkv_wal::SegmentError,
    },

    /// Internal error (bug).
    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

/// Raft result type.
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors returned to key/value clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    /// Retry against `leader` if known.
    #[error("not the leader (leader hint: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// The write was not confirmed in time. Its outcome is unknown.
    #[error("timed out waiting for commit; outcome unknown")]
    Timeout,

    /// The node cannot serve the request.
    #[error("unavailable: {reason}")]
    Unavailable { reason: String },
}

impl From<RaftError> for KvError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader { leader } => KvError::NotLeader { leader },
            RaftError::CommitTimeout { .. } => KvError::Timeout,
            other => KvError::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}
