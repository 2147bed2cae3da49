//! Replicated state machine contract and the key/value implementation.
//!
//! The apply loop is the only writer. Commands arrive in log order, exactly
//! once per node, and only after they are committed.

use crate::error::{RaftError, Result};
use crate::types::LogIndex;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// State machine driven by the Raft log.
///
/// `apply` must be deterministic: every node applies the same commands in
/// the same order and has to end up in the same state.
pub trait StateMachine: Send + 'static {
    /// Apply a committed command. The returned bytes go back to the proposer.
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<Bytes>;

    /// Serialize the full state.
    fn snapshot(&self) -> Result<Bytes>;

    /// Replace the full state with a snapshot.
    fn restore(&mut self, snapshot: &[u8]) -> Result<()>;
}

/// Command replicated through the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Set `key` to `value`, replacing any previous value.
    Set { key: String, value: String },
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Serialize command to bytes using bincode.
    pub fn serialize(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Deserialize command from bytes using bincode.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

type KvMap = BTreeMap<String, String>;

/// Ordered in-memory key/value map.
///
/// The map is shared with [`KvReader`] handles so reads never go through
/// the apply loop.
#[derive(Default)]
pub struct KvStateMachine {
    data: Arc<RwLock<KvMap>>,
    last_applied: LogIndex,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only handle on the same map.
    pub fn reader(&self) -> KvReader {
        KvReader {
            data: self.data.clone(),
        }
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<Bytes> {
        let cmd = Command::deserialize(command)?;
        self.last_applied = index;

        let previous = match cmd {
            Command::Set { key, value } => self.data.write().insert(key, value),
        };
        Ok(Bytes::from(bincode::serialize(&previous)?))
    }

    fn snapshot(&self) -> Result<Bytes> {
        let data = self.data.read().clone();
        Ok(Bytes::from(bincode::serialize(&data)?))
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        let restored: KvMap = if snapshot.is_empty() {
            KvMap::new()
        } else {
            bincode::deserialize(snapshot).map_err(|e| RaftError::SnapshotCorrupt {
                reason: format!("kv state: {}", e),
            })?
        };
        tracing::debug!(keys = restored.len(), "Restored key/value state");
        *self.data.write() = restored;
        Ok(())
    }
}

/// Decode the previous value returned by [`KvStateMachine::apply`].
pub fn decode_previous(result: &[u8]) -> Result<Option<String>> {
    Ok(bincode::deserialize(result)?)
}

/// Read-only view of a [`KvStateMachine`].
#[derive(Clone)]
pub struct KvReader {
    data: Arc<RwLock<KvMap>>,
}

impl KvReader {
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}
