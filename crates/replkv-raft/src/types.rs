//! Core Raft types: Term, Index, Log Entries, Membership, RPC messages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Raft term number (monotonically increasing).
///
/// Terms establish logical clocks in Raft. Each term has at most one leader.
/// When a server starts an election, it increments its term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log index (1-indexed, 0 is sentinel for "no entry").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Node identifier (unique across cluster).
///
/// NodeId is a string so it can carry DNS names, UUIDs or `host:port` pairs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The set of voting members.
///
/// Changes travel through the log one server at a time; a node uses the
/// latest membership present in its log, committed or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    voters: BTreeSet<NodeId>,
}

impl Membership {
    pub fn new(voters: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            voters: voters.into_iter().collect(),
        }
    }

    pub fn single(node: NodeId) -> Self {
        Self::new([node])
    }

    pub fn voters(&self) -> impl Iterator<Item = &NodeId> {
        self.voters.iter()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.voters.contains(node)
    }

    pub fn len(&self) -> usize {
        self.voters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    /// Votes (or acks) needed for a majority.
    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// True if the voters among `nodes` form a majority.
    pub fn has_quorum<'a>(&self, nodes: impl IntoIterator<Item = &'a NodeId>) -> bool {
        let count = nodes
            .into_iter()
            .filter(|n| self.voters.contains(*n))
            .collect::<BTreeSet<_>>()
            .len();
        !self.voters.is_empty() && count >= self.quorum()
    }

    /// A copy of this membership with `node` added.
    pub fn with_voter(&self, node: NodeId) -> Self {
        let mut next = self.clone();
        next.voters.insert(node);
        next
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, v) in self.voters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "}}")
    }
}

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by a new leader so earlier-term entries can commit.
    Noop,
    /// Opaque state machine command.
    Command(Bytes),
    /// New voter set.
    Membership(Membership),
}

/// Log entry (payload + metadata).
///
/// - `term`: Term when entry was created (for conflict detection)
/// - `index`: Position in log (for addressing)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, payload: EntryPayload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }

    pub fn command(term: Term, index: LogIndex, command: impl Into<Bytes>) -> Self {
        Self::new(term, index, EntryPayload::Command(command.into()))
    }
}

/// RequestVote RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting vote
    pub candidate_id: NodeId,

    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for candidate to update itself
    pub term: Term,

    /// True if candidate received vote
    pub vote_granted: bool,
}

/// AppendEntries RPC request.
///
/// Empty entries list = heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's ID (so follower can redirect clients)
    pub leader_id: NodeId,

    /// Index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,

    /// Term of prev_log_index entry
    pub prev_log_term: Term,

    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for leader to update itself
    pub term: Term,

    /// True if follower contained entry matching prev_log_index/term
    pub success: bool,

    /// On success, the last index known to match the leader's log
    pub match_index: LogIndex,

    /// On failure, where the leader should retry from
    pub conflict_index: Option<LogIndex>,
}

/// InstallSnapshot RPC request.
///
/// Sent by the leader when a follower needs entries that were compacted away.
/// The snapshot travels in one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's ID
    pub leader_id: NodeId,

    /// Snapshot position and membership
    pub metadata: SnapshotMetadata,

    /// Serialized state machine
    pub data: Bytes,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Current term, for leader to update itself
    pub term: Term,

    /// Follower's last log index after handling the request
    pub last_log_index: LogIndex,
}

/// Node role in the Raft cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// Snapshot metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Last log index covered by the snapshot
    pub last_included_index: LogIndex,

    /// Term of last_included_index
    pub last_included_term: Term,

    /// Membership as of last_included_index
    pub membership: Membership,
}

/// Durable vote state (`currentTerm`, `votedFor`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_and_index_ordering() {
        assert!(Term(2) > Term(1));
        assert_eq!(Term(1).next(), Term(2));
        assert_eq!(LogIndex(5).prev(), Some(LogIndex(4)));
        assert_eq!(LogIndex::ZERO.prev(), None);
        assert_eq!(format!("{} {}", Term(3), LogIndex(9)), "T3 I9");
    }

    #[test]
    fn test_defaults_are_zero() {
        assert_eq!(Term::default(), Term::ZERO);
        assert_eq!(LogIndex::default(), LogIndex::ZERO);
        let hs = HardState::default();
        assert_eq!(hs.current_term, Term::ZERO);
        assert_eq!(hs.voted_for, None);
    }

    #[test]
    fn test_membership_quorum() {
        let m = Membership::new(["n1", "n2", "n3"].map(NodeId::new));
        assert_eq!(m.quorum(), 2);
        assert!(m.has_quorum(&[NodeId::new("n1"), NodeId::new("n3")]));
        assert!(!m.has_quorum(&[NodeId::new("n1")]));
        // Non-members and duplicates do not count.
        assert!(!m.has_quorum(&[NodeId::new("n1"), NodeId::new("n1"), NodeId::new("x")]));

        let single = Membership::single(NodeId::new("n1"));
        assert_eq!(single.quorum(), 1);
        assert!(single.has_quorum(&[NodeId::new("n1")]));

        assert!(!Membership::default().has_quorum(std::iter::empty()));
    }

    #[test]
    fn test_membership_with_voter() {
        let m = Membership::single(NodeId::new("n1")).with_voter(NodeId::new("n2"));
        assert_eq!(m.len(), 2);
        assert!(m.contains(&NodeId::new("n2")));
        assert_eq!(m.to_string(), "{n1, n2}");
        assert_eq!(m.quorum(), 2);
    }
}
