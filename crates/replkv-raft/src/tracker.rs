//! Waiting proposals, keyed by log index.
//!
//! A proposer registers `(index, term)` after its entry is durable on the
//! leader. The apply loop resolves the registration when the index is
//! applied: with the state machine result if the applied entry carries the
//! same term, otherwise with `NotLeader` (the entry was overwritten by a
//! later leader). A step-down fails every registration above the commit
//! index, since those entries may never commit.

use crate::error::{RaftError, Result};
use crate::types::{LogIndex, NodeId, Term};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

struct Pending {
    term: Term,
    tx: oneshot::Sender<Result<Bytes>>,
}

#[derive(Default)]
pub struct ProposalTracker {
    pending: Mutex<BTreeMap<LogIndex, Pending>>,
}

impl ProposalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, index: LogIndex, term: Term) -> oneshot::Receiver<Result<Bytes>> {
        let (tx, rx) = oneshot::channel();
        if let Some(old) = self.pending.lock().insert(index, Pending { term, tx }) {
            let _ = old.tx.send(Err(RaftError::NotLeader { leader: None }));
        }
        rx
    }

    /// Answer the proposer of `index`, if any, now that it has been applied.
    pub fn resolve(&self, index: LogIndex, applied_term: Term, result: Result<Bytes>) {
        let Some(pending) = self.pending.lock().remove(&index) else {
            return;
        };
        let answer = if pending.term == applied_term {
            result
        } else {
            Err(RaftError::NotLeader { leader: None })
        };
        // The proposer may have given up already.
        let _ = pending.tx.send(answer);
    }

    /// Fail every proposal above `commit` with `NotLeader`.
    pub fn fail_after(&self, commit: LogIndex, leader: Option<NodeId>) {
        let failed = self.pending.lock().split_off(&commit.next());
        if !failed.is_empty() {
            tracing::debug!(count = failed.len(), "Failing uncommitted proposals");
        }
        for (_, pending) in failed {
            let _ = pending.tx.send(Err(RaftError::NotLeader {
                leader: leader.clone(),
            }));
        }
    }

    /// Fail every registration with `Shutdown`.
    pub fn shutdown(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (_, pending) in pending {
            let _ = pending.tx.send(Err(RaftError::Shutdown));
        }
    }

    /// Drop a registration whose proposer stopped waiting.
    pub fn forget(&self, index: LogIndex) {
        self.pending.lock().remove(&index);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_matching_term() {
        let tracker = ProposalTracker::new();
        let rx = tracker.register(LogIndex(3), Term(2));
        tracker.resolve(LogIndex(3), Term(2), Ok(Bytes::from("prev")));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from("prev"));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_overwritten_entry_reports_not_leader() {
        let tracker = ProposalTracker::new();
        let rx = tracker.register(LogIndex(3), Term(2));
        tracker.resolve(LogIndex(3), Term(3), Ok(Bytes::new()));
        assert!(matches!(rx.await.unwrap(), Err(RaftError::NotLeader { .. })));
    }

    #[tokio::test]
    async fn test_fail_after_keeps_committed() {
        let tracker = ProposalTracker::new();
        let committed = tracker.register(LogIndex(4), Term(1));
        let uncommitted = tracker.register(LogIndex(5), Term(1));

        tracker.fail_after(LogIndex(4), Some(NodeId::new("n2")));
        assert_eq!(tracker.len(), 1);

        match uncommitted.await.unwrap() {
            Err(RaftError::NotLeader { leader }) => assert_eq!(leader, Some(NodeId::new("n2"))),
            other => panic!("unexpected: {:?}", other),
        }

        tracker.resolve(LogIndex(4), Term(1), Ok(Bytes::new()));
        assert!(committed.await.unwrap().is_ok());
    }

    #[test]
    fn test_resolve_after_receiver_dropped() {
        let tracker = ProposalTracker::new();
        drop(tracker.register(LogIndex(1), Term(1)));
        tracker.resolve(LogIndex(1), Term(1), Ok(Bytes::new()));
        assert!(tracker.is_empty());
    }
}
