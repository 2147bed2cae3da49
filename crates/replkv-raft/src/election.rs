//! Leader election logic for Raft.
//!
//! - Followers become candidates when the election timeout fires
//! - Candidates request votes from every voter in the current membership
//! - A majority of that membership makes the candidate leader
//! - Split votes time out and retry in a new term

use crate::error::Result;
use crate::state::RaftState;
use crate::transport::RaftTransport;
use crate::types::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

/// Election result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// Won election (became leader)
    Won { term: Term, votes_received: usize },

    /// Lost election (discovered higher term)
    Lost { current_term: Term },

    /// Not enough votes; retry on the next timeout
    Timeout,

    /// This node may not campaign (leader already, failed, or not a voter)
    Skipped,
}

/// Run one election round as a candidate.
///
/// 1. Increment current term and vote for self (durably)
/// 2. Send RequestVote RPCs to all other voters in parallel
/// 3. Count grants against the membership quorum
pub async fn run_election(
    state: Arc<RaftState>,
    transport: Arc<dyn RaftTransport>,
) -> Result<ElectionOutcome> {
    let Some((term, last_log_index, last_log_term)) = state.start_election().await? else {
        return Ok(ElectionOutcome::Skipped);
    };

    let membership = state.log_ref().membership();
    let node_id = state.node_id().clone();
    let rpc_timeout = state.config().rpc_timeout;

    let mut votes = BTreeSet::new();
    votes.insert(node_id.clone());

    let vote_futures = membership
        .voters()
        .filter(|peer| *peer != &node_id)
        .map(|peer| {
            let transport = transport.clone();
            let peer = peer.clone();
            let request = RequestVoteRequest {
                term,
                candidate_id: node_id.clone(),
                last_log_index,
                last_log_term,
            };
            async move {
                let result = timeout(rpc_timeout, transport.request_vote(&peer, request)).await;
                (peer, result)
            }
        });
    let results = futures::future::join_all(vote_futures).await;

    for (peer, result) in results {
        match result {
            Ok(Ok(response)) => {
                if response.term > term {
                    state.observe_term(response.term).await?;
                    return Ok(ElectionOutcome::Lost {
                        current_term: response.term,
                    });
                }
                if response.vote_granted && response.term == term {
                    votes.insert(peer);
                }
            }
            Ok(Err(e)) => {
                tracing::trace!(peer = %peer, error = %e, "RequestVote failed");
            }
            Err(_) => {
                tracing::trace!(peer = %peer, "RequestVote timed out");
            }
        }
    }

    if state.current_term() != term {
        return Ok(ElectionOutcome::Lost {
            current_term: state.current_term(),
        });
    }

    if membership.has_quorum(votes.iter()) {
        Ok(ElectionOutcome::Won {
            term,
            votes_received: votes.len(),
        })
    } else {
        Ok(ElectionOutcome::Timeout)
    }
}

/// Election loop (runs in the background on every node).
///
/// Waits for the election timer, runs an election, and promotes the node to
/// leader when it wins.
pub async fn election_loop(
    state: Arc<RaftState>,
    transport: Arc<dyn RaftTransport>,
    mut timeout_rx: mpsc::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            Some(_) = timeout_rx.recv() => {
                if state.role() == Role::Leader {
                    continue;
                }

                match run_election(state.clone(), transport.clone()).await {
                    Ok(ElectionOutcome::Won { term, votes_received }) => {
                        if let Err(e) = state.become_leader(term, votes_received).await {
                            tracing::error!(error = %e, "Failed to become leader");
                        }
                    }
                    Ok(ElectionOutcome::Lost { current_term }) => {
                        tracing::debug!(term = %current_term, "Lost election (discovered higher term)");
                    }
                    Ok(ElectionOutcome::Timeout) => {
                        tracing::debug!(node = %state.node_id(), "Election timed out (split vote), will retry");
                    }
                    Ok(ElectionOutcome::Skipped) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "Election error");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!(node = %state.node_id(), "Election loop shutting down");
                break;
            }
        }
    }
}

/// Check if candidate's log is at least as up-to-date as ours.
///
/// Logs are compared by the term of their last entry, then by length.
pub fn is_log_up_to_date(
    candidate_last_term: Term,
    candidate_last_index: LogIndex,
    our_last_term: Term,
    our_last_index: LogIndex,
) -> bool {
    candidate_last_term > our_last_term
        || (candidate_last_term == our_last_term && candidate_last_index >= our_last_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_log_up_to_date_term_comparison() {
        // Candidate with higher term is more up-to-date
        assert!(is_log_up_to_date(Term(5), LogIndex(10), Term(4), LogIndex(100)));

        // Our log with higher term is more up-to-date
        assert!(!is_log_up_to_date(Term(4), LogIndex(100), Term(5), LogIndex(10)));
    }

    #[test]
    fn test_is_log_up_to_date_index_comparison() {
        assert!(is_log_up_to_date(Term(5), LogIndex(100), Term(5), LogIndex(50)));
        assert!(!is_log_up_to_date(Term(5), LogIndex(50), Term(5), LogIndex(100)));
        assert!(is_log_up_to_date(Term(5), LogIndex(50), Term(5), LogIndex(50)));
    }

    #[test]
    fn test_empty_logs_are_equal() {
        assert!(is_log_up_to_date(Term::ZERO, LogIndex::ZERO, Term::ZERO, LogIndex::ZERO));
        assert!(!is_log_up_to_date(Term::ZERO, LogIndex::ZERO, Term(1), LogIndex(1)));
    }
}
