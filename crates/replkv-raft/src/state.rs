//! Raft state machine (Follower, Candidate, Leader roles and transitions).
//!
//! The state machine handles:
//! - Role transitions (Follower → Candidate → Leader → Follower)
//! - RPC handling (RequestVote, AppendEntries, InstallSnapshot)
//! - Leader progress tracking and commitment
//!
//! # Locking
//!
//! Everything that decides safety (`current_term`, `voted_for`, role, commit
//! index, leader progress, the failed flag) lives in one [`Core`] behind a
//! `tokio::sync::Mutex`. The lock is held across local fsyncs, because the
//! write must land before the vote or ack it backs is visible, and is never
//! held across a transport call. A copy of the interesting fields is
//! republished into a `parking_lot::RwLock` after every mutation so status
//! queries never wait on the consensus lock.
//!
//! # Persistent State (survives crashes)
//!
//! - `current_term`, `voted_for`: [`HardState`] records in the Raft log WAL
//! - `log`: entries in the same WAL
//!
//! # Volatile State
//!
//! - `commit_index`: published on a watch channel for the apply loop
//! - `next_index[]`, `match_index[]`, last ack time: leader only

use crate::apply::ApplyMsg;
use crate::config::RaftConfig;
use crate::election::is_log_up_to_date;
use crate::error::{RaftError, Result};
use crate::log::RaftLog;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::tracker::ProposalTracker;
use crate::types::*;
use bytes::Bytes;
use parking_lot::RwLock;
use replkv_observe::{Meter, RaftEvt, RaftKind, VizEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};

/// Point-in-time view of a node.
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub snapshot_index: LogIndex,
    pub membership: Membership,
    /// Set once a durable write failed; the node no longer takes part.
    pub failed: Option<String>,
}

struct Core {
    current_term: Term,
    voted_for: Option<NodeId>,
    role: Role,
    leader_id: Option<NodeId>,
    commit_index: LogIndex,
    leader: Option<LeaderState>,
    failed: Option<String>,
}

/// Leader-specific volatile state.
struct LeaderState {
    /// For each peer, index of next log entry to send
    next_index: HashMap<NodeId, LogIndex>,

    /// For each peer, index of highest log entry known to be replicated
    match_index: HashMap<NodeId, LogIndex>,

    /// For each peer, when it last answered in this term
    last_ack: HashMap<NodeId, Instant>,
}

impl LeaderState {
    fn track(&mut self, peer: &NodeId, next: LogIndex) {
        self.next_index.entry(peer.clone()).or_insert(next);
        self.match_index.entry(peer.clone()).or_insert(LogIndex::ZERO);
        self.last_ack.entry(peer.clone()).or_insert_with(Instant::now);
    }
}

/// What the leader should send a follower next.
pub enum ReplicationPlan {
    Append(AppendEntriesRequest),
    /// The entries the follower needs are compacted away.
    Snapshot { term: Term },
}

fn reject_append(term: Term, conflict_index: Option<LogIndex>) -> AppendEntriesResponse {
    AppendEntriesResponse {
        term,
        success: false,
        match_index: LogIndex::ZERO,
        conflict_index,
    }
}

/// Raft node state machine.
pub struct RaftState {
    node_id: NodeId,
    config: RaftConfig,
    core: Mutex<Core>,
    log: RaftLog,
    snapshots: Arc<SnapshotStore>,
    status: RwLock<RaftStatus>,
    commit_tx: watch::Sender<LogIndex>,
    applied_tx: watch::Sender<LogIndex>,
    tracker: ProposalTracker,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    replicate: Notify,
    meter: Arc<dyn Meter>,
}

impl RaftState {
    /// Build the state from a recovered log.
    ///
    /// `applied` is how far the state machine already is (snapshot plus
    /// replayed entries); it is also the initial commit index.
    pub fn new(
        node_id: NodeId,
        config: RaftConfig,
        log: RaftLog,
        snapshots: Arc<SnapshotStore>,
        applied: LogIndex,
        apply_tx: mpsc::UnboundedSender<ApplyMsg>,
        meter: Arc<dyn Meter>,
    ) -> Self {
        let hs = log.hard_state();
        let core = Core {
            current_term: hs.current_term,
            voted_for: hs.voted_for,
            role: Role::Follower,
            leader_id: None,
            commit_index: applied,
            leader: None,
            failed: None,
        };
        let status = RaftStatus {
            node_id: node_id.clone(),
            role: Role::Follower,
            term: core.current_term,
            leader: None,
            commit_index: applied,
            last_applied: applied,
            last_log_index: log.last_index(),
            snapshot_index: log.snapshot_meta().last_included_index,
            membership: log.membership(),
            failed: None,
        };
        let (commit_tx, _) = watch::channel(applied);
        let (applied_tx, _) = watch::channel(applied);

        Self {
            node_id,
            config,
            core: Mutex::new(core),
            log,
            snapshots,
            status: RwLock::new(status),
            commit_tx,
            applied_tx,
            tracker: ProposalTracker::new(),
            apply_tx,
            replicate: Notify::new(),
            meter,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn log_ref(&self) -> &RaftLog {
        &self.log
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn tracker(&self) -> &ProposalTracker {
        &self.tracker
    }

    pub fn meter(&self) -> &Arc<dyn Meter> {
        &self.meter
    }

    pub fn role(&self) -> Role {
        self.status.read().role
    }

    pub fn current_term(&self) -> Term {
        self.status.read().term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.status.read().leader.clone()
    }

    pub fn commit_index(&self) -> LogIndex {
        *self.commit_tx.borrow()
    }

    pub fn status(&self) -> RaftStatus {
        let mut status = self.status.read().clone();
        status.last_applied = *self.applied_tx.borrow();
        status
    }

    pub fn subscribe_commit(&self) -> watch::Receiver<LogIndex> {
        self.commit_tx.subscribe()
    }

    pub fn subscribe_applied(&self) -> watch::Receiver<LogIndex> {
        self.applied_tx.subscribe()
    }

    pub(crate) fn publish_applied(&self, index: LogIndex) {
        self.applied_tx.send_replace(index);
    }

    /// Resolves when a proposal or membership change wants replication now.
    pub(crate) async fn replication_requested(&self) {
        self.replicate.notified().await
    }

    fn publish(&self, core: &Core) {
        let mut status = self.status.write();
        status.role = core.role;
        status.term = core.current_term;
        status.leader = core.leader_id.clone();
        status.commit_index = core.commit_index;
        status.last_log_index = self.log.last_index();
        status.snapshot_index = self.log.snapshot_meta().last_included_index;
        status.membership = self.log.membership();
        status.failed = core.failed.clone();
    }

    fn emit(&self, term: Term, kind: RaftKind) {
        self.meter.emit(VizEvent::Raft(RaftEvt {
            node: self.node_id.to_string(),
            term: term.as_u64(),
            kind,
        }));
    }

    fn set_commit(&self, core: &mut Core, index: LogIndex) {
        if index > core.commit_index {
            core.commit_index = index;
            self.commit_tx.send_replace(index);
        }
    }

    /// Enter the failed state after a durable write error.
    fn enter_failed(&self, core: &mut Core, err: RaftError) -> RaftError {
        let reason = err.to_string();
        tracing::error!(
            node = %self.node_id,
            error = %reason,
            "Storage failure, node stops voting and leading"
        );
        if core.role == Role::Leader {
            self.tracker.fail_after(core.commit_index, None);
        }
        core.role = Role::Follower;
        core.leader = None;
        core.leader_id = None;
        core.failed = Some(reason.clone());
        self.emit(core.current_term, RaftKind::StorageFailed);
        self.publish(core);
        RaftError::StorageFailure { reason }
    }

    fn check_healthy(&self, core: &Core) -> Result<()> {
        match &core.failed {
            Some(reason) => Err(RaftError::StorageFailure {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn persist_hard_state(&self, core: &mut Core) -> Result<()> {
        let hs = HardState {
            current_term: core.current_term,
            voted_for: core.voted_for.clone(),
        };
        match self.log.save_hard_state(hs).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.enter_failed(core, e)),
        }
    }

    /// Become follower, adopting `term` if it is newer. Durable on return.
    async fn become_follower(
        &self,
        core: &mut Core,
        term: Term,
        leader: Option<NodeId>,
    ) -> Result<()> {
        let newer = term > core.current_term;
        if newer {
            core.current_term = term;
            core.voted_for = None;
        }
        if core.role == Role::Leader {
            tracing::warn!(
                node = %self.node_id,
                term = %core.current_term,
                new_leader = ?leader,
                "Leader stepping down"
            );
            self.tracker.fail_after(core.commit_index, leader.clone());
            self.emit(core.current_term, RaftKind::StepDown);
        }
        core.role = Role::Follower;
        core.leader = None;
        core.leader_id = leader;
        if newer {
            self.persist_hard_state(core).await?;
        }
        Ok(())
    }

    /// Step down if a peer reports a newer term.
    pub async fn observe_term(&self, term: Term) -> Result<()> {
        let mut core = self.core.lock().await;
        if term > core.current_term {
            self.become_follower(&mut core, term, None).await?;
            self.publish(&core);
        }
        Ok(())
    }

    /// Record a durable-write failure seen outside the consensus handlers.
    pub async fn report_storage_failure(&self, err: RaftError) {
        let mut core = self.core.lock().await;
        if core.failed.is_none() {
            self.enter_failed(&mut core, err);
        }
    }

    /// Handle RequestVote RPC.
    ///
    /// The vote is persisted before the response is returned.
    pub async fn handle_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let mut core = self.core.lock().await;
        self.check_healthy(&core)?;

        if request.term > core.current_term {
            self.become_follower(&mut core, request.term, None).await?;
        }

        let mut vote_granted = false;
        if request.term == core.current_term {
            let can_vote = core
                .voted_for
                .as_ref()
                .map_or(true, |id| id == &request.candidate_id);
            let log_ok = is_log_up_to_date(
                request.last_log_term,
                request.last_log_index,
                self.log.last_term(),
                self.log.last_index(),
            );

            if can_vote && log_ok && core.role != Role::Leader {
                if core.voted_for.is_none() {
                    core.voted_for = Some(request.candidate_id.clone());
                    self.persist_hard_state(&mut core).await?;
                }
                vote_granted = true;
                self.emit(
                    core.current_term,
                    RaftKind::VoteGranted {
                        candidate: request.candidate_id.to_string(),
                    },
                );
            }
        }

        tracing::debug!(
            node = %self.node_id,
            candidate = %request.candidate_id,
            term = %request.term,
            granted = vote_granted,
            "RequestVote handled"
        );
        self.publish(&core);

        Ok(RequestVoteResponse {
            term: core.current_term,
            vote_granted,
        })
    }

    /// Handle AppendEntries RPC (replication and heartbeat).
    ///
    /// New entries are durable before the response is returned.
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut core = self.core.lock().await;
        self.check_healthy(&core)?;

        if request.term < core.current_term {
            return Ok(reject_append(core.current_term, None));
        }
        if core.role != Role::Follower
            || request.term > core.current_term
            || core.leader_id.as_ref() != Some(&request.leader_id)
        {
            self.become_follower(&mut core, request.term, Some(request.leader_id.clone()))
                .await?;
            self.publish(&core);
        }

        let prev = request.prev_log_index;
        let last = self.log.last_index();
        if prev > last {
            return Ok(reject_append(core.current_term, Some(last.next())));
        }

        let base = self.log.snapshot_meta().last_included_index;
        let local_term = if prev < base {
            self.log.get(prev).map(|e| e.term)
        } else {
            self.log.term_at(prev)
        };
        match local_term {
            Some(term) if term != request.prev_log_term => {
                let err = RaftError::LogInconsistency {
                    index: prev,
                    expected_term: request.prev_log_term,
                    actual_term: Some(term),
                };
                tracing::debug!(node = %self.node_id, error = %err, "Rejecting AppendEntries");
                let conflict = self.log.first_index_of_term(term, prev);
                return Ok(reject_append(core.current_term, Some(conflict)));
            }
            // Matching entry, or a prefix already folded into our snapshot.
            _ => {}
        }

        let covered = match self.log.append_from_leader(prev, request.entries).await {
            Ok(covered) => covered,
            Err(e) => return Err(self.enter_failed(&mut core, e)),
        };

        self.set_commit(&mut core, request.leader_commit.min(covered));
        self.publish(&core);

        Ok(AppendEntriesResponse {
            term: core.current_term,
            success: true,
            match_index: covered,
            conflict_index: None,
        })
    }

    /// Handle InstallSnapshot RPC.
    ///
    /// Stores the snapshot, resets the log base and hands the data to the
    /// apply loop. A snapshot at or below the commit index is ignored.
    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut core = self.core.lock().await;
        self.check_healthy(&core)?;

        if request.term < core.current_term {
            return Ok(InstallSnapshotResponse {
                term: core.current_term,
                last_log_index: self.log.last_index(),
            });
        }
        if core.role != Role::Follower
            || request.term > core.current_term
            || core.leader_id.as_ref() != Some(&request.leader_id)
        {
            self.become_follower(&mut core, request.term, Some(request.leader_id.clone()))
                .await?;
        }

        let meta = request.metadata;
        if meta.last_included_index <= core.commit_index {
            self.publish(&core);
            return Ok(InstallSnapshotResponse {
                term: core.current_term,
                last_log_index: self.log.last_index(),
            });
        }

        let snapshot = Snapshot::new(meta.clone(), request.data);
        if let Err(e) = self.snapshots.save(&snapshot).await {
            return Err(self.enter_failed(&mut core, e));
        }
        if let Err(e) = self.log.install_snapshot(&meta).await {
            return Err(self.enter_failed(&mut core, e));
        }

        tracing::info!(
            node = %self.node_id,
            snapshot_index = %meta.last_included_index,
            snapshot_term = %meta.last_included_term,
            leader = %request.leader_id,
            "Installed snapshot from leader"
        );
        // The apply loop restores the state machine before applying anything
        // past the snapshot; entries below it are gone from the log.
        let _ = self.apply_tx.send(ApplyMsg::Restore(snapshot));
        self.set_commit(&mut core, meta.last_included_index);
        self.emit(
            core.current_term,
            RaftKind::SnapshotInstalled {
                index: meta.last_included_index.as_u64(),
            },
        );
        self.publish(&core);

        Ok(InstallSnapshotResponse {
            term: core.current_term,
            last_log_index: self.log.last_index(),
        })
    }

    /// Transition to candidate for a new term.
    ///
    /// Returns `(term, last_log_index, last_log_term)` for the RequestVote
    /// messages, or None if this node must not campaign (leader, failed, or
    /// not a voter).
    pub async fn start_election(&self) -> Result<Option<(Term, LogIndex, Term)>> {
        let mut core = self.core.lock().await;
        if core.failed.is_some() || core.role == Role::Leader {
            return Ok(None);
        }
        if !self.log.membership().contains(&self.node_id) {
            tracing::trace!(node = %self.node_id, "Not a voter, skipping election");
            return Ok(None);
        }

        core.current_term = core.current_term.next();
        core.voted_for = Some(self.node_id.clone());
        core.role = Role::Candidate;
        core.leader_id = None;
        core.leader = None;
        self.persist_hard_state(&mut core).await?;

        tracing::info!(node = %self.node_id, term = %core.current_term, "Starting election");
        self.emit(core.current_term, RaftKind::VoteReq);
        self.publish(&core);

        Ok(Some((
            core.current_term,
            self.log.last_index(),
            self.log.last_term(),
        )))
    }

    /// Transition to leader after winning the election for `term`.
    ///
    /// Appends a no-op entry so that entries from earlier terms can commit.
    /// Returns false if the node moved on in the meantime.
    pub async fn become_leader(&self, term: Term, votes: usize) -> Result<bool> {
        let mut core = self.core.lock().await;
        if core.current_term != term || core.role != Role::Candidate || core.failed.is_some() {
            return Ok(false);
        }

        let noop = LogEntry::new(term, self.log.last_index().next(), EntryPayload::Noop);
        let next = noop.index;
        if let Err(e) = self.log.append(&[noop]).await {
            return Err(self.enter_failed(&mut core, e));
        }

        let mut leader = LeaderState {
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_ack: HashMap::new(),
        };
        for peer in self.log.membership().voters() {
            if peer != &self.node_id {
                leader.track(peer, next);
            }
        }
        core.role = Role::Leader;
        core.leader_id = Some(self.node_id.clone());
        core.leader = Some(leader);

        tracing::info!(
            node = %self.node_id,
            term = %term,
            votes,
            "Won election, becoming leader"
        );
        self.emit(term, RaftKind::LeaderElected { votes });

        self.advance_commit_index(&mut core);
        self.publish(&core);
        drop(core);
        self.replicate.notify_one();
        Ok(true)
    }

    /// Append a new entry as leader.
    ///
    /// The entry is durable on return and registered with the proposal
    /// tracker; the receiver resolves once it is applied.
    pub async fn propose(
        &self,
        payload: EntryPayload,
    ) -> Result<(LogIndex, Term, oneshot::Receiver<Result<Bytes>>)> {
        let mut core = self.core.lock().await;
        self.check_healthy(&core)?;
        if core.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: core.leader_id.clone(),
            });
        }
        if let EntryPayload::Membership(_) = payload {
            if let Some(index) = self.log.uncommitted_membership(core.commit_index) {
                return Err(RaftError::ConfigChangeInProgress { index });
            }
        }

        let term = core.current_term;
        let index = self.log.last_index().next();
        let new_voters: Vec<NodeId> = match &payload {
            EntryPayload::Membership(m) => m
                .voters()
                .filter(|v| *v != &self.node_id)
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        let entry = LogEntry::new(term, index, payload);
        if let Err(e) = self.log.append(&[entry]).await {
            return Err(self.enter_failed(&mut core, e));
        }
        if let Some(leader) = core.leader.as_mut() {
            for voter in &new_voters {
                leader.track(voter, index);
            }
        }
        let rx = self.tracker.register(index, term);

        self.advance_commit_index(&mut core);
        self.publish(&core);
        drop(core);
        self.replicate.notify_one();
        Ok((index, term, rx))
    }

    /// Add `node` to the voter set via a membership entry.
    ///
    /// Returns None if it is already a voter.
    pub async fn add_voter(
        &self,
        node: NodeId,
    ) -> Result<Option<(LogIndex, Term, oneshot::Receiver<Result<Bytes>>)>> {
        let membership = self.log.membership();
        if membership.contains(&node) {
            return Ok(None);
        }
        tracing::info!(node = %self.node_id, joining = %node, "Adding voter");
        self.propose(EntryPayload::Membership(membership.with_voter(node)))
            .await
            .map(Some)
    }

    /// Write the initial membership entry into an empty log.
    ///
    /// Returns false if the log already holds entries.
    pub async fn bootstrap(&self, membership: Membership) -> Result<bool> {
        if membership.is_empty() {
            return Err(RaftError::ConfigError {
                reason: "bootstrap membership is empty".to_string(),
            });
        }
        let mut core = self.core.lock().await;
        self.check_healthy(&core)?;
        if self.log.last_index() != LogIndex::ZERO {
            tracing::debug!(node = %self.node_id, "Log not empty, skipping bootstrap");
            return Ok(false);
        }
        let entry = LogEntry::new(Term(1), LogIndex(1), EntryPayload::Membership(membership.clone()));
        if let Err(e) = self.log.append(&[entry]).await {
            return Err(self.enter_failed(&mut core, e));
        }
        tracing::info!(node = %self.node_id, voters = %membership, "Bootstrapped cluster membership");
        self.publish(&core);
        Ok(true)
    }

    /// Peers the leader replicates to: every voter except itself.
    pub fn followers(&self) -> Vec<NodeId> {
        self.log
            .membership()
            .voters()
            .filter(|v| *v != &self.node_id)
            .cloned()
            .collect()
    }

    /// Build the next message for `follower`, or None if not leader.
    pub async fn replication_plan(&self, follower: &NodeId) -> Option<ReplicationPlan> {
        let mut core = self.core.lock().await;
        let term = core.current_term;
        let commit = core.commit_index;
        let leader = core.leader.as_mut()?;

        let last = self.log.last_index();
        leader.track(follower, last.next());
        let next = leader
            .next_index
            .get(follower)
            .copied()
            .unwrap_or(LogIndex(1))
            .min(last.next())
            .max(LogIndex(1));

        let prev = next.prev().unwrap_or(LogIndex::ZERO);
        let base = self.log.snapshot_meta().last_included_index;
        let prev_term = if prev < base {
            self.log.get(prev).map(|e| e.term)
        } else {
            self.log.term_at(prev)
        };
        let Some(prev_log_term) = prev_term else {
            return Some(ReplicationPlan::Snapshot { term });
        };

        Some(ReplicationPlan::Append(AppendEntriesRequest {
            term,
            leader_id: self.node_id.clone(),
            prev_log_index: prev,
            prev_log_term,
            entries: self.log.entries(next, self.config.max_entries_per_append),
            leader_commit: commit,
        }))
    }

    /// Apply a follower's AppendEntries response.
    pub async fn on_append_response(
        &self,
        follower: &NodeId,
        sent_term: Term,
        response: AppendEntriesResponse,
    ) -> Result<()> {
        let mut core = self.core.lock().await;
        if response.term > core.current_term {
            self.become_follower(&mut core, response.term, None).await?;
            self.publish(&core);
            return Ok(());
        }
        if core.current_term != sent_term {
            return Ok(());
        }
        let Some(leader) = core.leader.as_mut() else {
            return Ok(());
        };
        leader.last_ack.insert(follower.clone(), Instant::now());

        if response.success {
            let matched = leader
                .match_index
                .get(follower)
                .copied()
                .unwrap_or(LogIndex::ZERO)
                .max(response.match_index);
            leader.match_index.insert(follower.clone(), matched);
            leader.next_index.insert(follower.clone(), matched.next());
            self.advance_commit_index(&mut core);
            self.publish(&core);
        } else {
            let current = leader
                .next_index
                .get(follower)
                .copied()
                .unwrap_or(LogIndex(1));
            let next = match response.conflict_index {
                Some(hint) => hint,
                None => current.prev().unwrap_or(LogIndex(1)),
            };
            let matched = leader.match_index.get(follower).copied().unwrap_or(LogIndex::ZERO);
            leader
                .next_index
                .insert(follower.clone(), next.max(matched.next()).max(LogIndex(1)));
        }
        Ok(())
    }

    /// Apply a follower's InstallSnapshot response.
    pub async fn on_snapshot_response(
        &self,
        follower: &NodeId,
        sent_term: Term,
        snapshot_index: LogIndex,
        response: InstallSnapshotResponse,
    ) -> Result<()> {
        let mut core = self.core.lock().await;
        if response.term > core.current_term {
            self.become_follower(&mut core, response.term, None).await?;
            self.publish(&core);
            return Ok(());
        }
        if core.current_term != sent_term {
            return Ok(());
        }
        let Some(leader) = core.leader.as_mut() else {
            return Ok(());
        };
        leader.last_ack.insert(follower.clone(), Instant::now());
        let matched = leader
            .match_index
            .get(follower)
            .copied()
            .unwrap_or(LogIndex::ZERO)
            .max(snapshot_index);
        leader.match_index.insert(follower.clone(), matched);
        leader.next_index.insert(follower.clone(), matched.next());
        self.advance_commit_index(&mut core);
        self.publish(&core);
        Ok(())
    }

    /// Commit the highest index stored on a quorum of voters, if it is
    /// from the current term.
    fn advance_commit_index(&self, core: &mut Core) {
        let Some(leader) = core.leader.as_ref() else {
            return;
        };
        let membership = self.log.membership();
        if membership.is_empty() {
            return;
        }

        let last = self.log.last_index();
        let mut indices: Vec<LogIndex> = membership
            .voters()
            .map(|v| {
                if v == &self.node_id {
                    last
                } else {
                    leader.match_index.get(v).copied().unwrap_or(LogIndex::ZERO)
                }
            })
            .collect();
        indices.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = indices[membership.quorum() - 1];
        if candidate > core.commit_index && self.log.term_at(candidate) == Some(core.current_term) {
            tracing::trace!(node = %self.node_id, commit = %candidate, "Commit index advanced");
            self.set_commit(core, candidate);
        }
    }

    /// Step down if a quorum has not answered within `election_timeout_max`.
    ///
    /// Returns false if the leader stepped down.
    pub async fn check_quorum(&self) -> Result<bool> {
        let mut core = self.core.lock().await;
        let Some(leader) = core.leader.as_ref() else {
            return Ok(true);
        };
        let window = self.config.election_timeout_max;
        let mut alive = vec![self.node_id.clone()];
        alive.extend(
            leader
                .last_ack
                .iter()
                .filter(|(_, at)| at.elapsed() <= window)
                .map(|(peer, _)| peer.clone()),
        );
        if self.log.membership().has_quorum(alive.iter()) {
            return Ok(true);
        }

        tracing::warn!(
            node = %self.node_id,
            term = %core.current_term,
            reachable = alive.len(),
            "Lost contact with quorum"
        );
        let term = core.current_term;
        self.become_follower(&mut core, term, None).await?;
        self.publish(&core);
        Ok(false)
    }

    /// Fold the log into a snapshot the apply loop just stored.
    pub async fn compact_log(&self, meta: &SnapshotMetadata) -> Result<bool> {
        let mut core = self.core.lock().await;
        self.check_healthy(&core)?;
        match self.log.compact(meta, self.config.trailing_logs).await {
            Ok(compacted) => {
                self.publish(&core);
                Ok(compacted)
            }
            Err(e) => Err(self.enter_failed(&mut core, e)),
        }
    }

    #[cfg(test)]
    async fn force_role(&self, term: Term, role: Role) {
        let mut core = self.core.lock().await;
        core.current_term = term;
        core.role = role;
        if role == Role::Leader {
            core.leader_id = Some(self.node_id.clone());
            let mut leader = LeaderState {
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                last_ack: HashMap::new(),
            };
            for peer in self.log.membership().voters() {
                if peer != &self.node_id {
                    leader.track(peer, self.log.last_index().next());
                }
            }
            core.leader = Some(leader);
        }
        self.publish(&core);
    }
}
