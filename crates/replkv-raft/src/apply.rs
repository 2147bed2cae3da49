//! Apply loop: feeds committed entries to the state machine in log order.
//!
//! The loop owns the state machine outright, so nothing else can mutate it.
//! It wakes on commit index changes (watch channel) and on control messages
//! (snapshot restore from a leader, on-demand snapshot), applies batches of
//! at most `apply_batch_size` entries, answers waiting proposers, and takes
//! a snapshot once `snapshot_threshold` entries were applied since the last.

use crate::error::{RaftError, Result};
use crate::fsm::StateMachine;
use crate::snapshot::Snapshot;
use crate::state::RaftState;
use crate::types::*;
use bytes::Bytes;
use replkv_observe::{RaftEvt, RaftKind, VizEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Control messages for the apply loop.
pub enum ApplyMsg {
    /// Replace the state machine with a snapshot received from the leader.
    Restore(Snapshot),
    /// Take a snapshot now and report its metadata.
    Snapshot {
        done: oneshot::Sender<Result<SnapshotMetadata>>,
    },
}

pub struct ApplyLoop {
    state: Arc<RaftState>,
    fsm: Box<dyn StateMachine>,
    last_applied: LogIndex,
    last_snapshot: LogIndex,
}

impl ApplyLoop {
    /// `last_applied` is where the state machine already is; `last_snapshot`
    /// the index of the newest stored snapshot.
    pub fn new(
        state: Arc<RaftState>,
        fsm: Box<dyn StateMachine>,
        last_applied: LogIndex,
        last_snapshot: LogIndex,
    ) -> Self {
        Self {
            state,
            fsm,
            last_applied,
            last_snapshot,
        }
    }

    pub async fn run(
        mut self,
        mut commit_rx: watch::Receiver<LogIndex>,
        mut apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        // Catch up with anything committed before the loop started.
        let commit = *commit_rx.borrow_and_update();
        self.apply_committed(commit).await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::debug!(node = %self.state.node_id(), "Apply loop shutting down");
                    break;
                }
                msg = apply_rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle_msg(msg).await;
                    let commit = *commit_rx.borrow_and_update();
                    self.apply_committed(commit).await;
                }
                changed = commit_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let commit = *commit_rx.borrow_and_update();
                    self.apply_committed(commit).await;
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: ApplyMsg) {
        match msg {
            ApplyMsg::Restore(snapshot) => {
                let index = snapshot.index();
                if index <= self.last_applied {
                    tracing::debug!(index = %index, "Ignoring snapshot behind applied index");
                    return;
                }
                if let Err(e) = self.fsm.restore(&snapshot.data) {
                    self.state.report_storage_failure(e).await;
                    return;
                }
                self.last_applied = index;
                self.last_snapshot = index;
                self.state.publish_applied(index);
                tracing::info!(
                    node = %self.state.node_id(),
                    index = %index,
                    "State machine restored from snapshot"
                );
            }
            ApplyMsg::Snapshot { done } => {
                let _ = done.send(self.take_snapshot().await);
            }
        }
    }

    /// Apply every entry up to `commit`, in order.
    async fn apply_committed(&mut self, commit: LogIndex) {
        let batch_size = self.state.config().apply_batch_size;

        while self.last_applied < commit {
            let wanted = (commit.0 - self.last_applied.0).min(batch_size as u64) as usize;
            let batch = self.state.log_ref().entries(self.last_applied.next(), wanted);
            match batch.first() {
                Some(first) if first.index == self.last_applied.next() => {}
                // Compacted away under us: a snapshot restore is on its way.
                _ => {
                    tracing::debug!(
                        next = %self.last_applied.next(),
                        commit = %commit,
                        "Next entry not in log, waiting"
                    );
                    return;
                }
            }

            for entry in batch {
                if entry.index > commit {
                    break;
                }
                self.apply_entry(entry);
            }

            if let Err(e) = self.state.log_ref().record_commit(self.last_applied).await {
                self.state.report_storage_failure(e).await;
            }
            self.state.publish_applied(self.last_applied);

            if self.last_applied.0 - self.last_snapshot.0 >= self.state.config().snapshot_threshold {
                if let Err(e) = self.take_snapshot().await {
                    tracing::warn!(error = %e, "Automatic snapshot failed");
                }
            }
        }
    }

    fn apply_entry(&mut self, entry: LogEntry) {
        let result = match &entry.payload {
            EntryPayload::Command(command) => {
                let result = self.fsm.apply(entry.index, command);
                if let Err(e) = &result {
                    tracing::warn!(index = %entry.index, error = %e, "Command rejected by state machine");
                }
                result
            }
            EntryPayload::Noop | EntryPayload::Membership(_) => Ok(Bytes::new()),
        };
        self.last_applied = entry.index;
        self.state.tracker().resolve(entry.index, entry.term, result);
    }

    /// Snapshot the state machine at `last_applied` and compact the log.
    async fn take_snapshot(&mut self) -> Result<SnapshotMetadata> {
        let index = self.last_applied;
        let log = self.state.log_ref();
        if index == LogIndex::ZERO || index <= self.last_snapshot {
            return Ok(log.snapshot_meta());
        }

        let term = log.term_at(index).ok_or_else(|| RaftError::Internal {
            reason: format!("no term for applied index {}", index),
        })?;
        let meta = SnapshotMetadata {
            last_included_index: index,
            last_included_term: term,
            membership: log.membership_at(index),
        };
        let snapshot = Snapshot::new(meta.clone(), self.fsm.snapshot()?);
        let bytes = snapshot.data.len();

        self.state.snapshots().save(&snapshot).await?;
        self.state.compact_log(&meta).await?;
        self.last_snapshot = index;

        tracing::info!(
            node = %self.state.node_id(),
            index = %index,
            term = %term,
            bytes,
            "Snapshot taken"
        );
        self.state.meter().emit(VizEvent::Raft(RaftEvt {
            node: self.state.node_id().to_string(),
            term: self.state.current_term().as_u64(),
            kind: RaftKind::SnapshotTaken {
                index: index.as_u64(),
            },
        }));
        Ok(meta)
    }
}
