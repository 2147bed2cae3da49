//! Raft log storage backed by replkv-wal.
//!
//! Provides:
//! - Persistent log entries and hard state (`currentTerm`, `votedFor`) in one WAL
//! - A full in-memory index of live entries, rebuilt from the WAL on open
//! - Conflict truncation when a leader overwrites an uncommitted suffix
//! - Compaction behind a snapshot via atomic WAL rewrite
//!
//! Mutating methods are called with the consensus lock held, so they never
//! race each other. Readers (replication, the apply loop) only take the
//! short internal read lock.

use crate::error::{RaftError, Result};
use crate::types::{EntryPayload, HardState, LogEntry, LogIndex, Membership, SnapshotMetadata, Term};
use parking_lot::RwLock;
use replkv_observe::Meter;
use replkv_wal::{FsyncPolicy, Record, RecoveryInfo, Wal, WalConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// One WAL record of the Raft log.
///
/// Replay applies these in order; the state after replay is the state
/// before the crash, minus anything that was never fsynced.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogRecord {
    Entry(LogEntry),
    /// Drop every entry after this index.
    TruncateAfter(LogIndex),
    HardState(HardState),
    /// Lower bound on the commit index. Written without fsync.
    Commit(LogIndex),
    /// Entries up to this point are covered by a snapshot. Starts a rewritten log.
    SnapshotBase(SnapshotMetadata),
}

impl LogRecord {
    fn to_wal(&self) -> Result<Record> {
        Ok(Record::new(bincode::serialize(self)?))
    }
}

#[derive(Debug)]
struct LogInner {
    entries: BTreeMap<LogIndex, LogEntry>,
    memberships: BTreeMap<LogIndex, Membership>,
    base: SnapshotMetadata,
    hard_state: HardState,
    commit_hint: LogIndex,
}

impl Default for LogInner {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            memberships: BTreeMap::new(),
            base: SnapshotMetadata {
                last_included_index: LogIndex::ZERO,
                last_included_term: Term::ZERO,
                membership: Membership::default(),
            },
            hard_state: HardState::default(),
            commit_hint: LogIndex::ZERO,
        }
    }
}

impl LogInner {
    fn replay(&mut self, record: LogRecord) {
        match record {
            LogRecord::Entry(entry) => self.insert(entry),
            LogRecord::TruncateAfter(index) => self.truncate_after(index),
            LogRecord::HardState(hs) => self.hard_state = hs,
            LogRecord::Commit(index) => self.commit_hint = self.commit_hint.max(index),
            LogRecord::SnapshotBase(meta) => {
                self.entries.clear();
                self.memberships.clear();
                self.commit_hint = self.commit_hint.max(meta.last_included_index);
                self.base = meta;
            }
        }
    }

    fn insert(&mut self, entry: LogEntry) {
        // An entry at index i replaces everything from i onwards.
        self.entries.split_off(&entry.index);
        self.memberships.split_off(&entry.index);
        if let EntryPayload::Membership(m) = &entry.payload {
            self.memberships.insert(entry.index, m.clone());
        }
        self.entries.insert(entry.index, entry);
    }

    fn truncate_after(&mut self, index: LogIndex) {
        self.entries.split_off(&index.next());
        self.memberships.split_off(&index.next());
    }

    fn last_index(&self) -> LogIndex {
        let last_entry = self.entries.keys().next_back().copied().unwrap_or(LogIndex::ZERO);
        last_entry.max(self.base.last_included_index)
    }

    fn last_term(&self) -> Term {
        match self.entries.iter().next_back() {
            Some((index, entry)) if *index > self.base.last_included_index => entry.term,
            _ => self.base.last_included_term,
        }
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == LogIndex::ZERO {
            return Some(Term::ZERO);
        }
        if index == self.base.last_included_index {
            return Some(self.base.last_included_term);
        }
        self.entries.get(&index).map(|e| e.term)
    }

    fn membership_at(&self, index: LogIndex) -> Membership {
        let base = self.base.last_included_index;
        let found = if index > base {
            self.memberships.range(base.next()..=index).next_back()
        } else if index < base {
            self.memberships.range(..=index).next_back()
        } else {
            None
        };
        found
            .map(|(_, m)| m.clone())
            .unwrap_or_else(|| self.base.membership.clone())
    }
}

/// Raft log backed by replkv-wal.
///
/// # Storage Format
///
/// Each WAL record is a bincode-encoded [`LogRecord`]: an entry, a
/// truncation marker, a hard-state update, a commit hint, or a snapshot base.
/// Appends and hard-state updates are fsynced before the call returns.
#[derive(Clone)]
pub struct RaftLog {
    wal: Arc<Wal>,
    inner: Arc<RwLock<LogInner>>,
}

impl RaftLog {
    /// Open a Raft log in `dir`, replaying whatever the WAL recovered.
    pub async fn open(
        dir: impl Into<PathBuf>,
        node_tag: u32,
        meter: Arc<dyn Meter>,
    ) -> Result<(Self, RecoveryInfo)> {
        let config = WalConfig {
            dir: dir.into(),
            fsync_policy: FsyncPolicy::Os,
            node_id: node_tag,
        };
        let (wal, recovery_info) = Wal::open_with_meter(config, meter).await?;

        let mut inner = LogInner::default();
        for record in wal.read_all().await? {
            let record: LogRecord = bincode::deserialize(&record.payload)?;
            inner.replay(record);
        }

        tracing::info!(
            last_index = %inner.last_index(),
            term = %inner.hard_state.current_term,
            snapshot_index = %inner.base.last_included_index,
            commit_hint = %inner.commit_hint,
            truncated = recovery_info.bytes_truncated,
            "Raft log recovered"
        );

        Ok((
            Self {
                wal: Arc::new(wal),
                inner: Arc::new(RwLock::new(inner)),
            },
            recovery_info,
        ))
    }

    async fn write_durable(&self, records: &[LogRecord]) -> Result<()> {
        let encoded = records
            .iter()
            .map(LogRecord::to_wal)
            .collect::<Result<Vec<_>>>()?;
        self.wal.append_batch(&encoded).await?;
        self.wal.sync().await?;
        Ok(())
    }

    /// Append entries that directly follow the current last index.
    ///
    /// Durable on return.
    pub async fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let expected = self.last_index().next();
        if first.index != expected {
            return Err(RaftError::Internal {
                reason: format!("append at {} but next index is {}", first.index, expected),
            });
        }

        let records: Vec<LogRecord> = entries.iter().cloned().map(LogRecord::Entry).collect();
        self.write_durable(&records).await?;

        let mut inner = self.inner.write();
        for entry in entries {
            inner.insert(entry.clone());
        }
        Ok(())
    }

    /// Store entries received from a leader after `prev` matched.
    ///
    /// Entries already present with the same term are skipped; the first
    /// entry whose term differs truncates the local suffix from there.
    /// Returns the index of the last entry covered by the request.
    pub async fn append_from_leader(&self, prev: LogIndex, entries: Vec<LogEntry>) -> Result<LogIndex> {
        let covered = LogIndex(prev.0 + entries.len() as u64);

        let (start, conflict) = {
            let inner = self.inner.read();
            let last = inner.last_index();
            let mut start = entries.len();
            let mut conflict = false;
            for (i, entry) in entries.iter().enumerate() {
                if entry.index <= inner.base.last_included_index {
                    continue;
                }
                if entry.index > last {
                    start = i;
                    break;
                }
                if inner.term_at(entry.index) != Some(entry.term) {
                    start = i;
                    conflict = true;
                    break;
                }
            }
            (start, conflict)
        };

        let new_entries = &entries[start..];
        if new_entries.is_empty() {
            return Ok(covered);
        }

        let mut records = Vec::with_capacity(new_entries.len() + 1);
        let truncate_at = new_entries[0].index.prev().unwrap_or(LogIndex::ZERO);
        if conflict {
            tracing::warn!(
                from = %new_entries[0].index,
                "Truncating conflicting log suffix"
            );
            records.push(LogRecord::TruncateAfter(truncate_at));
        }
        records.extend(new_entries.iter().cloned().map(LogRecord::Entry));
        self.write_durable(&records).await?;

        let mut inner = self.inner.write();
        if conflict {
            inner.truncate_after(truncate_at);
        }
        for entry in new_entries {
            inner.insert(entry.clone());
        }
        Ok(covered)
    }

    /// Delete all entries after `index`. Durable on return.
    pub async fn truncate_after(&self, index: LogIndex) -> Result<()> {
        self.write_durable(&[LogRecord::TruncateAfter(index)]).await?;
        self.inner.write().truncate_after(index);
        Ok(())
    }

    /// Persist `currentTerm` and `votedFor`. Durable on return.
    pub async fn save_hard_state(&self, hard_state: HardState) -> Result<()> {
        self.write_durable(&[LogRecord::HardState(hard_state.clone())])
            .await?;
        self.inner.write().hard_state = hard_state;
        Ok(())
    }

    /// Record that everything up to `index` is known committed.
    ///
    /// Not fsynced: losing it only means replaying less on restart.
    pub async fn record_commit(&self, index: LogIndex) -> Result<()> {
        if index <= self.inner.read().commit_hint {
            return Ok(());
        }
        self.wal.append(&LogRecord::Commit(index).to_wal()?).await?;
        let mut inner = self.inner.write();
        inner.commit_hint = inner.commit_hint.max(index);
        Ok(())
    }

    /// Drop entries covered by a local snapshot, keeping `trailing` entries
    /// behind it. Returns false if the log was already compacted that far.
    pub async fn compact(&self, meta: &SnapshotMetadata, trailing: u64) -> Result<bool> {
        let (records, keep_from) = {
            let inner = self.inner.read();
            if meta.last_included_index <= inner.base.last_included_index {
                return Ok(false);
            }
            let keep_from = LogIndex(meta.last_included_index.0.saturating_sub(trailing) + 1);
            let mut records = vec![
                LogRecord::SnapshotBase(meta.clone()),
                LogRecord::HardState(inner.hard_state.clone()),
                LogRecord::Commit(inner.commit_hint.max(meta.last_included_index)),
            ];
            records.extend(
                inner
                    .entries
                    .range(keep_from..)
                    .map(|(_, e)| LogRecord::Entry(e.clone())),
            );
            (records, keep_from)
        };

        self.rewrite(&records).await?;

        let mut inner = self.inner.write();
        let kept = inner.entries.split_off(&keep_from);
        let kept_memberships = inner.memberships.split_off(&keep_from);
        inner.entries = kept;
        inner.memberships = kept_memberships;
        inner.commit_hint = inner.commit_hint.max(meta.last_included_index);
        inner.base = meta.clone();

        tracing::info!(
            snapshot_index = %meta.last_included_index,
            first_kept = %keep_from,
            "Log compacted"
        );
        Ok(true)
    }

    /// Reset the log base to a snapshot received from the leader.
    ///
    /// If the log already holds the snapshot's last entry, the suffix after
    /// it is kept; otherwise the whole log is discarded.
    pub async fn install_snapshot(&self, meta: &SnapshotMetadata) -> Result<()> {
        let (records, keep_suffix) = {
            let inner = self.inner.read();
            let keep_suffix =
                inner.term_at(meta.last_included_index) == Some(meta.last_included_term);
            let mut records = vec![
                LogRecord::SnapshotBase(meta.clone()),
                LogRecord::HardState(inner.hard_state.clone()),
                LogRecord::Commit(meta.last_included_index),
            ];
            if keep_suffix {
                records.extend(
                    inner
                        .entries
                        .range(meta.last_included_index.next()..)
                        .map(|(_, e)| LogRecord::Entry(e.clone())),
                );
            }
            (records, keep_suffix)
        };

        self.rewrite(&records).await?;

        let mut inner = self.inner.write();
        if keep_suffix {
            let from = meta.last_included_index.next();
            inner.entries = inner.entries.split_off(&from);
            inner.memberships = inner.memberships.split_off(&from);
        } else {
            inner.entries.clear();
            inner.memberships.clear();
        }
        inner.commit_hint = inner.commit_hint.max(meta.last_included_index);
        inner.base = meta.clone();
        Ok(())
    }

    async fn rewrite(&self, records: &[LogRecord]) -> Result<()> {
        let encoded = records
            .iter()
            .map(LogRecord::to_wal)
            .collect::<Result<Vec<_>>>()?;
        self.wal.rewrite(&encoded).await?;
        Ok(())
    }

    /// Get a log entry by index. None if absent or compacted.
    pub fn get(&self, index: LogIndex) -> Option<LogEntry> {
        self.inner.read().entries.get(&index).cloned()
    }

    /// Up to `max` consecutive entries starting at `from`.
    pub fn entries(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        self.inner
            .read()
            .entries
            .range(from..)
            .take(max)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Returns LogIndex(0) if log is empty.
    pub fn last_index(&self) -> LogIndex {
        self.inner.read().last_index()
    }

    /// Returns Term(0) if log is empty.
    pub fn last_term(&self) -> Term {
        self.inner.read().last_term()
    }

    /// Term of the entry at `index`, including the snapshot base. None if unknown.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.inner.read().term_at(index)
    }

    /// First index of the run of `term` entries ending at `upto`.
    ///
    /// Used as the conflict hint so a leader can skip a whole term at once.
    pub fn first_index_of_term(&self, term: Term, upto: LogIndex) -> LogIndex {
        let inner = self.inner.read();
        let floor = inner.base.last_included_index;
        if upto <= floor {
            return upto;
        }
        inner
            .entries
            .range(floor.next()..=upto)
            .rev()
            .take_while(|(_, e)| e.term == term)
            .last()
            .map(|(i, _)| *i)
            .unwrap_or(upto)
    }

    /// Current snapshot base (index 0 if never compacted).
    pub fn snapshot_meta(&self) -> SnapshotMetadata {
        self.inner.read().base.clone()
    }

    /// Latest membership in the log, committed or not.
    pub fn membership(&self) -> Membership {
        let inner = self.inner.read();
        let last = inner.last_index();
        inner.membership_at(last)
    }

    /// Membership in effect at `index`.
    pub fn membership_at(&self, index: LogIndex) -> Membership {
        self.inner.read().membership_at(index)
    }

    /// Index of the newest membership entry, if it is above `commit`.
    pub fn uncommitted_membership(&self, commit: LogIndex) -> Option<LogIndex> {
        self.inner
            .read()
            .memberships
            .keys()
            .next_back()
            .copied()
            .filter(|i| *i > commit)
    }

    pub fn hard_state(&self) -> HardState {
        self.inner.read().hard_state.clone()
    }

    /// Highest commit index recorded before the last shutdown.
    pub fn commit_hint(&self) -> LogIndex {
        let inner = self.inner.read();
        inner.commit_hint.min(inner.last_index())
    }
}
