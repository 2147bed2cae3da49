//! Raft snapshot support for log compaction.
//!
//! A snapshot captures the state machine at `last_included_index` together
//! with the membership in effect there. Once a snapshot is durable, log
//! entries it covers can be discarded, and a follower that needs them is
//! sent the snapshot instead (InstallSnapshot).
//!
//! # File format
//!
//! ```text
//! magic "RKVSNAP1" | meta_len: u32 LE | metadata (bincode)
//!                  | data_len: u64 LE | data | crc32c: u32 LE
//! ```
//!
//! The CRC covers every byte before it. A file that fails the check or does
//! not decode is reported as `SnapshotCorrupt`; the node refuses to start on
//! top of it.

use crate::error::{RaftError, Result};
use crate::types::{LogIndex, SnapshotMetadata, Term};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

const MAGIC: &[u8; 8] = b"RKVSNAP1";

/// Complete snapshot (metadata + data).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,

    /// State machine state (serialized)
    pub data: Bytes,
}

impl Snapshot {
    pub fn new(metadata: SnapshotMetadata, data: Bytes) -> Self {
        Self { metadata, data }
    }

    pub fn index(&self) -> LogIndex {
        self.metadata.last_included_index
    }

    /// Serialize to the on-disk format.
    pub fn encode(&self) -> Result<Bytes> {
        let meta = bincode::serialize(&self.metadata)?;
        let mut buf = BytesMut::with_capacity(MAGIC.len() + 16 + meta.len() + self.data.len());
        buf.put_slice(MAGIC);
        buf.put_u32_le(meta.len() as u32);
        buf.put_slice(&meta);
        buf.put_u64_le(self.data.len() as u64);
        buf.put_slice(&self.data);
        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        Ok(buf.freeze())
    }

    /// Parse and verify the on-disk format.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let corrupt = |reason: &str| RaftError::SnapshotCorrupt {
            reason: reason.to_string(),
        };

        if raw.len() < MAGIC.len() + 4 + 8 + 4 {
            return Err(corrupt("file too short"));
        }
        let (body, mut trailer) = raw.split_at(raw.len() - 4);
        let stored = trailer.get_u32_le();
        let actual = crc32c::crc32c(body);
        if stored != actual {
            return Err(RaftError::SnapshotCorrupt {
                reason: format!("crc mismatch: stored {:#x}, computed {:#x}", stored, actual),
            });
        }

        let mut cursor = body;
        if &cursor[..MAGIC.len()] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        cursor.advance(MAGIC.len());

        let meta_len = cursor.get_u32_le() as usize;
        if cursor.len() < meta_len + 8 {
            return Err(corrupt("truncated metadata"));
        }
        let metadata: SnapshotMetadata = bincode::deserialize(&cursor[..meta_len])
            .map_err(|e| corrupt(&format!("metadata: {}", e)))?;
        cursor.advance(meta_len);

        let data_len = cursor.get_u64_le() as usize;
        if cursor.len() != data_len {
            return Err(corrupt("data length mismatch"));
        }

        Ok(Self {
            metadata,
            data: Bytes::copy_from_slice(cursor),
        })
    }
}

/// Directory of snapshot files, newest wins.
///
/// Files are named `snap-{index}-{term}.snap` and written via temp file,
/// fsync and rename, so a crash never leaves a half-written snapshot under
/// its final name. Only the newest `retain` snapshots are kept.
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub async fn open(dir: impl Into<PathBuf>, retain: usize) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                tokio::fs::remove_file(&path).await?;
            }
        }

        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    fn file_name(index: LogIndex, term: Term) -> String {
        format!("snap-{:020}-{:020}.snap", index.0, term.0)
    }

    fn parse_name(path: &Path) -> Option<(LogIndex, Term)> {
        if path.extension()?.to_str()? != "snap" {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let mut parts = stem.strip_prefix("snap-")?.split('-');
        let index = parts.next()?.parse().ok()?;
        let term = parts.next()?.parse().ok()?;
        Some((LogIndex(index), Term(term)))
    }

    /// Snapshot files on disk, oldest first.
    pub async fn list(&self) -> Result<Vec<(LogIndex, Term, PathBuf)>> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some((index, term)) = Self::parse_name(&path) {
                found.push((index, term, path));
            }
        }
        found.sort_by_key(|(index, term, _)| (*index, *term));
        Ok(found)
    }

    /// Durably store `snapshot` and prune older ones.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let meta = &snapshot.metadata;
        let name = Self::file_name(meta.last_included_index, meta.last_included_term);
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{}.tmp", name));

        let encoded = snapshot.encode()?;
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .await?;
        f.write_all(&encoded).await?;
        f.sync_all().await?;
        drop(f);

        tokio::fs::rename(&tmp, &path).await?;
        #[cfg(unix)]
        tokio::fs::File::open(&self.dir).await?.sync_all().await?;

        self.prune().await?;
        Ok(path)
    }

    async fn prune(&self) -> Result<()> {
        let all = self.list().await?;
        if all.len() > self.retain {
            for (index, _, path) in &all[..all.len() - self.retain] {
                tracing::debug!(index = %index, "Removing old snapshot");
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }

    /// Load the newest snapshot, verifying its checksum.
    pub async fn latest(&self) -> Result<Option<Snapshot>> {
        let Some((_, _, path)) = self.list().await?.pop() else {
            return Ok(None);
        };
        let raw = tokio::fs::read(&path).await?;
        let snapshot = Snapshot::decode(&raw).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Snapshot failed verification");
            e
        })?;
        Ok(Some(snapshot))
    }
}
