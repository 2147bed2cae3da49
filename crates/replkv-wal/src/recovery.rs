//! WAL recovery with corruption detection and partial-tail truncation.
//!
//! Implements prefix-valid recovery:
//! - Removes leftover `.wal.tmp` files from an interrupted rewrite
//! - Keeps only the newest generation (older ones were superseded by a rename)
//! - Validates CRC32C for each record of that generation
//! - Truncates the first bad record and everything after it

use crate::record::{Record, RecordError};
use crate::segment::{
    is_temp_file, parse_generation, segment_path, sync_dir, SegmentError,
};
use replkv_observe::{Meter, VizEvent, WalEvt, WalKind};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Result of WAL recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryInfo {
    /// Generation that is live after recovery.
    pub generation: u64,
    /// Number of valid records in the live generation.
    pub valid_records: u64,
    /// Bytes dropped from the tail of the live generation.
    pub bytes_truncated: u64,
    /// Whether a torn or corrupt tail was found and truncated.
    pub corruption_detected: bool,
    /// Superseded generations and temp files deleted.
    pub stale_files_removed: u64,
}

/// Recovers a WAL directory in place and reports what was found.
pub async fn recover(
    wal_dir: &Path,
    meter: Arc<dyn Meter>,
    node_id: u32,
) -> Result<RecoveryInfo, SegmentError> {
    let mut generations = Vec::new();
    let mut stale_files_removed = 0;

    let mut entries = tokio::fs::read_dir(wal_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_temp_file(&path) {
            tracing::warn!(path = %path.display(), "Removing incomplete WAL rewrite");
            tokio::fs::remove_file(&path).await?;
            stale_files_removed += 1;
        } else if let Some(generation) = parse_generation(&path) {
            generations.push(generation);
        }
    }
    generations.sort_unstable();

    let live = match generations.pop() {
        Some(g) => g,
        None => {
            return Ok(RecoveryInfo {
                generation: 0,
                valid_records: 0,
                bytes_truncated: 0,
                corruption_detected: false,
                stale_files_removed,
            })
        }
    };

    for old in generations {
        tokio::fs::remove_file(segment_path(wal_dir, old)).await?;
        stale_files_removed += 1;
        meter.emit(VizEvent::Wal(WalEvt {
            node: node_id,
            generation: old,
            kind: WalKind::GenerationGc,
        }));
    }
    if stale_files_removed > 0 {
        sync_dir(wal_dir).await?;
    }

    let path = segment_path(wal_dir, live);
    let buffer = tokio::fs::read(&path).await?;
    let (valid_records, last_valid_offset) = scan_valid_records(&buffer);
    let bytes_truncated = buffer.len() as u64 - last_valid_offset;

    if bytes_truncated > 0 {
        tracing::warn!(
            generation = live,
            valid_records,
            bytes_truncated,
            "Truncating torn WAL tail"
        );
        truncate_segment_atomically(wal_dir, &path, &buffer[..last_valid_offset as usize]).await?;

        meter.emit(VizEvent::Wal(WalEvt {
            node: node_id,
            generation: live,
            kind: WalKind::CorruptionTruncated {
                bytes: bytes_truncated,
            },
        }));
    }

    Ok(RecoveryInfo {
        generation: live,
        valid_records,
        bytes_truncated,
        corruption_detected: bytes_truncated > 0,
        stale_files_removed,
    })
}

/// Scans a buffer for valid records, returning the count and last valid offset.
///
/// Stops scanning when corruption or incomplete records are detected.
pub(crate) fn scan_valid_records(buffer: &[u8]) -> (u64, u64) {
    let mut offset = 0usize;
    let mut valid_records = 0u64;

    while offset < buffer.len() {
        match Record::decode(&buffer[offset..]) {
            Ok((_record, size)) => {
                valid_records += 1;
                offset += size;
            }
            Err(RecordError::Incomplete) => break,
            Err(e) => {
                tracing::debug!(offset, error = %e, "Invalid WAL record");
                break;
            }
        }
    }

    (valid_records, offset as u64)
}

/// Replaces `path` with `valid` via temp file + rename.
///
/// The original file is unchanged if a crash occurs before the rename.
async fn truncate_segment_atomically(
    dir: &Path,
    path: &Path,
    valid: &[u8],
) -> Result<(), SegmentError> {
    let temp_path = path.with_extension("wal.tmp");

    let mut temp_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)
        .await?;
    temp_file.write_all(valid).await?;
    temp_file.sync_all().await?;
    drop(temp_file);

    tokio::fs::rename(&temp_path, path).await?;
    sync_dir(dir).await?;

    Ok(())
}
