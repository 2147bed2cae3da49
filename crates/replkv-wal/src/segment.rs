//! Generation files: naming, append handle, atomic replacement.
//!
//! A WAL directory holds exactly one live generation after recovery.
//! Files are named `{generation:06}.wal`; a generation being written by
//! [`SegmentFile::create_atomically`] lives at `{generation:06}.wal.tmp`
//! until it is fsynced and renamed.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Record error: {0}")]
    Record(#[from] crate::record::RecordError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// When appended records reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// fsync after every append or batch. Nothing acknowledged is ever lost.
    #[default]
    Always,
    /// Leave flushing to the OS; callers issue [`crate::Wal::sync`] themselves
    /// at the points where durability matters.
    Os,
}

pub(crate) fn segment_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{:06}.wal", generation))
}

pub(crate) fn temp_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{:06}.wal.tmp", generation))
}

/// Parses a generation number from a `.wal` file path.
pub(crate) fn parse_generation(path: &Path) -> Option<u64> {
    if path.extension()?.to_str()? != "wal" {
        return None;
    }
    path.file_stem()?.to_str()?.parse::<u64>().ok()
}

pub(crate) fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(".wal.tmp"))
        .unwrap_or(false)
}

/// Fsyncs a directory so that renames and unlinks inside it are durable.
pub(crate) async fn sync_dir(dir: &Path) -> Result<(), SegmentError> {
    #[cfg(unix)]
    {
        let d = File::open(dir).await?;
        d.sync_all().await?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// The open, append-only handle on the live generation.
pub(crate) struct SegmentFile {
    pub(crate) generation: u64,
    pub(crate) path: PathBuf,
    file: File,
    pub(crate) size: u64,
    /// True if this open created the file.
    pub(crate) created: bool,
}

impl SegmentFile {
    /// Opens (creating if missing) a generation file for appending.
    ///
    /// A newly created file has its directory entry fsynced before return,
    /// so records synced into it later cannot vanish with the entry.
    pub(crate) async fn open_append(dir: &Path, generation: u64) -> Result<Self, SegmentError> {
        let path = segment_path(dir, generation);
        let created = !tokio::fs::try_exists(&path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if created {
            sync_dir(dir).await?;
        }
        let size = file.metadata().await?.len();
        Ok(Self {
            generation,
            path,
            file,
            size,
            created,
        })
    }

    /// Writes `contents` as a brand new generation: temp file, fsync, rename,
    /// directory fsync. A crash at any point leaves either the old generation
    /// alone or the complete new one.
    pub(crate) async fn create_atomically(
        dir: &Path,
        generation: u64,
        contents: &[u8],
    ) -> Result<Self, SegmentError> {
        let tmp = temp_path(dir, generation);
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .await?;
        f.write_all(contents).await?;
        f.sync_all().await?;
        drop(f);

        tokio::fs::rename(&tmp, segment_path(dir, generation)).await?;
        sync_dir(dir).await?;

        Self::open_append(dir, generation).await
    }

    pub(crate) async fn write(&mut self, buf: &[u8]) -> Result<(), SegmentError> {
        self.file.write_all(buf).await?;
        // tokio buffers the write in its blocking pool until flushed
        self.file.flush().await?;
        self.size += buf.len() as u64;
        Ok(())
    }

    pub(crate) async fn sync(&mut self) -> Result<(), SegmentError> {
        self.file.sync_data().await?;
        Ok(())
    }
}
