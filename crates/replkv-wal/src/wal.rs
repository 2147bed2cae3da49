//! High-level WAL (Write-Ahead Log) API.
//!
//! Provides append-only logging with automatic recovery, atomic rewrite for
//! compaction, and a configurable durability policy.

use crate::record::Record;
use crate::recovery::{self, RecoveryInfo};
use crate::segment::{segment_path, sync_dir, FsyncPolicy, SegmentError, SegmentFile};
use bytes::BytesMut;
use replkv_observe::{obs_count, Meter, NoopMeter, VizEvent, WalEvt, WalKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Configuration for the WAL.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the WAL generation files.
    pub dir: PathBuf,
    /// Fsync policy for durability (default: Always).
    pub fsync_policy: FsyncPolicy,
    /// Node ID for observability events.
    pub node_id: u32,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("wal"),
            fsync_policy: FsyncPolicy::Always,
            node_id: 0,
        }
    }
}

impl WalConfig {
    fn validate(&self) -> Result<(), SegmentError> {
        if self.dir.as_os_str().is_empty() {
            return Err(SegmentError::InvalidConfig(
                "WAL directory must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Write-Ahead Log with automatic recovery and atomic rewrite.
///
/// # Example
///
/// ```no_run
/// use replkv_wal::{Record, Wal, WalConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (wal, _recovery_info) = Wal::open(WalConfig::default()).await?;
///
///     wal.append(&Record::new("SET user_id 12345")).await?;
///     wal.sync().await?;
///
///     for record in wal.read_all().await? {
///         println!("{} bytes", record.payload.len());
///     }
///     Ok(())
/// }
/// ```
pub struct Wal {
    current: Mutex<SegmentFile>,
    config: WalConfig,
    meter: Arc<dyn Meter>,
}

impl Wal {
    /// Opens a WAL, performing recovery if needed.
    pub async fn open(config: WalConfig) -> Result<(Self, RecoveryInfo), SegmentError> {
        Self::open_with_meter(config, Arc::new(NoopMeter)).await
    }

    /// Opens a WAL with a custom observability meter.
    pub async fn open_with_meter(
        config: WalConfig,
        meter: Arc<dyn Meter>,
    ) -> Result<(Self, RecoveryInfo), SegmentError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.dir).await?;

        let recovery_info = recovery::recover(&config.dir, meter.clone(), config.node_id).await?;
        let current = SegmentFile::open_append(&config.dir, recovery_info.generation).await?;

        tracing::debug!(
            dir = %config.dir.display(),
            generation = recovery_info.generation,
            records = recovery_info.valid_records,
            created = current.created,
            "WAL opened"
        );

        Ok((
            Self {
                current: Mutex::new(current),
                config,
                meter,
            },
            recovery_info,
        ))
    }

    /// Appends a record. Returns the end offset within the live generation.
    pub async fn append(&self, record: &Record) -> Result<u64, SegmentError> {
        self.append_batch(std::slice::from_ref(record)).await
    }

    /// Appends a batch of records with a single write (and a single fsync
    /// under [`FsyncPolicy::Always`]).
    pub async fn append_batch(&self, records: &[Record]) -> Result<u64, SegmentError> {
        let mut buf = BytesMut::new();
        for record in records {
            record.encode_into(&mut buf);
        }

        let mut current = self.current.lock().await;
        current.write(&buf).await?;
        obs_count!(self.meter, "wal_records_appended", &[], records.len());

        if self.config.fsync_policy == FsyncPolicy::Always {
            self.sync_locked(&mut current).await?;
        }
        Ok(current.size)
    }

    /// Syncs all appended data to disk (fsync).
    pub async fn sync(&self) -> Result<(), SegmentError> {
        let mut current = self.current.lock().await;
        self.sync_locked(&mut current).await
    }

    async fn sync_locked(&self, current: &mut SegmentFile) -> Result<(), SegmentError> {
        let start = Instant::now();
        current.sync().await?;
        self.meter.emit(VizEvent::Wal(WalEvt {
            node: self.config.node_id,
            generation: current.generation,
            kind: WalKind::Fsync {
                ms: start.elapsed().as_millis() as u32,
            },
        }));
        Ok(())
    }

    /// Reads every record of the live generation, in append order.
    pub async fn read_all(&self) -> Result<Vec<Record>, SegmentError> {
        let current = self.current.lock().await;
        let buffer = tokio::fs::read(&current.path).await?;

        let mut records = Vec::new();
        let mut offset = 0;
        while offset < buffer.len() {
            let (record, used) = Record::decode(&buffer[offset..])?;
            records.push(record);
            offset += used;
        }
        Ok(records)
    }

    /// Atomically replaces the whole log with `records`.
    ///
    /// The records are written to the next generation, which is fsynced and
    /// renamed into place before the previous generation is deleted. Readers
    /// and appenders are blocked for the duration.
    pub async fn rewrite(&self, records: &[Record]) -> Result<(), SegmentError> {
        let mut buf = BytesMut::new();
        for record in records {
            record.encode_into(&mut buf);
        }

        let mut current = self.current.lock().await;
        let old_generation = current.generation;
        let next = SegmentFile::create_atomically(&self.config.dir, old_generation + 1, &buf).await?;
        *current = next;

        tokio::fs::remove_file(segment_path(&self.config.dir, old_generation)).await?;
        sync_dir(&self.config.dir).await?;

        self.meter.emit(VizEvent::Wal(WalEvt {
            node: self.config.node_id,
            generation: current.generation,
            kind: WalKind::Rewrite {
                bytes: buf.len() as u64,
            },
        }));
        self.meter.emit(VizEvent::Wal(WalEvt {
            node: self.config.node_id,
            generation: old_generation,
            kind: WalKind::GenerationGc,
        }));
        tracing::debug!(
            generation = current.generation,
            records = records.len(),
            bytes = buf.len(),
            "WAL rewritten"
        );
        Ok(())
    }

    /// Generation number of the live file.
    pub async fn generation(&self) -> u64 {
        self.current.lock().await.generation
    }

    /// Returns the WAL configuration.
    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Syncs and closes the WAL.
    pub async fn close(self) -> Result<(), SegmentError> {
        self.sync().await
    }
}
