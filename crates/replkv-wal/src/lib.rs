//! replkv-wal: append-only write-ahead log with CRC32C framing.
//!
//! The log lives in a single active generation file (`NNNNNN.wal`) inside a
//! directory. Appends go to the end of that file; [`Wal::rewrite`] replaces the
//! whole contents atomically by writing the next generation to a temp file,
//! fsyncing it and renaming it into place. Recovery keeps the longest valid
//! prefix of the newest generation and truncates a torn tail.
//!
//! Higher layers (the Raft log store) decide what a record payload means; this
//! crate only guarantees that every record read back is byte-for-byte what was
//! appended, or is not returned at all.

pub mod record;
pub mod recovery;
pub mod segment;
pub mod wal;

pub use record::{Record, RecordError};
pub use recovery::RecoveryInfo;
pub use segment::{FsyncPolicy, SegmentError};
pub use wal::{Wal, WalConfig};
