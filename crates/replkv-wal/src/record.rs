//! WAL record format with varint encoding and CRC32C checksumming.
//!
//! Record format:
//! - len: varint (payload length)
//! - payload: bytes[len]
//! - crc32c: u32 (little-endian, over len + payload)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, ErrorKind};
use thiserror::Error;

/// Upper bound on a single payload. Anything larger is treated as corruption.
pub const MAX_RECORD_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("Record too large: {len} bytes")]
    TooLarge { len: u64 },
    #[error("Incomplete record")]
    Incomplete,
}

/// A single framed WAL record. The payload is opaque to the WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub payload: Bytes,
}

impl Record {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Encodes the record into bytes with CRC32C checksum.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 14);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Appends the encoded record to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let start = buf.len();
        encode_varint(buf, self.payload.len() as u64);
        buf.put_slice(&self.payload);
        let crc = crc32c::crc32c(&buf[start..]);
        buf.put_u32_le(crc);
    }

    /// Decodes a record from bytes, validating the CRC32C checksum.
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), RecordError> {
        let mut cursor = data;

        let len = decode_varint(&mut cursor)?;
        if len > MAX_RECORD_SIZE {
            return Err(RecordError::TooLarge { len });
        }
        let len = len as usize;
        if cursor.len() < len + 4 {
            return Err(RecordError::Incomplete);
        }

        let header_len = data.len() - cursor.len();
        let body_end = header_len + len;
        let payload = Bytes::copy_from_slice(&cursor[..len]);
        cursor.advance(len);

        let stored = cursor.get_u32_le();
        let calculated = crc32c::crc32c(&data[..body_end]);
        if stored != calculated {
            return Err(RecordError::CrcMismatch {
                expected: stored,
                actual: calculated,
            });
        }

        Ok((Record { payload }, body_end + 4))
    }
}

/// Encodes a u64 as a varint (LEB128).
fn encode_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a varint (LEB128) from bytes.
fn decode_varint(data: &mut &[u8]) -> Result<u64, RecordError> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        if data.is_empty() {
            return Err(RecordError::Incomplete);
        }

        let byte = data[0];
        data.advance(1);

        if shift >= 64 {
            return Err(io::Error::new(ErrorKind::InvalidData, "varint overflow").into());
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
    }

    Ok(result)
}
