//! On-disk commit log format.
//!
//! ```text
//! | "RDKV" | version: u16 LE | flags: u16 LE |          file header
//! | "RDCM" | len: u32 LE | payload (len bytes) | crc32 | commit record, repeated
//! ```
//!
//! A payload is the CBOR encoding of the [`Op`] list of one transaction.
//! The CRC covers magic, length and payload.

use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// File header magic.
pub const FILE_MAGIC: [u8; 4] = *b"RDKV";

/// Newest file format version this build reads and writes.
pub const FORMAT_VERSION: u16 = 1;

/// Size of the file header.
pub const HEADER_SIZE: usize = 8;

/// Commit record magic.
pub const RECORD_MAGIC: [u8; 4] = *b"RDCM";

/// Bytes a record adds around its payload.
pub const FRAME_OVERHEAD: usize = 12;

/// A single mutation inside a commit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Create a bucket (parents already exist).
    CreateBucket {
        /// Full bucket path.
        path: Vec<String>,
    },
    /// Delete a bucket and everything below it.
    DeleteBucket {
        /// Full bucket path.
        path: Vec<String>,
    },
    /// Store a value under a key.
    Put {
        /// Full bucket path.
        path: Vec<String>,
        /// Key bytes.
        key: Bytes,
        /// Value bytes.
        value: Bytes,
    },
    /// Remove a key.
    Delete {
        /// Full bucket path.
        path: Vec<String>,
        /// Key bytes.
        key: Bytes,
    },
}

/// Encodes the file header.
#[must_use]
pub fn encode_header() -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&FILE_MAGIC);
    header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header
}

/// Validates a file header.
///
/// # Errors
///
/// Returns `InvalidFormat` for a short header or wrong magic and
/// `IncompatibleVersion` for a newer format version.
pub fn check_header(data: &[u8]) -> StorageResult<()> {
    if data.len() < HEADER_SIZE {
        return Err(StorageError::InvalidFormat(format!(
            "file header truncated to {} bytes",
            data.len()
        )));
    }
    if data[0..4] != FILE_MAGIC {
        return Err(StorageError::InvalidFormat(
            "not a reldir database file".into(),
        ));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version > FORMAT_VERSION {
        return Err(StorageError::IncompatibleVersion {
            found: version,
            supported: FORMAT_VERSION,
        });
    }
    Ok(())
}

/// Frames one commit record.
///
/// # Errors
///
/// Returns `Encoding` if the operations cannot be serialized.
pub fn encode_record(ops: &[Op]) -> StorageResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(ops, &mut payload)
        .map_err(|e| StorageError::Encoding(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::Encoding("commit record exceeds 4 GiB".into()))?;

    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&RECORD_MAGIC);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// The result of scanning a commit log.
#[derive(Debug, Default)]
pub struct Replay {
    /// Decoded records, oldest first.
    pub records: Vec<Vec<Op>>,
    /// Length of the valid prefix of the file.
    pub valid_len: u64,
    /// Why the tail past `valid_len` was rejected, if it was.
    pub torn_tail: Option<String>,
}

/// Scans every record after the header.
///
/// A damaged record that runs to the end of the file is a torn write and is
/// reported in `torn_tail`. Damage followed by more data is corruption.
///
/// # Errors
///
/// Returns `Corrupted` for damage that is not at the tail.
pub fn replay(data: &[u8]) -> StorageResult<Replay> {
    check_header(data)?;

    let mut out = Replay {
        valid_len: HEADER_SIZE as u64,
        ..Replay::default()
    };
    let mut offset = HEADER_SIZE;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < FRAME_OVERHEAD {
            out.torn_tail = Some(format!("{} trailing bytes at offset {offset}", rest.len()));
            break;
        }
        if rest[0..4] != RECORD_MAGIC {
            return Err(StorageError::Corrupted(format!(
                "bad record magic at offset {offset}"
            )));
        }
        let len = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let total = len.saturating_add(FRAME_OVERHEAD);
        if total > rest.len() {
            out.torn_tail = Some(format!("record at offset {offset} is incomplete"));
            break;
        }

        let body = &rest[..8 + len];
        let stored = u32::from_le_bytes([
            rest[8 + len],
            rest[9 + len],
            rest[10 + len],
            rest[11 + len],
        ]);
        if compute_crc32(body) != stored {
            if offset + total == data.len() {
                out.torn_tail = Some(format!("checksum mismatch in last record at offset {offset}"));
                break;
            }
            return Err(StorageError::Corrupted(format!(
                "checksum mismatch at offset {offset}"
            )));
        }

        let ops: Vec<Op> = ciborium::from_reader(&rest[8..8 + len]).map_err(|e| {
            StorageError::Corrupted(format!("undecodable record at offset {offset}: {e}"))
        })?;
        out.records.push(ops);
        offset += total;
        out.valid_len = offset as u64;
    }

    Ok(out)
}

/// Computes the CRC32 (IEEE) checksum of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}
