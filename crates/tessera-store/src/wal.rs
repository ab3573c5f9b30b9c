//! Write-ahead log and snapshot encoding.
//!
//! Each committed transaction appends one record:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────┐
//! │ Length (4 B) │ CRC32 (4 B)  │ bincode Vec<WalOp>   │
//! └──────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! Replay stops cleanly at a torn tail (a crash mid-append); any other
//! corruption is fatal. The snapshot file is a single record of the same
//! shape holding the full table dump.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{StoreError, StoreResult, Table};

const RECORD_HEADER: usize = 8;

/// A single mutation inside a WAL record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalOp {
    Put {
        table: Table,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: Table,
        key: Vec<u8>,
    },
}

/// Appends one CRC-framed record and syncs it.
pub fn append_record<T: Serialize>(file: &mut File, record: &T) -> StoreResult<()> {
    let payload = bincode::serialize(record).map_err(|e| StoreError::Corrupt {
        offset: 0,
        reason: format!("encode: {e}"),
    })?;
    let mut frame = Vec::with_capacity(RECORD_HEADER + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    file.write_all(&frame)?;
    file.sync_data()?;
    Ok(())
}

/// Reads every record in `file`, truncating a torn tail in place.
pub fn read_records<T: DeserializeOwned>(file: &mut File) -> StoreResult<Vec<T>> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut bytes)?;

    let mut records = Vec::new();
    let mut pos: usize = 0;
    loop {
        if pos == bytes.len() {
            return Ok(records);
        }
        if bytes.len() - pos < RECORD_HEADER {
            break; // torn header
        }
        let length =
            u32::from_be_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        let checksum = u32::from_be_bytes(bytes[pos + 4..pos + 8].try_into().expect("4 bytes"));
        let body_start = pos + RECORD_HEADER;
        if bytes.len() - body_start < length {
            break; // torn body
        }
        let payload = &bytes[body_start..body_start + length];
        if crc32fast::hash(payload) != checksum {
            // A checksum failure on the *last* record is a torn write;
            // anywhere else it is corruption.
            if body_start + length == bytes.len() {
                break;
            }
            return Err(StoreError::Corrupt {
                offset: pos as u64,
                reason: "checksum mismatch".to_string(),
            });
        }
        let record: T = bincode::deserialize(payload).map_err(|e| StoreError::Corrupt {
            offset: pos as u64,
            reason: format!("decode: {e}"),
        })?;
        records.push(record);
        pos = body_start + length;
    }

    tracing::warn!(offset = pos, "truncating torn tail of write-ahead log");
    file.set_len(pos as u64)?;
    file.sync_data()?;
    file.seek(SeekFrom::End(0))?;
    Ok(records)
}

/// Opens (creating if absent) a log file positioned for appending.
pub fn open_log(path: &Path) -> StoreResult<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    file.seek(SeekFrom::End(0))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ops(n: u8) -> Vec<WalOp> {
        vec![WalOp::Put {
            table: Table::Vars,
            key: vec![n],
            value: vec![n, n],
        }]
    }

    #[test]
    fn append_then_read_back() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("wal.db");
        let mut file = open_log(&path).expect("open");
        append_record(&mut file, &ops(1)).expect("append");
        append_record(&mut file, &ops(2)).expect("append");

        let records: Vec<Vec<WalOp>> = read_records(&mut file).expect("read");
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("wal.db");
        let mut file = open_log(&path).expect("open");
        append_record(&mut file, &ops(1)).expect("append");
        let keep = file.metadata().expect("meta").len();
        append_record(&mut file, &ops(2)).expect("append");

        // Chop the second record in half.
        file.set_len(keep + 5).expect("truncate");

        let records: Vec<Vec<WalOp>> = read_records(&mut file).expect("read");
        assert_eq!(records.len(), 1);
        assert_eq!(file.metadata().expect("meta").len(), keep);
    }

    #[test]
    fn mid_log_corruption_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("wal.db");
        let mut file = open_log(&path).expect("open");
        append_record(&mut file, &ops(1)).expect("append");
        let first_len = file.metadata().expect("meta").len();
        append_record(&mut file, &ops(2)).expect("append");

        // Flip a payload byte inside the first record.
        file.seek(SeekFrom::Start(first_len - 1)).expect("seek");
        file.write_all(&[0xff]).expect("corrupt");

        let err = read_records::<Vec<WalOp>>(&mut file).expect_err("corrupt");
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
