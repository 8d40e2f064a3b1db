//! Append-only backup file of binary-encoded SOL objects.
//!
//! The file is a plain concatenation of framed records.  The file
//! publisher is the sole writer; the resend path reads it back with
//! [`scan_range`].  A partially written final record (power loss mid
//! append) is tolerated on read: the scan stops at the truncated tail.

use crate::bin_codec::{self, CodecError};
use crate::object::SolObject;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

// ---------------------------------------------------------------------------
// Append
// ---------------------------------------------------------------------------

/// Append `objects` to the backup file at `path`, in order.
///
/// Creates the file if it does not exist.  The write is buffered and
/// flushed before returning; either all records land or an error is
/// returned (a torn final record is possible on crash and handled by
/// the scanner).
pub fn append(path: &Path, objects: &[SolObject]) -> Result<(), BackupError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| BackupError::Io(format!("opening '{}': {}", path.display(), e)))?;
    let mut writer = BufWriter::new(file);
    for obj in objects {
        let bytes = bin_codec::encode(obj)?;
        writer
            .write_all(&bytes)
            .map_err(|e| BackupError::Io(format!("appending to '{}': {}", path.display(), e)))?;
    }
    writer
        .flush()
        .map_err(|e| BackupError::Io(format!("flushing '{}': {}", path.display(), e)))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

/// Read every stored object with `start <= timestamp <= end`, in file
/// order.
///
/// A missing file yields an empty result (nothing was ever written).  A
/// truncated final record ends the scan; corrupt data mid-file is an
/// error.
pub fn scan_range(path: &Path, start: i64, end: i64) -> Result<Vec<SolObject>, BackupError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(BackupError::Io(format!(
                "reading '{}': {}",
                path.display(),
                e
            )));
        }
    };

    let mut matched = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        match bin_codec::decode(&bytes[offset..]) {
            Ok((obj, consumed)) => {
                if obj.timestamp >= start && obj.timestamp <= end {
                    matched.push(obj);
                }
                offset += consumed;
            }
            Err(e) if e.is_truncated() => break,
            Err(e) => return Err(BackupError::Corrupt { offset, source: e }),
        }
    }
    Ok(matched)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("corrupt record at byte offset {offset}: {source}")]
    Corrupt { offset: usize, source: CodecError },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Mac, SolType};
    use serde_json::json;
    use tempfile::tempdir;

    fn obj(ts: i64) -> SolObject {
        SolObject::new(Mac::ZERO, ts, SolType::RawData, json!({"ts": ts})).unwrap()
    }

    #[test]
    fn scan_of_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.sol");
        assert!(scan_range(&path, 0, i64::MAX).unwrap().is_empty());
    }

    #[test]
    fn append_then_scan_filters_by_inclusive_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.sol");
        let objs: Vec<SolObject> = (1000..1005).map(obj).collect();
        append(&path, &objs).unwrap();

        let hit = scan_range(&path, 1001, 1003).unwrap();
        let ts: Vec<i64> = hit.iter().map(|o| o.timestamp).collect();
        assert_eq!(ts, vec![1001, 1002, 1003]);

        // Full range returns everything in file order.
        assert_eq!(scan_range(&path, 0, i64::MAX).unwrap(), objs);
    }

    #[test]
    fn successive_appends_concatenate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.sol");
        append(&path, &[obj(1), obj(2)]).unwrap();
        append(&path, &[obj(3)]).unwrap();
        let all = scan_range(&path, 0, i64::MAX).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].timestamp, 3);
    }

    #[test]
    fn truncated_tail_is_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.sol");
        append(&path, &[obj(1), obj(2)]).unwrap();

        // Chop a few bytes off the final record.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        let all = scan_range(&path, 0, i64::MAX).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].timestamp, 1);
    }

    #[test]
    fn corrupt_mid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.sol");
        append(&path, &[obj(1), obj(2)]).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = 0x00; // break the first record's magic
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            scan_range(&path, 0, i64::MAX),
            Err(BackupError::Corrupt { offset: 0, .. })
        ));
    }
}
