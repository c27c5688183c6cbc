//! WAL segment files.
//!
//! A segment is a flat sequence of framed records. Segment `n` lives in
//! `wal_{n:016}.log`; the byte position of a frame inside its segment is the
//! position half of the record's LSN.

use log::warn;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::record::{Lsn, WalRecord, RECORD_HEADER_SIZE};
use crate::storage::error::{StorageError, StorageResult};

/// WAL file prefix.
const WAL_FILE_PREFIX: &str = "wal_";

/// WAL file extension.
const WAL_FILE_EXTENSION: &str = ".log";

/// File name of the segment with the given index.
pub fn segment_file_name(index: u64) -> String {
    format!("{}{:016}{}", WAL_FILE_PREFIX, index, WAL_FILE_EXTENSION)
}

/// Parse a segment index out of a file name produced by [`segment_file_name`].
pub fn parse_segment_index(name: &str) -> Option<u64> {
    name.strip_prefix(WAL_FILE_PREFIX)?
        .strip_suffix(WAL_FILE_EXTENSION)?
        .parse()
        .ok()
}

/// List the segment indexes present in `dir`, ascending.
pub fn list_segments(dir: &Path) -> StorageResult<Vec<u64>> {
    let mut indexes = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(index) = entry.file_name().to_str().and_then(parse_segment_index) {
            indexes.push(index);
        }
    }
    indexes.sort_unstable();
    Ok(indexes)
}

/// One open segment file.
pub struct WalSegment {
    index: u64,
    path: PathBuf,
    file: File,
    /// Bytes handed to the OS so far.
    len: u64,
}

impl WalSegment {
    /// Create a new, empty segment.
    pub fn create(dir: &Path, index: u64) -> StorageResult<Self> {
        let path = dir.join(segment_file_name(index));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(WalSegment {
            index,
            path,
            file,
            len: 0,
        })
    }

    /// Open an existing segment, validating every frame. A torn tail (a
    /// short frame or a checksum mismatch) is cut off when `repair_tail` is
    /// set; otherwise it is reported as a corrupted record.
    pub fn open(dir: &Path, index: u64, repair_tail: bool) -> StorageResult<Self> {
        let path = dir.join(segment_file_name(index));
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let mut valid_end = 0usize;
        let mut failure = None;
        while valid_end < contents.len() {
            match check_frame(&contents[valid_end..]) {
                Ok(frame_len) => valid_end += frame_len,
                Err(reason) => {
                    failure = Some(reason);
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            if !repair_tail {
                return Err(StorageError::CorruptedRecord {
                    lsn: Lsn::new(index, valid_end as u64),
                    reason: reason.to_string(),
                });
            }
            warn!(
                "Truncating torn WAL tail in {:?} at position {} ({} bytes dropped): {}",
                path,
                valid_end,
                contents.len() - valid_end,
                reason
            );
            file.set_len(valid_end as u64)?;
            file.sync_all()?;
        }

        Ok(WalSegment {
            index,
            path,
            file,
            len: valid_end as u64,
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of bytes written to the segment file.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append raw frame bytes at the end of the segment.
    pub fn write_all(&mut self, data: &[u8]) -> StorageResult<()> {
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(())
    }

    /// Sync the segment to stable storage.
    pub fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Validate the frame at the start of `buf`, returning its total length.
fn check_frame(buf: &[u8]) -> Result<usize, &'static str> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Err("incomplete frame header");
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if len == 0 {
        return Err("zero-length frame");
    }
    let end = RECORD_HEADER_SIZE + len;
    if buf.len() < end {
        return Err("incomplete frame payload");
    }
    if crc32fast::hash(&buf[RECORD_HEADER_SIZE..end]) != crc {
        return Err("frame checksum mismatch");
    }
    Ok(end)
}

/// Read the frame at `lsn` from the segment file at `path`. Returns the
/// decoded record and the total frame length.
pub fn read_frame(path: &Path, lsn: Lsn) -> StorageResult<(WalRecord, u64)> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    file.seek(SeekFrom::Start(lsn.position))?;

    let mut header = [0u8; RECORD_HEADER_SIZE];
    file.read_exact(&mut header).map_err(|_| StorageError::CorruptedRecord {
        lsn,
        reason: "no record at this position".to_string(),
    })?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let remaining = file_len.saturating_sub(lsn.position + RECORD_HEADER_SIZE as u64);
    if len as u64 > remaining {
        return Err(StorageError::CorruptedRecord {
            lsn,
            reason: format!(
                "frame length {} exceeds the {} byte(s) left in the segment",
                len, remaining
            ),
        });
    }
    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)
        .map_err(|_| StorageError::CorruptedRecord {
            lsn,
            reason: "record payload is truncated".to_string(),
        })?;
    if crc32fast::hash(&payload) != crc {
        return Err(StorageError::CorruptedRecord {
            lsn,
            reason: "frame checksum mismatch".to_string(),
        });
    }

    let record = WalRecord::decode(lsn, &payload)?;
    Ok((record, (RECORD_HEADER_SIZE + len) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_segment_file_names() {
        assert_eq!(segment_file_name(1), "wal_0000000000000001.log");
        assert_eq!(parse_segment_index("wal_0000000000000042.log"), Some(42));
        assert_eq!(parse_segment_index("wal_x.log"), None);
        assert_eq!(parse_segment_index("name_id_map.cm"), None);
    }

    #[test]
    fn test_write_and_read_frames() -> StorageResult<()> {
        let dir = tempdir()?;
        let mut segment = WalSegment::create(dir.path(), 1)?;

        let first = WalRecord::AtomicUnitStart { unit_id: 5 };
        let second = WalRecord::NonTxOperationPerformed;
        segment.write_all(&first.encode()?)?;
        let second_pos = segment.len();
        segment.write_all(&second.encode()?)?;
        segment.sync()?;

        let (record, len) = read_frame(segment.path(), Lsn::new(1, 0))?;
        assert_eq!(record, first);
        assert_eq!(len, second_pos);

        let (record, _) = read_frame(segment.path(), Lsn::new(1, second_pos))?;
        assert_eq!(record, second);

        assert_eq!(list_segments(dir.path())?, vec![1]);
        Ok(())
    }

    #[test]
    fn test_read_frame_rejects_oversized_length() -> StorageResult<()> {
        let dir = tempdir()?;
        let mut segment = WalSegment::create(dir.path(), 1)?;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        header[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        segment.write_all(&header)?;
        segment.write_all(&[0u8; 16])?;
        segment.sync()?;

        match read_frame(segment.path(), Lsn::new(1, 0)) {
            Err(StorageError::CorruptedRecord { reason, .. }) => {
                assert!(reason.contains("exceeds"));
            }
            other => panic!("unexpected result: {:?}", other.map(|(record, _)| record)),
        }
        Ok(())
    }

    #[test]
    fn test_open_truncates_torn_tail() -> StorageResult<()> {
        let dir = tempdir()?;
        let valid_len = {
            let mut segment = WalSegment::create(dir.path(), 3)?;
            segment.write_all(&WalRecord::FuzzyCheckpointEnd.encode()?)?;
            let valid_len = segment.len();
            // Half a frame
            let frame = WalRecord::AtomicUnitStart { unit_id: 9 }.encode()?;
            segment.write_all(&frame[..frame.len() - 3])?;
            valid_len
        };

        assert!(WalSegment::open(dir.path(), 3, false).is_err());

        let segment = WalSegment::open(dir.path(), 3, true)?;
        assert_eq!(segment.len(), valid_len);
        assert_eq!(
            std::fs::metadata(dir.path().join(segment_file_name(3)))?.len(),
            valid_len
        );
        Ok(())
    }

    #[test]
    fn test_open_detects_checksum_mismatch() -> StorageResult<()> {
        let dir = tempdir()?;
        {
            let mut segment = WalSegment::create(dir.path(), 1)?;
            let mut frame = WalRecord::AtomicUnitStart { unit_id: 1 }.encode()?;
            let last = frame.len() - 1;
            frame[last] ^= 0x55;
            segment.write_all(&frame)?;
        }

        let segment = WalSegment::open(dir.path(), 1, true)?;
        assert!(segment.is_empty());
        Ok(())
    }
}
