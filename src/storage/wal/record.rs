//! WAL record types and their binary encoding.
//!
//! Every record is framed as `[payload length: u32][crc32: u32][payload]`,
//! where the payload starts with a one-byte tag followed by the record's
//! fields, all little-endian.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{FileId, PageChange, PageChanges};

/// Identifier of an atomic unit.
pub type UnitId = u64;

/// Size of the frame header preceding each record payload.
pub const RECORD_HEADER_SIZE: usize = 8;

/// Log Sequence Number - the address of a record in the log.
///
/// LSNs are ordered first by segment, then by byte position inside the
/// segment. Segments are numbered from 1, so `(0, 0)` never addresses a real
/// record and serves as the "no LSN" sentinel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn {
    pub segment: u64,
    pub position: u64,
}

impl Lsn {
    /// The sentinel LSN.
    pub const NONE: Lsn = Lsn {
        segment: 0,
        position: 0,
    };

    /// Create a new LSN.
    pub fn new(segment: u64, position: u64) -> Self {
        Lsn { segment, position }
    }

    /// Check if this is the sentinel LSN.
    pub fn is_none(&self) -> bool {
        *self == Lsn::NONE
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({}:{})", self.segment, self.position)
    }
}

const TAG_ATOMIC_UNIT_START: u8 = 1;
const TAG_ATOMIC_UNIT_END: u8 = 2;
const TAG_UPDATE_PAGE: u8 = 3;
const TAG_FILE_CREATED: u8 = 4;
const TAG_NON_TX_OPERATION: u8 = 5;
const TAG_FUZZY_CHECKPOINT_START: u8 = 6;
const TAG_FUZZY_CHECKPOINT_END: u8 = 7;

/// A single WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Opens the bracket of an atomic unit.
    AtomicUnitStart { unit_id: UnitId },
    /// Closes the bracket of an atomic unit. Only units closed without
    /// rollback are redone by recovery.
    AtomicUnitEnd { unit_id: UnitId, rollback: bool },
    /// Byte-range changes applied to one page by an atomic unit.
    UpdatePage {
        unit_id: UnitId,
        file_id: FileId,
        page_index: u64,
        changes: PageChanges,
    },
    /// A logical file was registered by an atomic unit.
    FileCreated {
        unit_id: UnitId,
        file_name: String,
        file_id: FileId,
    },
    /// Marker for an operation performed outside any atomic unit.
    NonTxOperationPerformed,
    /// Beginning of a fuzzy checkpoint; `flushed_lsn` is the durable end of
    /// the log when the checkpoint started.
    FuzzyCheckpointStart { flushed_lsn: Lsn },
    /// End of a fuzzy checkpoint.
    FuzzyCheckpointEnd,
}

impl WalRecord {
    /// The atomic unit this record belongs to, if any.
    pub fn unit_id(&self) -> Option<UnitId> {
        match self {
            WalRecord::AtomicUnitStart { unit_id }
            | WalRecord::AtomicUnitEnd { unit_id, .. }
            | WalRecord::UpdatePage { unit_id, .. }
            | WalRecord::FileCreated { unit_id, .. } => Some(*unit_id),
            WalRecord::NonTxOperationPerformed
            | WalRecord::FuzzyCheckpointStart { .. }
            | WalRecord::FuzzyCheckpointEnd => None,
        }
    }

    /// Short human readable name of the record kind.
    pub fn kind(&self) -> &'static str {
        match self {
            WalRecord::AtomicUnitStart { .. } => "AtomicUnitStart",
            WalRecord::AtomicUnitEnd { .. } => "AtomicUnitEnd",
            WalRecord::UpdatePage { .. } => "UpdatePage",
            WalRecord::FileCreated { .. } => "FileCreated",
            WalRecord::NonTxOperationPerformed => "NonTxOperationPerformed",
            WalRecord::FuzzyCheckpointStart { .. } => "FuzzyCheckpointStart",
            WalRecord::FuzzyCheckpointEnd => "FuzzyCheckpointEnd",
        }
    }

    /// Encode the record into a complete frame (header + payload).
    pub fn encode(&self) -> StorageResult<BytesMut> {
        let mut payload = BytesMut::with_capacity(self.estimated_size());
        self.encode_payload(&mut payload)?;

        let mut frame = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
        frame.put_u32_le(payload.len() as u32);
        frame.put_u32_le(crc32fast::hash(&payload));
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    fn estimated_size(&self) -> usize {
        match self {
            WalRecord::UpdatePage { changes, .. } => {
                29 + changes.len() * 8 + changes.payload_size() * 2
            }
            WalRecord::FileCreated { file_name, .. } => 19 + file_name.len(),
            _ => 17,
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) -> StorageResult<()> {
        match self {
            WalRecord::AtomicUnitStart { unit_id } => {
                buf.put_u8(TAG_ATOMIC_UNIT_START);
                buf.put_u64_le(*unit_id);
            }
            WalRecord::AtomicUnitEnd { unit_id, rollback } => {
                buf.put_u8(TAG_ATOMIC_UNIT_END);
                buf.put_u64_le(*unit_id);
                buf.put_u8(u8::from(*rollback));
            }
            WalRecord::UpdatePage {
                unit_id,
                file_id,
                page_index,
                changes,
            } => {
                buf.put_u8(TAG_UPDATE_PAGE);
                buf.put_u64_le(*unit_id);
                buf.put_u64_le(file_id.0);
                buf.put_u64_le(*page_index);
                buf.put_u32_le(changes.len() as u32);
                for change in changes {
                    buf.put_u32_le(change.offset);
                    buf.put_u32_le(change.after.len() as u32);
                    buf.extend_from_slice(&change.after);
                    buf.extend_from_slice(&change.before);
                }
            }
            WalRecord::FileCreated {
                unit_id,
                file_name,
                file_id,
            } => {
                let name_len = u16::try_from(file_name.len()).map_err(|_| {
                    StorageError::Serialization(format!(
                        "file name of {} bytes does not fit a WAL record",
                        file_name.len()
                    ))
                })?;
                buf.put_u8(TAG_FILE_CREATED);
                buf.put_u64_le(*unit_id);
                buf.put_u64_le(file_id.0);
                buf.put_u16_le(name_len);
                buf.extend_from_slice(file_name.as_bytes());
            }
            WalRecord::NonTxOperationPerformed => buf.put_u8(TAG_NON_TX_OPERATION),
            WalRecord::FuzzyCheckpointStart { flushed_lsn } => {
                buf.put_u8(TAG_FUZZY_CHECKPOINT_START);
                buf.put_u64_le(flushed_lsn.segment);
                buf.put_u64_le(flushed_lsn.position);
            }
            WalRecord::FuzzyCheckpointEnd => buf.put_u8(TAG_FUZZY_CHECKPOINT_END),
        }
        Ok(())
    }

    /// Decode a record payload (the bytes following the frame header).
    /// `lsn` is only used to report where a corrupt record was found.
    pub fn decode(lsn: Lsn, payload: &[u8]) -> StorageResult<WalRecord> {
        let mut reader = PayloadReader { buf: payload, lsn };
        let tag = reader.u8()?;
        let record = match tag {
            TAG_ATOMIC_UNIT_START => WalRecord::AtomicUnitStart {
                unit_id: reader.u64()?,
            },
            TAG_ATOMIC_UNIT_END => WalRecord::AtomicUnitEnd {
                unit_id: reader.u64()?,
                rollback: reader.u8()? != 0,
            },
            TAG_UPDATE_PAGE => {
                let unit_id = reader.u64()?;
                let file_id = FileId(reader.u64()?);
                let page_index = reader.u64()?;
                let count = reader.u32()? as usize;
                let mut changes = PageChanges::new();
                for _ in 0..count {
                    let offset = reader.u32()?;
                    let len = reader.u32()? as usize;
                    let after = reader.bytes(len)?;
                    let before = reader.bytes(len)?;
                    changes.push(PageChange {
                        offset,
                        before,
                        after,
                    });
                }
                WalRecord::UpdatePage {
                    unit_id,
                    file_id,
                    page_index,
                    changes,
                }
            }
            TAG_FILE_CREATED => {
                let unit_id = reader.u64()?;
                let file_id = FileId(reader.u64()?);
                let len = reader.u16()? as usize;
                let raw = reader.bytes(len)?;
                let file_name = String::from_utf8(raw)
                    .map_err(|_| reader.corrupted("file name is not valid UTF-8"))?;
                WalRecord::FileCreated {
                    unit_id,
                    file_name,
                    file_id,
                }
            }
            TAG_NON_TX_OPERATION => WalRecord::NonTxOperationPerformed,
            TAG_FUZZY_CHECKPOINT_START => WalRecord::FuzzyCheckpointStart {
                flushed_lsn: Lsn::new(reader.u64()?, reader.u64()?),
            },
            TAG_FUZZY_CHECKPOINT_END => WalRecord::FuzzyCheckpointEnd,
            other => return Err(reader.corrupted(&format!("unknown record tag {}", other))),
        };

        if reader.buf.has_remaining() {
            return Err(reader.corrupted("trailing bytes after record"));
        }
        Ok(record)
    }
}

struct PayloadReader<'a> {
    buf: &'a [u8],
    lsn: Lsn,
}

impl PayloadReader<'_> {
    fn corrupted(&self, reason: &str) -> StorageError {
        StorageError::CorruptedRecord {
            lsn: self.lsn,
            reason: reason.to_string(),
        }
    }

    fn need(&self, n: usize) -> StorageResult<()> {
        if self.buf.remaining() < n {
            return Err(self.corrupted("record payload is truncated"));
        }
        Ok(())
    }

    fn u8(&mut self) -> StorageResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> StorageResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> StorageResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> StorageResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn bytes(&mut self, len: usize) -> StorageResult<Vec<u8>> {
        self.need(len)?;
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_frame(frame: &[u8]) -> WalRecord {
        let len = u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(frame[4..8].try_into().unwrap());
        let payload = &frame[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + len];
        assert_eq!(crc, crc32fast::hash(payload));
        WalRecord::decode(Lsn::new(1, 0), payload).unwrap()
    }

    #[test]
    fn test_lsn_ordering() {
        assert!(Lsn::new(1, 900) < Lsn::new(2, 0));
        assert!(Lsn::new(2, 10) < Lsn::new(2, 11));
        assert!(Lsn::NONE.is_none());
        assert!(Lsn::NONE < Lsn::new(1, 0));
        assert_eq!(Lsn::new(3, 42).to_string(), "LSN(3:42)");
    }

    #[test]
    fn test_update_page_encoding() {
        let changes = PageChanges::from_changes(vec![
            PageChange {
                offset: 28,
                before: vec![0, 0],
                after: vec![1, 2],
            },
            PageChange {
                offset: 8000,
                before: vec![9; 5],
                after: vec![7; 5],
            },
        ]);
        let record = WalRecord::UpdatePage {
            unit_id: 17,
            file_id: FileId(3),
            page_index: 99,
            changes,
        };

        let frame = record.encode().expect("encodable record");
        // tag + unit + file + page + count + 2 * (offset + len) + 2 * (2 + 5) bytes
        assert_eq!(frame.len(), RECORD_HEADER_SIZE + 1 + 8 + 8 + 8 + 4 + 16 + 14);
        assert_eq!(decode_frame(&frame), record);
        assert_eq!(record.unit_id(), Some(17));
    }

    #[test]
    fn test_file_created_and_markers() {
        let records = vec![
            WalRecord::AtomicUnitStart { unit_id: 1 },
            WalRecord::FileCreated {
                unit_id: 1,
                file_name: "index.sbt".to_string(),
                file_id: FileId(12),
            },
            WalRecord::AtomicUnitEnd {
                unit_id: 1,
                rollback: false,
            },
            WalRecord::NonTxOperationPerformed,
            WalRecord::FuzzyCheckpointStart {
                flushed_lsn: Lsn::new(4, 512),
            },
            WalRecord::FuzzyCheckpointEnd,
        ];
        for record in records {
            assert_eq!(decode_frame(&record.encode().expect("encodable record")), record);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let lsn = Lsn::new(2, 64);

        match WalRecord::decode(lsn, &[0xEE]) {
            Err(StorageError::CorruptedRecord { lsn: at, reason }) => {
                assert_eq!(at, lsn);
                assert!(reason.contains("unknown record tag"));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // Truncated unit id
        assert!(WalRecord::decode(lsn, &[TAG_ATOMIC_UNIT_START, 1, 2]).is_err());

        // Trailing bytes
        assert!(WalRecord::decode(lsn, &[TAG_FUZZY_CHECKPOINT_END, 0]).is_err());
    }

    #[test]
    fn test_oversized_file_name_is_rejected() {
        let record = WalRecord::FileCreated {
            unit_id: 1,
            file_name: "n".repeat(u16::MAX as usize + 1),
            file_id: FileId(1),
        };
        assert!(matches!(
            record.encode(),
            Err(StorageError::Serialization(_))
        ));

        let longest = WalRecord::FileCreated {
            unit_id: 1,
            file_name: "n".repeat(u16::MAX as usize),
            file_id: FileId(1),
        };
        let frame = longest.encode().expect("longest name fits");
        assert_eq!(decode_frame(&frame), longest);
    }
}
