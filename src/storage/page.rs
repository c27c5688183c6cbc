//! Page addressing, header layout and typed read access.
//!
//! Every page starts with a fixed header:
//!
//! ```text
//! | magic (8) | crc32 (4) | lsn segment (8) | lsn position (8) | payload ...
//! 0           8           12                20                 28
//! ```
//!
//! The magic number and checksum are stamped by the write cache when a page
//! is written to its file. The LSN is stamped by the atomic operation that
//! produced the page's current content.

pub mod durable;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::Lsn;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use durable::{DurablePage, PageBuffer, PageChange, PageChanges};

pub const PAGE_SIZE: usize = 8192;

pub const MAGIC_NUMBER_OFFSET: usize = 0;
pub const CRC32_OFFSET: usize = 8;
pub const WAL_SEGMENT_OFFSET: usize = 12;
pub const WAL_POSITION_OFFSET: usize = 20;
/// First byte available to page formats built on top of the header.
pub const PAGE_PAYLOAD_OFFSET: usize = 28;

/// "SBTDBPAG"
pub const PAGE_MAGIC: u64 = 0x5342_5444_4250_4147;

/// Identifier of a logical file registered with the write cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Address of a page: the owning file and the page index inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    pub file_id: FileId,
    pub page_index: u64,
}

impl PageKey {
    pub fn new(file_id: FileId, page_index: u64) -> Self {
        Self {
            file_id,
            page_index,
        }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_index)
    }
}

/// Typed little-endian accessors over page bytes.
///
/// Offsets are absolute within the page. Callers are expected to stay inside
/// `PAGE_SIZE`; out-of-range reads panic like slice indexing does.
pub trait PageRead {
    fn page_bytes(&self) -> &[u8];

    fn get_u8(&self, offset: usize) -> u8 {
        self.page_bytes()[offset]
    }

    fn get_u16(&self, offset: usize) -> u16 {
        LittleEndian::read_u16(&self.page_bytes()[offset..offset + 2])
    }

    fn get_u32(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.page_bytes()[offset..offset + 4])
    }

    fn get_i32(&self, offset: usize) -> i32 {
        LittleEndian::read_i32(&self.page_bytes()[offset..offset + 4])
    }

    fn get_u64(&self, offset: usize) -> u64 {
        LittleEndian::read_u64(&self.page_bytes()[offset..offset + 8])
    }

    fn get_i64(&self, offset: usize) -> i64 {
        LittleEndian::read_i64(&self.page_bytes()[offset..offset + 8])
    }

    fn get_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.page_bytes()[offset..offset + len]
    }

    /// LSN of the WAL record that produced the current content.
    fn lsn(&self) -> Lsn {
        Lsn::new(
            self.get_u64(WAL_SEGMENT_OFFSET),
            self.get_u64(WAL_POSITION_OFFSET),
        )
    }
}

impl PageRead for [u8] {
    fn page_bytes(&self) -> &[u8] {
        self
    }
}

impl<T: PageRead + ?Sized> PageRead for &T {
    fn page_bytes(&self) -> &[u8] {
        (**self).page_bytes()
    }
}

impl<T: PageRead + ?Sized> PageRead for &mut T {
    fn page_bytes(&self) -> &[u8] {
        (**self).page_bytes()
    }
}

fn page_crc(buf: &[u8]) -> u32 {
    crc32fast::hash(&buf[WAL_SEGMENT_OFFSET..PAGE_SIZE])
}

/// Writes the magic number and checksum into a page image about to be stored.
pub fn stamp_checksum(buf: &mut [u8]) {
    LittleEndian::write_u64(&mut buf[MAGIC_NUMBER_OFFSET..], PAGE_MAGIC);
    let crc = page_crc(buf);
    LittleEndian::write_u32(&mut buf[CRC32_OFFSET..], crc);
}

/// Checks a page image read from disk. Pages that were never written carry no
/// magic number and are accepted as-is.
pub fn verify_checksum(key: PageKey, buf: &[u8]) -> StorageResult<()> {
    if buf.get_u64(MAGIC_NUMBER_OFFSET) != PAGE_MAGIC {
        return Ok(());
    }
    let stored = buf.get_u32(CRC32_OFFSET);
    let computed = page_crc(buf);
    if stored != computed {
        return Err(StorageError::ChecksumMismatch {
            key,
            stored,
            computed,
        });
    }
    Ok(())
}
