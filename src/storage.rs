//! Storage layer implementation for sbtreedb.
//!
//! Everything below the access structures lives here:
//!
//! - **Page**: Fixed-size (8KB) blocks with an LSN and checksum header
//! - **WriteCache**: Logical files on disk and the file registry
//! - **ReadCache**: In-memory page frames with LRU eviction and pinning
//! - **WAL**: Segmented write-ahead log of page changes
//! - **Atomic operations**: Bracketed units of page changes, redone as a
//!   whole or not at all

pub mod atomic;
pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;
pub mod wal;
pub mod write_cache;

pub use atomic::{AtomicOperation, AtomicOperationsManager};
pub use buffer::{PageReadGuard, PageWriteGuard, ReadCache};
pub use error::{StorageError, StorageResult};
pub use page::{DurablePage, FileId, PageKey, PAGE_SIZE};
pub use wal::{Lsn, WriteAheadLog};
pub use write_cache::WriteCache;
