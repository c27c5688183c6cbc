//! On-disk file formats below the cache.

pub mod file_lock;
pub mod paged_file;

pub use file_lock::DataDirLock;
pub use paged_file::{PagedFile, FILE_HEADER_SIZE};
