//! Storage layer error types.

use crate::storage::page::PageKey;
use crate::storage::wal::Lsn;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Page not found: {0}")]
    PageNotFound(PageKey),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("Checksum mismatch on page {key}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        key: PageKey,
        stored: u32,
        computed: u32,
    },

    #[error("Corrupted WAL record at {lsn}: {reason}")]
    CorruptedRecord { lsn: Lsn, reason: String },

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Null keys are not supported by tree {0}")]
    NullKeyNotAllowed(String),

    #[error("Entry of {size} bytes exceeds the maximum of {max} bytes")]
    EntryTooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Data directory {0:?} is locked by another process")]
    Locked(PathBuf),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StorageError {
    pub fn consistency(msg: impl Into<String>) -> Self {
        StorageError::ConsistencyViolation(msg.into())
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
