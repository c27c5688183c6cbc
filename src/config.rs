//! Storage configuration.
//!
//! [`StorageConfig`] gathers every tunable of the storage core. It derives
//! serde so embedding applications can load it from their own configuration
//! format; the `sbtreedb` binary fills it from command line flags.

use crate::storage::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default size of a WAL segment file (64MB).
pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default number of page frames held by the read cache.
pub const DEFAULT_CACHE_PAGES: usize = 4096;

/// Smallest accepted WAL segment size.
pub const MIN_WAL_SEGMENT_SIZE: u64 = 4096;

/// Name of the WAL directory inside the data directory.
pub const WAL_DIR_NAME: &str = "wal";

/// When appended WAL records are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Every append is flushed and synced before it returns.
    Sync,
    /// The log is flushed and synced when an atomic unit ends.
    Group,
    /// A background thread flushes the log on a fixed interval.
    Periodic { interval_ms: u64 },
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy::Group
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalSettings {
    /// Size at which the log rolls over to a new segment file.
    pub segment_size: u64,
    pub flush_policy: FlushPolicy,
}

impl Default for WalSettings {
    fn default() -> Self {
        WalSettings {
            segment_size: DEFAULT_WAL_SEGMENT_SIZE,
            flush_policy: FlushPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding page files, the file registry and the WAL.
    pub data_dir: PathBuf,
    pub wal: WalSettings,
    /// Number of page frames the read cache may hold.
    pub cache_pages: usize,
    /// Interval of the background fuzzy checkpoint, if any.
    pub checkpoint_interval_ms: Option<u64>,
    /// Take an exclusive lock on the data directory while open.
    pub file_lock: bool,
    /// Verify page checksums when pages are read from disk.
    pub verify_checksums: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: PathBuf::from("./sbtreedb_data"),
            wal: WalSettings::default(),
            cache_pages: DEFAULT_CACHE_PAGES,
            checkpoint_interval_ms: None,
            file_lock: true,
            verify_checksums: true,
        }
    }
}

impl StorageConfig {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        StorageConfig {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn with_flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.wal.flush_policy = policy;
        self
    }

    pub fn with_segment_size(mut self, segment_size: u64) -> Self {
        self.wal.segment_size = segment_size;
        self
    }

    pub fn with_cache_pages(mut self, cache_pages: usize) -> Self {
        self.cache_pages = cache_pages;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Option<Duration>) -> Self {
        self.checkpoint_interval_ms = interval.map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_file_lock(mut self, file_lock: bool) -> Self {
        self.file_lock = file_lock;
        self
    }

    pub fn with_verify_checksums(mut self, verify_checksums: bool) -> Self {
        self.verify_checksums = verify_checksums;
        self
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join(WAL_DIR_NAME)
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        self.checkpoint_interval_ms.map(Duration::from_millis)
    }

    /// Reject settings the storage core cannot run with.
    pub fn validate(&self) -> StorageResult<()> {
        if self.cache_pages < 16 {
            return Err(StorageError::InvalidConfig(format!(
                "cache_pages must be at least 16, got {}",
                self.cache_pages
            )));
        }
        if self.wal.segment_size < MIN_WAL_SEGMENT_SIZE {
            return Err(StorageError::InvalidConfig(format!(
                "wal.segment_size must be at least {}, got {}",
                MIN_WAL_SEGMENT_SIZE, self.wal.segment_size
            )));
        }
        if let FlushPolicy::Periodic { interval_ms: 0 } = self.wal.flush_policy {
            return Err(StorageError::InvalidConfig(
                "periodic flush interval must be positive".to_string(),
            ));
        }
        if self.checkpoint_interval_ms == Some(0) {
            return Err(StorageError::InvalidConfig(
                "checkpoint interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
