//! Checkpoint management for recovery.
//!
//! Implements fuzzy checkpointing, which lets atomic units keep running while
//! dirty pages are written out. A checkpoint ends by persisting a
//! [`MasterRecord`] that tells the next startup where recovery begins, and
//! by truncating the log below that point.

use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::storage::atomic::AtomicOperationsManager;
use crate::storage::error::StorageResult;
use crate::storage::wal::{Lsn, UnitId, WalRecord};

/// Name of the master record inside the data directory.
pub const MASTER_RECORD_FILE: &str = "checkpoint.master";

/// Durable result of the last completed checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRecord {
    /// LSN recovery starts scanning from.
    pub checkpoint_lsn: Lsn,
    /// Unit id counter at checkpoint time, so ids are never reused across
    /// restarts even after the log holding them is truncated.
    pub next_unit_id: UnitId,
}

impl MasterRecord {
    /// Read the master record of `data_dir`, if a checkpoint ever completed.
    pub fn read(data_dir: &Path) -> StorageResult<Option<Self>> {
        let path = data_dir.join(MASTER_RECORD_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let record = bincode::deserialize_from(BufReader::new(File::open(path)?))?;
        Ok(Some(record))
    }

    /// Replace the master record atomically: write a temporary file, sync it
    /// and rename it over the old one.
    pub fn write(&self, data_dir: &Path) -> StorageResult<()> {
        let path = data_dir.join(MASTER_RECORD_FILE);
        let tmp_path = path.with_extension("master.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&bincode::serialize(self)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

/// Statistics of one checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointStats {
    /// LSN of the Fuzzy-Checkpoint-Start record.
    pub start_lsn: Lsn,
    /// Where the next recovery begins.
    pub cut_lsn: Lsn,
    pub pages_flushed: usize,
    pub segments_removed: usize,
}

/// Checkpoint manager handles creating checkpoints and the master record.
pub struct CheckpointManager {
    data_dir: PathBuf,
    atomic: Arc<AtomicOperationsManager>,
    /// Held for the duration of a checkpoint.
    running: Mutex<()>,
    last: Mutex<Option<MasterRecord>>,
}

impl CheckpointManager {
    pub fn new(data_dir: impl AsRef<Path>, atomic: Arc<AtomicOperationsManager>) -> Self {
        CheckpointManager {
            data_dir: data_dir.as_ref().to_path_buf(),
            atomic,
            running: Mutex::new(()),
            last: Mutex::new(None),
        }
    }

    /// Master record written by the last checkpoint of this instance, or
    /// read from disk.
    pub fn last_master_record(&self) -> StorageResult<Option<MasterRecord>> {
        let mut last = self.last.lock();
        if last.is_none() {
            *last = MasterRecord::read(&self.data_dir)?;
        }
        Ok(*last)
    }

    /// Write dirty pages out and move the recovery start forward.
    ///
    /// The cut is the Start of the oldest open unit, or the end of the log,
    /// lowered to the first-dirty LSN of every page still dirty after the
    /// flush (pages held by open units).
    pub fn make_fuzzy_checkpoint(&self) -> StorageResult<CheckpointStats> {
        let _running = self.running.lock();
        let wal = self.atomic.wal();
        let cache = self.atomic.cache();

        let end = wal.end_lsn();
        let mut cut = self
            .atomic
            .oldest_active_unit_lsn()
            .map_or(end, |oldest| oldest.min(end));

        let start_lsn = wal.append(&WalRecord::FuzzyCheckpointStart {
            flushed_lsn: wal.flushed_lsn(),
        })?;
        debug!("Fuzzy checkpoint started at {}", start_lsn);

        wal.flush()?;
        let pages_flushed = cache.flush()?;
        cache.write_cache().sync()?;
        if let Some(min_dirty) = cache.min_dirty_lsn() {
            cut = cut.min(min_dirty);
        }

        wal.append(&WalRecord::FuzzyCheckpointEnd)?;
        wal.flush()?;

        let record = MasterRecord {
            checkpoint_lsn: cut,
            next_unit_id: self.atomic.next_unit_id(),
        };
        record.write(&self.data_dir)?;
        *self.last.lock() = Some(record);

        let segments_removed = wal.cut_till(cut)?;
        info!(
            "Fuzzy checkpoint complete: {} page(s) flushed, recovery starts at {}",
            pages_flushed, cut
        );
        Ok(CheckpointStats {
            start_lsn,
            cut_lsn: cut,
            pages_flushed,
            segments_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlushPolicy;
    use crate::storage::buffer::ReadCache;
    use crate::storage::page::{DurablePage, PageKey, PAGE_PAYLOAD_OFFSET};
    use crate::storage::wal::{WalConfig, WriteAheadLog};
    use crate::storage::write_cache::WriteCache;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_master_record_round_trip() -> Result<()> {
        let dir = tempdir()?;
        assert_eq!(MasterRecord::read(dir.path())?, None);

        let record = MasterRecord {
            checkpoint_lsn: Lsn::new(3, 128),
            next_unit_id: 77,
        };
        record.write(dir.path())?;
        assert_eq!(MasterRecord::read(dir.path())?, Some(record));
        assert!(!dir.path().join("checkpoint.master.tmp").exists());
        Ok(())
    }

    #[test]
    fn test_checkpoint_flushes_and_truncates() -> Result<()> {
        let dir = tempdir()?;
        let mut config = WalConfig::new(dir.path().join("wal"));
        config.flush_policy = FlushPolicy::Group;
        config.segment_size = 4096;
        let wal = WriteAheadLog::open(config)?;
        let write_cache = Arc::new(WriteCache::open(dir.path(), Some(Arc::clone(&wal)), true)?);
        let cache = ReadCache::with_lru(write_cache, 32);
        let atomic = Arc::new(AtomicOperationsManager::new(Arc::clone(&wal), cache.clone()));
        let file_id = cache.add_file("checkpointed.sbt")?;

        for value in 0..50u64 {
            let mut op = atomic.start_atomic_unit()?;
            {
                let mut guard = cache
                    .load_for_write(PageKey::new(file_id, value % 4), true)?
                    .expect("allocated");
                let mut page = DurablePage::new(&mut guard);
                page.set_u64(PAGE_PAYLOAD_OFFSET + 64 * (value as usize % 8), value + 1);
                op.log_page_changes(&mut page)?;
            }
            op.end()?;
        }
        assert!(wal.segments().len() > 1);
        assert!(cache.dirty_pages() > 0);

        let manager = CheckpointManager::new(dir.path(), Arc::clone(&atomic));
        let stats = manager.make_fuzzy_checkpoint()?;
        assert_eq!(stats.pages_flushed, 4);
        assert!(stats.segments_removed > 0);
        assert_eq!(cache.dirty_pages(), 0);
        assert!(stats.cut_lsn <= stats.start_lsn);

        let record = MasterRecord::read(dir.path())?.expect("master record");
        assert_eq!(record.checkpoint_lsn, stats.cut_lsn);
        assert_eq!(record.next_unit_id, atomic.next_unit_id());
        Ok(())
    }

    #[test]
    fn test_open_unit_holds_back_the_cut() -> Result<()> {
        let dir = tempdir()?;
        let wal = WriteAheadLog::open(WalConfig::new(dir.path().join("wal")))?;
        let write_cache = Arc::new(WriteCache::open(dir.path(), Some(Arc::clone(&wal)), true)?);
        let cache = ReadCache::with_lru(write_cache, 32);
        let atomic = Arc::new(AtomicOperationsManager::new(Arc::clone(&wal), cache.clone()));
        let file_id = cache.add_file("held.sbt")?;

        let mut op = atomic.start_atomic_unit()?;
        {
            let mut guard = cache
                .load_for_write(PageKey::new(file_id, 0), true)?
                .expect("allocated");
            let mut page = DurablePage::new(&mut guard);
            page.set_u64(PAGE_PAYLOAD_OFFSET, 1);
            op.log_page_changes(&mut page)?;
        }

        let manager = CheckpointManager::new(dir.path(), Arc::clone(&atomic));
        let stats = manager.make_fuzzy_checkpoint()?;
        assert_eq!(stats.pages_flushed, 0);
        assert_eq!(stats.cut_lsn, op.start_lsn());
        assert_eq!(cache.dirty_pages(), 1);

        let unit_start = op.start_lsn();
        op.end()?;
        let stats = manager.make_fuzzy_checkpoint()?;
        assert_eq!(stats.pages_flushed, 1);
        assert!(stats.cut_lsn > unit_start);
        assert_eq!(
            manager.last_master_record()?.map(|r| r.checkpoint_lsn),
            Some(stats.cut_lsn)
        );
        Ok(())
    }
}
