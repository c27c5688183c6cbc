use crate::access::btree::{BinarySerializer, KeyType, SBTree};
use crate::config::StorageConfig;
use crate::recovery::{CheckpointManager, CheckpointStats, Recovery, RecoveryStats};
use crate::storage::atomic::AtomicOperationsManager;
use crate::storage::buffer::ReadCache;
use crate::storage::disk::DataDirLock;
use crate::storage::error::StorageResult;
use crate::storage::wal::{WalConfig, WriteAheadLog};
use crate::storage::write_cache::WriteCache;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::fs;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

struct Checkpointer {
    handle: JoinHandle<()>,
    stop: Arc<(Mutex<bool>, Condvar)>,
}

impl Checkpointer {
    fn spawn(checkpoints: Arc<CheckpointManager>, interval: Duration) -> StorageResult<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("checkpointer".to_string())
            .spawn(move || {
                let (lock, cvar) = &*thread_stop;
                let mut stopped = lock.lock();
                while !*stopped {
                    cvar.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                    if let Err(e) = checkpoints.make_fuzzy_checkpoint() {
                        error!("Periodic checkpoint failed: {}", e);
                    }
                }
                debug!("Checkpointer stopped");
            })?;
        Ok(Checkpointer { handle, stop })
    }

    fn stop(self) {
        {
            let (lock, cvar) = &*self.stop;
            *lock.lock() = true;
            cvar.notify_all();
        }
        if self.handle.join().is_err() {
            error!("Checkpointer thread panicked");
        }
    }
}

/// High-level interface that opens every storage layer from one
/// [`StorageConfig`] and recovers it.
///
/// Dropping a `Database` without [`Database::close`] behaves like a crash:
/// nothing is flushed and the next open replays the WAL.
pub struct Database {
    config: StorageConfig,
    wal: Arc<WriteAheadLog>,
    cache: ReadCache,
    atomic: Arc<AtomicOperationsManager>,
    checkpoints: Arc<CheckpointManager>,
    checkpointer: Option<Checkpointer>,
    recovery_stats: RecoveryStats,
    closed: bool,
    // Released last
    _lock: Option<DataDirLock>,
}

impl Database {
    /// Open the data directory, creating it if needed, and replay the WAL
    /// from the last checkpoint.
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        let lock = if config.file_lock {
            Some(DataDirLock::acquire(&config.data_dir)?)
        } else {
            None
        };

        let wal = WriteAheadLog::open(WalConfig::from(&config))?;
        let write_cache = Arc::new(WriteCache::open(
            &config.data_dir,
            Some(Arc::clone(&wal)),
            config.verify_checksums,
        )?);
        let cache = ReadCache::with_lru(write_cache, config.cache_pages);
        let atomic = Arc::new(AtomicOperationsManager::new(
            Arc::clone(&wal),
            cache.clone(),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            &config.data_dir,
            Arc::clone(&atomic),
        ));

        let master = checkpoints.last_master_record()?;
        if let Some(master) = master {
            atomic.advance_unit_id(master.next_unit_id);
        }
        let recovery_stats = Recovery::new(Arc::clone(&wal), cache.clone())
            .recover(master.map(|m| m.checkpoint_lsn))?;
        atomic.advance_unit_id(recovery_stats.max_unit_id + 1);
        if recovery_stats.replayed_anything() {
            checkpoints.make_fuzzy_checkpoint()?;
        }

        let checkpointer = match config.checkpoint_interval() {
            Some(interval) => Some(Checkpointer::spawn(Arc::clone(&checkpoints), interval)?),
            None => None,
        };

        info!("Opened database in {:?}", config.data_dir);
        Ok(Database {
            config,
            wal,
            cache,
            atomic,
            checkpoints,
            checkpointer,
            recovery_stats,
            closed: false,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    pub fn atomic_operations(&self) -> &Arc<AtomicOperationsManager> {
        &self.atomic
    }

    /// What the startup recovery replayed.
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery_stats
    }

    /// Create a new SBTree. `key_types` lists the key's components.
    pub fn create_sbtree<K: Ord + Clone, V: Clone>(
        &self,
        name: &str,
        key_serializer: Arc<dyn BinarySerializer<K>>,
        value_serializer: Arc<dyn BinarySerializer<V>>,
        key_types: &[KeyType],
        nullable: bool,
    ) -> StorageResult<SBTree<K, V>> {
        SBTree::create(
            name,
            Arc::clone(&self.atomic),
            key_serializer,
            value_serializer,
            key_types,
            key_types.len() as u32,
            nullable,
        )
    }

    pub fn open_sbtree<K: Ord + Clone, V: Clone>(
        &self,
        name: &str,
        key_serializer: Arc<dyn BinarySerializer<K>>,
        value_serializer: Arc<dyn BinarySerializer<V>>,
    ) -> StorageResult<SBTree<K, V>> {
        SBTree::load(name, Arc::clone(&self.atomic), key_serializer, value_serializer)
    }

    /// Delete a tree and checkpoint, so that redo never recreates it from
    /// the records that built it.
    pub fn delete_sbtree<K: Ord + Clone, V: Clone>(&self, tree: SBTree<K, V>) -> StorageResult<()> {
        tree.delete()?;
        self.checkpoint()?;
        Ok(())
    }

    pub fn checkpoint(&self) -> StorageResult<CheckpointStats> {
        self.checkpoints.make_fuzzy_checkpoint()
    }

    /// Stop background work, checkpoint and close the WAL.
    pub fn close(mut self) -> StorageResult<()> {
        if let Some(checkpointer) = self.checkpointer.take() {
            checkpointer.stop();
        }
        self.checkpoints.make_fuzzy_checkpoint()?;
        self.cache.close()?;
        self.wal.close()?;
        self.closed = true;
        info!("Closed database in {:?}", self.config.data_dir);
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(checkpointer) = self.checkpointer.take() {
            checkpointer.stop();
        }
        if !self.closed {
            warn!(
                "Database in {:?} dropped without close; the WAL will be replayed on next open",
                self.config.data_dir
            );
        }
    }
}
