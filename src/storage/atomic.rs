//! Atomic operations: groups of page changes that become durable together.
//!
//! Every structural change (a B-tree insert with its splits, a merge, a file
//! creation) runs inside one atomic unit. The unit is bracketed in the WAL by
//! Start and End records; recovery redoes only units whose End record made it
//! to disk. Pages touched by an open unit are held in the cache so that
//! half-finished content is never written to the data files.

use crate::storage::buffer::{Frame, PageWriteGuard, ReadCache};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{DurablePage, FileId, PageChanges, PageKey};
use crate::storage::wal::{Lsn, UnitId, WalRecord, WriteAheadLog};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hands out atomic units and tracks the ones still open.
pub struct AtomicOperationsManager {
    wal: Arc<WriteAheadLog>,
    cache: ReadCache,
    next_unit_id: AtomicU64,
    /// Open units and the LSN of their Start record.
    active: Mutex<BTreeMap<UnitId, Lsn>>,
    /// Page holds of units dropped without being ended.
    abandoned: Mutex<Vec<Arc<Frame>>>,
}

impl AtomicOperationsManager {
    pub fn new(wal: Arc<WriteAheadLog>, cache: ReadCache) -> Self {
        Self {
            wal,
            cache,
            next_unit_id: AtomicU64::new(1),
            active: Mutex::new(BTreeMap::new()),
            abandoned: Mutex::new(Vec::new()),
        }
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    /// Next unit id that will be handed out.
    pub fn next_unit_id(&self) -> UnitId {
        self.next_unit_id.load(Ordering::SeqCst)
    }

    /// Raise the unit id counter, e.g. past the ids found in the log.
    pub fn advance_unit_id(&self, at_least: UnitId) {
        self.next_unit_id.fetch_max(at_least, Ordering::SeqCst);
    }

    /// Open a new atomic unit and log its Start record.
    pub fn start_atomic_unit(self: &Arc<Self>) -> StorageResult<AtomicOperation> {
        let unit_id = self.next_unit_id.fetch_add(1, Ordering::SeqCst);
        let mut active = self.active.lock();
        let start_lsn = self.wal.append(&WalRecord::AtomicUnitStart { unit_id })?;
        active.insert(unit_id, start_lsn);
        drop(active);

        debug!("Started atomic unit {} at {}", unit_id, start_lsn);
        Ok(AtomicOperation {
            unit_id,
            start_lsn,
            manager: Arc::clone(self),
            held: HashMap::new(),
            logged: Vec::new(),
            finished: false,
        })
    }

    /// Start LSN of the oldest unit that has not ended.
    pub fn oldest_active_unit_lsn(&self) -> Option<Lsn> {
        self.active.lock().values().min().copied()
    }

    pub fn active_unit_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Log an operation that changed state outside any atomic unit.
    pub fn log_non_tx_operation(&self) -> StorageResult<Lsn> {
        self.wal.append(&WalRecord::NonTxOperationPerformed)
    }

    /// Number of pages still held by abandoned units.
    pub fn abandoned_holds(&self) -> usize {
        self.abandoned.lock().len()
    }
}

/// Handle of one open atomic unit.
///
/// Consume it with [`AtomicOperation::end`] or [`AtomicOperation::rollback`].
/// Dropping it instead abandons the unit: no End record is written, its pages
/// stay held until the process exits, and recovery discards its changes.
pub struct AtomicOperation {
    unit_id: UnitId,
    start_lsn: Lsn,
    manager: Arc<AtomicOperationsManager>,
    held: HashMap<PageKey, Arc<Frame>>,
    /// Logged change sets in log order, kept for rollback.
    logged: Vec<(PageKey, PageChanges)>,
    finished: bool,
}

impl AtomicOperation {
    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// Log the changes accumulated on `page` since its last capture and stamp
    /// the page with the record's LSN. Returns `None` if nothing changed.
    pub fn log_page_changes(
        &mut self,
        page: &mut DurablePage<'_, PageWriteGuard>,
    ) -> StorageResult<Option<Lsn>> {
        if !page.has_changes() {
            return Ok(None);
        }
        let changes = page.capture_changes();
        let key = page.buffer().key();

        let lsn = self.manager.wal.append(&WalRecord::UpdatePage {
            unit_id: self.unit_id,
            file_id: key.file_id,
            page_index: key.page_index,
            changes: changes.clone(),
        })?;
        page.set_lsn(lsn);
        // The first-dirty LSN is the unit's Start record, so a checkpoint
        // never cuts the log in the middle of a unit that dirtied the page.
        page.buffer().mark_dirty(self.start_lsn);

        if !self.held.contains_key(&key) {
            let frame = self.manager.cache.hold(page.buffer());
            self.held.insert(key, frame);
        }
        self.logged.push((key, changes));
        Ok(Some(lsn))
    }

    /// Log the registration of a new logical file.
    pub fn log_file_created(&mut self, file_name: &str, file_id: FileId) -> StorageResult<Lsn> {
        self.manager.wal.append(&WalRecord::FileCreated {
            unit_id: self.unit_id,
            file_name: file_name.to_string(),
            file_id,
        })
    }

    /// Number of distinct pages this unit has changed.
    pub fn touched_pages(&self) -> usize {
        self.held.len()
    }

    /// Close the unit. Its changes become redoable once the End record is
    /// durable, which the WAL's flush policy decides.
    pub fn end(mut self) -> StorageResult<Lsn> {
        self.finish(false)
    }

    /// Undo every change of the unit in memory and close it as rolled back.
    pub fn rollback(mut self) -> StorageResult<Lsn> {
        for (key, changes) in self.logged.iter().rev() {
            match self.held.get(key) {
                Some(frame) => self.manager.cache.revert_held(frame, changes),
                None => {
                    return Err(StorageError::consistency(format!(
                        "atomic unit {} logged page {} without holding it",
                        self.unit_id, key
                    )))
                }
            }
        }
        debug!(
            "Rolled back {} change set(s) of atomic unit {}",
            self.logged.len(),
            self.unit_id
        );
        self.finish(true)
    }

    fn finish(&mut self, rollback: bool) -> StorageResult<Lsn> {
        let lsn = self.manager.wal.append(&WalRecord::AtomicUnitEnd {
            unit_id: self.unit_id,
            rollback,
        })?;
        self.finished = true;
        self.manager.active.lock().remove(&self.unit_id);
        for (_, frame) in self.held.drain() {
            self.manager.cache.release_hold(&frame, lsn);
        }
        self.logged.clear();
        Ok(lsn)
    }
}

impl Drop for AtomicOperation {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "Atomic unit {} abandoned with {} held page(s); discarded on restart",
                self.unit_id,
                self.held.len()
            );
            self.manager
                .abandoned
                .lock()
                .extend(self.held.drain().map(|(_, frame)| frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlushPolicy;
    use crate::storage::page::{PageRead, PAGE_PAYLOAD_OFFSET};
    use crate::storage::wal::WalConfig;
    use crate::storage::write_cache::WriteCache;
    use anyhow::Result;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        wal: Arc<WriteAheadLog>,
        cache: ReadCache,
        manager: Arc<AtomicOperationsManager>,
        file_id: FileId,
    }

    fn setup() -> Result<Fixture> {
        let dir = tempdir()?;
        let mut config = WalConfig::new(dir.path().join("wal"));
        config.flush_policy = FlushPolicy::Group;
        let wal = WriteAheadLog::open(config)?;
        let write_cache = Arc::new(WriteCache::open(dir.path(), Some(Arc::clone(&wal)), true)?);
        let cache = ReadCache::with_lru(write_cache, 32);
        let file_id = cache.add_file("unit.sbt")?;
        let manager = Arc::new(AtomicOperationsManager::new(Arc::clone(&wal), cache.clone()));
        Ok(Fixture {
            _dir: dir,
            wal,
            cache,
            manager,
            file_id,
        })
    }

    fn write_value(
        op: &mut AtomicOperation,
        guard: &mut PageWriteGuard,
        value: u64,
    ) -> Result<Option<Lsn>> {
        let mut page = DurablePage::new(guard);
        page.set_u64(PAGE_PAYLOAD_OFFSET, value);
        Ok(op.log_page_changes(&mut page)?)
    }

    #[test]
    fn test_unit_brackets_are_logged() -> Result<()> {
        let fx = setup()?;

        let mut op = fx.manager.start_atomic_unit()?;
        let unit_id = op.unit_id();
        let mut guard = fx.cache.allocate_new_page(fx.file_id)?;
        let lsn = write_value(&mut op, &mut guard, 42)?.expect("page changed");
        assert_eq!(guard.lsn(), lsn);
        drop(guard);
        op.end()?;

        let records: Vec<WalRecord> = fx
            .wal
            .iter()?
            .map(|entry| entry.map(|(_, record)| record))
            .collect::<StorageResult<_>>()?;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], WalRecord::AtomicUnitStart { unit_id });
        assert!(matches!(
            &records[1],
            WalRecord::UpdatePage { unit_id: u, page_index: 0, changes, .. }
                if *u == unit_id && changes.len() == 1
        ));
        assert_eq!(
            records[2],
            WalRecord::AtomicUnitEnd {
                unit_id,
                rollback: false
            }
        );

        // Group policy forces the log when the unit ends
        assert_eq!(fx.wal.flushed_lsn(), fx.wal.end_lsn());
        Ok(())
    }

    #[test]
    fn test_unchanged_page_is_not_logged() -> Result<()> {
        let fx = setup()?;

        let mut op = fx.manager.start_atomic_unit()?;
        let mut guard = fx.cache.allocate_new_page(fx.file_id)?;
        assert!(write_value(&mut op, &mut guard, 0)?.is_none());
        assert_eq!(op.touched_pages(), 0);
        drop(guard);
        op.end()?;
        Ok(())
    }

    #[test]
    fn test_held_pages_wait_for_unit_end() -> Result<()> {
        let fx = setup()?;

        let mut op = fx.manager.start_atomic_unit()?;
        {
            let mut guard = fx.cache.allocate_new_page(fx.file_id)?;
            write_value(&mut op, &mut guard, 7)?;
        }
        assert_eq!(fx.cache.flush()?, 0);
        assert_eq!(fx.manager.active_unit_count(), 1);
        assert_eq!(fx.manager.oldest_active_unit_lsn(), Some(op.start_lsn()));

        op.end()?;
        assert_eq!(fx.manager.oldest_active_unit_lsn(), None);
        assert_eq!(fx.cache.flush()?, 1);
        assert_eq!(fx.cache.pinned_pages(), 0);
        Ok(())
    }

    #[test]
    fn test_rollback_restores_page() -> Result<()> {
        let fx = setup()?;

        let key = {
            let mut op = fx.manager.start_atomic_unit()?;
            let mut guard = fx.cache.allocate_new_page(fx.file_id)?;
            write_value(&mut op, &mut guard, 1)?;
            let key = guard.key();
            drop(guard);
            op.end()?;
            key
        };

        let mut op = fx.manager.start_atomic_unit()?;
        {
            let mut guard = fx.cache.load_for_write(key, false)?.expect("page exists");
            write_value(&mut op, &mut guard, 2)?;
            write_value(&mut op, &mut guard, 3)?;
        }
        op.rollback()?;

        let guard = fx.cache.load_for_read(key)?;
        assert_eq!(guard.get_u64(PAGE_PAYLOAD_OFFSET), 1);
        drop(guard);
        assert_eq!(fx.cache.pinned_pages(), 0);
        Ok(())
    }

    #[test]
    fn test_dropped_unit_is_abandoned() -> Result<()> {
        let fx = setup()?;

        let mut op = fx.manager.start_atomic_unit()?;
        {
            let mut guard = fx.cache.allocate_new_page(fx.file_id)?;
            write_value(&mut op, &mut guard, 9)?;
        }
        let start = op.start_lsn();
        drop(op);

        // The page stays held and the unit still bounds WAL truncation
        assert_eq!(fx.manager.abandoned_holds(), 1);
        assert_eq!(fx.cache.pinned_pages(), 1);
        assert_eq!(fx.cache.flush()?, 0);
        assert_eq!(fx.manager.oldest_active_unit_lsn(), Some(start));
        assert_eq!(fx.wal.open_unit_count(), 1);
        Ok(())
    }

    #[test]
    fn test_non_tx_operation_needs_no_unit() -> Result<()> {
        let fx = setup()?;

        let lsn = fx.manager.log_non_tx_operation()?;
        assert_eq!(fx.wal.read(lsn)?, WalRecord::NonTxOperationPerformed);
        assert_eq!(fx.manager.active_unit_count(), 0);
        Ok(())
    }

    #[test]
    fn test_unit_ids_can_be_advanced() -> Result<()> {
        let fx = setup()?;

        fx.manager.advance_unit_id(100);
        let op = fx.manager.start_atomic_unit()?;
        assert_eq!(op.unit_id(), 100);
        op.end()?;
        fx.manager.advance_unit_id(50);
        assert_eq!(fx.manager.next_unit_id(), 101);
        Ok(())
    }
}
