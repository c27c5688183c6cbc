//! Redo recovery.
//!
//! Recovery makes two passes over the log, starting at the checkpoint LSN
//! from the master record (or the beginning of the log):
//!
//! 1. Analysis: find out which atomic units were ended without rollback.
//! 2. Redo: in log order, replay the File-Created and Update-Page records of
//!    those units onto the page files.
//!
//! Units without an End record, and units ended with rollback, contribute
//! nothing. Replaying a unit rewrites after-images only, so running recovery
//! twice over the same log gives the same pages.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::storage::buffer::ReadCache;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{DurablePage, FileId, PageChanges, PageKey};
use crate::storage::wal::{Lsn, UnitId, WalRecord, WriteAheadLog};

/// Maps a logged file name to the name it is restored under.
pub type FileNameMapper = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Recovery statistics.
#[derive(Debug, Default, Clone)]
pub struct RecoveryStats {
    /// Number of records read by the analysis pass.
    pub records_analyzed: usize,
    /// Number of File-Created and Update-Page records replayed.
    pub records_redone: usize,
    /// Files registered by the redo pass.
    pub files_created: usize,
    pub units_committed: usize,
    pub units_rolled_back: usize,
    /// Units with no End record in the log.
    pub units_discarded: usize,
    /// End and body records of units whose Start lies before the scan.
    pub orphan_records: usize,
    /// Largest unit id seen in the scanned log.
    pub max_unit_id: UnitId,
    /// Where the scan started; `None` for an empty log.
    pub start_lsn: Option<Lsn>,
}

impl RecoveryStats {
    /// Whether the redo pass changed any page or file.
    pub fn replayed_anything(&self) -> bool {
        self.records_redone > 0
    }
}

/// Outcome of one incarnation of a unit, keyed by its Start record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    Open,
    Ended { rollback: bool },
}

pub struct Recovery {
    wal: Arc<WriteAheadLog>,
    cache: ReadCache,
    file_name_mapper: Option<FileNameMapper>,
}

impl Recovery {
    pub fn new(wal: Arc<WriteAheadLog>, cache: ReadCache) -> Self {
        Recovery {
            wal,
            cache,
            file_name_mapper: None,
        }
    }

    /// Restore files under different names, e.g. to rebuild a tree next to
    /// the one that wrote the log.
    pub fn with_file_name_mapper(
        mut self,
        mapper: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.file_name_mapper = Some(Box::new(mapper));
        self
    }

    /// Replay the log from `from`, or from its first record.
    pub fn recover(&self, from: Option<Lsn>) -> StorageResult<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        let start = match from {
            Some(lsn) => Some(lsn),
            None => self.wal.begin()?,
        };
        let Some(start) = start else {
            info!("WAL is empty, nothing to recover");
            return Ok(stats);
        };
        stats.start_lsn = Some(start);

        let committed = self.analysis_pass(start, &mut stats)?;
        self.redo_pass(start, &committed, &mut stats)?;

        info!(
            "Recovery from {}: {} analyzed, {} redone, {} committed, {} rolled back, {} discarded",
            start,
            stats.records_analyzed,
            stats.records_redone,
            stats.units_committed,
            stats.units_rolled_back,
            stats.units_discarded
        );
        Ok(stats)
    }

    /// Returns the Start LSNs of the units to redo.
    fn analysis_pass(&self, start: Lsn, stats: &mut RecoveryStats) -> StorageResult<HashSet<Lsn>> {
        // Current incarnation of every unit id seen in the scan
        let mut units: HashMap<UnitId, (Lsn, UnitState)> = HashMap::new();
        let mut committed = HashSet::new();
        let mut orphans: HashSet<UnitId> = HashSet::new();

        for entry in self.wal.iter_from(start) {
            let (lsn, record) = entry.map_err(undecodable)?;
            stats.records_analyzed += 1;
            if let Some(unit_id) = record.unit_id() {
                stats.max_unit_id = stats.max_unit_id.max(unit_id);
            }

            match record {
                WalRecord::AtomicUnitStart { unit_id } => {
                    if let Some((_, UnitState::Open)) = units.get(&unit_id) {
                        return Err(StorageError::consistency(format!(
                            "atomic unit {} started again at {} while still open",
                            unit_id, lsn
                        )));
                    }
                    units.insert(unit_id, (lsn, UnitState::Open));
                }
                WalRecord::AtomicUnitEnd { unit_id, rollback } => match units.get_mut(&unit_id) {
                    Some((start_lsn, state @ UnitState::Open)) => {
                        *state = UnitState::Ended { rollback };
                        if rollback {
                            stats.units_rolled_back += 1;
                        } else {
                            stats.units_committed += 1;
                            committed.insert(*start_lsn);
                        }
                    }
                    Some((_, UnitState::Ended { .. })) => {
                        return Err(StorageError::consistency(format!(
                            "atomic unit {} ended twice, again at {}",
                            unit_id, lsn
                        )));
                    }
                    None => note_orphan(&mut orphans, stats, &record, lsn, unit_id),
                },
                WalRecord::UpdatePage { unit_id, .. } | WalRecord::FileCreated { unit_id, .. } => {
                    match units.get(&unit_id) {
                        Some((_, UnitState::Ended { .. })) => {
                            return Err(StorageError::consistency(format!(
                                "{} record at {} for atomic unit {} after its End record",
                                record.kind(),
                                lsn,
                                unit_id
                            )));
                        }
                        Some((_, UnitState::Open)) => {}
                        None => note_orphan(&mut orphans, stats, &record, lsn, unit_id),
                    }
                }
                WalRecord::NonTxOperationPerformed
                | WalRecord::FuzzyCheckpointStart { .. }
                | WalRecord::FuzzyCheckpointEnd => {}
            }
        }

        stats.units_discarded = units
            .values()
            .filter(|(_, state)| *state == UnitState::Open)
            .count();
        if stats.units_discarded > 0 {
            warn!(
                "Discarding {} atomic unit(s) without an End record",
                stats.units_discarded
            );
        }
        Ok(committed)
    }

    fn redo_pass(
        &self,
        start: Lsn,
        committed: &HashSet<Lsn>,
        stats: &mut RecoveryStats,
    ) -> StorageResult<()> {
        let mut current: HashMap<UnitId, Lsn> = HashMap::new();
        let mut remapped: HashMap<FileId, FileId> = HashMap::new();
        let redoable = |current: &HashMap<UnitId, Lsn>, unit_id: UnitId| {
            current
                .get(&unit_id)
                .is_some_and(|start_lsn| committed.contains(start_lsn))
        };

        for entry in self.wal.iter_from(start) {
            let (lsn, record) = entry.map_err(undecodable)?;
            match record {
                WalRecord::AtomicUnitStart { unit_id } => {
                    current.insert(unit_id, lsn);
                }
                WalRecord::FileCreated {
                    unit_id,
                    file_name,
                    file_id,
                } if redoable(&current, unit_id) => {
                    let restored = self.redo_file_created(&file_name, file_id, stats)?;
                    if restored != file_id {
                        remapped.insert(file_id, restored);
                    }
                    stats.records_redone += 1;
                }
                WalRecord::UpdatePage {
                    unit_id,
                    file_id,
                    page_index,
                    changes,
                } if redoable(&current, unit_id) => {
                    let file_id = remapped.get(&file_id).copied().unwrap_or(file_id);
                    if self.redo_page(PageKey::new(file_id, page_index), &changes)? {
                        stats.records_redone += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Register a logged file unless it exists; returns the id it has now.
    fn redo_file_created(
        &self,
        file_name: &str,
        file_id: FileId,
        stats: &mut RecoveryStats,
    ) -> StorageResult<FileId> {
        let name = match &self.file_name_mapper {
            Some(mapper) => mapper(file_name),
            None => file_name.to_string(),
        };
        if let Some(existing) = self.cache.file_id_by_name(&name) {
            return Ok(existing);
        }

        let write_cache = self.cache.write_cache();
        let restored = if write_cache.native_file_name_by_id(file_id).is_none() {
            self.cache.add_file_with_id(&name, file_id)?
        } else {
            self.cache.add_file(&name)?
        };
        stats.files_created += 1;
        debug!("Recovery registered file {} as {}", name, restored);
        Ok(restored)
    }

    /// Apply after-images to one page. Returns false for pages of files
    /// that no longer exist.
    fn redo_page(&self, key: PageKey, changes: &PageChanges) -> StorageResult<bool> {
        if self
            .cache
            .write_cache()
            .native_file_name_by_id(key.file_id)
            .is_none()
        {
            debug!("Skipping redo of page {} of a deleted file", key);
            return Ok(false);
        }
        let mut guard = self
            .cache
            .load_for_write(key, true)?
            .ok_or(StorageError::PageNotFound(key))?;
        let mut page = DurablePage::new(&mut guard);
        page.restore_changes(changes);
        page.set_lsn(Lsn::NONE);
        page.buffer().mark_dirty(Lsn::NONE);
        Ok(true)
    }
}

/// Count a record of a unit whose Start lies before the scan, warning once
/// per unit. A checkpoint cut inside a unit shows up here.
fn note_orphan(
    orphans: &mut HashSet<UnitId>,
    stats: &mut RecoveryStats,
    record: &WalRecord,
    lsn: Lsn,
    unit_id: UnitId,
) {
    stats.orphan_records += 1;
    if orphans.insert(unit_id) {
        warn!(
            "{} record at {} for atomic unit {} whose Start precedes the scan",
            record.kind(),
            lsn,
            unit_id
        );
    }
}

fn undecodable(err: StorageError) -> StorageError {
    match err {
        StorageError::CorruptedRecord { lsn, reason } => StorageError::consistency(format!(
            "undecodable WAL record at {}: {}",
            lsn, reason
        )),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlushPolicy;
    use crate::storage::atomic::AtomicOperationsManager;
    use crate::storage::page::{PageRead, PAGE_PAYLOAD_OFFSET};
    use crate::storage::wal::WalConfig;
    use crate::storage::write_cache::WriteCache;
    use anyhow::Result;
    use std::path::Path;
    use tempfile::tempdir;

    struct Instance {
        wal: Arc<WriteAheadLog>,
        cache: ReadCache,
        atomic: Arc<AtomicOperationsManager>,
    }

    fn open(dir: &Path) -> Result<Instance> {
        let mut config = WalConfig::new(dir.join("wal"));
        config.flush_policy = FlushPolicy::Group;
        let wal = WriteAheadLog::open(config)?;
        let write_cache = Arc::new(WriteCache::open(dir, Some(Arc::clone(&wal)), true)?);
        let cache = ReadCache::with_lru(write_cache, 32);
        let atomic = Arc::new(AtomicOperationsManager::new(Arc::clone(&wal), cache.clone()));
        Ok(Instance { wal, cache, atomic })
    }

    /// Create `name` with `value` written at the start of page `page_index`,
    /// all in one unit that is ended.
    fn committed_write(db: &Instance, name: &str, page_index: u64, value: u64) -> Result<FileId> {
        let mut op = db.atomic.start_atomic_unit()?;
        let file_id = match db.cache.file_id_by_name(name) {
            Some(file_id) => file_id,
            None => {
                let file_id = db.cache.add_file(name)?;
                op.log_file_created(name, file_id)?;
                file_id
            }
        };
        {
            let mut guard = db
                .cache
                .load_for_write(PageKey::new(file_id, page_index), true)?
                .expect("allocated");
            let mut page = DurablePage::new(&mut guard);
            page.set_u64(PAGE_PAYLOAD_OFFSET, value);
            op.log_page_changes(&mut page)?;
        }
        op.end()?;
        Ok(file_id)
    }

    fn read_value(db: &Instance, file_id: FileId, page_index: u64) -> Result<u64> {
        let guard = db.cache.load_for_read(PageKey::new(file_id, page_index))?;
        Ok(guard.get_u64(PAGE_PAYLOAD_OFFSET))
    }

    #[test]
    fn test_committed_units_are_redone() -> Result<()> {
        let dir = tempdir()?;
        let file_id = {
            let db = open(dir.path())?;
            let file_id = committed_write(&db, "redo.sbt", 0, 11)?;
            committed_write(&db, "redo.sbt", 2, 22)?;
            // Crash: nothing flushed to the page file
            file_id
        };

        let db = open(dir.path())?;
        let stats = Recovery::new(Arc::clone(&db.wal), db.cache.clone()).recover(None)?;
        assert_eq!(stats.units_committed, 2);
        assert_eq!(stats.units_discarded, 0);
        assert_eq!(stats.max_unit_id, 2);
        assert!(stats.replayed_anything());

        assert_eq!(read_value(&db, file_id, 0)?, 11);
        assert_eq!(read_value(&db, file_id, 2)?, 22);
        assert_eq!(db.cache.pinned_pages(), 0);
        Ok(())
    }

    #[test]
    fn test_unterminated_and_rolled_back_units_are_discarded() -> Result<()> {
        let dir = tempdir()?;
        let file_id = {
            let db = open(dir.path())?;
            let file_id = committed_write(&db, "atomic.sbt", 0, 1)?;

            let mut rolled_back = db.atomic.start_atomic_unit()?;
            {
                let mut guard = db
                    .cache
                    .load_for_write(PageKey::new(file_id, 0), false)?
                    .expect("page exists");
                let mut page = DurablePage::new(&mut guard);
                page.set_u64(PAGE_PAYLOAD_OFFSET, 2);
                rolled_back.log_page_changes(&mut page)?;
            }
            rolled_back.rollback()?;

            let mut abandoned = db.atomic.start_atomic_unit()?;
            {
                let mut guard = db
                    .cache
                    .load_for_write(PageKey::new(file_id, 1), true)?
                    .expect("allocated");
                let mut page = DurablePage::new(&mut guard);
                page.set_u64(PAGE_PAYLOAD_OFFSET, 3);
                abandoned.log_page_changes(&mut page)?;
            }
            db.wal.flush()?;
            drop(abandoned);
            file_id
        };

        let db = open(dir.path())?;
        let stats = Recovery::new(Arc::clone(&db.wal), db.cache.clone()).recover(None)?;
        assert_eq!(stats.units_committed, 1);
        assert_eq!(stats.units_rolled_back, 1);
        assert_eq!(stats.units_discarded, 1);

        assert_eq!(read_value(&db, file_id, 0)?, 1);
        assert_eq!(read_value(&db, file_id, 1)?, 0);
        Ok(())
    }

    #[test]
    fn test_redo_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let file_id = {
            let db = open(dir.path())?;
            let file_id = committed_write(&db, "twice.sbt", 0, 5)?;
            committed_write(&db, "twice.sbt", 0, 6)?;
            committed_write(&db, "twice.sbt", 1, 7)?;
            file_id
        };

        let db = open(dir.path())?;
        let recovery = Recovery::new(Arc::clone(&db.wal), db.cache.clone());
        recovery.recover(None)?;
        db.cache.flush()?;
        let first: Vec<u8> = db.cache.load_for_read(PageKey::new(file_id, 0))?.to_vec();

        let stats = recovery.recover(None)?;
        assert_eq!(stats.files_created, 0);
        let second: Vec<u8> = db.cache.load_for_read(PageKey::new(file_id, 0))?.to_vec();
        assert_eq!(first, second);
        assert_eq!(read_value(&db, file_id, 0)?, 6);
        assert_eq!(read_value(&db, file_id, 1)?, 7);
        Ok(())
    }

    #[test]
    fn test_file_name_mapper_restores_under_new_name() -> Result<()> {
        let dir = tempdir()?;
        {
            let db = open(dir.path())?;
            committed_write(&db, "actual.sbt", 0, 42)?;
            db.cache.flush()?;
        }

        let db = open(dir.path())?;
        let stats = Recovery::new(Arc::clone(&db.wal), db.cache.clone())
            .with_file_name_mapper(|name| name.replace("actual", "expected"))
            .recover(None)?;
        assert_eq!(stats.files_created, 1);

        let original = db.cache.file_id_by_name("actual.sbt").expect("original kept");
        let restored = db.cache.file_id_by_name("expected.sbt").expect("restored");
        assert_ne!(original, restored);
        assert_eq!(read_value(&db, restored, 0)?, 42);
        Ok(())
    }

    #[test]
    fn test_duplicate_start_is_fatal() -> Result<()> {
        let dir = tempdir()?;
        {
            let db = open(dir.path())?;
            db.wal.append(&WalRecord::AtomicUnitStart { unit_id: 9 })?;
            db.wal.flush()?;
        }
        {
            // The reopened log no longer knows unit 9 is open
            let db = open(dir.path())?;
            db.wal.append(&WalRecord::AtomicUnitStart { unit_id: 9 })?;
            db.wal.flush()?;
        }

        let db = open(dir.path())?;
        let result = Recovery::new(Arc::clone(&db.wal), db.cache.clone()).recover(None);
        assert!(matches!(result, Err(StorageError::ConsistencyViolation(_))));
        Ok(())
    }

    #[test]
    fn test_restarted_unit_id_is_a_new_unit() -> Result<()> {
        let dir = tempdir()?;
        {
            let db = open(dir.path())?;
            db.wal.append(&WalRecord::AtomicUnitStart { unit_id: 1 })?;
            db.wal.append(&WalRecord::AtomicUnitEnd {
                unit_id: 1,
                rollback: false,
            })?;
            db.wal.append(&WalRecord::AtomicUnitStart { unit_id: 1 })?;
            db.wal.append(&WalRecord::AtomicUnitEnd {
                unit_id: 1,
                rollback: true,
            })?;
        }

        let db = open(dir.path())?;
        let stats = Recovery::new(Arc::clone(&db.wal), db.cache.clone()).recover(None)?;
        assert_eq!(stats.units_committed, 1);
        assert_eq!(stats.units_rolled_back, 1);
        assert!(!stats.replayed_anything());
        Ok(())
    }

    #[test]
    fn test_records_of_units_started_before_the_scan_are_counted() -> Result<()> {
        let dir = tempdir()?;
        let db = open(dir.path())?;
        db.wal.append(&WalRecord::AtomicUnitStart { unit_id: 4 })?;
        let cut = db.wal.append(&WalRecord::NonTxOperationPerformed)?;
        db.wal.append(&WalRecord::FileCreated {
            unit_id: 4,
            file_name: "cut.sbt".to_string(),
            file_id: FileId(5),
        })?;
        db.wal.append(&WalRecord::AtomicUnitEnd {
            unit_id: 4,
            rollback: false,
        })?;
        db.wal.flush()?;

        let stats = Recovery::new(Arc::clone(&db.wal), db.cache.clone()).recover(Some(cut))?;
        assert_eq!(stats.orphan_records, 2);
        assert_eq!(stats.units_committed, 0);
        assert!(!stats.replayed_anything());
        assert!(!db.cache.exists("cut.sbt"));
        Ok(())
    }
}
