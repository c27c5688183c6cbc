//! WAL manager implementation.
//!
//! The write-ahead log hands out LSNs, buffers framed records, rolls over to
//! new segment files, forces records to disk according to the configured
//! [`FlushPolicy`], and reads records back for recovery.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use super::record::{Lsn, UnitId, WalRecord};
use super::segment::{list_segments, read_frame, segment_file_name, WalSegment};
use crate::config::{FlushPolicy, StorageConfig};
use crate::storage::error::{StorageError, StorageResult};

/// Size of the in-memory record buffer that triggers a write to the
/// segment file (1MB).
const WAL_BUFFER_SIZE: usize = 1024 * 1024;

/// WAL manager configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory where WAL segments are stored.
    pub wal_dir: PathBuf,
    /// Size at which a new segment is started.
    pub segment_size: u64,
    /// When appended records are forced to disk.
    pub flush_policy: FlushPolicy,
}

impl WalConfig {
    pub fn new(wal_dir: impl AsRef<Path>) -> Self {
        WalConfig {
            wal_dir: wal_dir.as_ref().to_path_buf(),
            segment_size: crate::config::DEFAULT_WAL_SEGMENT_SIZE,
            flush_policy: FlushPolicy::default(),
        }
    }
}

impl From<&StorageConfig> for WalConfig {
    fn from(config: &StorageConfig) -> Self {
        WalConfig {
            wal_dir: config.wal_dir(),
            segment_size: config.wal.segment_size,
            flush_policy: config.wal.flush_policy,
        }
    }
}

/// Mutable log state, guarded by a single mutex so that LSN assignment and
/// buffer order always agree.
struct WalInner {
    /// Segment currently receiving appends.
    current: WalSegment,
    /// Lengths of older segments still on disk.
    sealed: BTreeMap<u64, u64>,
    /// Framed records not yet handed to the segment file.
    buffer: BytesMut,
    /// Atomic units with a Start record and no End record yet.
    open_units: HashSet<UnitId>,
}

impl WalInner {
    fn end_lsn(&self) -> Lsn {
        Lsn::new(
            self.current.index(),
            self.current.len() + self.buffer.len() as u64,
        )
    }

    /// Hand buffered frames to the segment file without syncing.
    fn spill(&mut self) -> StorageResult<()> {
        if !self.buffer.is_empty() {
            self.current.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Path and length of a segment, if it is still on disk.
    fn segment_extent(&self, wal_dir: &Path, index: u64) -> Option<(PathBuf, u64)> {
        if index == self.current.index() {
            return Some((self.current.path().to_path_buf(), self.current.len()));
        }
        self.sealed
            .get(&index)
            .map(|len| (wal_dir.join(segment_file_name(index)), *len))
    }

    /// First non-empty segment with an index greater than `index`.
    fn next_segment_after(&self, index: u64) -> Option<u64> {
        self.sealed
            .range(index + 1..)
            .find(|(_, len)| **len > 0)
            .map(|(idx, _)| *idx)
            .or_else(|| {
                (self.current.index() > index && self.current.len() > 0)
                    .then(|| self.current.index())
            })
    }
}

struct Flusher {
    handle: JoinHandle<()>,
    stop: Arc<(Mutex<bool>, Condvar)>,
}

/// Segmented, append-only write-ahead log.
pub struct WriteAheadLog {
    config: WalConfig,
    inner: Mutex<WalInner>,
    /// All records strictly below this LSN are on stable storage.
    flushed_lsn: RwLock<Lsn>,
    /// LSNs below which truncation is forbidden, with holder counts.
    cut_till_limits: Mutex<BTreeMap<Lsn, usize>>,
    flusher: Mutex<Option<Flusher>>,
}

impl WriteAheadLog {
    /// Open the log in `config.wal_dir`, creating the directory and the first
    /// segment if needed. A torn tail in the last segment is truncated.
    pub fn open(config: WalConfig) -> StorageResult<Arc<Self>> {
        fs::create_dir_all(&config.wal_dir)?;

        let indexes = list_segments(&config.wal_dir)?;
        let mut sealed = BTreeMap::new();
        let current = match indexes.split_last() {
            None => WalSegment::create(&config.wal_dir, 1)?,
            Some((last, older)) => {
                for &index in older {
                    let segment = WalSegment::open(&config.wal_dir, index, false)?;
                    sealed.insert(index, segment.len());
                }
                WalSegment::open(&config.wal_dir, *last, true)?
            }
        };

        let end = Lsn::new(current.index(), current.len());
        info!(
            "Opened WAL in {:?}: {} segment(s), end of log at {}",
            config.wal_dir,
            sealed.len() + 1,
            end
        );

        let wal = Arc::new(WriteAheadLog {
            inner: Mutex::new(WalInner {
                current,
                sealed,
                buffer: BytesMut::with_capacity(WAL_BUFFER_SIZE),
                open_units: HashSet::new(),
            }),
            flushed_lsn: RwLock::new(end),
            cut_till_limits: Mutex::new(BTreeMap::new()),
            flusher: Mutex::new(None),
            config,
        });

        if let FlushPolicy::Periodic { interval_ms } = wal.config.flush_policy {
            let interval = Duration::from_millis(interval_ms);
            let flusher = Self::spawn_flusher(Arc::downgrade(&wal), interval)?;
            *wal.flusher.lock() = Some(flusher);
        }

        Ok(wal)
    }

    fn spawn_flusher(wal: Weak<WriteAheadLog>, interval: Duration) -> StorageResult<Flusher> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("wal-flusher".to_string())
            .spawn(move || {
                let (lock, cvar) = &*thread_stop;
                let mut stopped = lock.lock();
                while !*stopped {
                    cvar.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                    // The last handle may be dropped here, and dropping
                    // takes the stop lock.
                    let alive = MutexGuard::unlocked(&mut stopped, || match wal.upgrade() {
                        Some(wal) => {
                            if let Err(e) = wal.flush() {
                                error!("Periodic WAL flush failed: {}", e);
                            }
                            true
                        }
                        None => false,
                    });
                    if !alive {
                        break;
                    }
                }
                debug!("WAL flusher stopped");
            })?;
        Ok(Flusher { handle, stop })
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    pub fn wal_dir(&self) -> &Path {
        &self.config.wal_dir
    }

    /// Append a record and return its LSN.
    ///
    /// Update-Page and File-Created records must belong to an open atomic
    /// unit; Start and End records must open and close units exactly once.
    pub fn append(&self, record: &WalRecord) -> StorageResult<Lsn> {
        let mut inner = self.inner.lock();

        match record {
            WalRecord::AtomicUnitStart { unit_id } => {
                if inner.open_units.contains(unit_id) {
                    return Err(StorageError::consistency(format!(
                        "atomic unit {} started twice",
                        unit_id
                    )));
                }
            }
            WalRecord::AtomicUnitEnd { unit_id, .. }
            | WalRecord::UpdatePage { unit_id, .. }
            | WalRecord::FileCreated { unit_id, .. } => {
                if !inner.open_units.contains(unit_id) {
                    return Err(StorageError::consistency(format!(
                        "{} record for atomic unit {} which is not open",
                        record.kind(),
                        unit_id
                    )));
                }
            }
            WalRecord::NonTxOperationPerformed
            | WalRecord::FuzzyCheckpointStart { .. }
            | WalRecord::FuzzyCheckpointEnd => {}
        }

        let frame = record.encode()?;
        let mut lsn = inner.end_lsn();
        if lsn.position > 0 && lsn.position + frame.len() as u64 > self.config.segment_size {
            self.rotate(&mut inner)?;
            lsn = inner.end_lsn();
        }

        inner.buffer.extend_from_slice(&frame);
        if inner.buffer.len() >= WAL_BUFFER_SIZE {
            inner.spill()?;
        }

        match record {
            WalRecord::AtomicUnitStart { unit_id } => {
                inner.open_units.insert(*unit_id);
            }
            WalRecord::AtomicUnitEnd { unit_id, .. } => {
                inner.open_units.remove(unit_id);
            }
            _ => {}
        }

        let force = match self.config.flush_policy {
            FlushPolicy::Sync => true,
            FlushPolicy::Group => matches!(record, WalRecord::AtomicUnitEnd { .. }),
            FlushPolicy::Periodic { .. } => false,
        };
        if force {
            self.flush_locked(&mut inner)?;
        }

        Ok(lsn)
    }

    /// Seal the current segment and start the next one.
    fn rotate(&self, inner: &mut WalInner) -> StorageResult<()> {
        inner.spill()?;
        inner.current.sync()?;

        let next_index = inner.current.index() + 1;
        let next = WalSegment::create(&self.config.wal_dir, next_index)?;
        let old = std::mem::replace(&mut inner.current, next);
        inner.sealed.insert(old.index(), old.len());

        *self.flushed_lsn.write() = inner.end_lsn();
        info!("WAL rolled over to segment {}", next_index);
        Ok(())
    }

    fn flush_locked(&self, inner: &mut WalInner) -> StorageResult<()> {
        let end = inner.end_lsn();
        if *self.flushed_lsn.read() >= end {
            return Ok(());
        }
        inner.spill()?;
        inner.current.sync()?;
        *self.flushed_lsn.write() = end;
        Ok(())
    }

    /// Force every appended record to stable storage.
    pub fn flush(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }

    /// Make sure the record at `lsn` is on stable storage.
    pub fn flush_to(&self, lsn: Lsn) -> StorageResult<()> {
        if *self.flushed_lsn.read() > lsn {
            return Ok(());
        }
        self.flush()
    }

    /// Position right after the last appended record.
    pub fn end_lsn(&self) -> Lsn {
        self.inner.lock().end_lsn()
    }

    /// Every record strictly below the returned LSN is durable.
    pub fn flushed_lsn(&self) -> Lsn {
        *self.flushed_lsn.read()
    }

    /// Atomic units that have started but not ended.
    pub fn open_unit_count(&self) -> usize {
        self.inner.lock().open_units.len()
    }

    /// LSN of the oldest record still in the log.
    pub fn begin(&self) -> StorageResult<Option<Lsn>> {
        let mut inner = self.inner.lock();
        inner.spill()?;
        Ok(inner.next_segment_after(0).map(|index| Lsn::new(index, 0)))
    }

    /// Read the record at `lsn`.
    pub fn read(&self, lsn: Lsn) -> StorageResult<WalRecord> {
        self.read_entry(lsn).map(|(record, _)| record)
    }

    /// LSN of the record following the one at `lsn`, if any.
    pub fn next(&self, lsn: Lsn) -> StorageResult<Option<Lsn>> {
        let (_, frame_len) = self.read_entry(lsn)?;
        Ok(self.lsn_after(lsn, frame_len))
    }

    fn read_entry(&self, lsn: Lsn) -> StorageResult<(WalRecord, u64)> {
        let (path, len) = {
            let mut inner = self.inner.lock();
            if lsn.segment == inner.current.index() {
                inner.spill()?;
            }
            inner
                .segment_extent(&self.config.wal_dir, lsn.segment)
                .ok_or_else(|| StorageError::CorruptedRecord {
                    lsn,
                    reason: "segment is not part of the log".to_string(),
                })?
        };
        if lsn.position >= len {
            return Err(StorageError::CorruptedRecord {
                lsn,
                reason: "position is past the end of the segment".to_string(),
            });
        }
        read_frame(&path, lsn)
    }

    fn lsn_after(&self, lsn: Lsn, frame_len: u64) -> Option<Lsn> {
        let inner = self.inner.lock();
        let next_position = lsn.position + frame_len;
        match inner.segment_extent(&self.config.wal_dir, lsn.segment) {
            Some((_, len)) if next_position < len => Some(Lsn::new(lsn.segment, next_position)),
            _ => inner
                .next_segment_after(lsn.segment)
                .map(|index| Lsn::new(index, 0)),
        }
    }

    /// Iterate over records starting at `from`, up to the end of the log as
    /// it is when the iterator is created.
    /// A `from` at the end of a sealed segment starts at the next segment.
    pub fn iter_from(&self, from: Lsn) -> WalIterator<'_> {
        let next = {
            let inner = self.inner.lock();
            match inner.segment_extent(&self.config.wal_dir, from.segment) {
                _ if from.segment == inner.current.index() => Some(from),
                Some((_, len)) if from.position < len => Some(from),
                _ => inner
                    .next_segment_after(from.segment)
                    .map(|index| Lsn::new(index, 0)),
            }
        };
        WalIterator {
            wal: self,
            next,
            end: self.end_lsn(),
        }
    }

    /// Iterate over every record still in the log.
    pub fn iter(&self) -> StorageResult<WalIterator<'_>> {
        let end = self.end_lsn();
        Ok(WalIterator {
            wal: self,
            next: self.begin()?,
            end,
        })
    }

    /// Forbid truncation of the log at or above `lsn` until the limit is
    /// removed again. Limits are counted, so each add needs one remove.
    pub fn add_cut_till_limit(&self, lsn: Lsn) {
        *self.cut_till_limits.lock().entry(lsn).or_insert(0) += 1;
    }

    pub fn remove_cut_till_limit(&self, lsn: Lsn) {
        let mut limits = self.cut_till_limits.lock();
        match limits.get_mut(&lsn) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                limits.remove(&lsn);
            }
            None => warn!("Removing unknown WAL cut-till limit {}", lsn),
        }
    }

    /// Delete segments that only hold records below `lsn` (lowered to the
    /// smallest cut-till limit). The current segment is never deleted.
    /// Returns the number of segments removed.
    pub fn cut_till(&self, lsn: Lsn) -> StorageResult<usize> {
        let limit = self.cut_till_limits.lock().keys().next().copied();
        let effective = limit.map_or(lsn, |limit| limit.min(lsn));

        let mut inner = self.inner.lock();
        let doomed: Vec<u64> = inner
            .sealed
            .range(..effective.segment)
            .map(|(index, _)| *index)
            .collect();
        for index in &doomed {
            fs::remove_file(self.config.wal_dir.join(segment_file_name(*index)))?;
            inner.sealed.remove(index);
        }
        if !doomed.is_empty() {
            info!(
                "Truncated {} WAL segment(s) below {}",
                doomed.len(),
                effective
            );
        }
        Ok(doomed.len())
    }

    /// Indexes of the segments currently on disk.
    pub fn segments(&self) -> Vec<u64> {
        let inner = self.inner.lock();
        let mut indexes: Vec<u64> = inner.sealed.keys().copied().collect();
        indexes.push(inner.current.index());
        indexes
    }

    /// Stop the background flusher and force the log to disk.
    pub fn close(&self) -> StorageResult<()> {
        if let Some(flusher) = self.flusher.lock().take() {
            {
                let (lock, cvar) = &*flusher.stop;
                *lock.lock() = true;
                cvar.notify_all();
            }
            if flusher.handle.join().is_err() {
                error!("WAL flusher thread panicked");
            }
        }
        self.flush()
    }
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        // Buffered records are intentionally not flushed here: dropping an
        // unclosed log behaves like a crash.
        if let Some(flusher) = self.flusher.get_mut().take() {
            let (lock, cvar) = &*flusher.stop;
            *lock.lock() = true;
            cvar.notify_all();
        }
    }
}

/// Lazy forward iterator over WAL records.
///
/// Yields `(lsn, record)` pairs. After an error the iterator is exhausted.
pub struct WalIterator<'a> {
    wal: &'a WriteAheadLog,
    next: Option<Lsn>,
    end: Lsn,
}

impl Iterator for WalIterator<'_> {
    type Item = StorageResult<(Lsn, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        let lsn = self.next.take()?;
        if lsn >= self.end {
            return None;
        }
        match self.wal.read_entry(lsn) {
            Ok((record, frame_len)) => {
                self.next = self.wal.lsn_after(lsn, frame_len);
                Some(Ok((lsn, record)))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
