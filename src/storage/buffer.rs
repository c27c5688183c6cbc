pub mod lru;
pub mod replacer;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{FileId, PageBuffer, PageChanges, PageKey, PageRead, PAGE_SIZE};
use crate::storage::wal::Lsn;
use crate::storage::write_cache::WriteCache;
use log::{debug, warn};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, MutexGuard, RawRwLock, RwLock};
use replacer::{FrameId, Replacer};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

type PageData = Box<[u8]>;

/// How long a caller waits for a frame before logging that the cache is
/// exhausted. The wait itself continues.
const FRAME_WAIT_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// One resident page. Pin counts and unit holds change only under the cache
/// state lock; the page bytes are guarded by the frame's own latch.
pub(crate) struct Frame {
    id: FrameId,
    key: PageKey,
    data: Arc<RwLock<PageData>>,
    pin_count: AtomicU32,
    /// Pins owned by open atomic units. Held pages are never written out.
    unit_holds: AtomicU32,
    is_dirty: AtomicBool,
    /// LSN of the first logged change since the page was last written.
    rec_lsn: Mutex<Option<Lsn>>,
    /// End record of the last unit that released the page. The WAL must be
    /// durable past it before the page is written.
    commit_lsn: Mutex<Option<Lsn>>,
}

impl Frame {
    fn new(id: FrameId, key: PageKey, data: PageData) -> Self {
        Self {
            id,
            key,
            data: Arc::new(RwLock::new(data)),
            pin_count: AtomicU32::new(1),
            unit_holds: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            rec_lsn: Mutex::new(None),
            commit_lsn: Mutex::new(None),
        }
    }
}

struct CacheState {
    page_table: HashMap<PageKey, FrameId>,
    frames: HashMap<FrameId, Arc<Frame>>,
    replacer: Box<dyn Replacer>,
    next_frame_id: FrameId,
}

struct ReadCacheInner {
    state: Mutex<CacheState>,
    frame_released: Condvar,
    write_cache: Arc<WriteCache>,
    max_frames: usize,
}

impl ReadCacheInner {
    /// Drop one pin; the last pin makes the frame evictable again.
    fn unpin(&self, frame: &Frame) {
        let mut state = self.state.lock();
        let previous = frame.pin_count.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            if state.frames.contains_key(&frame.id) {
                state.replacer.unpin(frame.id);
            }
            self.frame_released.notify_all();
        }
    }
}

enum Slot {
    Resident(Arc<Frame>),
    Free(FrameId),
}

/// Page cache mediating every page access.
///
/// Pages are pinned for shared ([`PageReadGuard`]) or exclusive
/// ([`PageWriteGuard`]) access; dropping the guard releases the pin. Misses
/// are loaded through the [`WriteCache`], and a full cache evicts the least
/// recently used unpinned frame, writing it out first when dirty.
#[derive(Clone)]
pub struct ReadCache {
    inner: Arc<ReadCacheInner>,
}

impl ReadCache {
    pub fn new(
        write_cache: Arc<WriteCache>,
        replacer: Box<dyn Replacer>,
        max_frames: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ReadCacheInner {
                state: Mutex::new(CacheState {
                    page_table: HashMap::with_capacity(max_frames),
                    frames: HashMap::with_capacity(max_frames),
                    replacer,
                    next_frame_id: 0,
                }),
                frame_released: Condvar::new(),
                write_cache,
                max_frames,
            }),
        }
    }

    pub fn with_lru(write_cache: Arc<WriteCache>, max_frames: usize) -> Self {
        Self::new(write_cache, Box::new(lru::LruReplacer::new(max_frames)), max_frames)
    }

    pub fn write_cache(&self) -> &Arc<WriteCache> {
        &self.inner.write_cache
    }

    pub fn add_file(&self, name: &str) -> StorageResult<FileId> {
        self.inner.write_cache.add_file(name)
    }

    pub fn add_file_with_id(&self, name: &str, file_id: FileId) -> StorageResult<FileId> {
        self.inner.write_cache.add_file_with_id(name, file_id)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.write_cache.exists(name)
    }

    pub fn file_id_by_name(&self, name: &str) -> Option<FileId> {
        self.inner.write_cache.file_id_by_name(name)
    }

    /// Pin a page for shared access, blocking while a writer holds it.
    pub fn load_for_read(&self, key: PageKey) -> StorageResult<PageReadGuard> {
        let frame = self.pin(key)?;
        let data = frame.data.read_arc();
        Ok(PageReadGuard {
            data,
            frame,
            cache: Arc::clone(&self.inner),
        })
    }

    /// Pin a page for exclusive access, blocking until other holders leave.
    ///
    /// Returns `None` if the page lies beyond the end of its file, unless
    /// `allocate_if_absent` is set, in which case the file is extended until
    /// the page exists.
    pub fn load_for_write(
        &self,
        key: PageKey,
        allocate_if_absent: bool,
    ) -> StorageResult<Option<PageWriteGuard>> {
        let filled = self.inner.write_cache.filled_up_to(key.file_id)?;
        if key.page_index >= filled {
            if !allocate_if_absent {
                return Ok(None);
            }
            loop {
                let guard = self.allocate_new_page(key.file_id)?;
                match guard.key().page_index.cmp(&key.page_index) {
                    std::cmp::Ordering::Less => continue,
                    std::cmp::Ordering::Equal => return Ok(Some(guard)),
                    std::cmp::Ordering::Greater => {
                        return Err(StorageError::consistency(format!(
                            "allocation of {} skipped past requested page {}",
                            guard.key(),
                            key
                        )))
                    }
                }
            }
        }

        let frame = self.pin(key)?;
        let data = frame.data.write_arc();
        Ok(Some(PageWriteGuard {
            data,
            frame,
            cache: Arc::clone(&self.inner),
        }))
    }

    /// Extend a file by one zero-filled page and pin it exclusively.
    pub fn allocate_new_page(&self, file_id: FileId) -> StorageResult<PageWriteGuard> {
        let frame = {
            let mut state = self.inner.state.lock();
            let frame_id = match self.reserve(&mut state, None)? {
                Slot::Free(frame_id) => frame_id,
                Slot::Resident(frame) => {
                    return Err(StorageError::consistency(format!(
                        "fresh allocation resolved to resident page {}",
                        frame.key
                    )))
                }
            };
            let page_index = self.inner.write_cache.allocate(file_id)?;
            let key = PageKey::new(file_id, page_index);
            let frame = Arc::new(Frame::new(
                frame_id,
                key,
                vec![0u8; PAGE_SIZE].into_boxed_slice(),
            ));
            state.frames.insert(frame_id, Arc::clone(&frame));
            state.page_table.insert(key, frame_id);
            frame
        };

        let data = frame.data.write_arc();
        Ok(PageWriteGuard {
            data,
            frame,
            cache: Arc::clone(&self.inner),
        })
    }

    /// Pin the frame of `key`, loading it from disk on a miss.
    fn pin(&self, key: PageKey) -> StorageResult<Arc<Frame>> {
        let mut state = self.inner.state.lock();
        let frame_id = match self.reserve(&mut state, Some(key))? {
            Slot::Resident(frame) => return Ok(frame),
            Slot::Free(frame_id) => frame_id,
        };

        let mut data = vec![0u8; PAGE_SIZE].into_boxed_slice();
        self.inner.write_cache.load(key, &mut data)?;

        let frame = Arc::new(Frame::new(frame_id, key, data));
        state.frames.insert(frame_id, Arc::clone(&frame));
        state.page_table.insert(key, frame_id);
        Ok(frame)
    }

    /// Find the resident frame of `key` (pinning it) or make room for a new
    /// frame, evicting or waiting as needed.
    fn reserve(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        key: Option<PageKey>,
    ) -> StorageResult<Slot> {
        loop {
            if let Some(key) = key {
                if let Some(&frame_id) = state.page_table.get(&key) {
                    let frame = state
                        .frames
                        .get(&frame_id)
                        .cloned()
                        .ok_or_else(|| {
                            StorageError::consistency(format!(
                                "page table entry for {} has no frame",
                                key
                            ))
                        })?;
                    frame.pin_count.fetch_add(1, Ordering::SeqCst);
                    state.replacer.pin(frame_id);
                    return Ok(Slot::Resident(frame));
                }
            }

            if state.frames.len() < self.inner.max_frames {
                let frame_id = state.next_frame_id;
                state.next_frame_id += 1;
                return Ok(Slot::Free(frame_id));
            }

            if let Some(victim_id) = state.replacer.evict() {
                self.evict(state, victim_id)?;
                continue;
            }

            warn!(
                "All {} cache frames are pinned; waiting for a release",
                self.inner.max_frames
            );
            self.inner
                .frame_released
                .wait_for(state, FRAME_WAIT_WARN_INTERVAL);
        }
    }

    fn evict(&self, state: &mut CacheState, victim_id: FrameId) -> StorageResult<()> {
        let victim = match state.frames.get(&victim_id) {
            Some(frame) => Arc::clone(frame),
            None => return Ok(()),
        };

        if victim.is_dirty.load(Ordering::SeqCst) {
            let data = victim.data.read();
            let commit_lsn = *victim.commit_lsn.lock();
            if let Err(e) = self.inner.write_cache.store(victim.key, &data, commit_lsn) {
                drop(data);
                state.replacer.unpin(victim_id);
                return Err(e);
            }
            debug!("Evicted dirty page {}", victim.key);
        }

        state.frames.remove(&victim_id);
        state.page_table.remove(&victim.key);
        Ok(())
    }

    /// Write every dirty page not held by an open atomic unit. The WAL is
    /// forced up to each page's LSN before the page is written. Returns the
    /// number of pages written.
    pub fn flush(&self) -> StorageResult<usize> {
        let candidates: Vec<Arc<Frame>> = {
            let mut state = self.inner.state.lock();
            let dirty: Vec<Arc<Frame>> = state
                .frames
                .values()
                .filter(|f| {
                    f.is_dirty.load(Ordering::SeqCst) && f.unit_holds.load(Ordering::SeqCst) == 0
                })
                .cloned()
                .collect();
            for frame in &dirty {
                frame.pin_count.fetch_add(1, Ordering::SeqCst);
                state.replacer.pin(frame.id);
            }
            dirty
        };

        let mut written = 0;
        let mut result = Ok(());
        for frame in &candidates {
            if result.is_ok() {
                match self.flush_frame(frame) {
                    Ok(true) => written += 1,
                    Ok(false) => {}
                    Err(e) => result = Err(e),
                }
            }
            self.inner.unpin(frame);
        }
        result.map(|_| written)
    }

    fn flush_frame(&self, frame: &Frame) -> StorageResult<bool> {
        let data = frame.data.read();
        let held = frame.unit_holds.load(Ordering::SeqCst) > 0;
        if held || !frame.is_dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let image = data.to_vec();
        let rec_lsn = frame.rec_lsn.lock().take();
        let commit_lsn = *frame.commit_lsn.lock();
        drop(data);

        if let Err(e) = self.inner.write_cache.store(frame.key, &image, commit_lsn) {
            frame.is_dirty.store(true, Ordering::SeqCst);
            let mut current = frame.rec_lsn.lock();
            *current = match (*current, rec_lsn) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            return Err(e);
        }
        Ok(true)
    }

    /// Smallest first-change LSN over all dirty resident pages.
    pub fn min_dirty_lsn(&self) -> Option<Lsn> {
        let state = self.inner.state.lock();
        state
            .frames
            .values()
            .filter(|f| f.is_dirty.load(Ordering::SeqCst))
            .filter_map(|f| *f.rec_lsn.lock())
            .min()
    }

    /// Keep a page pinned on behalf of an atomic unit until
    /// [`ReadCache::release_hold`] is called.
    pub(crate) fn hold(&self, guard: &PageWriteGuard) -> Arc<Frame> {
        let mut state = self.inner.state.lock();
        guard.frame.pin_count.fetch_add(1, Ordering::SeqCst);
        guard.frame.unit_holds.fetch_add(1, Ordering::SeqCst);
        state.replacer.pin(guard.frame.id);
        Arc::clone(&guard.frame)
    }

    /// Write the before-images of `changes` back into a held page.
    pub(crate) fn revert_held(&self, frame: &Frame, changes: &PageChanges) {
        let mut data = frame.data.write();
        changes.revert(&mut data);
        frame.is_dirty.store(true, Ordering::SeqCst);
    }

    /// Release a unit's hold. `end_lsn` is the unit's End record; the page
    /// is not written out before the WAL is durable past it.
    pub(crate) fn release_hold(&self, frame: &Frame, end_lsn: Lsn) {
        {
            let mut commit_lsn = frame.commit_lsn.lock();
            *commit_lsn = Some(commit_lsn.map_or(end_lsn, |lsn| lsn.max(end_lsn)));
        }
        frame.unit_holds.fetch_sub(1, Ordering::SeqCst);
        self.inner.unpin(frame);
    }

    /// Drop all frames of a file and delete it from disk.
    pub fn delete_file(&self, file_id: FileId) -> StorageResult<()> {
        {
            let mut state = self.inner.state.lock();
            let doomed: Vec<(FrameId, PageKey)> = state
                .frames
                .values()
                .filter(|f| f.key.file_id == file_id)
                .map(|f| (f.id, f.key))
                .collect();
            if let Some(pinned) = doomed.iter().find(|(id, _)| {
                state.frames[id].pin_count.load(Ordering::SeqCst) > 0
            }) {
                return Err(StorageError::consistency(format!(
                    "cannot delete file {} while page {} is pinned",
                    file_id, pinned.1
                )));
            }
            for (frame_id, key) in doomed {
                state.frames.remove(&frame_id);
                state.page_table.remove(&key);
                state.replacer.remove(frame_id);
            }
        }
        self.inner.write_cache.delete_file(file_id)
    }

    /// Flush all eligible pages and sync the files.
    pub fn close(&self) -> StorageResult<()> {
        self.flush()?;
        self.inner.write_cache.sync()
    }

    /// Number of frames currently pinned by guards or atomic units.
    pub fn pinned_pages(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .frames
            .values()
            .filter(|f| f.pin_count.load(Ordering::SeqCst) > 0)
            .count()
    }

    pub fn resident_pages(&self) -> usize {
        self.inner.state.lock().frames.len()
    }

    pub fn dirty_pages(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .frames
            .values()
            .filter(|f| f.is_dirty.load(Ordering::SeqCst))
            .count()
    }
}

/// Shared pin on a page.
pub struct PageReadGuard {
    data: ArcRwLockReadGuard<RawRwLock, PageData>,
    frame: Arc<Frame>,
    cache: Arc<ReadCacheInner>,
}

impl PageReadGuard {
    pub fn key(&self) -> PageKey {
        self.frame.key
    }
}

impl Deref for PageReadGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl PageRead for PageReadGuard {
    fn page_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        self.cache.unpin(&self.frame);
    }
}

/// Exclusive pin on a page.
pub struct PageWriteGuard {
    data: ArcRwLockWriteGuard<RawRwLock, PageData>,
    frame: Arc<Frame>,
    cache: Arc<ReadCacheInner>,
}

impl PageWriteGuard {
    pub fn key(&self) -> PageKey {
        self.frame.key
    }

    /// Flag the page as modified by the record at `lsn`.
    pub fn mark_dirty(&self, lsn: Lsn) {
        self.frame.is_dirty.store(true, Ordering::SeqCst);
        if !lsn.is_none() {
            let mut rec_lsn = self.frame.rec_lsn.lock();
            if rec_lsn.is_none() {
                *rec_lsn = Some(lsn);
            }
        }
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl PageRead for PageWriteGuard {
    fn page_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl PageBuffer for PageWriteGuard {
    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn mark_dirty(&mut self, lsn: Lsn) {
        PageWriteGuard::mark_dirty(self, lsn);
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        self.cache.unpin(&self.frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{DurablePage, PAGE_PAYLOAD_OFFSET};
    use anyhow::Result;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    fn create_test_cache(max_frames: usize) -> Result<(TempDir, ReadCache, FileId)> {
        let dir = tempdir()?;
        let write_cache = Arc::new(WriteCache::open(dir.path(), None, true)?);
        let file_id = write_cache.add_file("test.sbt")?;
        Ok((dir, ReadCache::with_lru(write_cache, max_frames), file_id))
    }

    #[test]
    fn test_allocate_and_read_back() -> Result<()> {
        let (_dir, cache, file_id) = create_test_cache(10)?;

        let mut guard = cache.allocate_new_page(file_id)?;
        let key = guard.key();
        assert_eq!(key, PageKey::new(file_id, 0));
        guard[PAGE_PAYLOAD_OFFSET] = 42;
        guard.mark_dirty(Lsn::NONE);
        drop(guard);

        let guard = cache.load_for_read(key)?;
        assert_eq!(guard[PAGE_PAYLOAD_OFFSET], 42);
        drop(guard);

        assert_eq!(cache.pinned_pages(), 0);
        Ok(())
    }

    #[test]
    fn test_load_beyond_extent() -> Result<()> {
        let (_dir, cache, file_id) = create_test_cache(10)?;

        let key = PageKey::new(file_id, 3);
        assert!(matches!(
            cache.load_for_read(key),
            Err(StorageError::PageNotFound(_))
        ));
        assert!(cache.load_for_write(key, false)?.is_none());

        // Allocation extends the file up to the requested page
        let guard = cache.load_for_write(key, true)?.expect("allocated");
        assert_eq!(guard.key(), key);
        drop(guard);
        assert_eq!(cache.write_cache().filled_up_to(file_id)?, 4);
        assert_eq!(cache.pinned_pages(), 0);
        Ok(())
    }

    #[test]
    fn test_eviction_writes_dirty_pages() -> Result<()> {
        let (_dir, cache, file_id) = create_test_cache(2)?;

        for i in 0..5u8 {
            let mut guard = cache.allocate_new_page(file_id)?;
            let mut page = DurablePage::new(&mut guard);
            page.set_u8(PAGE_PAYLOAD_OFFSET, i + 1);
        }
        assert_eq!(cache.resident_pages(), 2);

        for i in 0..5u64 {
            let guard = cache.load_for_read(PageKey::new(file_id, i))?;
            assert_eq!(guard[PAGE_PAYLOAD_OFFSET], i as u8 + 1);
        }
        Ok(())
    }

    #[test]
    fn test_pinned_pages_are_not_evicted() -> Result<()> {
        let (_dir, cache, file_id) = create_test_cache(2)?;

        let mut first = cache.allocate_new_page(file_id)?;
        first[PAGE_PAYLOAD_OFFSET] = 1;
        first.mark_dirty(Lsn::NONE);
        let first_key = first.key();

        // Cycling other pages through the single free frame leaves the pinned one alone
        for _ in 0..4 {
            let guard = cache.allocate_new_page(file_id)?;
            drop(guard);
        }
        assert_eq!(first[PAGE_PAYLOAD_OFFSET], 1);
        drop(first);

        let guard = cache.load_for_read(first_key)?;
        assert_eq!(guard[PAGE_PAYLOAD_OFFSET], 1);
        Ok(())
    }

    #[test]
    fn test_flush_and_dirty_tracking() -> Result<()> {
        let (_dir, cache, file_id) = create_test_cache(10)?;

        {
            let mut guard = cache.allocate_new_page(file_id)?;
            let mut page = DurablePage::new(&mut guard);
            page.set_u64(PAGE_PAYLOAD_OFFSET, 99);
            drop(page);
            guard.mark_dirty(Lsn::new(1, 64));
        }
        assert_eq!(cache.dirty_pages(), 1);
        assert_eq!(cache.min_dirty_lsn(), Some(Lsn::new(1, 64)));

        assert_eq!(cache.flush()?, 1);
        assert_eq!(cache.dirty_pages(), 0);
        assert_eq!(cache.min_dirty_lsn(), None);
        assert_eq!(cache.flush()?, 0);

        let mut buf = vec![0u8; PAGE_SIZE];
        cache
            .write_cache()
            .load(PageKey::new(file_id, 0), &mut buf)?;
        assert_eq!(buf.as_slice().get_u64(PAGE_PAYLOAD_OFFSET), 99);
        Ok(())
    }

    #[test]
    fn test_held_pages_are_not_flushed() -> Result<()> {
        let (_dir, cache, file_id) = create_test_cache(10)?;

        let held = {
            let mut guard = cache.allocate_new_page(file_id)?;
            guard[PAGE_PAYLOAD_OFFSET] = 5;
            guard.mark_dirty(Lsn::NONE);
            cache.hold(&guard)
        };
        assert_eq!(cache.flush()?, 0);
        assert_eq!(cache.pinned_pages(), 1);

        cache.release_hold(&held, Lsn::NONE);
        assert_eq!(cache.pinned_pages(), 0);
        assert_eq!(cache.flush()?, 1);
        Ok(())
    }

    #[test]
    fn test_writer_excludes_readers() -> Result<()> {
        let (_dir, cache, file_id) = create_test_cache(10)?;
        let key = cache.allocate_new_page(file_id)?.key();

        let observed = Arc::new(AtomicUsize::new(0));
        let mut writer = cache.load_for_write(key, false)?.expect("page exists");

        let reader = {
            let cache = cache.clone();
            let observed = Arc::clone(&observed);
            thread::spawn(move || {
                let guard = cache.load_for_read(key).unwrap();
                // Either none or all of the writer's bytes are visible
                let first = guard[PAGE_PAYLOAD_OFFSET];
                let last = guard[PAGE_SIZE - 1];
                assert_eq!(first, last);
                observed.store(first as usize, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        writer[PAGE_PAYLOAD_OFFSET] = 7;
        thread::sleep(Duration::from_millis(5));
        writer[PAGE_SIZE - 1] = 7;
        drop(writer);

        reader.join().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 7);
        assert_eq!(cache.pinned_pages(), 0);
        Ok(())
    }

    #[test]
    fn test_exhausted_cache_waits_for_release() -> Result<()> {
        let (_dir, cache, file_id) = create_test_cache(2)?;

        let a = cache.allocate_new_page(file_id)?;
        let b = cache.allocate_new_page(file_id)?;

        let waiter = {
            let cache = cache.clone();
            thread::spawn(move || cache.allocate_new_page(file_id).map(|g| g.key().page_index))
        };

        thread::sleep(Duration::from_millis(50));
        drop(a);
        let index = waiter.join().unwrap()?;
        assert_eq!(index, 2);
        drop(b);
        Ok(())
    }

    #[test]
    fn test_delete_file_drops_frames() -> Result<()> {
        let (_dir, cache, file_id) = create_test_cache(10)?;

        let guard = cache.allocate_new_page(file_id)?;
        assert!(cache.delete_file(file_id).is_err());
        drop(guard);

        cache.delete_file(file_id)?;
        assert_eq!(cache.resident_pages(), 0);
        assert!(!cache.exists("test.sbt"));
        Ok(())
    }
}
