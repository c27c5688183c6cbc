//! SBTree: a disk-resident B+-tree built on the page cache.
//!
//! A tree named `name` lives in `<name>.sbt` (metadata in page 0, root in
//! page 1) and, if it accepts a null key, `<name>.nbt`. Every mutation runs
//! inside one atomic unit so that a split or merge spanning several pages is
//! redone completely or not at all.
//!
//! Writers take the tree's component lock exclusively and readers share it;
//! page latches come from the cache.

pub mod bucket;
pub mod cursor;
pub mod meta;
pub mod null_bucket;
pub mod serializer;

pub use cursor::SBTreeCursor;
pub use serializer::{
    BinarySerializer, ByteArraySerializer, IntegerSerializer, KeyType, LinkSerializer,
    LongSerializer, Rid, StringSerializer,
};

use self::bucket::{internal_entry, leaf_entry, Bucket, BUCKET_CAPACITY, MAX_ENTRY_SIZE};
use self::meta::{MetaPage, META_PAGE_INDEX, ROOT_PAGE_INDEX};
use self::null_bucket::NullBucket;
use crate::storage::atomic::{AtomicOperation, AtomicOperationsManager};
use crate::storage::buffer::{PageWriteGuard, ReadCache};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{DurablePage, FileId, PageKey, PageRead};
use log::{debug, error};
use parking_lot::{RwLock, RwLockReadGuard};
use std::ops::Bound;
use std::sync::Arc;

pub const DATA_FILE_EXTENSION: &str = ".sbt";
pub const NULL_FILE_EXTENSION: &str = ".nbt";

/// Deeper paths mean the page links form a cycle.
const MAX_TREE_DEPTH: usize = 64;

/// What `put` does with a key that is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    #[default]
    Overwrite,
    Reject,
}

type WriteBucket<'s, 'g, K, V> = Bucket<'s, DurablePage<'g, PageWriteGuard>, K, V>;

/// Run `f` inside a fresh atomic unit, ending it on success and rolling it
/// back on failure.
fn run_in_unit<T>(
    atomic: &Arc<AtomicOperationsManager>,
    f: impl FnOnce(&mut AtomicOperation) -> StorageResult<T>,
) -> StorageResult<T> {
    let mut op = atomic.start_atomic_unit()?;
    match f(&mut op) {
        Ok(value) => {
            op.end()?;
            Ok(value)
        }
        Err(e) => {
            let unit_id = op.unit_id();
            if let Err(rollback_error) = op.rollback() {
                error!(
                    "Failed to roll back atomic unit {}: {}",
                    unit_id, rollback_error
                );
            }
            Err(e)
        }
    }
}

pub struct SBTree<K, V> {
    name: String,
    cache: ReadCache,
    atomic: Arc<AtomicOperationsManager>,
    file_id: FileId,
    null_file_id: Option<FileId>,
    key_serializer: Arc<dyn BinarySerializer<K>>,
    value_serializer: Arc<dyn BinarySerializer<V>>,
    key_types: Vec<KeyType>,
    key_size: u32,
    duplicate_policy: DuplicatePolicy,
    lock: RwLock<()>,
}

impl<K: Ord + Clone, V: Clone> SBTree<K, V> {
    /// Create the tree's files. Creation is one atomic unit.
    pub fn create(
        name: &str,
        atomic: Arc<AtomicOperationsManager>,
        key_serializer: Arc<dyn BinarySerializer<K>>,
        value_serializer: Arc<dyn BinarySerializer<V>>,
        key_types: &[KeyType],
        key_size: u32,
        nullable: bool,
    ) -> StorageResult<Self> {
        let cache = atomic.cache().clone();
        let data_name = format!("{}{}", name, DATA_FILE_EXTENSION);
        let null_name = format!("{}{}", name, NULL_FILE_EXTENSION);
        if cache.exists(&data_name) {
            return Err(StorageError::FileExists(data_name));
        }

        let (file_id, null_file_id) = run_in_unit(&atomic, |op| {
            let file_id = cache.add_file(&data_name)?;
            op.log_file_created(&data_name, file_id)?;

            let mut meta_guard = cache.allocate_new_page(file_id)?;
            let mut root_guard = cache.allocate_new_page(file_id)?;
            if meta_guard.key().page_index != META_PAGE_INDEX
                || root_guard.key().page_index != ROOT_PAGE_INDEX
            {
                return Err(StorageError::consistency(format!(
                    "new tree file {} is not empty",
                    data_name
                )));
            }

            let mut meta = MetaPage::new(DurablePage::new(&mut meta_guard));
            meta.init(
                key_serializer.id(),
                value_serializer.id(),
                nullable,
                key_size,
                key_types,
            );
            op.log_page_changes(meta.page_mut())?;

            let mut root = Bucket::new(
                DurablePage::new(&mut root_guard),
                &*key_serializer,
                &*value_serializer,
            );
            root.init(true);
            op.log_page_changes(root.page_mut())?;

            let null_file_id = if nullable {
                let null_file_id = cache.add_file(&null_name)?;
                op.log_file_created(&null_name, null_file_id)?;
                Some(null_file_id)
            } else {
                None
            };
            Ok((file_id, null_file_id))
        })?;

        debug!("Created SBTree {} in file {}", name, file_id);
        Ok(Self {
            name: name.to_string(),
            cache,
            atomic,
            file_id,
            null_file_id,
            key_serializer,
            value_serializer,
            key_types: key_types.to_vec(),
            key_size,
            duplicate_policy: DuplicatePolicy::default(),
            lock: RwLock::new(()),
        })
    }

    /// Open an existing tree. The serializers must be the ones it was
    /// created with.
    pub fn load(
        name: &str,
        atomic: Arc<AtomicOperationsManager>,
        key_serializer: Arc<dyn BinarySerializer<K>>,
        value_serializer: Arc<dyn BinarySerializer<V>>,
    ) -> StorageResult<Self> {
        let cache = atomic.cache().clone();
        let data_name = format!("{}{}", name, DATA_FILE_EXTENSION);
        let file_id = cache
            .file_id_by_name(&data_name)
            .ok_or_else(|| StorageError::FileNotFound(data_name.clone()))?;

        let guard = cache.load_for_read(PageKey::new(file_id, META_PAGE_INDEX))?;
        let meta = MetaPage::new(&guard);
        if meta.key_serializer_id() != key_serializer.id()
            || meta.value_serializer_id() != value_serializer.id()
        {
            return Err(StorageError::Serialization(format!(
                "tree {} was created with serializers {}/{} but opened with {}/{}",
                name,
                meta.key_serializer_id(),
                meta.value_serializer_id(),
                key_serializer.id(),
                value_serializer.id()
            )));
        }
        let key_types = meta.key_types()?;
        let key_size = meta.key_size();
        let null_file_id = if meta.nullable() {
            let null_name = format!("{}{}", name, NULL_FILE_EXTENSION);
            Some(
                cache
                    .file_id_by_name(&null_name)
                    .ok_or(StorageError::FileNotFound(null_name))?,
            )
        } else {
            None
        };
        drop(guard);

        Ok(Self {
            name: name.to_string(),
            cache,
            atomic,
            file_id,
            null_file_id,
            key_serializer,
            value_serializer,
            key_types,
            key_size,
            duplicate_policy: DuplicatePolicy::default(),
            lock: RwLock::new(()),
        })
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn null_file_id(&self) -> Option<FileId> {
        self.null_file_id
    }

    pub fn is_nullable(&self) -> bool {
        self.null_file_id.is_some()
    }

    pub fn key_types(&self) -> &[KeyType] {
        &self.key_types
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    fn page_key(&self, page_index: u64) -> PageKey {
        PageKey::new(self.file_id, page_index)
    }

    fn read_bucket<P: PageRead>(&self, page: P) -> Bucket<'_, P, K, V> {
        Bucket::new(page, &*self.key_serializer, &*self.value_serializer)
    }

    fn write_bucket<'g>(&self, guard: &'g mut PageWriteGuard) -> WriteBucket<'_, 'g, K, V> {
        Bucket::new(
            DurablePage::new(guard),
            &*self.key_serializer,
            &*self.value_serializer,
        )
    }

    fn load_for_write(&self, page_index: u64) -> StorageResult<PageWriteGuard> {
        let key = self.page_key(page_index);
        self.cache
            .load_for_write(key, false)?
            .ok_or(StorageError::PageNotFound(key))
    }

    pub(crate) fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Page indexes from the root down to the leaf that holds `key`.
    fn find_path(&self, key: &K) -> StorageResult<Vec<u64>> {
        let mut path = vec![ROOT_PAGE_INDEX];
        loop {
            let page_index = path[path.len() - 1];
            let guard = self.cache.load_for_read(self.page_key(page_index))?;
            let bucket = self.read_bucket(&guard);
            if bucket.is_leaf() {
                return Ok(path);
            }
            if bucket.is_freed() || path.len() >= MAX_TREE_DEPTH {
                return Err(StorageError::consistency(format!(
                    "broken descent in tree {} at page {}",
                    self.name, page_index
                )));
            }
            path.push(bucket.child(bucket.child_index_for(key)?));
        }
    }

    /// Leaf that holds `key`. Callers hold the component lock.
    pub(crate) fn find_leaf(&self, key: &K) -> StorageResult<u64> {
        let path = self.find_path(key)?;
        Ok(path[path.len() - 1])
    }

    /// Leftmost or rightmost leaf. Callers hold the component lock.
    pub(crate) fn find_edge_leaf(&self, leftmost: bool) -> StorageResult<u64> {
        let mut page_index = ROOT_PAGE_INDEX;
        for _ in 0..MAX_TREE_DEPTH {
            let guard = self.cache.load_for_read(self.page_key(page_index))?;
            let bucket = self.read_bucket(&guard);
            if bucket.is_leaf() {
                return Ok(page_index);
            }
            page_index = if leftmost {
                bucket.leftmost_child()
            } else {
                bucket.child(bucket.size())
            };
        }
        Err(StorageError::consistency(format!(
            "tree {} is deeper than {} levels",
            self.name, MAX_TREE_DEPTH
        )))
    }

    /// Read the entries of a leaf, for cursors. Callers hold the component
    /// lock. Returns `None` if the page is no longer a leaf.
    pub(crate) fn read_leaf(&self, page_index: u64) -> StorageResult<Option<LeafSnapshot<K, V>>> {
        let guard = self.cache.load_for_read(self.page_key(page_index))?;
        let bucket = self.read_bucket(&guard);
        if !bucket.is_leaf() {
            return Ok(None);
        }
        let mut entries = Vec::with_capacity(bucket.size());
        for index in 0..bucket.size() {
            entries.push((bucket.key(index)?, bucket.value(index)?));
        }
        Ok(Some(LeafSnapshot {
            entries,
            left_sibling: bucket.left_sibling(),
            right_sibling: bucket.right_sibling(),
        }))
    }

    fn check_entry_size(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let size = (key.len() + value.len()).max(8 + key.len());
        if size > MAX_ENTRY_SIZE {
            return Err(StorageError::EntryTooLarge {
                size,
                max: MAX_ENTRY_SIZE,
            });
        }
        Ok(())
    }

    pub fn get(&self, key: &K) -> StorageResult<Option<V>> {
        let _lock = self.lock.read();
        let leaf = self.find_leaf(key)?;
        let guard = self.cache.load_for_read(self.page_key(leaf))?;
        let bucket = self.read_bucket(&guard);
        match bucket.find(key)? {
            Ok(index) => Ok(Some(bucket.value(index)?)),
            Err(_) => Ok(None),
        }
    }

    /// Insert or replace the value of `key`.
    pub fn put(&self, key: &K, value: &V) -> StorageResult<()> {
        let key_bytes = self.key_serializer.to_bytes(key);
        let value_bytes = self.value_serializer.to_bytes(value);
        self.check_entry_size(&key_bytes, &value_bytes)?;

        let _lock = self.lock.write();
        if self.duplicate_policy == DuplicatePolicy::Reject {
            let leaf = self.find_leaf(key)?;
            let guard = self.cache.load_for_read(self.page_key(leaf))?;
            if self.read_bucket(&guard).find(key)?.is_ok() {
                return Err(StorageError::DuplicateKey);
            }
        }

        run_in_unit(&self.atomic, |op| {
            self.put_in_unit(op, key, &key_bytes, &value_bytes)
        })
    }

    fn put_in_unit(
        &self,
        op: &mut AtomicOperation,
        key: &K,
        key_bytes: &[u8],
        value_bytes: &[u8],
    ) -> StorageResult<()> {
        let entry = leaf_entry(key_bytes, value_bytes);
        loop {
            let path = self.find_path(key)?;
            let depth = path.len() - 1;
            let inserted = {
                let mut guard = self.load_for_write(path[depth])?;
                let mut bucket = self.write_bucket(&mut guard);
                match bucket.find(key)? {
                    Ok(index) => {
                        if bucket.value_bytes(index) == value_bytes {
                            return Ok(());
                        }
                        if bucket.update_value(index, value_bytes)? {
                            op.log_page_changes(bucket.page_mut())?;
                            return Ok(());
                        }
                        // The grown value no longer fits; reinsert it through
                        // the split path.
                        bucket.remove(index);
                        op.log_page_changes(bucket.page_mut())?;
                        drop(bucket);
                        drop(guard);
                        self.add_to_tree_size(op, -1)?;
                        continue;
                    }
                    Err(index) => {
                        let inserted = bucket.insert_raw(index, &entry);
                        if inserted {
                            op.log_page_changes(bucket.page_mut())?;
                        }
                        inserted
                    }
                }
            };

            if inserted {
                return self.add_to_tree_size(op, 1);
            }
            self.split(op, &path, depth)?;
        }
    }

    fn add_to_tree_size(&self, op: &mut AtomicOperation, delta: i64) -> StorageResult<()> {
        let mut guard = self.load_for_write(META_PAGE_INDEX)?;
        let mut meta = MetaPage::new(DurablePage::new(&mut guard));
        let size = meta.tree_size().checked_add_signed(delta).ok_or_else(|| {
            StorageError::consistency(format!("size of tree {} went negative", self.name))
        })?;
        meta.set_tree_size(size);
        op.log_page_changes(meta.page_mut())?;
        Ok(())
    }

    /// Take a page from the free list, or extend the file.
    fn allocate_page(&self, op: &mut AtomicOperation) -> StorageResult<PageWriteGuard> {
        let mut meta_guard = self.load_for_write(META_PAGE_INDEX)?;
        let mut meta = MetaPage::new(DurablePage::new(&mut meta_guard));
        match meta.free_list_head() {
            Some(free_index) => {
                let guard = self.load_for_write(free_index)?;
                let (freed, next) = {
                    let bucket = self.read_bucket(&guard);
                    (bucket.is_freed(), bucket.next_free_page())
                };
                if !freed {
                    return Err(StorageError::consistency(format!(
                        "free list of tree {} points at live page {}",
                        self.name, free_index
                    )));
                }
                meta.set_free_list_head(next);
                op.log_page_changes(meta.page_mut())?;
                Ok(guard)
            }
            None => {
                drop(meta);
                drop(meta_guard);
                self.cache.allocate_new_page(self.file_id)
            }
        }
    }

    fn free_page(&self, op: &mut AtomicOperation, page_index: u64) -> StorageResult<()> {
        let mut meta_guard = self.load_for_write(META_PAGE_INDEX)?;
        let mut meta = MetaPage::new(DurablePage::new(&mut meta_guard));
        {
            let mut guard = self.load_for_write(page_index)?;
            let mut bucket = self.write_bucket(&mut guard);
            bucket.mark_freed(meta.free_list_head());
            op.log_page_changes(bucket.page_mut())?;
        }
        meta.set_free_list_head(Some(page_index));
        op.log_page_changes(meta.page_mut())?;
        Ok(())
    }

    /// Split the bucket at `path[depth]`. If its parent cannot take the new
    /// separator, the parent is split instead and the caller retries.
    fn split(&self, op: &mut AtomicOperation, path: &[u64], depth: usize) -> StorageResult<()> {
        if depth == 0 {
            return self.split_root(op);
        }
        let node_index = path[depth];
        let parent_index = path[depth - 1];

        let mut node_guard = self.load_for_write(node_index)?;
        let mut node = self.write_bucket(&mut node_guard);
        let size = node.size();
        let mid = size / 2;
        let is_leaf = node.is_leaf();
        let separator = node.key_bytes(mid).to_vec();

        let parent_has_room = {
            let parent_guard = self.cache.load_for_read(self.page_key(parent_index))?;
            self.read_bucket(&parent_guard).free_space() >= 8 + separator.len() + 4
        };
        if !parent_has_room {
            drop(node);
            drop(node_guard);
            return self.split(op, path, depth - 1);
        }

        let (right_entries, right_leftmost) = if is_leaf {
            (node.raw_entries(mid..size), None)
        } else {
            (node.raw_entries(mid + 1..size), Some(node.right_child(mid)))
        };
        let old_right_sibling = node.right_sibling();

        let mut right_guard = self.allocate_page(op)?;
        let right_index = right_guard.key().page_index;
        {
            let mut right = self.write_bucket(&mut right_guard);
            right.init(is_leaf);
            match right_leftmost {
                Some(child) => right.set_leftmost_child(child),
                None => {
                    right.set_left_sibling(Some(node_index));
                    right.set_right_sibling(old_right_sibling);
                }
            }
            if !right.add_all(&right_entries) {
                return Err(StorageError::consistency(format!(
                    "split half of page {} does not fit into page {}",
                    node_index, right_index
                )));
            }
            op.log_page_changes(right.page_mut())?;
        }
        drop(right_guard);

        node.shrink(mid);
        if is_leaf {
            node.set_right_sibling(Some(right_index));
        }
        op.log_page_changes(node.page_mut())?;
        drop(node);
        drop(node_guard);

        if let (true, Some(next_index)) = (is_leaf, old_right_sibling) {
            let mut guard = self.load_for_write(next_index)?;
            let mut next = self.write_bucket(&mut guard);
            next.set_left_sibling(Some(right_index));
            op.log_page_changes(next.page_mut())?;
        }

        let separator_key = self.key_serializer.deserialize(&separator)?;
        let mut parent_guard = self.load_for_write(parent_index)?;
        let mut parent = self.write_bucket(&mut parent_guard);
        let index = match parent.find(&separator_key)? {
            Err(index) => index,
            Ok(_) => {
                return Err(StorageError::consistency(format!(
                    "separator of split page {} already present in parent {}",
                    node_index, parent_index
                )))
            }
        };
        if !parent.insert_raw(index, &internal_entry(right_index, &separator)) {
            return Err(StorageError::consistency(format!(
                "separator no longer fits into parent page {}",
                parent_index
            )));
        }
        op.log_page_changes(parent.page_mut())?;

        debug!(
            "Split page {} of tree {} into {} at depth {}",
            node_index, self.name, right_index, depth
        );
        Ok(())
    }

    /// Split the root by moving its halves into two new pages; the root
    /// becomes an internal bucket with a single separator.
    fn split_root(&self, op: &mut AtomicOperation) -> StorageResult<()> {
        let mut root_guard = self.load_for_write(ROOT_PAGE_INDEX)?;
        let mut root = self.write_bucket(&mut root_guard);
        let size = root.size();
        let mid = size / 2;
        let is_leaf = root.is_leaf();
        let separator = root.key_bytes(mid).to_vec();

        let (left_entries, right_entries, leftmost_children) = if is_leaf {
            (root.raw_entries(0..mid), root.raw_entries(mid..size), None)
        } else {
            (
                root.raw_entries(0..mid),
                root.raw_entries(mid + 1..size),
                Some((root.leftmost_child(), root.right_child(mid))),
            )
        };

        let mut left_guard = self.allocate_page(op)?;
        let mut right_guard = self.allocate_page(op)?;
        let left_index = left_guard.key().page_index;
        let right_index = right_guard.key().page_index;

        for (guard, entries, leftmost, siblings) in [
            (
                &mut left_guard,
                &left_entries,
                leftmost_children.map(|(left, _)| left),
                (None, Some(right_index)),
            ),
            (
                &mut right_guard,
                &right_entries,
                leftmost_children.map(|(_, right)| right),
                (Some(left_index), None),
            ),
        ] {
            let page_index = guard.key().page_index;
            let mut half = self.write_bucket(guard);
            half.init(is_leaf);
            match leftmost {
                Some(child) => half.set_leftmost_child(child),
                None => {
                    half.set_left_sibling(siblings.0);
                    half.set_right_sibling(siblings.1);
                }
            }
            if !half.add_all(entries) {
                return Err(StorageError::consistency(format!(
                    "root half does not fit into page {}",
                    page_index
                )));
            }
            op.log_page_changes(half.page_mut())?;
        }

        root.init(false);
        root.set_leftmost_child(left_index);
        if !root.insert_raw(0, &internal_entry(right_index, &separator)) {
            return Err(StorageError::consistency("root separator does not fit"));
        }
        op.log_page_changes(root.page_mut())?;

        debug!(
            "Split root of tree {} into pages {} and {}",
            self.name, left_index, right_index
        );
        Ok(())
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: &K) -> StorageResult<Option<V>> {
        let _lock = self.lock.write();
        let path = self.find_path(key)?;
        let depth = path.len() - 1;
        let value = {
            let guard = self.cache.load_for_read(self.page_key(path[depth]))?;
            let bucket = self.read_bucket(&guard);
            match bucket.find(key)? {
                Ok(index) => bucket.value(index)?,
                Err(_) => return Ok(None),
            }
        };

        run_in_unit(&self.atomic, |op| {
            {
                let mut guard = self.load_for_write(path[depth])?;
                let mut bucket = self.write_bucket(&mut guard);
                let index = bucket.find(key)?.map_err(|_| {
                    StorageError::consistency(format!("key vanished from page {}", path[depth]))
                })?;
                bucket.remove(index);
                op.log_page_changes(bucket.page_mut())?;
            }
            self.add_to_tree_size(op, -1)?;
            self.rebalance(op, &path, depth)
        })?;
        Ok(Some(value))
    }

    /// Fix an underflowed bucket at `path[depth]` by merging it with a
    /// sibling, or by moving entries over from the sibling.
    fn rebalance(&self, op: &mut AtomicOperation, path: &[u64], depth: usize) -> StorageResult<()> {
        if depth == 0 {
            return Ok(());
        }
        let node_index = path[depth];
        let parent_index = path[depth - 1];

        let underflowed = {
            let guard = self.cache.load_for_read(self.page_key(node_index))?;
            self.read_bucket(&guard).is_underflowed()
        };
        if !underflowed {
            return Ok(());
        }

        let (left_index, right_index, separator_index, separator) = {
            let guard = self.cache.load_for_read(self.page_key(parent_index))?;
            let parent = self.read_bucket(&guard);
            if parent.is_empty() {
                return Ok(());
            }
            let child = (0..=parent.size())
                .find(|child| parent.child(*child) == node_index)
                .ok_or_else(|| {
                    StorageError::consistency(format!(
                        "page {} is not a child of page {}",
                        node_index, parent_index
                    ))
                })?;
            if child > 0 {
                let separator = parent.key_bytes(child - 1).to_vec();
                (parent.child(child - 1), node_index, child - 1, separator)
            } else {
                let separator = parent.key_bytes(0).to_vec();
                (node_index, parent.child(1), 0, separator)
            }
        };

        let mut left_guard = self.load_for_write(left_index)?;
        let mut right_guard = self.load_for_write(right_index)?;
        let mut left = self.write_bucket(&mut left_guard);
        let mut right = self.write_bucket(&mut right_guard);
        let is_leaf = left.is_leaf();
        let pulled_down = if is_leaf { 0 } else { 8 + separator.len() + 4 };

        if left.used_bytes() + right.used_bytes() + pulled_down > BUCKET_CAPACITY {
            return self.redistribute(
                op,
                &mut left,
                &mut right,
                parent_index,
                separator_index,
                &separator,
            );
        }

        let mut entries = Vec::with_capacity(right.size() + 1);
        if !is_leaf {
            entries.push(internal_entry(right.leftmost_child(), &separator));
        }
        entries.extend(right.raw_entries(0..right.size()));
        if !left.add_all(&entries) {
            return Err(StorageError::consistency(format!(
                "merge of page {} into {} overflowed",
                right_index, left_index
            )));
        }
        let next_sibling = if is_leaf { right.right_sibling() } else { None };
        if is_leaf {
            left.set_right_sibling(next_sibling);
        }
        op.log_page_changes(left.page_mut())?;
        drop((left, right));
        drop((left_guard, right_guard));

        if let Some(next_index) = next_sibling {
            let mut guard = self.load_for_write(next_index)?;
            let mut next = self.write_bucket(&mut guard);
            next.set_left_sibling(Some(left_index));
            op.log_page_changes(next.page_mut())?;
        }
        self.free_page(op, right_index)?;

        let parent_empty = {
            let mut guard = self.load_for_write(parent_index)?;
            let mut parent = self.write_bucket(&mut guard);
            parent.remove(separator_index);
            op.log_page_changes(parent.page_mut())?;
            parent.is_empty()
        };
        debug!(
            "Merged page {} into {} in tree {}",
            right_index, left_index, self.name
        );

        if depth - 1 == 0 {
            if parent_empty {
                self.collapse_root(op, left_index)?;
            }
            Ok(())
        } else {
            self.rebalance(op, path, depth - 1)
        }
    }

    fn redistribute(
        &self,
        op: &mut AtomicOperation,
        left: &mut WriteBucket<'_, '_, K, V>,
        right: &mut WriteBucket<'_, '_, K, V>,
        parent_index: u64,
        separator_index: usize,
        separator: &[u8],
    ) -> StorageResult<()> {
        let is_leaf = left.is_leaf();
        let left_size = left.size();
        let mut all = left.raw_entries(0..left_size);
        if !is_leaf {
            all.push(internal_entry(right.leftmost_child(), separator));
        }
        all.extend(right.raw_entries(0..right.size()));
        if all.len() < 2 {
            return Ok(());
        }

        // First entry that goes right: roughly half of the bytes stay left.
        let total: usize = all.iter().map(|entry| entry.len() + 4).sum();
        let mut split = 0;
        let mut left_bytes = 0;
        while split < all.len() - 1 && left_bytes + all[split].len() + 4 <= total / 2 {
            left_bytes += all[split].len() + 4;
            split += 1;
        }
        let split = split.max(1);
        if split == left_size {
            return Ok(());
        }

        let (new_separator, right_leftmost, right_start) = if is_leaf {
            let key_len = self.key_serializer.object_size_in_bytes(&all[split]);
            (all[split][..key_len].to_vec(), None, split)
        } else {
            let pivot = &all[split];
            let child = i64::from_le_bytes(
                pivot[..8]
                    .try_into()
                    .map_err(|_| StorageError::consistency("short internal entry"))?,
            ) as u64;
            (pivot[8..].to_vec(), Some(child), split + 1)
        };

        let mut parent_guard = self.load_for_write(parent_index)?;
        let mut parent = self.write_bucket(&mut parent_guard);
        if parent.free_space() + parent.entry_len(separator_index) < 8 + new_separator.len() {
            debug!(
                "Skipping redistribution under page {}: separator does not fit",
                parent_index
            );
            return Ok(());
        }

        left.shrink(0);
        right.shrink(0);
        if let Some(child) = right_leftmost {
            right.set_leftmost_child(child);
        }
        if !left.add_all(&all[..split]) || !right.add_all(&all[right_start..]) {
            return Err(StorageError::consistency(
                "redistributed entries do not fit their buckets",
            ));
        }
        op.log_page_changes(left.page_mut())?;
        op.log_page_changes(right.page_mut())?;

        let right_index = right.page().buffer().key().page_index;
        parent.remove(separator_index);
        if !parent.insert_raw(separator_index, &internal_entry(right_index, &new_separator)) {
            return Err(StorageError::consistency(format!(
                "new separator does not fit into page {}",
                parent_index
            )));
        }
        op.log_page_changes(parent.page_mut())?;
        Ok(())
    }

    /// Replace an empty internal root by its only child.
    fn collapse_root(&self, op: &mut AtomicOperation, child_index: u64) -> StorageResult<()> {
        let (is_leaf, leftmost, entries) = {
            let guard = self.cache.load_for_read(self.page_key(child_index))?;
            let child = self.read_bucket(&guard);
            (
                child.is_leaf(),
                child.leftmost_child(),
                child.raw_entries(0..child.size()),
            )
        };

        {
            let mut guard = self.load_for_write(ROOT_PAGE_INDEX)?;
            let mut root = self.write_bucket(&mut guard);
            root.init(is_leaf);
            if !is_leaf {
                root.set_leftmost_child(leftmost);
            }
            if !root.add_all(&entries) {
                return Err(StorageError::consistency("collapsed root overflowed"));
            }
            op.log_page_changes(root.page_mut())?;
        }
        self.free_page(op, child_index)?;
        debug!("Collapsed root of tree {} into page {}", self.name, child_index);
        Ok(())
    }

    fn null_file(&self) -> StorageResult<FileId> {
        self.null_file_id
            .ok_or_else(|| StorageError::NullKeyNotAllowed(self.name.clone()))
    }

    /// Store the value of the null key.
    pub fn put_null(&self, value: &V) -> StorageResult<()> {
        let null_file_id = self.null_file()?;
        let value_bytes = self.value_serializer.to_bytes(value);
        if value_bytes.len() > MAX_ENTRY_SIZE {
            return Err(StorageError::EntryTooLarge {
                size: value_bytes.len(),
                max: MAX_ENTRY_SIZE,
            });
        }

        let _lock = self.lock.write();
        let existing = self.read_null_bytes(null_file_id)?;
        if existing.is_some() && self.duplicate_policy == DuplicatePolicy::Reject {
            return Err(StorageError::DuplicateKey);
        }
        if existing.as_deref() == Some(value_bytes.as_slice()) {
            return Ok(());
        }

        run_in_unit(&self.atomic, |op| {
            let key = PageKey::new(null_file_id, 0);
            let mut guard = self
                .cache
                .load_for_write(key, true)?
                .ok_or(StorageError::PageNotFound(key))?;
            let mut bucket = NullBucket::new(DurablePage::new(&mut guard));
            bucket.set_value(&value_bytes);
            op.log_page_changes(bucket.page_mut())?;
            drop(bucket);
            drop(guard);
            if existing.is_none() {
                self.add_to_tree_size(op, 1)?;
            }
            Ok(())
        })
    }

    pub fn get_null(&self) -> StorageResult<Option<V>> {
        let null_file_id = self.null_file()?;
        let _lock = self.lock.read();
        self.read_null_bytes(null_file_id)?
            .map(|bytes| self.value_serializer.deserialize(&bytes))
            .transpose()
    }

    pub fn remove_null(&self) -> StorageResult<Option<V>> {
        let null_file_id = self.null_file()?;
        let _lock = self.lock.write();
        let existing = match self.read_null_bytes(null_file_id)? {
            Some(bytes) => self.value_serializer.deserialize(&bytes)?,
            None => return Ok(None),
        };

        run_in_unit(&self.atomic, |op| {
            let mut guard = self
                .cache
                .load_for_write(PageKey::new(null_file_id, 0), false)?
                .ok_or(StorageError::PageNotFound(PageKey::new(null_file_id, 0)))?;
            let mut bucket = NullBucket::new(DurablePage::new(&mut guard));
            bucket.remove_value();
            op.log_page_changes(bucket.page_mut())?;
            drop(bucket);
            drop(guard);
            self.add_to_tree_size(op, -1)
        })?;
        Ok(Some(existing))
    }

    fn read_null_bytes(&self, null_file_id: FileId) -> StorageResult<Option<Vec<u8>>> {
        if self.cache.write_cache().filled_up_to(null_file_id)? == 0 {
            return Ok(None);
        }
        let guard = self.cache.load_for_read(PageKey::new(null_file_id, 0))?;
        Ok(NullBucket::new(&guard).value_bytes().map(|bytes| bytes.to_vec()))
    }

    /// Number of entries, the null key included.
    pub fn size(&self) -> StorageResult<u64> {
        let _lock = self.lock.read();
        let guard = self.cache.load_for_read(self.page_key(META_PAGE_INDEX))?;
        Ok(MetaPage::new(&guard).tree_size())
    }

    pub fn first_key(&self) -> StorageResult<Option<K>> {
        self.edge_key(true)
    }

    pub fn last_key(&self) -> StorageResult<Option<K>> {
        self.edge_key(false)
    }

    fn edge_key(&self, ascending: bool) -> StorageResult<Option<K>> {
        Ok(self
            .iter_all(ascending)
            .next()
            .transpose()?
            .map(|(key, _)| key))
    }

    /// Every non-null entry in key order.
    pub fn iter_all(&self, ascending: bool) -> SBTreeCursor<'_, K, V> {
        SBTreeCursor::new(self, Bound::Unbounded, Bound::Unbounded, ascending)
    }

    /// Entries with keys between `from` and `to`.
    pub fn iterate_entries_between(
        &self,
        from: &K,
        from_inclusive: bool,
        to: &K,
        to_inclusive: bool,
        ascending: bool,
    ) -> SBTreeCursor<'_, K, V> {
        SBTreeCursor::new(
            self,
            bound(from, from_inclusive),
            bound(to, to_inclusive),
            ascending,
        )
    }

    /// Entries with keys above `key`.
    pub fn iterate_entries_major(
        &self,
        key: &K,
        inclusive: bool,
        ascending: bool,
    ) -> SBTreeCursor<'_, K, V> {
        SBTreeCursor::new(self, bound(key, inclusive), Bound::Unbounded, ascending)
    }

    /// Entries with keys below `key`.
    pub fn iterate_entries_minor(
        &self,
        key: &K,
        inclusive: bool,
        ascending: bool,
    ) -> SBTreeCursor<'_, K, V> {
        SBTreeCursor::new(self, Bound::Unbounded, bound(key, inclusive), ascending)
    }

    /// Drop the tree and delete its files.
    pub fn delete(self) -> StorageResult<()> {
        let _lock = self.lock.write();
        self.cache.delete_file(self.file_id)?;
        if let Some(null_file_id) = self.null_file_id {
            self.cache.delete_file(null_file_id)?;
        }
        self.atomic.log_non_tx_operation()?;
        debug!("Deleted SBTree {}", self.name);
        Ok(())
    }
}

fn bound<K: Clone>(key: &K, inclusive: bool) -> Bound<K> {
    if inclusive {
        Bound::Included(key.clone())
    } else {
        Bound::Excluded(key.clone())
    }
}

/// Entries and sibling links of one leaf, copied out under the tree lock.
pub(crate) struct LeafSnapshot<K, V> {
    pub entries: Vec<(K, V)>,
    pub left_sibling: Option<u64>,
    pub right_sibling: Option<u64>,
}
