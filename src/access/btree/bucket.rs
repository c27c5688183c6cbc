//! B-tree bucket: one page holding a sorted array of entries.
//!
//! ```text
//! | page header | free pointer (4) | size (4) | flags (1) | left sibling (8) |
//! 0             28                 32         36          37
//! | right sibling (8) | leftmost child (8) | positions (4 * size) -> ... <- entries |
//! 45                  53                   61                                 8192
//! ```
//!
//! Entries grow down from the end of the page; the positions array grows up
//! and keeps entry offsets in key order. A leaf entry is the serialized key
//! followed by the serialized value. An internal entry is the right child
//! page index followed by the serialized key; the child left of the first key
//! is the bucket's leftmost child. Siblings are only maintained for leaves.
//!
//! All mutations go through a [`DurablePage`] so that they are captured as
//! page changes for the WAL.

use super::serializer::BinarySerializer;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{DurablePage, PageBuffer, PageRead, PAGE_PAYLOAD_OFFSET, PAGE_SIZE};
use std::cmp::Ordering;

const FREE_POINTER_OFFSET: usize = PAGE_PAYLOAD_OFFSET;
const SIZE_OFFSET: usize = FREE_POINTER_OFFSET + 4;
const FLAGS_OFFSET: usize = SIZE_OFFSET + 4;
const LEFT_SIBLING_OFFSET: usize = FLAGS_OFFSET + 1;
const RIGHT_SIBLING_OFFSET: usize = LEFT_SIBLING_OFFSET + 8;
/// Leftmost child of an internal bucket, next free page of a freed one.
const LEFTMOST_CHILD_OFFSET: usize = RIGHT_SIBLING_OFFSET + 8;
const POSITIONS_ARRAY_OFFSET: usize = LEFTMOST_CHILD_OFFSET + 8;

const FLAG_INTERNAL: u8 = 0;
const FLAG_LEAF: u8 = 1;
const FLAG_FREED: u8 = 2;

const NO_PAGE: i64 = -1;

/// Bytes available for entries and their positions.
pub const BUCKET_CAPACITY: usize = PAGE_SIZE - POSITIONS_ARRAY_OFFSET;

/// Largest entry a bucket accepts. Any bucket with fewer than four entries
/// has room for one more, so splitting a full bucket always makes progress.
pub const MAX_ENTRY_SIZE: usize = BUCKET_CAPACITY / 4 - 4;

/// A bucket holding less than this many bytes is underflowed.
pub const UNDERFLOW_THRESHOLD: usize = BUCKET_CAPACITY / 4;

fn encode_link(page: Option<u64>) -> i64 {
    page.map_or(NO_PAGE, |index| index as i64)
}

fn decode_link(raw: i64) -> Option<u64> {
    (raw >= 0).then_some(raw as u64)
}

/// Serialized leaf entry.
pub fn leaf_entry(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut entry = Vec::with_capacity(key.len() + value.len());
    entry.extend_from_slice(key);
    entry.extend_from_slice(value);
    entry
}

/// Serialized internal entry.
pub fn internal_entry(right_child: u64, key: &[u8]) -> Vec<u8> {
    let mut entry = Vec::with_capacity(8 + key.len());
    entry.extend_from_slice(&(right_child as i64).to_le_bytes());
    entry.extend_from_slice(key);
    entry
}

pub struct Bucket<'s, P, K, V> {
    page: P,
    keys: &'s dyn BinarySerializer<K>,
    values: &'s dyn BinarySerializer<V>,
}

impl<'s, P: PageRead, K, V> Bucket<'s, P, K, V> {
    pub fn new(
        page: P,
        keys: &'s dyn BinarySerializer<K>,
        values: &'s dyn BinarySerializer<V>,
    ) -> Self {
        Self { page, keys, values }
    }

    pub fn page(&self) -> &P {
        &self.page
    }

    pub fn into_page(self) -> P {
        self.page
    }

    pub fn size(&self) -> usize {
        self.page.get_u32(SIZE_OFFSET) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_leaf(&self) -> bool {
        self.page.get_u8(FLAGS_OFFSET) == FLAG_LEAF
    }

    pub fn is_freed(&self) -> bool {
        self.page.get_u8(FLAGS_OFFSET) == FLAG_FREED
    }

    pub fn left_sibling(&self) -> Option<u64> {
        decode_link(self.page.get_i64(LEFT_SIBLING_OFFSET))
    }

    pub fn right_sibling(&self) -> Option<u64> {
        decode_link(self.page.get_i64(RIGHT_SIBLING_OFFSET))
    }

    /// Next page of the free list, for freed buckets.
    pub fn next_free_page(&self) -> Option<u64> {
        decode_link(self.page.get_i64(LEFTMOST_CHILD_OFFSET))
    }

    fn free_pointer(&self) -> usize {
        self.page.get_u32(FREE_POINTER_OFFSET) as usize
    }

    pub fn free_space(&self) -> usize {
        self.free_pointer()
            .saturating_sub(POSITIONS_ARRAY_OFFSET + self.size() * 4)
    }

    /// Bytes taken by entries and their positions.
    pub fn used_bytes(&self) -> usize {
        (PAGE_SIZE - self.free_pointer()) + self.size() * 4
    }

    pub fn is_underflowed(&self) -> bool {
        self.used_bytes() < UNDERFLOW_THRESHOLD
    }

    fn position(&self, index: usize) -> usize {
        self.page.get_u32(POSITIONS_ARRAY_OFFSET + index * 4) as usize
    }

    fn key_offset(&self, index: usize) -> usize {
        let position = self.position(index);
        if self.is_leaf() {
            position
        } else {
            position + 8
        }
    }

    /// Serialized key of entry `index`.
    pub fn key_bytes(&self, index: usize) -> &[u8] {
        let offset = self.key_offset(index);
        let bytes = self.page.page_bytes();
        let len = self.keys.object_size_in_bytes(&bytes[offset..]);
        &bytes[offset..offset + len]
    }

    pub fn key(&self, index: usize) -> StorageResult<K> {
        self.keys.deserialize(self.key_bytes(index))
    }

    /// Serialized value of leaf entry `index`.
    pub fn value_bytes(&self, index: usize) -> &[u8] {
        let offset = self.key_offset(index) + self.key_bytes(index).len();
        let bytes = self.page.page_bytes();
        let len = self.values.object_size_in_bytes(&bytes[offset..]);
        &bytes[offset..offset + len]
    }

    pub fn value(&self, index: usize) -> StorageResult<V> {
        self.values.deserialize(self.value_bytes(index))
    }

    /// Right child of internal entry `index`.
    pub fn right_child(&self, index: usize) -> u64 {
        self.page.get_i64(self.position(index)) as u64
    }

    pub fn leftmost_child(&self) -> u64 {
        self.page.get_i64(LEFTMOST_CHILD_OFFSET) as u64
    }

    /// Child number `child` of an internal bucket: 0 is the leftmost child,
    /// `i + 1` the right child of entry `i`.
    pub fn child(&self, child: usize) -> u64 {
        if child == 0 {
            self.leftmost_child()
        } else {
            self.right_child(child - 1)
        }
    }

    pub fn entry_len(&self, index: usize) -> usize {
        let key_len = self.key_bytes(index).len();
        if self.is_leaf() {
            key_len + self.value_bytes(index).len()
        } else {
            8 + key_len
        }
    }

    pub fn raw_entry(&self, index: usize) -> Vec<u8> {
        let position = self.position(index);
        self.page
            .get_bytes(position, self.entry_len(index))
            .to_vec()
    }

    pub fn raw_entries(&self, range: std::ops::Range<usize>) -> Vec<Vec<u8>> {
        range.map(|index| self.raw_entry(index)).collect()
    }

    /// Binary search: `Ok(index)` of an equal key or `Err(index)` of the
    /// insertion point.
    pub fn find(&self, key: &K) -> StorageResult<Result<usize, usize>>
    where
        K: Ord,
    {
        let (mut low, mut high) = (0, self.size());
        while low < high {
            let mid = (low + high) / 2;
            match self.key(mid)?.cmp(key) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(low))
    }

    /// Child number to descend into when looking for `key`. Keys equal to
    /// a separator live right of it.
    pub fn child_index_for(&self, key: &K) -> StorageResult<usize>
    where
        K: Ord,
    {
        Ok(match self.find(key)? {
            Ok(index) => index + 1,
            Err(index) => index,
        })
    }
}

impl<'s, 'a, B: PageBuffer + ?Sized, K, V> Bucket<'s, DurablePage<'a, B>, K, V> {
    pub fn page_mut(&mut self) -> &mut DurablePage<'a, B> {
        &mut self.page
    }

    /// Format the page as an empty bucket.
    pub fn init(&mut self, is_leaf: bool) {
        self.page.set_u32(FREE_POINTER_OFFSET, PAGE_SIZE as u32);
        self.page.set_u32(SIZE_OFFSET, 0);
        self.page
            .set_u8(FLAGS_OFFSET, if is_leaf { FLAG_LEAF } else { FLAG_INTERNAL });
        self.page.set_i64(LEFT_SIBLING_OFFSET, NO_PAGE);
        self.page.set_i64(RIGHT_SIBLING_OFFSET, NO_PAGE);
        self.page.set_i64(LEFTMOST_CHILD_OFFSET, NO_PAGE);
    }

    /// Turn the page into a free-list member pointing at `next_free`.
    pub fn mark_freed(&mut self, next_free: Option<u64>) {
        self.init(false);
        self.page.set_u8(FLAGS_OFFSET, FLAG_FREED);
        self.page
            .set_i64(LEFTMOST_CHILD_OFFSET, encode_link(next_free));
    }

    pub fn set_left_sibling(&mut self, page: Option<u64>) {
        self.page.set_i64(LEFT_SIBLING_OFFSET, encode_link(page));
    }

    pub fn set_right_sibling(&mut self, page: Option<u64>) {
        self.page.set_i64(RIGHT_SIBLING_OFFSET, encode_link(page));
    }

    pub fn set_leftmost_child(&mut self, page: u64) {
        self.page.set_i64(LEFTMOST_CHILD_OFFSET, page as i64);
    }

    fn set_position(&mut self, index: usize, position: usize) {
        self.page
            .set_u32(POSITIONS_ARRAY_OFFSET + index * 4, position as u32);
    }

    /// Insert a serialized entry at `index`. Returns false, leaving the
    /// bucket untouched, if there is not enough room.
    pub fn insert_raw(&mut self, index: usize, entry: &[u8]) -> bool {
        if self.free_space() < entry.len() + 4 {
            return false;
        }
        let size = self.size();
        let position = self.free_pointer() - entry.len();
        self.page.apply_patch(position, entry);
        self.page.set_u32(FREE_POINTER_OFFSET, position as u32);

        let slot = POSITIONS_ARRAY_OFFSET + index * 4;
        self.page.move_data(slot, slot + 4, (size - index) * 4);
        self.set_position(index, position);
        self.page.set_u32(SIZE_OFFSET, (size + 1) as u32);
        true
    }

    /// Append entries after the last one. Returns false as soon as one does
    /// not fit.
    pub fn add_all(&mut self, entries: &[Vec<u8>]) -> bool {
        entries
            .iter()
            .all(|entry| self.insert_raw(self.size(), entry))
    }

    /// Remove entry `index` and compact the entry area.
    pub fn remove(&mut self, index: usize) {
        let size = self.size();
        let position = self.position(index);
        let len = self.entry_len(index);
        let free_pointer = self.free_pointer();

        self.page
            .move_data(free_pointer, free_pointer + len, position - free_pointer);
        for other in 0..size {
            if other != index {
                let other_position = self.position(other);
                if other_position < position {
                    self.set_position(other, other_position + len);
                }
            }
        }

        let slot = POSITIONS_ARRAY_OFFSET + index * 4;
        self.page
            .move_data(slot + 4, slot, (size - index - 1) * 4);
        self.page
            .set_u32(FREE_POINTER_OFFSET, (free_pointer + len) as u32);
        self.page.set_u32(SIZE_OFFSET, (size - 1) as u32);
    }

    /// Replace the value of leaf entry `index`. Returns false, leaving the
    /// bucket untouched, if the new entry would not fit.
    pub fn update_value(&mut self, index: usize, value: &[u8]) -> StorageResult<bool> {
        if !self.is_leaf() {
            return Err(StorageError::consistency(
                "values can only be updated in leaf buckets",
            ));
        }
        let old_len = self.value_bytes(index).len();
        if old_len == value.len() {
            let offset = self.key_offset(index) + self.key_bytes(index).len();
            self.page.apply_patch(offset, value);
            return Ok(true);
        }

        let entry = leaf_entry(self.key_bytes(index), value);
        if self.free_space() + self.entry_len(index) < entry.len() {
            return Ok(false);
        }
        self.remove(index);
        Ok(self.insert_raw(index, &entry))
    }

    /// Set the right child of internal entry `index`.
    pub fn set_right_child(&mut self, index: usize, page: u64) {
        let position = self.position(index);
        self.page.set_i64(position, page as i64);
    }

    /// Keep only the first `new_size` entries, compacted.
    pub fn shrink(&mut self, new_size: usize) {
        let kept = self.raw_entries(0..new_size);
        self.page.set_u32(SIZE_OFFSET, 0);
        self.page
            .set_u32(FREE_POINTER_OFFSET, PAGE_SIZE as u32);
        self.add_all(&kept);
    }
}
