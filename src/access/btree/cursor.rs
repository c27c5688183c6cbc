//! Range cursor over the leaves of an [`SBTree`].
//!
//! The cursor copies one leaf at a time under the tree's shared lock and
//! remembers the last key it returned, not a page position. If the next leaf
//! was merged away or reused in between, it descends again from that key, so
//! concurrent writers never make it return a key twice or out of order.

use super::SBTree;
use crate::storage::error::StorageResult;
use std::collections::VecDeque;
use std::ops::Bound;

enum CursorState {
    /// Descend from the root before reading the next leaf.
    Unpositioned,
    Positioned { page: u64 },
    Exhausted,
}

pub struct SBTreeCursor<'t, K, V> {
    tree: &'t SBTree<K, V>,
    lower: Bound<K>,
    upper: Bound<K>,
    ascending: bool,
    state: CursorState,
    buffer: VecDeque<(K, V)>,
    last_key: Option<K>,
}

impl<'t, K: Ord + Clone, V: Clone> SBTreeCursor<'t, K, V> {
    pub(crate) fn new(
        tree: &'t SBTree<K, V>,
        lower: Bound<K>,
        upper: Bound<K>,
        ascending: bool,
    ) -> Self {
        let empty = match (&lower, &upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u))
            | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
            _ => false,
        };
        Self {
            tree,
            lower,
            upper,
            ascending,
            state: if empty {
                CursorState::Exhausted
            } else {
                CursorState::Unpositioned
            },
            buffer: VecDeque::new(),
            last_key: None,
        }
    }

    fn seek(&self) -> StorageResult<u64> {
        let start = if self.ascending { &self.lower } else { &self.upper };
        let anchor = self.last_key.as_ref().or(match start {
            Bound::Included(key) | Bound::Excluded(key) => Some(key),
            Bound::Unbounded => None,
        });
        match anchor {
            Some(key) => self.tree.find_leaf(key),
            None => self.tree.find_edge_leaf(self.ascending),
        }
    }

    /// Already returned, or before the start bound.
    fn skipped(&self, key: &K) -> bool {
        if self.ascending {
            self.last_key.as_ref().is_some_and(|last| key <= last)
                || match &self.lower {
                    Bound::Included(l) => key < l,
                    Bound::Excluded(l) => key <= l,
                    Bound::Unbounded => false,
                }
        } else {
            self.last_key.as_ref().is_some_and(|last| key >= last)
                || match &self.upper {
                    Bound::Included(u) => key > u,
                    Bound::Excluded(u) => key >= u,
                    Bound::Unbounded => false,
                }
        }
    }

    fn past_end(&self, key: &K) -> bool {
        if self.ascending {
            match &self.upper {
                Bound::Included(u) => key > u,
                Bound::Excluded(u) => key >= u,
                Bound::Unbounded => false,
            }
        } else {
            match &self.lower {
                Bound::Included(l) => key < l,
                Bound::Excluded(l) => key <= l,
                Bound::Unbounded => false,
            }
        }
    }

    fn fill(&mut self) -> StorageResult<()> {
        let tree = self.tree;
        while self.buffer.is_empty() {
            let _lock = tree.read_lock();
            let (page, reseeked) = match self.state {
                CursorState::Exhausted => return Ok(()),
                CursorState::Unpositioned => (self.seek()?, true),
                CursorState::Positioned { page } => (page, false),
            };

            let leaf = match tree.read_leaf(page)? {
                Some(leaf) => leaf,
                None if !reseeked => {
                    // Merged away or reused since the cursor was positioned
                    self.state = CursorState::Unpositioned;
                    continue;
                }
                None => {
                    return Err(crate::storage::error::StorageError::consistency(format!(
                        "descent ended at non-leaf page {}",
                        page
                    )))
                }
            };

            let mut finished = false;
            let entries: Box<dyn Iterator<Item = (K, V)>> = if self.ascending {
                Box::new(leaf.entries.into_iter())
            } else {
                Box::new(leaf.entries.into_iter().rev())
            };
            for (key, value) in entries {
                if self.skipped(&key) {
                    continue;
                }
                if self.past_end(&key) {
                    finished = true;
                    break;
                }
                self.buffer.push_back((key, value));
            }

            let next = if self.ascending {
                leaf.right_sibling
            } else {
                leaf.left_sibling
            };
            self.state = match next {
                Some(page) if !finished => CursorState::Positioned { page },
                _ => CursorState::Exhausted,
            };
        }
        Ok(())
    }
}

impl<K: Ord + Clone, V: Clone> Iterator for SBTreeCursor<'_, K, V> {
    type Item = StorageResult<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if let Err(e) = self.fill() {
                self.state = CursorState::Exhausted;
                return Some(Err(e));
            }
        }
        let (key, value) = self.buffer.pop_front()?;
        self.last_key = Some(key.clone());
        Some(Ok((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use crate::access::btree::{IntegerSerializer, KeyType, LongSerializer, SBTree};
    use crate::storage::atomic::AtomicOperationsManager;
    use crate::storage::buffer::ReadCache;
    use crate::storage::error::StorageResult;
    use crate::storage::wal::{WalConfig, WriteAheadLog};
    use crate::storage::write_cache::WriteCache;
    use anyhow::Result;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn keys(cursor: impl Iterator<Item = StorageResult<(i32, i64)>>) -> Result<Vec<i32>> {
        Ok(cursor
            .map(|entry| entry.map(|(key, _)| key))
            .collect::<StorageResult<_>>()?)
    }

    #[test]
    fn test_range_queries() -> Result<()> {
        let dir = tempdir()?;
        let wal = WriteAheadLog::open(WalConfig::new(dir.path().join("wal")))?;
        let write_cache = Arc::new(WriteCache::open(dir.path(), Some(Arc::clone(&wal)), true)?);
        let cache = ReadCache::with_lru(write_cache, 128);
        let atomic = Arc::new(AtomicOperationsManager::new(wal, cache));
        let tree: SBTree<i32, i64> = SBTree::create(
            "ranges",
            atomic,
            Arc::new(IntegerSerializer),
            Arc::new(LongSerializer),
            &[KeyType::Integer],
            1,
            false,
        )?;
        // Even keys only, enough to span many leaves
        for key in (0..4000).step_by(2) {
            tree.put(&key, &(key as i64 * 10))?;
        }

        let all = keys(tree.iter_all(true))?;
        assert_eq!(all, (0..4000).step_by(2).collect::<Vec<_>>());
        let mut reversed = keys(tree.iter_all(false))?;
        reversed.reverse();
        assert_eq!(reversed, all);

        assert_eq!(
            keys(tree.iterate_entries_between(&10, true, &20, false, true))?,
            vec![10, 12, 14, 16, 18]
        );
        assert_eq!(
            keys(tree.iterate_entries_between(&9, false, &21, true, false))?,
            vec![20, 18, 16, 14, 12, 10]
        );
        assert_eq!(
            keys(tree.iterate_entries_major(&3990, false, true))?,
            vec![3992, 3994, 3996, 3998]
        );
        assert_eq!(
            keys(tree.iterate_entries_major(&3990, true, false))?,
            vec![3998, 3996, 3994, 3992, 3990]
        );
        assert_eq!(
            keys(tree.iterate_entries_minor(&6, true, true))?,
            vec![0, 2, 4, 6]
        );
        assert_eq!(keys(tree.iterate_entries_minor(&0, false, true))?, vec![]);
        assert!(keys(tree.iterate_entries_between(&30, true, &20, true, true))?.is_empty());

        let (key, value) = tree
            .iterate_entries_major(&1001, true, true)
            .next()
            .transpose()?
            .expect("entry above 1001");
        assert_eq!((key, value), (1002, 10020));
        Ok(())
    }

    #[test]
    fn test_cursor_survives_concurrent_removal() -> Result<()> {
        let dir = tempdir()?;
        let wal = WriteAheadLog::open(WalConfig::new(dir.path().join("wal")))?;
        let write_cache = Arc::new(WriteCache::open(dir.path(), Some(Arc::clone(&wal)), true)?);
        let cache = ReadCache::with_lru(write_cache, 128);
        let atomic = Arc::new(AtomicOperationsManager::new(wal, cache));
        let tree: SBTree<i32, i64> = SBTree::create(
            "moving",
            atomic,
            Arc::new(IntegerSerializer),
            Arc::new(LongSerializer),
            &[KeyType::Integer],
            1,
            false,
        )?;
        for key in 0..3000 {
            tree.put(&key, &0)?;
        }

        let mut cursor = tree.iter_all(true);
        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(cursor.next().transpose()?.map(|(key, _)| key));
        }
        // Emptying the tree frees every leaf the cursor knew about
        for key in 0..2900 {
            tree.remove(&key)?;
        }
        let rest = keys(cursor)?;

        assert_eq!(seen, (0..10).map(Some).collect::<Vec<_>>());
        assert!(rest.windows(2).all(|w| w[0] < w[1]));
        assert!(rest.iter().all(|key| *key >= 10));
        assert_eq!(&rest[rest.len() - 100..], &(2900..3000).collect::<Vec<_>>()[..]);
        Ok(())
    }
}
