//! # Range Cursor
//!
//! Lazy inclusive scan over `[start, end]`. The cursor positions itself on
//! the first cell at or above the start key, then walks cells and follows
//! the leaf sibling chain. Each step pins and latches only the leaf it is
//! currently reading, so arbitrarily long scans hold one frame at a time.

use eyre::Result;

use super::leaf::{LeafNode, SearchResult};
use super::tree::TreeReader;
use crate::storage::{validate_page_header, PageType};

pub struct RangeCursor<'a> {
    reader: TreeReader<'a>,
    current_leaf: u32,
    index: usize,
    end: u64,
    done: bool,
}

/// Detached cursor position, used by iterators that cannot hold the borrow
/// of a [`TreeReader`] across yields.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CursorState {
    current_leaf: u32,
    index: usize,
    end: u64,
    done: bool,
}

impl<'a> RangeCursor<'a> {
    /// Rebuilds a cursor from a detached position.
    pub(crate) fn resume(reader: TreeReader<'a>, state: CursorState) -> Self {
        Self {
            reader,
            current_leaf: state.current_leaf,
            index: state.index,
            end: state.end,
            done: state.done,
        }
    }

    /// Detaches the current position.
    pub(crate) fn state(&self) -> CursorState {
        CursorState {
            current_leaf: self.current_leaf,
            index: self.index,
            end: self.end,
            done: self.done,
        }
    }

    /// Positions a cursor on the first key at or above `start`. An empty
    /// interval (`end < start`) yields nothing.
    pub(crate) fn new(reader: TreeReader<'a>, start: u64, end: u64) -> Result<Self> {
        if end < start {
            return Ok(Self {
                reader,
                current_leaf: 0,
                index: 0,
                end,
                done: true,
            });
        }

        let (leaf_page, _latch) = reader.descend_to_leaf(start)?;
        let index = {
            let guard = reader.pool.get_page(reader.pager, leaf_page)?;
            validate_page_header(leaf_page, guard.data(), PageType::Leaf)?;
            let leaf = LeafNode::from_page(guard.data())?;
            match leaf.find_key(start)? {
                SearchResult::Found(index) => index,
                SearchResult::NotFound(index) => index,
            }
        };

        Ok(Self {
            reader,
            current_leaf: leaf_page,
            index,
            end,
            done: false,
        })
    }

    /// Yields the next pair at or below the end key.
    pub fn next_entry(&mut self) -> Result<Option<(u64, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }

        loop {
            let _latch = self.reader.latches.acquire_shared(self.current_leaf);
            let guard = self.reader.pool.get_page(self.reader.pager, self.current_leaf)?;
            let leaf = LeafNode::from_page(guard.data())?;

            if self.index < leaf.cell_count() {
                let key = leaf.key_at(self.index)?;
                if key > self.end {
                    self.done = true;
                    return Ok(None);
                }
                let value = self.reader.materialize(&leaf, self.index)?;
                self.index += 1;
                return Ok(Some((key, value)));
            }

            let sibling = leaf.right_sibling();
            drop(guard);
            if sibling == 0 {
                self.done = true;
                return Ok(None);
            }
            self.current_leaf = sibling;
            self.index = 0;
        }
    }
}

impl Iterator for RangeCursor<'_> {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::BTree;
    use crate::config::{EvictionPolicy, StoreOptions};
    use crate::storage::{BufferPool, LatchManager, PageStore, Wal};
    use tempfile::{tempdir, TempDir};

    const PAGE: usize = 512;

    struct Fixture {
        _dir: TempDir,
        pager: PageStore,
        wal: Wal,
        pool: BufferPool,
        latches: LatchManager,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let opts = StoreOptions::new(dir.path().join("t.db")).page_size(PAGE);
            let pager = PageStore::open(&opts).unwrap();
            let wal = Wal::open(dir.path().join("t.db.wal"), PAGE).unwrap();
            let pool = BufferPool::new(32, PAGE, EvictionPolicy::Lru, false);
            Self {
                _dir: dir,
                pager,
                wal,
                pool,
                latches: LatchManager::new(),
            }
        }

        fn populate(&mut self, keys: impl Iterator<Item = u64>) {
            let mut tree = BTree::new(&mut self.pager, &self.pool, &mut self.wal, &self.latches);
            for key in keys {
                tree.set(key, &key.to_le_bytes()).unwrap();
            }
        }

        fn reader(&self) -> TreeReader<'_> {
            TreeReader::new(&self.pager, &self.pool, &self.latches)
        }
    }

    fn drain(cursor: RangeCursor<'_>) -> Vec<u64> {
        cursor.map(|entry| entry.unwrap().0).collect()
    }

    #[test]
    fn scans_inclusive_interval_in_order() {
        let mut fx = Fixture::new();
        fx.populate(0..100);

        let keys = drain(RangeCursor::new(fx.reader(), 10, 20).unwrap());
        assert_eq!(keys, (10..=20).collect::<Vec<u64>>());
    }

    #[test]
    fn empty_interval_yields_nothing() {
        let mut fx = Fixture::new();
        fx.populate(0..10);

        let keys = drain(RangeCursor::new(fx.reader(), 8, 3).unwrap());
        assert!(keys.is_empty());
    }

    #[test]
    fn scan_crosses_leaf_boundaries() {
        let mut fx = Fixture::new();
        fx.populate(0..200);
        assert!(fx.pager.meta().tree_depth() > 1);

        let keys = drain(RangeCursor::new(fx.reader(), 0, 199).unwrap());
        assert_eq!(keys.len(), 200);
        assert_eq!(keys, (0..200).collect::<Vec<u64>>());
    }

    #[test]
    fn start_between_keys_snaps_forward() {
        let mut fx = Fixture::new();
        fx.populate((0..50).map(|k| k * 10));

        let keys = drain(RangeCursor::new(fx.reader(), 11, 35).unwrap());
        assert_eq!(keys, vec![20, 30]);
    }

    #[test]
    fn values_materialize_during_scan() {
        let mut fx = Fixture::new();
        fx.populate(0..20);

        let mut cursor = RangeCursor::new(fx.reader(), 5, 7).unwrap();
        while let Some((key, value)) = cursor.next_entry().unwrap() {
            assert_eq!(value, key.to_le_bytes().to_vec());
        }
    }

    #[test]
    fn scan_past_tree_end_terminates() {
        let mut fx = Fixture::new();
        fx.populate(0..10);

        let keys = drain(RangeCursor::new(fx.reader(), 5, u64::MAX).unwrap());
        assert_eq!(keys, (5..10).collect::<Vec<u64>>());
    }

    #[test]
    fn two_cursors_scan_independently() {
        let mut fx = Fixture::new();
        fx.populate(0..100);

        let mut a = RangeCursor::new(fx.reader(), 0, 49).unwrap();
        let mut b = RangeCursor::new(fx.reader(), 50, 99).unwrap();

        let mut seen = Vec::new();
        loop {
            let from_a = a.next_entry().unwrap();
            let from_b = b.next_entry().unwrap();
            if from_a.is_none() && from_b.is_none() {
                break;
            }
            if let Some((key, _)) = from_a {
                seen.push(key);
            }
            if let Some((key, _)) = from_b {
                seen.push(key);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<u64>>());
    }
}
