//! # B+Tree Operations
//!
//! This module implements the ordered-map semantics over the storage stack:
//! descent, insertion with splits, deletion with rebalancing, and the
//! structural consistency check.
//!
//! ## Handles
//!
//! [`TreeReader`] is the shared-access handle used under the coordinator's
//! read lock; [`BTree`] is the mutating handle used under the write lock.
//! Readers crab shared page latches down the tree and move right along the
//! leaf sibling chain when a key could live past an unpropagated split.
//! Writers take exclusive latches along the whole descent path and hold
//! them until the operation is complete, so a split or merge can propagate
//! without re-latching.
//!
//! ## Insert
//!
//! ```text
//! 1. Descend to the target leaf, recording (page, child slot) per level
//! 2. Overwrite: an existing cell is removed and its overflow chain freed
//! 3. Values longer than the inline maximum put their tail in a chain
//! 4. If the cell does not fit, split by accumulated cell size, link the
//!    new page into the sibling chain, and insert the separator upstream
//! 5. An interior page past its key maximum splits at ceil(n/2) - 1 with
//!    the median promoted; growing past the root adds a level
//! ```
//!
//! ## Delete
//!
//! Removal from the leaf is followed by the rebalance ladder: borrow from
//! the left sibling, borrow from the right, merge left, merge right; then
//! the interior path rebalances the same way (rotating separators through
//! the parent), and a root left with zero separators collapses into its
//! only child.
//!
//! All sibling checks are gated by byte-fit in addition to the fill
//! minimums, because leaf cells are variable-sized.

use eyre::{bail, ensure, Result};
use hashbrown::HashSet;
use smallvec::SmallVec;

use super::interior::{InteriorNode, InteriorNodeMut};
use super::leaf::{split_index, LeafCell, LeafNode, LeafNodeMut, SearchResult};
use super::{max_internal_keys, min_internal_keys, min_leaf_keys};
use crate::error::StoreError;
use crate::storage::{
    max_inline_value, read_chain, validate_page_header, BufferPool, LatchGuard, LatchManager,
    OverflowStore, PageHeader, PageStore, PageType, Wal, PAGE_HEADER_SIZE,
};

/// Descent path: (page, child slot taken) per interior level, root first.
type Path = SmallVec<[(u32, usize); 8]>;
type Latches = SmallVec<[LatchGuard; 8]>;

/// Shared-access handle: lookups, scans, checks.
#[derive(Clone, Copy)]
pub struct TreeReader<'a> {
    pub(crate) pager: &'a PageStore,
    pub(crate) pool: &'a BufferPool,
    pub(crate) latches: &'a LatchManager,
}

impl<'a> TreeReader<'a> {
    pub fn new(pager: &'a PageStore, pool: &'a BufferPool, latches: &'a LatchManager) -> Self {
        Self {
            pager,
            pool,
            latches,
        }
    }

    /// Walks from the root to the leaf responsible for `key`, crabbing
    /// shared latches: the child latch is taken before the parent latch is
    /// released. Returns the leaf page with its latch still held.
    pub(crate) fn descend_to_leaf(&self, key: u64) -> Result<(u32, LatchGuard)> {
        let meta = self.pager.meta();
        let mut current = meta.root_page();
        let mut held = self.latches.acquire_shared(current);

        for _ in 1..meta.tree_depth() {
            let child = {
                let guard = self.pool.get_page(self.pager, current)?;
                validate_page_header(current, guard.data(), PageType::Internal)?;
                let node = InteriorNode::from_page(guard.data())?;
                node.find_child(key)?.0
            };
            let child_latch = self.latches.acquire_shared(child);
            held = child_latch;
            current = child;
        }
        Ok((current, held))
    }

    pub fn get(&self, key: u64) -> Result<Option<Vec<u8>>> {
        let (mut leaf_page, mut _latch) = self.descend_to_leaf(key)?;

        loop {
            let guard = self.pool.get_page(self.pager, leaf_page)?;
            validate_page_header(leaf_page, guard.data(), PageType::Leaf)?;
            let leaf = LeafNode::from_page(guard.data())?;

            match leaf.find_key(key)? {
                SearchResult::Found(index) => {
                    let value = self.materialize(&leaf, index)?;
                    return Ok(Some(value));
                }
                SearchResult::NotFound(_) => {
                    // Move right: the key may sit past a split whose
                    // separator has not reached the parent yet.
                    let sibling = leaf.right_sibling();
                    if sibling != 0 && leaf.cell_count() > 0 && leaf.last_key()? < key {
                        drop(guard);
                        _latch = self.latches.acquire_shared(sibling);
                        leaf_page = sibling;
                        continue;
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Rebuilds a cell's full value: the inline bytes plus the overflow
    /// chain remainder.
    pub(crate) fn materialize(&self, leaf: &LeafNode<'_>, index: usize) -> Result<Vec<u8>> {
        let total_len = leaf.total_len_at(index)?;
        let inline = leaf.inline_at(index)?;
        let overflow_head = leaf.overflow_head_at(index)?;

        if overflow_head == 0 {
            let take = (total_len as usize).min(inline.len());
            return Ok(inline[..take].to_vec());
        }

        let mut value = Vec::with_capacity(total_len as usize);
        value.extend_from_slice(inline);
        let remainder = total_len - inline.len() as u64;
        value.extend_from_slice(&read_chain(self.pool, self.pager, overflow_head, remainder)?);
        Ok(value)
    }

    /// Structural check: DFS with a visited set, page types per level,
    /// in-node key order, key-count reconciliation, and a monotone sibling
    /// chain covering every leaf. Logs the first discrepancy.
    pub fn consistency_check(&self) -> Result<bool> {
        let meta = self.pager.meta();
        let depth = meta.tree_depth();
        let mut visited: HashSet<u32> = HashSet::new();
        let mut stack: Vec<(u32, u32)> = vec![(meta.root_page(), 1)];
        let mut leaf_cells = 0u64;
        let mut leaf_pages = 0u64;

        while let Some((page_no, level)) = stack.pop() {
            if !visited.insert(page_no) {
                log::warn!("consistency: page {} reached twice", page_no);
                return Ok(false);
            }
            let guard = self.pool.get_page(self.pager, page_no)?;
            let data = guard.data();
            let header = PageHeader::from_bytes(data)?;

            if level == depth {
                if header.page_type() != Some(PageType::Leaf) {
                    log::warn!("consistency: page {} should be a leaf", page_no);
                    return Ok(false);
                }
                let leaf = LeafNode::from_page(data)?;
                for i in 1..leaf.cell_count() {
                    if leaf.key_at(i - 1)? >= leaf.key_at(i)? {
                        log::warn!("consistency: leaf {} keys out of order", page_no);
                        return Ok(false);
                    }
                }
                leaf_cells += leaf.cell_count() as u64;
                leaf_pages += 1;
            } else {
                if header.page_type() != Some(PageType::Internal) {
                    log::warn!("consistency: page {} should be interior", page_no);
                    return Ok(false);
                }
                let node = InteriorNode::from_page(data)?;
                if level > 1 && node.cell_count() == 0 {
                    log::warn!("consistency: non-root interior {} is empty", page_no);
                    return Ok(false);
                }
                for i in 1..node.cell_count() {
                    if node.key_at(i - 1)? >= node.key_at(i)? {
                        log::warn!("consistency: interior {} keys out of order", page_no);
                        return Ok(false);
                    }
                }
                for slot in 0..node.child_slots() {
                    stack.push((node.child_at_slot(slot)?, level + 1));
                }
            }
        }

        if leaf_cells != meta.key_count() {
            log::warn!(
                "consistency: leaves hold {} cells but meta records {}",
                leaf_cells,
                meta.key_count()
            );
            return Ok(false);
        }

        // No page may be both reachable from the root and on the free list.
        for free in self.pager.collect_free_pages()? {
            if visited.contains(&free) {
                log::warn!("consistency: page {} is live and free", free);
                return Ok(false);
            }
        }

        // The sibling chain must cover every leaf in strictly increasing
        // key order.
        let mut current = meta.root_page();
        for _ in 1..depth {
            let guard = self.pool.get_page(self.pager, current)?;
            current = InteriorNode::from_page(guard.data())?.left_child();
        }
        let mut chain_leaves = 0u64;
        let mut previous_last: Option<u64> = None;
        while current != 0 {
            let guard = self.pool.get_page(self.pager, current)?;
            let leaf = LeafNode::from_page(guard.data())?;
            if leaf.cell_count() > 0 {
                if let Some(prev) = previous_last {
                    if prev >= leaf.first_key()? {
                        log::warn!("consistency: sibling chain disorder at leaf {}", current);
                        return Ok(false);
                    }
                }
                previous_last = Some(leaf.last_key()?);
            }
            chain_leaves += 1;
            let next = leaf.right_sibling();
            drop(guard);
            current = next;
        }
        if chain_leaves != leaf_pages {
            log::warn!(
                "consistency: sibling chain covers {} of {} leaves",
                chain_leaves,
                leaf_pages
            );
            return Ok(false);
        }

        Ok(true)
    }

    /// Collects every live pair through a left-to-right leaf walk.
    pub(crate) fn collect_all(&self) -> Result<Vec<(u64, Vec<u8>)>> {
        let meta = self.pager.meta();
        let mut current = meta.root_page();
        for _ in 1..meta.tree_depth() {
            let guard = self.pool.get_page(self.pager, current)?;
            validate_page_header(current, guard.data(), PageType::Internal)?;
            current = InteriorNode::from_page(guard.data())?.left_child();
        }

        let mut out = Vec::new();
        while current != 0 {
            let next = {
                let guard = self.pool.get_page(self.pager, current)?;
                let leaf = LeafNode::from_page(guard.data())?;
                for i in 0..leaf.cell_count() {
                    let key = leaf.key_at(i)?;
                    let value = self.materialize(&leaf, i)?;
                    out.push((key, value));
                }
                leaf.right_sibling()
            };
            current = next;
        }
        Ok(out)
    }
}

/// Mutating handle: inserts, deletes, structural maintenance.
pub struct BTree<'a> {
    pager: &'a mut PageStore,
    pool: &'a BufferPool,
    wal: &'a mut Wal,
    latches: &'a LatchManager,
}

impl<'a> BTree<'a> {
    pub fn new(
        pager: &'a mut PageStore,
        pool: &'a BufferPool,
        wal: &'a mut Wal,
        latches: &'a LatchManager,
    ) -> Self {
        Self {
            pager,
            pool,
            wal,
            latches,
        }
    }

    pub fn reader(&self) -> TreeReader<'_> {
        TreeReader::new(self.pager, self.pool, self.latches)
    }

    /// Exclusive descent recording the child slot taken at each interior
    /// level. Latches stay held for the whole mutation.
    fn descend_with_path(&mut self, key: u64) -> Result<(u32, Path, Latches)> {
        let meta = *self.pager.meta();
        let mut current = meta.root_page();
        let mut path = Path::new();
        let mut latches = Latches::new();
        latches.push(self.latches.acquire_exclusive(current));

        for _ in 1..meta.tree_depth() {
            let (child, slot) = {
                let guard = self.pool.get_page_for_write(self.pager, self.wal, current)?;
                validate_page_header(current, guard.data(), PageType::Internal)?;
                let node = InteriorNode::from_page(guard.data())?;
                node.find_child(key)?
            };
            path.push((current, slot));
            latches.push(self.latches.acquire_exclusive(child));
            current = child;
        }
        Ok((current, path, latches))
    }

    pub fn set(&mut self, key: u64, value: &[u8]) -> Result<()> {
        ensure!(
            value.len() as u64 <= u32::MAX as u64,
            StoreError::ValueTooLarge {
                len: value.len() as u64,
                max: u32::MAX as u64,
            }
        );

        let (leaf_page, path, _latches) = self.descend_with_path(key)?;

        // Overwrite: drop the old cell and its chain first.
        let existing = {
            let mut guard = self.pool.get_page_for_write(self.pager, self.wal, leaf_page)?;
            validate_page_header(leaf_page, guard.data(), PageType::Leaf)?;
            let mut leaf = LeafNodeMut::from_page(guard.data_mut())?;
            match leaf.as_read().find_key(key)? {
                SearchResult::Found(index) => Some(leaf.remove_cell(index)?),
                SearchResult::NotFound(_) => None,
            }
        };
        if let Some(old) = &existing {
            if old.overflow_head != 0 {
                self.free_chain(old.overflow_head)?;
            }
        }

        let inline_len = value.len().min(max_inline_value(self.pager.page_size()));
        let overflow_head = if value.len() > inline_len {
            OverflowStore::new(self.pager, self.pool, self.wal)
                .allocate_chain(&value[inline_len..])?
        } else {
            0
        };
        let cell = LeafCell {
            key,
            total_len: value.len() as u32,
            overflow_head,
            inline: value[..inline_len].to_vec(),
        };

        self.insert_into_leaf(leaf_page, path, cell)?;

        if existing.is_none() {
            let mut meta = *self.pager.meta();
            meta.set_key_count(meta.key_count() + 1);
            self.pager.write_meta(meta)?;
        }
        Ok(())
    }

    fn insert_into_leaf(&mut self, leaf_page: u32, path: Path, cell: LeafCell) -> Result<()> {
        let fits = {
            let guard = self.pool.get_page_for_write(self.pager, self.wal, leaf_page)?;
            LeafNode::from_page(guard.data())?.fits(&cell)?
        };

        if fits {
            let mut guard = self.pool.get_page_for_write(self.pager, self.wal, leaf_page)?;
            let mut leaf = LeafNodeMut::from_page(guard.data_mut())?;
            let index = match leaf.as_read().find_key(cell.key)? {
                SearchResult::NotFound(index) => index,
                SearchResult::Found(_) => bail!("duplicate key {} after overwrite removal", cell.key),
            };
            leaf.insert_cell(index, &cell)?;
            return Ok(());
        }

        // Split: collect, insert sorted, cut at the byte midpoint.
        let page_size = self.pager.page_size();
        let (mut cells, old_sibling) = {
            let guard = self.pool.get_page_for_write(self.pager, self.wal, leaf_page)?;
            let leaf = LeafNode::from_page(guard.data())?;
            (leaf.cells()?, leaf.right_sibling())
        };
        let position = cells.partition_point(|c| c.key < cell.key);
        cells.insert(position, cell);

        // A near-page cell between large neighbors can make every cut
        // overfull on one side; shrinking its inline portion into the
        // overflow chain always restores a feasible cut.
        let mid = loop {
            match split_index(&cells, page_size) {
                Some(mid) => break mid,
                None => self.shrink_widest_cell(&mut cells)?,
            }
        };
        let separator = cells[mid].key;

        let new_page = self.pager.allocate_page()?;
        {
            let mut guard = self.pool.get_page_for_write(self.pager, self.wal, leaf_page)?;
            let mut leaf = LeafNodeMut::from_page(guard.data_mut())?;
            leaf.write_cells(&cells[..mid], new_page)?;
        }
        {
            let mut guard = self.pool.get_page_for_write(self.pager, self.wal, new_page)?;
            let mut leaf = LeafNodeMut::init(guard.data_mut());
            leaf.write_cells(&cells[mid..], old_sibling)?;
        }

        self.propagate_split(path, separator, new_page)
    }

    /// Inserts `(separator, new_child)` into the parent, splitting interior
    /// pages upward; growing past the root adds a level.
    fn propagate_split(&mut self, mut path: Path, separator: u64, new_child: u32) -> Result<()> {
        let page_size = self.pager.page_size();
        let mut separator = separator;
        let mut new_child = new_child;

        while let Some((parent_page, slot)) = path.pop() {
            let count_after = {
                let mut guard = self
                    .pool
                    .get_page_for_write(self.pager, self.wal, parent_page)?;
                let mut node = InteriorNodeMut::from_page(guard.data_mut())?;
                node.insert_cell(slot, separator, new_child)?;
                node.as_read().cell_count()
            };
            if count_after <= max_internal_keys(page_size) {
                return Ok(());
            }

            let (left_child, cells, old_sibling) = {
                let guard = self
                    .pool
                    .get_page_for_write(self.pager, self.wal, parent_page)?;
                let node = InteriorNode::from_page(guard.data())?;
                (node.left_child(), node.separators()?, node.right_sibling())
            };
            let mid = cells.len().div_ceil(2) - 1;
            let (promoted_key, promoted_child) = cells[mid];

            let new_page = self.pager.allocate_page()?;
            {
                let mut guard = self
                    .pool
                    .get_page_for_write(self.pager, self.wal, parent_page)?;
                let mut node = InteriorNodeMut::from_page(guard.data_mut())?;
                node.write_cells(left_child, &cells[..mid], new_page)?;
            }
            {
                let mut guard = self.pool.get_page_for_write(self.pager, self.wal, new_page)?;
                let mut node = InteriorNodeMut::init(guard.data_mut(), promoted_child);
                node.write_cells(promoted_child, &cells[mid + 1..], old_sibling)?;
            }

            separator = promoted_key;
            new_child = new_page;
        }

        // The split reached above the root: add a level.
        let old_root = self.pager.meta().root_page();
        let new_root = self.pager.allocate_page()?;
        {
            let mut guard = self.pool.get_page_for_write(self.pager, self.wal, new_root)?;
            let mut node = InteriorNodeMut::init(guard.data_mut(), old_root);
            node.insert_cell(0, separator, new_child)?;
        }
        let mut meta = *self.pager.meta();
        meta.set_root_page(new_root);
        meta.set_tree_depth(meta.tree_depth() + 1);
        self.pager.write_meta(meta)?;
        Ok(())
    }

    pub fn delete(&mut self, key: u64) -> Result<bool> {
        let (leaf_page, path, _latches) = self.descend_with_path(key)?;

        let removed = {
            let mut guard = self.pool.get_page_for_write(self.pager, self.wal, leaf_page)?;
            validate_page_header(leaf_page, guard.data(), PageType::Leaf)?;
            let mut leaf = LeafNodeMut::from_page(guard.data_mut())?;
            match leaf.as_read().find_key(key)? {
                SearchResult::Found(index) => {
                    let cell = leaf.remove_cell(index)?;
                    Some((cell, index == 0))
                }
                SearchResult::NotFound(_) => None,
            }
        };
        let Some((cell, removed_first)) = removed else {
            return Ok(false);
        };

        if cell.overflow_head != 0 {
            self.free_chain(cell.overflow_head)?;
        }

        // Keep the parent separator tight when the leaf minimum moved.
        if removed_first {
            let new_first = {
                let guard = self.pool.get_page_for_write(self.pager, self.wal, leaf_page)?;
                let leaf = LeafNode::from_page(guard.data())?;
                if leaf.cell_count() > 0 {
                    Some(leaf.first_key()?)
                } else {
                    None
                }
            };
            if let (Some(first), Some(&(parent_page, slot))) = (new_first, path.last()) {
                if slot > 0 {
                    let mut guard = self
                        .pool
                        .get_page_for_write(self.pager, self.wal, parent_page)?;
                    let mut node = InteriorNodeMut::from_page(guard.data_mut())?;
                    node.set_key_at(slot - 1, first)?;
                }
            }
        }

        let mut meta = *self.pager.meta();
        meta.set_key_count(meta.key_count() - 1);
        self.pager.write_meta(meta)?;

        if self.pager.meta().tree_depth() > 1 {
            self.rebalance_leaf(leaf_page, &path)?;
            self.rebalance_interior(&path)?;
        }
        Ok(true)
    }

    fn leaf_snapshot(&mut self, page_no: u32) -> Result<(usize, usize)> {
        let guard = self.pool.get_page_for_write(self.pager, self.wal, page_no)?;
        let leaf = LeafNode::from_page(guard.data())?;
        Ok((leaf.cell_count(), leaf.used_size()?))
    }

    /// Borrow-then-merge ladder for an underfull leaf.
    fn rebalance_leaf(&mut self, leaf_page: u32, path: &Path) -> Result<()> {
        let page_size = self.pager.page_size();
        let minimum = min_leaf_keys(page_size);

        let (count, used) = self.leaf_snapshot(leaf_page)?;
        if count >= minimum {
            return Ok(());
        }
        let Some(&(parent_page, slot)) = path.last() else {
            return Ok(());
        };

        let child_slots = {
            let guard = self
                .pool
                .get_page_for_write(self.pager, self.wal, parent_page)?;
            InteriorNode::from_page(guard.data())?.child_slots()
        };

        // Borrow from the left sibling.
        if slot > 0 {
            let left_page = self.child_at(parent_page, slot - 1)?;
            let (left_count, _) = self.leaf_snapshot(left_page)?;
            if left_count > minimum {
                let moved = {
                    let guard = self.pool.get_page_for_write(self.pager, self.wal, left_page)?;
                    LeafNode::from_page(guard.data())?.cell_at(left_count - 1)?
                };
                if used + moved.footprint() <= page_size {
                    {
                        let mut guard =
                            self.pool.get_page_for_write(self.pager, self.wal, left_page)?;
                        LeafNodeMut::from_page(guard.data_mut())?.remove_cell(left_count - 1)?;
                    }
                    {
                        let mut guard =
                            self.pool.get_page_for_write(self.pager, self.wal, leaf_page)?;
                        LeafNodeMut::from_page(guard.data_mut())?.insert_cell(0, &moved)?;
                    }
                    let mut guard = self
                        .pool
                        .get_page_for_write(self.pager, self.wal, parent_page)?;
                    InteriorNodeMut::from_page(guard.data_mut())?.set_key_at(slot - 1, moved.key)?;
                    return Ok(());
                }
            }
        }

        // Borrow from the right sibling.
        if slot + 1 < child_slots {
            let right_page = self.child_at(parent_page, slot + 1)?;
            let (right_count, _) = self.leaf_snapshot(right_page)?;
            if right_count > minimum {
                let moved = {
                    let guard = self
                        .pool
                        .get_page_for_write(self.pager, self.wal, right_page)?;
                    LeafNode::from_page(guard.data())?.cell_at(0)?
                };
                if used + moved.footprint() <= page_size {
                    let new_first = {
                        let mut guard = self
                            .pool
                            .get_page_for_write(self.pager, self.wal, right_page)?;
                        let mut leaf = LeafNodeMut::from_page(guard.data_mut())?;
                        leaf.remove_cell(0)?;
                        leaf.as_read().first_key()?
                    };
                    {
                        let mut guard =
                            self.pool.get_page_for_write(self.pager, self.wal, leaf_page)?;
                        LeafNodeMut::from_page(guard.data_mut())?.insert_cell(count, &moved)?;
                    }
                    let mut guard = self
                        .pool
                        .get_page_for_write(self.pager, self.wal, parent_page)?;
                    InteriorNodeMut::from_page(guard.data_mut())?.set_key_at(slot, new_first)?;
                    return Ok(());
                }
            }
        }

        // Merge into the left sibling.
        if slot > 0 {
            let left_page = self.child_at(parent_page, slot - 1)?;
            let (_, left_used) = self.leaf_snapshot(left_page)?;
            if left_used + (used - PAGE_HEADER_SIZE) <= page_size {
                self.merge_leaves(left_page, leaf_page, parent_page, slot - 1)?;
                return Ok(());
            }
        }

        // Merge the right sibling into this leaf.
        if slot + 1 < child_slots {
            let right_page = self.child_at(parent_page, slot + 1)?;
            let (_, right_used) = self.leaf_snapshot(right_page)?;
            if used + (right_used - PAGE_HEADER_SIZE) <= page_size {
                self.merge_leaves(leaf_page, right_page, parent_page, slot)?;
            }
        }
        Ok(())
    }

    /// Moves all of `right_page`'s cells into `left_page`, unlinks and frees
    /// `right_page`, and drops the separator at `separator_index`.
    fn merge_leaves(
        &mut self,
        left_page: u32,
        right_page: u32,
        parent_page: u32,
        separator_index: usize,
    ) -> Result<()> {
        let (right_cells, right_sibling) = {
            let guard = self
                .pool
                .get_page_for_write(self.pager, self.wal, right_page)?;
            let leaf = LeafNode::from_page(guard.data())?;
            (leaf.cells()?, leaf.right_sibling())
        };
        {
            let mut guard = self.pool.get_page_for_write(self.pager, self.wal, left_page)?;
            let mut leaf = LeafNodeMut::from_page(guard.data_mut())?;
            let mut index = leaf.as_read().cell_count();
            for cell in &right_cells {
                leaf.insert_cell(index, cell)?;
                index += 1;
            }
            leaf.set_right_sibling(right_sibling);
        }
        self.free_page(right_page)?;

        let mut guard = self
            .pool
            .get_page_for_write(self.pager, self.wal, parent_page)?;
        InteriorNodeMut::from_page(guard.data_mut())?.remove_cell(separator_index)?;
        Ok(())
    }

    /// Rebalances interior nodes from the leaf's parent to the root, then
    /// collapses an empty root.
    fn rebalance_interior(&mut self, path: &Path) -> Result<()> {
        let page_size = self.pager.page_size();
        let minimum = min_internal_keys(page_size);

        for i in (0..path.len()).rev() {
            let (page_no, _) = path[i];
            let count = {
                let guard = self.pool.get_page_for_write(self.pager, self.wal, page_no)?;
                InteriorNode::from_page(guard.data())?.cell_count()
            };

            if i == 0 {
                // The root tolerates any key count, but collapses at zero.
                if count == 0 {
                    let new_root = {
                        let guard =
                            self.pool.get_page_for_write(self.pager, self.wal, page_no)?;
                        InteriorNode::from_page(guard.data())?.left_child()
                    };
                    self.free_page(page_no)?;
                    let mut meta = *self.pager.meta();
                    meta.set_root_page(new_root);
                    meta.set_tree_depth(meta.tree_depth() - 1);
                    self.pager.write_meta(meta)?;
                }
                return Ok(());
            }

            if count >= minimum {
                return Ok(());
            }
            let (parent_page, node_slot) = path[i - 1];
            self.rebalance_interior_node(page_no, parent_page, node_slot)?;
        }
        Ok(())
    }

    fn child_at(&mut self, parent_page: u32, slot: usize) -> Result<u32> {
        let guard = self
            .pool
            .get_page_for_write(self.pager, self.wal, parent_page)?;
        InteriorNode::from_page(guard.data())?.child_at_slot(slot)
    }

    fn interior_count(&mut self, page_no: u32) -> Result<usize> {
        let guard = self.pool.get_page_for_write(self.pager, self.wal, page_no)?;
        Ok(InteriorNode::from_page(guard.data())?.cell_count())
    }

    /// Borrow-then-merge ladder for one underfull interior node, rotating
    /// separators through the parent.
    fn rebalance_interior_node(
        &mut self,
        node_page: u32,
        parent_page: u32,
        node_slot: usize,
    ) -> Result<()> {
        let page_size = self.pager.page_size();
        let minimum = min_internal_keys(page_size);
        let maximum = max_internal_keys(page_size);

        let child_slots = {
            let guard = self
                .pool
                .get_page_for_write(self.pager, self.wal, parent_page)?;
            InteriorNode::from_page(guard.data())?.child_slots()
        };
        let node_count = self.interior_count(node_page)?;

        // Rotate from the left sibling through the parent separator.
        if node_slot > 0 {
            let left_page = self.child_at(parent_page, node_slot - 1)?;
            let left_count = self.interior_count(left_page)?;
            if left_count > minimum {
                let separator = {
                    let guard = self
                        .pool
                        .get_page_for_write(self.pager, self.wal, parent_page)?;
                    InteriorNode::from_page(guard.data())?.key_at(node_slot - 1)?
                };
                let (left_last_key, left_last_child) = {
                    let mut guard =
                        self.pool.get_page_for_write(self.pager, self.wal, left_page)?;
                    InteriorNodeMut::from_page(guard.data_mut())?.remove_cell(left_count - 1)?
                };
                {
                    let mut guard =
                        self.pool.get_page_for_write(self.pager, self.wal, node_page)?;
                    let mut node = InteriorNodeMut::from_page(guard.data_mut())?;
                    let old_left_child = node.as_read().left_child();
                    node.insert_cell(0, separator, old_left_child)?;
                    node.set_left_child(left_last_child);
                }
                let mut guard = self
                    .pool
                    .get_page_for_write(self.pager, self.wal, parent_page)?;
                InteriorNodeMut::from_page(guard.data_mut())?
                    .set_key_at(node_slot - 1, left_last_key)?;
                return Ok(());
            }
        }

        // Rotate from the right sibling.
        if node_slot + 1 < child_slots {
            let right_page = self.child_at(parent_page, node_slot + 1)?;
            let right_count = self.interior_count(right_page)?;
            if right_count > minimum {
                let separator = {
                    let guard = self
                        .pool
                        .get_page_for_write(self.pager, self.wal, parent_page)?;
                    InteriorNode::from_page(guard.data())?.key_at(node_slot)?
                };
                let (right_first_key, right_old_left, right_first_child) = {
                    let guard =
                        self.pool.get_page_for_write(self.pager, self.wal, right_page)?;
                    let node = InteriorNode::from_page(guard.data())?;
                    (node.key_at(0)?, node.left_child(), node.child_at(0)?)
                };
                {
                    let mut guard =
                        self.pool.get_page_for_write(self.pager, self.wal, node_page)?;
                    InteriorNodeMut::from_page(guard.data_mut())?.insert_cell(
                        node_count,
                        separator,
                        right_old_left,
                    )?;
                }
                {
                    let mut guard =
                        self.pool.get_page_for_write(self.pager, self.wal, right_page)?;
                    let mut node = InteriorNodeMut::from_page(guard.data_mut())?;
                    node.remove_cell(0)?;
                    node.set_left_child(right_first_child);
                }
                let mut guard = self
                    .pool
                    .get_page_for_write(self.pager, self.wal, parent_page)?;
                InteriorNodeMut::from_page(guard.data_mut())?.set_key_at(node_slot, right_first_key)?;
                return Ok(());
            }
        }

        // Merge into the left sibling, parent separator as glue.
        if node_slot > 0 {
            let left_page = self.child_at(parent_page, node_slot - 1)?;
            let left_count = self.interior_count(left_page)?;
            if left_count + 1 + node_count <= maximum {
                self.merge_interiors(left_page, node_page, parent_page, node_slot - 1)?;
                return Ok(());
            }
        }

        // Merge the right sibling into this node.
        if node_slot + 1 < child_slots {
            let right_page = self.child_at(parent_page, node_slot + 1)?;
            let right_count = self.interior_count(right_page)?;
            if node_count + 1 + right_count <= maximum {
                self.merge_interiors(node_page, right_page, parent_page, node_slot)?;
            }
        }
        Ok(())
    }

    /// Concatenates `right_page` onto `left_page` with the parent separator
    /// as glue, then frees `right_page`.
    fn merge_interiors(
        &mut self,
        left_page: u32,
        right_page: u32,
        parent_page: u32,
        separator_index: usize,
    ) -> Result<()> {
        let separator = {
            let guard = self
                .pool
                .get_page_for_write(self.pager, self.wal, parent_page)?;
            InteriorNode::from_page(guard.data())?.key_at(separator_index)?
        };
        let (right_left_child, right_cells, right_sibling) = {
            let guard = self
                .pool
                .get_page_for_write(self.pager, self.wal, right_page)?;
            let node = InteriorNode::from_page(guard.data())?;
            (node.left_child(), node.separators()?, node.right_sibling())
        };
        {
            let mut guard = self.pool.get_page_for_write(self.pager, self.wal, left_page)?;
            let mut node = InteriorNodeMut::from_page(guard.data_mut())?;
            let mut index = node.as_read().cell_count();
            node.insert_cell(index, separator, right_left_child)?;
            index += 1;
            for &(key, child) in &right_cells {
                node.insert_cell(index, key, child)?;
                index += 1;
            }
            node.set_right_sibling(right_sibling);
        }
        self.free_page(right_page)?;

        let mut guard = self
            .pool
            .get_page_for_write(self.pager, self.wal, parent_page)?;
        InteriorNodeMut::from_page(guard.data_mut())?.remove_cell(separator_index)?;
        Ok(())
    }

    /// Rewrites the cell with the largest inline portion to carry half as
    /// many inline bytes, pushing the rest into a rebuilt overflow chain.
    fn shrink_widest_cell(&mut self, cells: &mut [LeafCell]) -> Result<()> {
        let index = cells
            .iter()
            .enumerate()
            .max_by_key(|(_, c)| c.inline.len())
            .map(|(i, _)| i)
            .expect("split candidates are never empty");
        let (key, total_len, old_head, inline) = {
            let cell = &cells[index];
            (cell.key, cell.total_len, cell.overflow_head, cell.inline.clone())
        };
        ensure!(inline.len() >= 2, "cannot shrink cell for key {} any further", key);

        let mut full = inline;
        if old_head != 0 {
            let tail_len = total_len as u64 - full.len() as u64;
            full.extend_from_slice(&read_chain(self.pool, self.pager, old_head, tail_len)?);
            self.free_chain(old_head)?;
        }

        let new_inline = full.len().min(cells[index].inline.len() / 2);
        let overflow_head = OverflowStore::new(self.pager, self.pool, self.wal)
            .allocate_chain(&full[new_inline..])?;
        cells[index] = LeafCell {
            key,
            total_len,
            overflow_head,
            inline: full[..new_inline].to_vec(),
        };
        Ok(())
    }

    fn free_page(&mut self, page_no: u32) -> Result<()> {
        self.pool.drop_page(page_no)?;
        self.pager.free_page(page_no)
    }

    fn free_chain(&mut self, head: u32) -> Result<()> {
        OverflowStore::new(self.pager, self.pool, self.wal).free_chain(head)
    }
}
