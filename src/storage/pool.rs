//! # Buffer Pool
//!
//! A bounded, pinning cache of page frames keyed by page number. Every page
//! the tree touches is read and mutated through a frame here; the on-disk
//! bytes of a dirty frame never change before the frame has been flushed
//! through a WAL transaction.
//!
//! ## Frames and Pins
//!
//! ```text
//! Frame {
//!     page_no:     u32
//!     data:        Box<[u8]>     page-sized buffer
//!     dirty:       AtomicBool
//!     pin_count:   AtomicU32     > 0 blocks eviction
//!     last_access: AtomicU64     logical clock stamp (LRU)
//!     visited:     AtomicBool    second-chance bit (clock)
//! }
//! ```
//!
//! [`PageGuard`] is the pin handle: acquiring a page pins it, dropping the
//! guard unpins it, and `data_mut` marks the frame dirty. Guards keep the
//! frame buffer valid: an evicted or dropped frame can never be pinned.
//!
//! ## Eviction
//!
//! When the pool is full the configured policy selects a victim among
//! unpinned frames:
//!
//! - **LRU** picks the smallest `last_access` stamp.
//! - **Clock** sweeps a hand over the frame table, clearing second-chance
//!   bits, skipping pinned frames, giving up after two full revolutions.
//!
//! A dirty victim is flushed (WAL transaction, then write-back) before
//! removal. On the read path no WAL is available, so only clean frames are
//! eligible; the coordinator guarantees dirty frames exist only while the
//! single writer is running. If no victim exists the caller gets
//! `PoolExhausted`.
//!
//! ## Flushing
//!
//! `flush_page` copies the frame image, stages it as a single-page WAL
//! transaction, commits (honoring group commit), then writes through to the
//! page store and clears the dirty bit. `flush_all` does this for every
//! dirty frame.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::{PageStore, Wal};
use crate::config::EvictionPolicy;
use crate::error::StoreError;

struct Frame {
    page_no: u32,
    data: Box<[u8]>,
    dirty: AtomicBool,
    pin_count: AtomicU32,
    last_access: AtomicU64,
    visited: AtomicBool,
}

impl Frame {
    fn new(page_no: u32, page_size: usize) -> Self {
        Self {
            page_no,
            data: vec![0u8; page_size].into_boxed_slice(),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            last_access: AtomicU64::new(0),
            visited: AtomicBool::new(false),
        }
    }

    fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

struct PoolInner {
    frames: Vec<Frame>,
    index: HashMap<u32, usize>,
    hand: usize,
}

impl PoolInner {
    fn remove(&mut self, idx: usize) -> Frame {
        let frame = self.frames.swap_remove(idx);
        self.index.remove(&frame.page_no);
        if idx < self.frames.len() {
            let moved = self.frames[idx].page_no;
            self.index.insert(moved, idx);
        }
        if self.hand >= self.frames.len() {
            self.hand = 0;
        }
        frame
    }
}

/// Accumulated pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Pages loaded from the page store on miss.
    pub loads: u64,
    /// Dirty frames flushed through the WAL.
    pub flushes: u64,
    /// Frames evicted to make room.
    pub evictions: u64,
    /// High-water mark of resident frames.
    pub max_resident: u64,
}

pub struct BufferPool {
    inner: RwLock<PoolInner>,
    capacity: usize,
    page_size: usize,
    policy: EvictionPolicy,
    group_commit: bool,
    tick: AtomicU64,
    loads: AtomicU64,
    flushes: AtomicU64,
    evictions: AtomicU64,
    max_resident: AtomicU64,
}

impl BufferPool {
    pub fn new(
        capacity: usize,
        page_size: usize,
        policy: EvictionPolicy,
        group_commit: bool,
    ) -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                frames: Vec::with_capacity(capacity),
                index: HashMap::with_capacity(capacity),
                hand: 0,
            }),
            capacity,
            page_size,
            policy,
            group_commit,
            tick: AtomicU64::new(1),
            loads: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            max_resident: AtomicU64::new(0),
        }
    }

    fn touch(&self, frame: &Frame) {
        let stamp = self.tick.fetch_add(1, Ordering::Relaxed);
        frame.last_access.store(stamp, Ordering::Relaxed);
        frame.visited.store(true, Ordering::Release);
    }

    /// Pins page `page_no`, loading it from the page store on miss. Read
    /// paths call this form; eviction will only consider clean frames.
    pub fn get_page(&self, pager: &PageStore, page_no: u32) -> Result<PageGuard<'_>> {
        self.fetch(pager, None, page_no)
    }

    /// Pins page `page_no` for a mutation path. Dirty frames may be evicted
    /// because the WAL is on hand to flush them first.
    pub fn get_page_for_write(
        &self,
        pager: &PageStore,
        wal: &mut Wal,
        page_no: u32,
    ) -> Result<PageGuard<'_>> {
        self.fetch(pager, Some(wal), page_no)
    }

    fn fetch(
        &self,
        pager: &PageStore,
        mut wal: Option<&mut Wal>,
        page_no: u32,
    ) -> Result<PageGuard<'_>> {
        {
            let inner = self.inner.read();
            if let Some(&idx) = inner.index.get(&page_no) {
                let frame = &inner.frames[idx];
                frame.pin_count.fetch_add(1, Ordering::AcqRel);
                self.touch(frame);
                return Ok(PageGuard {
                    pool: self,
                    page_no,
                });
            }
        }

        let mut inner = self.inner.write();
        if let Some(&idx) = inner.index.get(&page_no) {
            let frame = &inner.frames[idx];
            frame.pin_count.fetch_add(1, Ordering::AcqRel);
            self.touch(frame);
            return Ok(PageGuard {
                pool: self,
                page_no,
            });
        }

        if inner.frames.len() >= self.capacity {
            let can_flush = wal.is_some();
            let victim = self.select_victim(&mut inner, can_flush);
            match victim {
                Some(idx) => {
                    if inner.frames[idx].is_dirty() {
                        let wal = wal
                            .as_deref_mut()
                            .expect("dirty victims require a WAL handle");
                        self.flush_frame(&inner.frames[idx], pager, wal)?;
                    }
                    inner.remove(idx);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => bail!(StoreError::PoolExhausted),
            }
        }

        let mut frame = Frame::new(page_no, self.page_size);
        pager.read_page(page_no, &mut frame.data)?;
        frame.pin_count.store(1, Ordering::Release);
        self.touch(&frame);
        self.loads.fetch_add(1, Ordering::Relaxed);

        let idx = inner.frames.len();
        inner.frames.push(frame);
        inner.index.insert(page_no, idx);
        self.max_resident
            .fetch_max(inner.frames.len() as u64, Ordering::Relaxed);

        Ok(PageGuard {
            pool: self,
            page_no,
        })
    }

    /// Picks an evictable frame index, or None when every candidate is
    /// pinned (or dirty on the read path).
    fn select_victim(&self, inner: &mut PoolInner, can_flush: bool) -> Option<usize> {
        let eligible = |frame: &Frame| !frame.is_pinned() && (can_flush || !frame.is_dirty());

        match self.policy {
            EvictionPolicy::Lru => inner
                .frames
                .iter()
                .enumerate()
                .filter(|(_, f)| eligible(f))
                .min_by_key(|(_, f)| f.last_access.load(Ordering::Relaxed))
                .map(|(idx, _)| idx),
            EvictionPolicy::Clock => {
                let len = inner.frames.len();
                if len == 0 {
                    return None;
                }
                for _ in 0..2 * len {
                    let idx = inner.hand;
                    inner.hand = (inner.hand + 1) % len;

                    let frame = &inner.frames[idx];
                    if !eligible(frame) {
                        continue;
                    }
                    if frame.visited.swap(false, Ordering::AcqRel) {
                        continue;
                    }
                    return Some(idx);
                }
                None
            }
        }
    }

    fn flush_frame(&self, frame: &Frame, pager: &PageStore, wal: &mut Wal) -> Result<()> {
        let image = frame.data.to_vec();
        let tx = wal.begin_transaction()?;
        wal.stage_page(tx, frame.page_no, &image)?;
        wal.commit_transaction(tx, self.group_commit)?;
        pager.write_page(frame.page_no, &image)?;
        frame.dirty.store(false, Ordering::Release);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flushes one page if it is resident and dirty.
    pub fn flush_page(&self, pager: &PageStore, wal: &mut Wal, page_no: u32) -> Result<()> {
        let inner = self.inner.read();
        if let Some(&idx) = inner.index.get(&page_no) {
            let frame = &inner.frames[idx];
            if frame.is_dirty() {
                self.flush_frame(frame, pager, wal)?;
            }
        }
        Ok(())
    }

    /// Flushes every dirty frame, one WAL transaction per page.
    pub fn flush_all(&self, pager: &PageStore, wal: &mut Wal) -> Result<usize> {
        let inner = self.inner.read();
        let mut flushed = 0;
        for frame in &inner.frames {
            if frame.is_dirty() {
                self.flush_frame(frame, pager, wal)?;
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Unpins a page, optionally marking it dirty. Unpinning an unpinned
    /// page is a protocol violation.
    pub fn unpin(&self, page_no: u32, dirty: bool) -> Result<()> {
        let inner = self.inner.read();
        let idx = match inner.index.get(&page_no) {
            Some(&idx) => idx,
            None => {
                bail!(StoreError::LockMisuse(format!(
                    "unpin of non-resident page {}",
                    page_no
                )))
            }
        };
        let frame = &inner.frames[idx];
        if dirty {
            frame.dirty.store(true, Ordering::Release);
        }
        let previous = frame.pin_count.load(Ordering::Acquire);
        if previous == 0 {
            bail!(StoreError::LockMisuse(format!(
                "unpin of unpinned page {}",
                page_no
            )));
        }
        frame.pin_count.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn mark_dirty(&self, page_no: u32) {
        let inner = self.inner.read();
        if let Some(&idx) = inner.index.get(&page_no) {
            inner.frames[idx].dirty.store(true, Ordering::Release);
        }
    }

    /// Removes a frame without flushing. Dropping a pinned page is a
    /// protocol violation; dropping a non-resident page is a no-op.
    pub fn drop_page(&self, page_no: u32) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(&idx) = inner.index.get(&page_no) {
            if inner.frames[idx].is_pinned() {
                bail!(StoreError::LockMisuse(format!(
                    "drop of pinned page {}",
                    page_no
                )));
            }
            inner.remove(idx);
        }
        Ok(())
    }

    /// Discards all frames. The caller must have flushed beforehand.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        debug_assert!(
            inner.frames.iter().all(|f| !f.is_pinned()),
            "reset with pinned frames"
        );
        inner.frames.clear();
        inner.index.clear();
        inner.hand = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.read().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            loads: self.loads.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            max_resident: self.max_resident.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn is_dirty(&self, page_no: u32) -> bool {
        let inner = self.inner.read();
        inner
            .index
            .get(&page_no)
            .map(|&idx| inner.frames[idx].is_dirty())
            .unwrap_or(false)
    }

    fn data_ptr(&self, page_no: u32) -> (*mut u8, usize) {
        let inner = self.inner.read();
        let idx = *inner
            .index
            .get(&page_no)
            .expect("pinned page must be resident"); // INVARIANT: guard holds a pin
        let frame = &inner.frames[idx];
        (frame.data.as_ptr() as *mut u8, frame.data.len())
    }
}

/// RAII pin on a buffered page. The page stays resident until the guard
/// drops; mutable access marks the frame dirty.
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    page_no: u32,
}

impl<'a> PageGuard<'a> {
    pub fn page_no(&self) -> u32 {
        self.page_no
    }

    pub fn data(&self) -> &[u8] {
        let (ptr, len) = self.pool.data_ptr(self.page_no);
        // SAFETY: the frame is pinned for the guard's lifetime, so it cannot
        // be evicted, dropped or reset, and its boxed buffer address is
        // stable across frame-table reallocation. Writers are serialized by
        // the coordinator lock, so no mutable alias exists while shared
        // guards read.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.pool.mark_dirty(self.page_no);
        let (ptr, len) = self.pool.data_ptr(self.page_no);
        // SAFETY: as in `data`, the pin keeps the buffer alive and stable.
        // `&mut self` plus the coordinator's single-writer lock ensure this
        // is the only live reference to the frame's bytes.
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }

    pub fn mark_dirty(&self) {
        self.pool.mark_dirty(self.page_no);
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        // Pins are balanced by construction; a failure here is a pool bug.
        let _ = self.pool.unpin(self.page_no, false);
    }
}

impl std::fmt::Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard").field("page_no", &self.page_no).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreOptions;
    use tempfile::tempdir;

    const PAGE: usize = 512;

    fn fixture(dir: &std::path::Path, capacity: usize, policy: EvictionPolicy) -> (PageStore, Wal, BufferPool) {
        let opts = StoreOptions::new(dir.join("t.db")).page_size(PAGE);
        let pager = PageStore::open(&opts).unwrap();
        let wal = Wal::open(dir.join("t.db.wal"), PAGE).unwrap();
        let pool = BufferPool::new(capacity, PAGE, policy, false);
        (pager, wal, pool)
    }

    #[test]
    fn get_page_loads_and_caches() {
        let dir = tempdir().unwrap();
        let (pager, _wal, pool) = fixture(dir.path(), 4, EvictionPolicy::Lru);

        {
            let guard = pool.get_page(&pager, 2).unwrap();
            assert_eq!(guard.data().len(), PAGE);
        }
        assert_eq!(pool.stats().loads, 1);

        {
            let _guard = pool.get_page(&pager, 2).unwrap();
        }
        assert_eq!(pool.stats().loads, 1, "second access must hit the cache");
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn writes_survive_flush_and_reload() {
        let dir = tempdir().unwrap();
        let (pager, mut wal, pool) = fixture(dir.path(), 4, EvictionPolicy::Lru);

        {
            let mut guard = pool.get_page_for_write(&pager, &mut wal, 5).unwrap();
            guard.data_mut()[100] = 0xAB;
        }
        assert!(pool.is_dirty(5));

        pool.flush_all(&pager, &mut wal).unwrap();
        assert!(!pool.is_dirty(5));

        pool.drop_page(5).unwrap();
        let guard = pool.get_page(&pager, 5).unwrap();
        assert_eq!(guard.data()[100], 0xAB);
    }

    #[test]
    fn dirty_page_does_not_touch_disk_before_flush() {
        let dir = tempdir().unwrap();
        let (pager, mut wal, pool) = fixture(dir.path(), 4, EvictionPolicy::Lru);

        {
            let mut guard = pool.get_page_for_write(&pager, &mut wal, 6).unwrap();
            guard.data_mut()[0] = 0xEE;
        }

        let mut on_disk = vec![0u8; PAGE];
        pager.read_page(6, &mut on_disk).unwrap();
        assert_eq!(on_disk[0], 0, "write-back must wait for the WAL flush");
    }

    #[test]
    fn lru_evicts_oldest_clean_frame() {
        let dir = tempdir().unwrap();
        let (pager, _wal, pool) = fixture(dir.path(), 2, EvictionPolicy::Lru);

        pool.get_page(&pager, 3).unwrap();
        pool.get_page(&pager, 4).unwrap();
        // Touch 3 so 4 becomes the LRU victim.
        pool.get_page(&pager, 3).unwrap();
        pool.get_page(&pager, 5).unwrap();

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.stats().evictions, 1);

        let inner = pool.inner.read();
        assert!(inner.index.contains_key(&3));
        assert!(inner.index.contains_key(&5));
        assert!(!inner.index.contains_key(&4));
    }

    #[test]
    fn clock_skips_pinned_frames() {
        let dir = tempdir().unwrap();
        let (pager, _wal, pool) = fixture(dir.path(), 2, EvictionPolicy::Clock);

        let pinned = pool.get_page(&pager, 3).unwrap();
        pool.get_page(&pager, 4).unwrap();
        pool.get_page(&pager, 5).unwrap();

        let inner = pool.inner.read();
        assert!(inner.index.contains_key(&3), "pinned frame must survive");
        assert!(inner.index.contains_key(&5));
        drop(inner);
        drop(pinned);
    }

    #[test]
    fn all_pinned_fails_with_pool_exhausted() {
        let dir = tempdir().unwrap();
        let (pager, _wal, pool) = fixture(dir.path(), 2, EvictionPolicy::Lru);

        let _a = pool.get_page(&pager, 3).unwrap();
        let _b = pool.get_page(&pager, 4).unwrap();

        let err = pool.get_page(&pager, 5).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::PoolExhausted)
        ));
    }

    #[test]
    fn dirty_frames_need_a_wal_to_be_evicted() {
        let dir = tempdir().unwrap();
        let (pager, mut wal, pool) = fixture(dir.path(), 1, EvictionPolicy::Lru);

        {
            let mut guard = pool.get_page_for_write(&pager, &mut wal, 3).unwrap();
            guard.data_mut()[0] = 1;
        }

        // Read path cannot flush the dirty victim.
        let err = pool.get_page(&pager, 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::PoolExhausted)
        ));

        // Write path flushes it through the WAL and proceeds.
        pool.get_page_for_write(&pager, &mut wal, 4).unwrap();
        assert_eq!(pool.stats().evictions, 1);

        let mut on_disk = vec![0u8; PAGE];
        pager.read_page(3, &mut on_disk).unwrap();
        assert_eq!(on_disk[0], 1, "evicted dirty frame must be written back");
    }

    #[test]
    fn unpin_of_unpinned_page_is_lock_misuse() {
        let dir = tempdir().unwrap();
        let (pager, _wal, pool) = fixture(dir.path(), 2, EvictionPolicy::Lru);

        {
            let _guard = pool.get_page(&pager, 3).unwrap();
        }
        let err = pool.unpin(3, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::LockMisuse(_))
        ));
    }

    #[test]
    fn drop_of_pinned_page_is_lock_misuse() {
        let dir = tempdir().unwrap();
        let (pager, _wal, pool) = fixture(dir.path(), 2, EvictionPolicy::Lru);

        let _guard = pool.get_page(&pager, 3).unwrap();
        let err = pool.drop_page(3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::LockMisuse(_))
        ));
    }

    #[test]
    fn stats_track_high_water_mark() {
        let dir = tempdir().unwrap();
        let (pager, _wal, pool) = fixture(dir.path(), 8, EvictionPolicy::Lru);

        for page_no in 0..5u32 {
            pool.get_page(&pager, page_no).unwrap();
        }
        assert_eq!(pool.stats().max_resident, 5);
        assert_eq!(pool.stats().loads, 5);

        pool.reset();
        assert!(pool.is_empty());
        assert_eq!(pool.stats().max_resident, 5, "reset keeps counters");
    }
}
