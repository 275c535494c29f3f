//! # Page Store
//!
//! The page store owns the block file backend and the meta page. It is the
//! single authority for page allocation: pages are created by popping the
//! persistent free list or by bumping `total_pages`, and destroyed by pushing
//! onto the free-list head.
//!
//! ## Free List
//!
//! Freed pages form a singly linked chain. Each free page stores its
//! successor's page number as a u32 at offset 0; the head lives in the meta
//! page. Pages 0 through 2 never enter the chain.
//!
//! ```text
//! meta.free_head ──> page 9 ──> page 4 ──> page 17 ──> 0
//! ```
//!
//! Allocation pops the head and relinks the meta to the stored successor, so
//! an allocate immediately after a free returns the same page.
//!
//! ## Vacuum
//!
//! Vacuum reclaims the physical tail of the file: while the highest allocated
//! page is free, it is popped from the free set, then the remaining free
//! pages are rewritten as a fresh chain and the file is truncated. The
//! operation is idempotent.
//!
//! ## Meta Writes
//!
//! `write_meta` writes through to disk immediately; the meta page is never
//! cached in the buffer pool.

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashSet;

use super::{
    FileStore, MetaHeader, PageHeader, PageIo, PageType, SegmentedFileStore,
    FIRST_FREE_CANDIDATE, INITIAL_ROOT_PAGE, INITIAL_TOTAL_PAGES, META_PAGE, RESERVED_PAGE,
};
use crate::config::StoreOptions;
use crate::error::StoreError;

/// Outcome of a [`PageStore::vacuum`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VacuumReport {
    /// Pages removed from the end of the file.
    pub reclaimed: u32,
    /// Free pages still in the chain after truncation.
    pub remaining_free: u32,
}

pub struct PageStore {
    io: Box<dyn PageIo>,
    page_size: usize,
    meta: MetaHeader,
}

impl PageStore {
    /// Opens or creates the data file. A missing or foreign meta page is
    /// replaced by a fresh meta and an empty root leaf.
    pub fn open(opts: &StoreOptions) -> Result<Self> {
        opts.validate()?;

        let io: Box<dyn PageIo> = match opts.segment_pages {
            Some(segment_pages) => Box::new(SegmentedFileStore::open(
                &opts.file_path,
                opts.page_size,
                segment_pages,
            )?),
            None => Box::new(FileStore::open(&opts.file_path, opts.page_size)?),
        };

        let mut store = Self {
            io,
            page_size: opts.page_size,
            meta: MetaHeader::fresh(opts.page_size as u32),
        };

        let existing_pages = store.io.page_count()?;
        let mut needs_init = existing_pages == 0;

        if !needs_init {
            let mut page = vec![0u8; store.page_size];
            store.io.read_page(META_PAGE, &mut page)?;
            let meta = MetaHeader::from_bytes(&page)?;
            if meta.has_valid_magic() {
                ensure!(
                    meta.page_size() as usize == opts.page_size,
                    "store was created with page_size {}, opened with {}",
                    meta.page_size(),
                    opts.page_size
                );
                store.meta = *meta;
            } else {
                log::warn!(
                    "meta magic absent at {:?}, initializing a fresh store",
                    opts.file_path
                );
                needs_init = true;
            }
        }

        if needs_init {
            store.initialize()?;
        }

        Ok(store)
    }

    fn initialize(&mut self) -> Result<()> {
        self.write_meta(MetaHeader::fresh(self.page_size as u32))?;

        let zeros = vec![0u8; self.page_size];
        self.io.write_page(RESERVED_PAGE, &zeros)?;

        let mut root = vec![0u8; self.page_size];
        PageHeader::init(&mut root, PageType::Leaf);
        self.io.write_page(INITIAL_ROOT_PAGE, &root)?;

        self.io.sync()?;
        log::debug!("initialized fresh store, page_size={}", self.page_size);
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The cached meta page. Mutations go through [`PageStore::write_meta`].
    pub fn meta(&self) -> &MetaHeader {
        &self.meta
    }

    /// Writes the meta page through to disk immediately.
    pub fn write_meta(&mut self, meta: MetaHeader) -> Result<()> {
        let mut page = vec![0u8; self.page_size];
        meta.write_to(&mut page)?;
        self.io.write_page(META_PAGE, &page)?;
        self.meta = meta;
        Ok(())
    }

    pub fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<()> {
        self.io.read_page(page_no, buf)
    }

    pub fn write_page(&self, page_no: u32, data: &[u8]) -> Result<()> {
        self.io.write_page(page_no, data)
    }

    pub fn sync(&self) -> Result<()> {
        self.io.sync()
    }

    pub fn file_page_count(&self) -> Result<u32> {
        self.io.page_count()
    }

    /// Pops the free-list head, or bumps `total_pages`. Bump-allocated pages
    /// are zeroed on disk before they are handed out.
    pub fn allocate_page(&mut self) -> Result<u32> {
        let head = self.meta.free_head();
        if head != 0 {
            if head < FIRST_FREE_CANDIDATE {
                bail!(StoreError::CorruptFreeList(format!(
                    "free head points at reserved page {}",
                    head
                )));
            }
            let mut page = vec![0u8; self.page_size];
            self.io.read_page(head, &mut page)?;
            let successor = u32::from_le_bytes(page[..4].try_into().expect("4-byte slice"));

            let mut meta = self.meta;
            meta.set_free_head(successor);
            self.write_meta(meta)?;
            return Ok(head);
        }

        let page_no = self.meta.total_pages();
        let zeros = vec![0u8; self.page_size];
        self.io
            .write_page(page_no, &zeros)
            .wrap_err_with(|| format!("failed to zero freshly allocated page {}", page_no))?;

        let mut meta = self.meta;
        meta.set_total_pages(page_no + 1);
        self.write_meta(meta)?;
        Ok(page_no)
    }

    /// Pushes a page onto the free-list head.
    pub fn free_page(&mut self, page_no: u32) -> Result<()> {
        ensure!(
            page_no >= FIRST_FREE_CANDIDATE,
            "page {} is reserved and cannot be freed",
            page_no
        );
        ensure!(
            page_no < self.meta.total_pages(),
            "page {} is beyond total_pages {}",
            page_no,
            self.meta.total_pages()
        );

        let mut page = vec![0u8; self.page_size];
        page[..4].copy_from_slice(&self.meta.free_head().to_le_bytes());
        self.io.write_page(page_no, &page)?;

        let mut meta = self.meta;
        meta.set_free_head(page_no);
        self.write_meta(meta)?;
        Ok(())
    }

    /// Walks the free chain into a set, detecting cycles and reserved-page
    /// references.
    pub fn collect_free_pages(&self) -> Result<HashSet<u32>> {
        let mut seen = HashSet::new();
        let mut current = self.meta.free_head();
        let mut page = vec![0u8; self.page_size];

        while current != 0 {
            if current < FIRST_FREE_CANDIDATE {
                bail!(StoreError::CorruptFreeList(format!(
                    "chain references reserved page {}",
                    current
                )));
            }
            if !seen.insert(current) {
                bail!(StoreError::CorruptFreeList(format!(
                    "cycle detected at page {}",
                    current
                )));
            }
            self.io.read_page(current, &mut page)?;
            current = u32::from_le_bytes(page[..4].try_into().expect("4-byte slice"));
        }

        Ok(seen)
    }

    /// Reclaims trailing free pages and truncates the file.
    pub fn vacuum(&mut self) -> Result<VacuumReport> {
        let mut free = self.collect_free_pages()?;
        let mut total = self.meta.total_pages();
        let mut reclaimed = 0u32;

        while total > INITIAL_TOTAL_PAGES && free.remove(&(total - 1)) {
            total -= 1;
            reclaimed += 1;
        }

        if reclaimed == 0 {
            return Ok(VacuumReport {
                reclaimed: 0,
                remaining_free: free.len() as u32,
            });
        }

        // Rewrite the surviving chain before the tail disappears.
        let mut remaining: Vec<u32> = free.iter().copied().collect();
        remaining.sort_unstable();

        let mut page = vec![0u8; self.page_size];
        for (i, &page_no) in remaining.iter().enumerate() {
            let successor = remaining.get(i + 1).copied().unwrap_or(0);
            page.fill(0);
            page[..4].copy_from_slice(&successor.to_le_bytes());
            self.io.write_page(page_no, &page)?;
        }

        let mut meta = self.meta;
        meta.set_free_head(remaining.first().copied().unwrap_or(0));
        meta.set_total_pages(total);
        self.write_meta(meta)?;

        self.io.truncate_pages(total)?;
        self.io.sync()?;

        log::info!(
            "vacuum reclaimed {} pages, {} still free, {} total",
            reclaimed,
            remaining.len(),
            total
        );
        Ok(VacuumReport {
            reclaimed,
            remaining_free: remaining.len() as u32,
        })
    }

    /// Truncates to a pristine three-page store with an empty root leaf.
    /// Used by defragmentation after all live entries have been collected.
    pub fn reset_fresh(&mut self) -> Result<()> {
        self.io.truncate_pages(INITIAL_TOTAL_PAGES)?;
        self.initialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &std::path::Path) -> PageStore {
        let opts = StoreOptions::new(dir.join("t.db")).page_size(512);
        PageStore::open(&opts).unwrap()
    }

    #[test]
    fn fresh_store_has_three_pages() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let meta = store.meta();
        assert!(meta.has_valid_magic());
        assert_eq!(meta.root_page(), INITIAL_ROOT_PAGE);
        assert_eq!(meta.tree_depth(), 1);
        assert_eq!(meta.total_pages(), INITIAL_TOTAL_PAGES);
        assert_eq!(meta.key_count(), 0);
        assert_eq!(meta.free_head(), 0);

        let mut root = vec![0u8; 512];
        store.read_page(INITIAL_ROOT_PAGE, &mut root).unwrap();
        let header = PageHeader::from_bytes(&root).unwrap();
        assert_eq!(header.page_type(), Some(PageType::Leaf));
    }

    #[test]
    fn reopen_preserves_meta() {
        let dir = tempdir().unwrap();
        {
            let mut store = open_store(dir.path());
            let mut meta = *store.meta();
            meta.set_key_count(42);
            meta.set_root_page(7);
            meta.set_tree_depth(2);
            store.write_meta(meta).unwrap();
            store.sync().unwrap();
        }

        let store = open_store(dir.path());
        assert_eq!(store.meta().key_count(), 42);
        assert_eq!(store.meta().root_page(), 7);
        assert_eq!(store.meta().tree_depth(), 2);
    }

    #[test]
    fn reopen_with_other_page_size_fails() {
        let dir = tempdir().unwrap();
        {
            open_store(dir.path());
        }
        let opts = StoreOptions::new(dir.path().join("t.db")).page_size(1024);
        assert!(PageStore::open(&opts).is_err());
    }

    #[test]
    fn bump_allocation_zeroes_and_counts() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        let a = store.allocate_page().unwrap();
        let b = store.allocate_page().unwrap();
        assert_eq!(a, 3);
        assert_eq!(b, 4);
        assert_eq!(store.meta().total_pages(), 5);

        let mut page = vec![0xFFu8; 512];
        store.read_page(a, &mut page).unwrap();
        assert!(page.iter().all(|&x| x == 0));
    }

    #[test]
    fn free_then_allocate_returns_same_page() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        let a = store.allocate_page().unwrap();
        let total_before = store.meta().total_pages();

        store.free_page(a).unwrap();
        assert_eq!(store.meta().free_head(), a);

        let b = store.allocate_page().unwrap();
        assert_eq!(b, a);
        assert_eq!(store.meta().free_head(), 0);
        assert_eq!(store.meta().total_pages(), total_before);
    }

    #[test]
    fn free_list_is_lifo() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        let a = store.allocate_page().unwrap();
        let b = store.allocate_page().unwrap();
        let c = store.allocate_page().unwrap();

        store.free_page(a).unwrap();
        store.free_page(b).unwrap();
        store.free_page(c).unwrap();

        assert_eq!(store.allocate_page().unwrap(), c);
        assert_eq!(store.allocate_page().unwrap(), b);
        assert_eq!(store.allocate_page().unwrap(), a);
    }

    #[test]
    fn collect_free_pages_walks_chain() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        let pages: Vec<u32> = (0..5).map(|_| store.allocate_page().unwrap()).collect();
        for &p in &pages {
            store.free_page(p).unwrap();
        }

        let free = store.collect_free_pages().unwrap();
        assert_eq!(free.len(), 5);
        for p in pages {
            assert!(free.contains(&p));
        }
    }

    #[test]
    fn collect_free_pages_detects_cycle() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        let a = store.allocate_page().unwrap();
        let b = store.allocate_page().unwrap();
        store.free_page(a).unwrap();
        store.free_page(b).unwrap();

        // Corrupt the chain: point a back at b, closing b -> a -> b.
        let mut page = vec![0u8; 512];
        page[..4].copy_from_slice(&b.to_le_bytes());
        store.write_page(a, &page).unwrap();

        let err = store.collect_free_pages().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::CorruptFreeList(_))
        ));
    }

    #[test]
    fn collect_free_pages_rejects_reserved_reference() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        let a = store.allocate_page().unwrap();
        store.free_page(a).unwrap();

        let mut page = vec![0u8; 512];
        page[..4].copy_from_slice(&1u32.to_le_bytes());
        store.write_page(a, &page).unwrap();

        let err = store.collect_free_pages().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::CorruptFreeList(_))
        ));
    }

    #[test]
    fn vacuum_reclaims_trailing_free_pages() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        let pages: Vec<u32> = (0..4).map(|_| store.allocate_page().unwrap()).collect();
        assert_eq!(store.meta().total_pages(), 7);

        // Free the last two allocated pages (5 and 6) plus page 3.
        store.free_page(pages[2]).unwrap();
        store.free_page(pages[3]).unwrap();
        store.free_page(pages[0]).unwrap();

        let report = store.vacuum().unwrap();
        assert_eq!(report.reclaimed, 2);
        assert_eq!(report.remaining_free, 1);
        assert_eq!(store.meta().total_pages(), 5);
        assert_eq!(store.file_page_count().unwrap(), 5);

        let free = store.collect_free_pages().unwrap();
        assert!(free.contains(&pages[0]));
        assert_eq!(free.len(), 1);
    }

    #[test]
    fn vacuum_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        let a = store.allocate_page().unwrap();
        store.free_page(a).unwrap();

        let first = store.vacuum().unwrap();
        assert_eq!(first.reclaimed, 1);

        let second = store.vacuum().unwrap();
        assert_eq!(second.reclaimed, 0);
        assert_eq!(second.remaining_free, 0);
        assert_eq!(store.meta().total_pages(), INITIAL_TOTAL_PAGES);
    }

    #[test]
    fn reset_fresh_restores_pristine_store() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        for _ in 0..6 {
            store.allocate_page().unwrap();
        }
        let mut meta = *store.meta();
        meta.set_key_count(10);
        store.write_meta(meta).unwrap();

        store.reset_fresh().unwrap();

        assert_eq!(store.meta().total_pages(), INITIAL_TOTAL_PAGES);
        assert_eq!(store.meta().key_count(), 0);
        assert_eq!(store.meta().free_head(), 0);
        assert_eq!(store.file_page_count().unwrap(), INITIAL_TOTAL_PAGES);
    }

    #[test]
    fn segmented_store_initializes() {
        let dir = tempdir().unwrap();
        let opts = StoreOptions::new(dir.path().join("seg.db"))
            .page_size(512)
            .segment_pages(2);
        let store = PageStore::open(&opts).unwrap();

        assert_eq!(store.meta().total_pages(), INITIAL_TOTAL_PAGES);
        assert!(dir.path().join("seg.db.seg1").exists());
    }
}
