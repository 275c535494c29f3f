//! # Store Coordinator
//!
//! [`Store`] is the public face of the crate: it owns the storage stack and
//! a process-wide reader-writer lock. Lookups and scans run under the
//! shared side, mutations and maintenance under the exclusive side, so a
//! writer runs to completion before readers observe its outcome and readers
//! never see a partially applied mutation.
//!
//! ## Mutation Path
//!
//! ```text
//! set/delete
//!   └─ exclusive lock
//!        └─ tree mutation (frames dirtied in the pool)
//!             └─ flush: one WAL transaction per dirty page, then write-back
//!                  └─ checkpoint when the ops or time threshold trips
//! ```
//!
//! With group commit enabled the per-page commits skip fsync and durability
//! is deferred to the next checkpoint or close; consistency is unaffected
//! because replay ignores uncommitted transactions.
//!
//! ## Lifecycle
//!
//! Opening replays the WAL into the data file and truncates it, so a store
//! that crashed mid-write comes back containing exactly the committed
//! transactions. Closing flushes, checkpoints and syncs; a dropped store
//! closes itself on a best-effort basis.

use std::time::Instant;

use eyre::{ensure, Result};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::btree::{BTree, CursorState, RangeCursor, TreeReader};
use crate::config::StoreOptions;
use crate::storage::{
    BufferPool, LatchManager, PageStore, PoolStats, VacuumReport, Wal,
};

struct StoreInner {
    pager: PageStore,
    wal: Wal,
    pool: BufferPool,
    latches: LatchManager,
    opts: StoreOptions,
    ops_since_checkpoint: u64,
    last_checkpoint: Instant,
    closed: bool,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    pub pool: PoolStats,
    pub wal_bytes: u64,
    pub ops_since_checkpoint: u64,
    pub key_count: u64,
    pub total_pages: u32,
}

/// A durable ordered map from u64 keys to byte values.
pub struct Store {
    inner: RwLock<StoreInner>,
}

impl Store {
    /// Opens or creates a store, replaying any committed WAL transactions.
    pub fn open(opts: StoreOptions) -> Result<Self> {
        opts.validate()?;

        let pager = PageStore::open(&opts)?;
        let mut wal = Wal::open(opts.resolved_wal_path(), opts.page_size)?;
        let replayed = wal.checkpoint(&pager)?;
        if replayed > 0 {
            log::info!("recovered {} WAL frames at open", replayed);
        }

        let pool = BufferPool::new(
            opts.buffer_pages,
            opts.page_size,
            opts.eviction_policy,
            opts.wal.group_commit,
        );

        log::debug!(
            "store open at {:?}: page_size={}, buffer_pages={}, keys={}",
            opts.file_path,
            opts.page_size,
            opts.buffer_pages,
            pager.meta().key_count()
        );

        Ok(Self {
            inner: RwLock::new(StoreInner {
                pager,
                wal,
                pool,
                latches: LatchManager::new(),
                opts,
                ops_since_checkpoint: 0,
                last_checkpoint: Instant::now(),
                closed: false,
            }),
        })
    }

    fn read_inner(&self) -> Result<RwLockReadGuard<'_, StoreInner>> {
        let inner = self.inner.read();
        ensure!(!inner.closed, "store is closed");
        Ok(inner)
    }

    pub fn get(&self, key: u64) -> Result<Option<Vec<u8>>> {
        let inner = self.read_inner()?;
        TreeReader::new(&inner.pager, &inner.pool, &inner.latches).get(key)
    }

    pub fn set(&self, key: u64, value: &[u8]) -> Result<()> {
        let mut guard = self.inner.write();
        ensure!(!guard.closed, "store is closed");
        {
            let StoreInner {
                pager,
                wal,
                pool,
                latches,
                ..
            } = &mut *guard;
            BTree::new(pager, pool, wal, latches).set(key, value)?;
        }
        Self::after_mutation(&mut guard)
    }

    /// Removes a key, reporting whether it existed.
    pub fn delete(&self, key: u64) -> Result<bool> {
        let mut guard = self.inner.write();
        ensure!(!guard.closed, "store is closed");
        let existed = {
            let StoreInner {
                pager,
                wal,
                pool,
                latches,
                ..
            } = &mut *guard;
            BTree::new(pager, pool, wal, latches).delete(key)?
        };
        Self::after_mutation(&mut guard)?;
        Ok(existed)
    }

    /// Lazy scan of `[start, end]`, both endpoints inclusive. The iterator
    /// holds the shared coordinator lock until dropped.
    pub fn range(&self, start: u64, end: u64) -> Result<Range<'_>> {
        let guard = self.read_inner()?;
        let state = {
            let reader = TreeReader::new(&guard.pager, &guard.pool, &guard.latches);
            RangeCursor::new(reader, start, end)?.state()
        };
        Ok(Range { guard, state })
    }

    pub fn keys(&self, start: u64, end: u64) -> Result<Vec<u64>> {
        self.range(start, end)?
            .map(|entry| entry.map(|(key, _)| key))
            .collect()
    }

    pub fn values(&self, start: u64, end: u64) -> Result<Vec<Vec<u8>>> {
        self.range(start, end)?
            .map(|entry| entry.map(|(_, value)| value))
            .collect()
    }

    /// Structural validation of the whole tree.
    pub fn consistency_check(&self) -> Result<bool> {
        let inner = self.read_inner()?;
        TreeReader::new(&inner.pager, &inner.pool, &inner.latches).consistency_check()
    }

    /// Rebuilds the tree from scratch, reclaiming all freed pages. Atomic
    /// from the client's perspective: the exclusive lock is held throughout.
    pub fn defragment(&self) -> Result<()> {
        let mut guard = self.inner.write();
        ensure!(!guard.closed, "store is closed");
        let inner = &mut *guard;
        let StoreInner {
            pager,
            wal,
            pool,
            latches,
            ..
        } = inner;

        pool.flush_all(pager, wal)?;
        wal.checkpoint(pager)?;

        let entries = TreeReader::new(pager, pool, latches).collect_all()?;
        log::info!("defragment: rebuilding {} entries", entries.len());

        pool.reset();
        latches.reset();
        wal.reset()?;
        pager.reset_fresh()?;

        {
            let mut tree = BTree::new(pager, pool, wal, latches);
            for (key, value) in &entries {
                tree.set(*key, value)?;
            }
        }
        pool.flush_all(pager, wal)?;
        wal.checkpoint(pager)?;

        inner.ops_since_checkpoint = 0;
        inner.last_checkpoint = Instant::now();
        Ok(())
    }

    /// Reclaims trailing free pages and truncates the data file.
    pub fn vacuum(&self) -> Result<VacuumReport> {
        let mut guard = self.inner.write();
        ensure!(!guard.closed, "store is closed");
        let StoreInner {
            pager, wal, pool, ..
        } = &mut *guard;

        pool.flush_all(pager, wal)?;
        wal.checkpoint(pager)?;
        pool.reset();
        pager.vacuum()
    }

    /// Flushes, checkpoints and marks the store closed. Further operations
    /// fail; dropping the store repeats this on a best-effort basis.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.write();
        if guard.closed {
            return Ok(());
        }
        let StoreInner {
            pager, wal, pool, ..
        } = &mut *guard;
        pool.flush_all(pager, wal)?;
        wal.checkpoint(pager)?;
        pager.sync()?;
        guard.closed = true;
        log::debug!("store closed");
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let inner = self.read_inner()?;
        Ok(StoreStats {
            pool: inner.pool.stats(),
            wal_bytes: inner.wal.len(),
            ops_since_checkpoint: inner.ops_since_checkpoint,
            key_count: inner.pager.meta().key_count(),
            total_pages: inner.pager.meta().total_pages(),
        })
    }

    /// Flush, checkpoint cadence and advisory limit checks shared by every
    /// mutation.
    fn after_mutation(guard: &mut StoreInner) -> Result<()> {
        {
            let StoreInner {
                pager, wal, pool, ..
            } = guard;
            pool.flush_all(pager, wal)?;
        }

        guard.ops_since_checkpoint += 1;
        let wal_opts = &guard.opts.wal;
        let ops_due = wal_opts.checkpoint_interval_ops > 0
            && guard.ops_since_checkpoint >= wal_opts.checkpoint_interval_ops;
        let time_due = wal_opts.checkpoint_interval_ms > 0
            && guard.last_checkpoint.elapsed().as_millis() as u64 >= wal_opts.checkpoint_interval_ms;

        if ops_due || time_due {
            let StoreInner {
                pager, wal, ..
            } = guard;
            let applied = wal.checkpoint(pager)?;
            log::debug!(
                "auto checkpoint ({}) applied {} frames",
                if ops_due { "ops" } else { "time" },
                applied
            );
            guard.ops_since_checkpoint = 0;
            guard.last_checkpoint = Instant::now();
        }

        let limits = &guard.opts.limits;
        if limits.buffer_pages > 0 && guard.pool.len() > limits.buffer_pages {
            log::warn!(
                "buffer pool holds {} frames, advisory limit is {}",
                guard.pool.len(),
                limits.buffer_pages
            );
        }
        if limits.rss_bytes > 0 {
            let resident = (guard.pool.len() * guard.opts.page_size) as u64;
            if resident > limits.rss_bytes {
                log::warn!(
                    "resident page memory {} bytes exceeds advisory limit {}",
                    resident,
                    limits.rss_bytes
                );
            }
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("close on drop failed: {:#}", err);
        }
    }
}

/// Lazy inclusive range iterator. Holds the coordinator's shared lock, so
/// it must be dropped before any mutation on the same thread.
pub struct Range<'a> {
    guard: RwLockReadGuard<'a, StoreInner>,
    state: CursorState,
}

impl Iterator for Range<'_> {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = TreeReader::new(&self.guard.pager, &self.guard.pool, &self.guard.latches);
        let mut cursor = RangeCursor::resume(reader, self.state);
        let item = cursor.next_entry();
        self.state = cursor.state();
        match item {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvictionPolicy;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> Store {
        Store::open(StoreOptions::new(dir.join("t.db"))).unwrap()
    }

    #[test]
    fn basic_set_get_delete() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        store.set(1, b"hello").unwrap();
        store.set(2, b"world").unwrap();

        assert_eq!(store.get(1).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.get(2).unwrap(), Some(b"world".to_vec()));
        assert!(store.delete(1).unwrap());
        assert_eq!(store.get(1).unwrap(), None);
        assert_eq!(store.get(2).unwrap(), Some(b"world".to_vec()));
        assert!(!store.delete(1).unwrap());
    }

    #[test]
    fn range_is_inclusive_and_ordered() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        for key in 0..50u64 {
            store.set(key, &key.to_le_bytes()).unwrap();
        }

        let pairs: Vec<(u64, Vec<u8>)> = store
            .range(10, 20)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(pairs.len(), 11);
        assert_eq!(pairs.first().unwrap().0, 10);
        assert_eq!(pairs.last().unwrap().0, 20);

        assert!(store.range(20, 10).unwrap().next().is_none());
    }

    #[test]
    fn keys_and_values_project_the_range() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        for key in 0..10u64 {
            store.set(key, &[key as u8]).unwrap();
        }

        assert_eq!(store.keys(3, 5).unwrap(), vec![3, 4, 5]);
        assert_eq!(store.values(3, 5).unwrap(), vec![vec![3u8], vec![4], vec![5]]);
    }

    #[test]
    fn close_then_reopen_preserves_data() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            for key in 0..100u64 {
                store.set(key, &key.to_le_bytes()).unwrap();
            }
            store.close().unwrap();
            assert!(store.get(1).is_err(), "closed store must reject reads");
        }

        let store = open(dir.path());
        for key in 0..100u64 {
            assert_eq!(store.get(key).unwrap(), Some(key.to_le_bytes().to_vec()));
        }
        assert!(store.consistency_check().unwrap());
    }

    #[test]
    fn defragment_preserves_entries_and_reclaims_pages() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        for key in 0..500u64 {
            store.set(key, &key.to_le_bytes()).unwrap();
        }
        for key in (0..500u64).step_by(2) {
            store.delete(key).unwrap();
        }
        let before = store.stats().unwrap().total_pages;

        store.defragment().unwrap();

        let after = store.stats().unwrap().total_pages;
        assert!(after <= before, "defragment must not grow the file");
        assert_eq!(store.stats().unwrap().key_count, 250);
        for key in 0..500u64 {
            let expected = (key % 2 == 1).then(|| key.to_le_bytes().to_vec());
            assert_eq!(store.get(key).unwrap(), expected);
        }
        assert!(store.consistency_check().unwrap());

        // Idempotent up to page numbering.
        store.defragment().unwrap();
        assert_eq!(store.stats().unwrap().key_count, 250);
    }

    #[test]
    fn vacuum_truncates_trailing_free_pages() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let value = vec![0xCDu8; 4096 * 3];
        store.set(5, &value).unwrap();
        let before = store.stats().unwrap().total_pages;

        store.delete(5).unwrap();
        let report = store.vacuum().unwrap();
        assert!(report.reclaimed >= 3, "overflow pages should be reclaimed");
        assert!(store.stats().unwrap().total_pages < before);
    }

    #[test]
    fn checkpoint_cadence_truncates_wal() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            StoreOptions::new(dir.path().join("t.db")).checkpoint_interval_ops(10),
        )
        .unwrap();

        for key in 0..25u64 {
            store.set(key, b"v").unwrap();
        }

        let stats = store.stats().unwrap();
        assert!(
            stats.ops_since_checkpoint < 10,
            "auto checkpoint must have reset the counter"
        );
    }

    #[test]
    fn clock_policy_store_works() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            StoreOptions::new(dir.path().join("t.db"))
                .buffer_pages(8)
                .eviction_policy(EvictionPolicy::Clock),
        )
        .unwrap();

        for key in 0..200u64 {
            store.set(key, &key.to_le_bytes()).unwrap();
        }
        for key in 0..200u64 {
            assert_eq!(store.get(key).unwrap(), Some(key.to_le_bytes().to_vec()));
        }
    }

    #[test]
    fn group_commit_defers_sync_but_preserves_data_on_clean_close() {
        let dir = tempdir().unwrap();
        {
            let store = Store::open(
                StoreOptions::new(dir.path().join("t.db")).group_commit(true),
            )
            .unwrap();
            for key in 0..50u64 {
                store.set(key, b"gc").unwrap();
            }
            store.close().unwrap();
        }

        let store = open(dir.path());
        assert_eq!(store.stats().unwrap().key_count, 50);
    }
}
