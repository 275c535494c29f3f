//! # Page Latches
//!
//! Short-lived per-page reader-writer latches used by tree traversal
//! beneath the coordinator lock. Latches are created lazily on first
//! acquisition and held through RAII guards, so every acquisition is
//! released on every exit path.
//!
//! ## Writer Preference
//!
//! New shared acquirers wait while any writer is active or queued; writers
//! wait for zero readers and no active writer. On release a waiting writer
//! is woken first; only when no writer waits do all waiting readers proceed.
//! This keeps a stream of readers from starving the single writer during
//! latch crabbing.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct LatchState {
    readers: u32,
    writer: bool,
    waiting_writers: u32,
}

#[derive(Default)]
struct Latch {
    state: Mutex<LatchState>,
    reader_cv: Condvar,
    writer_cv: Condvar,
}

impl Latch {
    fn acquire_shared(&self) {
        let mut state = self.state.lock();
        while state.writer || state.waiting_writers > 0 {
            self.reader_cv.wait(&mut state);
        }
        state.readers += 1;
    }

    fn acquire_exclusive(&self) {
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while state.writer || state.readers > 0 {
            self.writer_cv.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = true;
    }

    fn release_shared(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "shared release without holders");
        state.readers -= 1;
        if state.readers == 0 && state.waiting_writers > 0 {
            self.writer_cv.notify_one();
        }
    }

    fn release_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer, "exclusive release without a writer");
        state.writer = false;
        if state.waiting_writers > 0 {
            self.writer_cv.notify_one();
        } else {
            self.reader_cv.notify_all();
        }
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        !state.writer && state.readers == 0 && state.waiting_writers == 0
    }
}

/// Lazy map from page number to its latch.
#[derive(Default)]
pub struct LatchManager {
    latches: Mutex<HashMap<u32, Arc<Latch>>>,
}

impl LatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn latch_for(&self, page_no: u32) -> Arc<Latch> {
        let mut latches = self.latches.lock();
        Arc::clone(latches.entry(page_no).or_default())
    }

    pub fn acquire_shared(&self, page_no: u32) -> LatchGuard {
        let latch = self.latch_for(page_no);
        latch.acquire_shared();
        LatchGuard {
            latch,
            page_no,
            exclusive: false,
        }
    }

    pub fn acquire_exclusive(&self, page_no: u32) -> LatchGuard {
        let latch = self.latch_for(page_no);
        latch.acquire_exclusive();
        LatchGuard {
            latch,
            page_no,
            exclusive: true,
        }
    }

    /// Drops all latches. Every guard must have been released.
    pub fn reset(&self) {
        let mut latches = self.latches.lock();
        debug_assert!(
            latches.values().all(|latch| latch.is_idle()),
            "reset with held latches"
        );
        latches.clear();
    }

    pub fn len(&self) -> usize {
        self.latches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Release handle for one page latch.
pub struct LatchGuard {
    latch: Arc<Latch>,
    page_no: u32,
    exclusive: bool,
}

impl LatchGuard {
    pub fn page_no(&self) -> u32 {
        self.page_no
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        if self.exclusive {
            self.latch.release_exclusive();
        } else {
            self.latch.release_shared();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn shared_latches_coexist() {
        let manager = LatchManager::new();
        let a = manager.acquire_shared(7);
        let b = manager.acquire_shared(7);
        assert!(!a.is_exclusive());
        assert_eq!(b.page_no(), 7);
    }

    #[test]
    fn latches_on_distinct_pages_are_independent() {
        let manager = LatchManager::new();
        let _a = manager.acquire_exclusive(1);
        let _b = manager.acquire_exclusive(2);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn exclusive_excludes_readers() {
        let manager = Arc::new(LatchManager::new());
        let sequence = Arc::new(AtomicU32::new(0));

        let writer = manager.acquire_exclusive(3);

        let handle = {
            let manager = Arc::clone(&manager);
            let sequence = Arc::clone(&sequence);
            std::thread::spawn(move || {
                let _reader = manager.acquire_shared(3);
                sequence.store(1, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sequence.load(Ordering::SeqCst), 0, "reader must wait");

        drop(writer);
        handle.join().unwrap();
        assert_eq!(sequence.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        let manager = Arc::new(LatchManager::new());
        let writer_done = Arc::new(AtomicU32::new(0));

        let reader = manager.acquire_shared(5);

        let writer_handle = {
            let manager = Arc::clone(&manager);
            let writer_done = Arc::clone(&writer_done);
            std::thread::spawn(move || {
                let _writer = manager.acquire_exclusive(5);
                writer_done.store(1, Ordering::SeqCst);
            })
        };

        // Give the writer time to queue, then try a new reader: preference
        // means it must wait behind the queued writer.
        std::thread::sleep(Duration::from_millis(50));
        let reader_handle = {
            let manager = Arc::clone(&manager);
            let writer_done = Arc::clone(&writer_done);
            std::thread::spawn(move || {
                let _reader = manager.acquire_shared(5);
                assert_eq!(
                    writer_done.load(Ordering::SeqCst),
                    1,
                    "late reader must run after the queued writer"
                );
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        drop(reader);

        writer_handle.join().unwrap();
        reader_handle.join().unwrap();
    }

    #[test]
    fn reset_clears_idle_latches() {
        let manager = LatchManager::new();
        {
            let _a = manager.acquire_shared(1);
            let _b = manager.acquire_exclusive(2);
        }
        assert_eq!(manager.len(), 2);
        manager.reset();
        assert!(manager.is_empty());
    }
}
