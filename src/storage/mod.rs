//! # Storage Module
//!
//! This module provides the paged storage stack under the B+Tree: block file
//! I/O, page allocation with a persistent free list, the write-ahead log, the
//! pinning buffer pool, per-page latches, and overflow chains for values that
//! do not fit inline in a leaf.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │               BTree / Store                │
//! ├──────────────┬──────────────┬──────────────┤
//! │  BufferPool  │ LatchManager │ OverflowStore│
//! ├──────────────┴──────┬───────┴──────────────┤
//! │      PageStore      │         Wal          │
//! ├─────────────────────┴──────────────────────┤
//! │      FileStore / SegmentedFileStore        │
//! └────────────────────────────────────────────┘
//! ```
//!
//! All cross-page references are `u32` page numbers. Page 0 is the meta page,
//! page 1 is reserved, page 2 is the initial root leaf. Decoded page bytes
//! live exclusively in buffer pool frames; no in-memory pointers are kept
//! across operations.
//!
//! ## Durability Path
//!
//! A mutation edits frames in the pool, then flushes each dirty frame through
//! a WAL transaction (Begin, one full-page image, Commit, fsync unless group
//! commit is on) before writing the frame back in place. Checkpointing
//! replays any committed frames and truncates the WAL to its 32-byte header.
//!
//! ## Page Size
//!
//! The page size is fixed at store creation (default 4096 bytes, any positive
//! multiple of 512) and persisted in the meta page; reopening with a
//! different size is rejected.

mod file;
mod headers;
mod latch;
mod overflow;
mod pager;
mod pool;
mod wal;

pub use file::{FileStore, PageIo, SegmentedFileStore};
pub use headers::{
    validate_page_header, MetaHeader, OverflowHeader, PageHeader, PageType, META_MAGIC,
};
pub use latch::{LatchGuard, LatchManager};
pub use overflow::{free_chain, read_chain, OverflowStore};
pub use pager::{PageStore, VacuumReport};
pub use pool::{BufferPool, PageGuard, PoolStats};
pub use wal::{
    Wal, WalRecordHeader, RECORD_BEGIN, RECORD_COMMIT, RECORD_PAGE, WAL_HEADER_SIZE, WAL_MAGIC,
    WAL_RECORD_HEADER_SIZE,
};

/// Size of the header at the start of every internal, leaf and overflow page.
/// The meta page (page 0) uses its own fixed field layout instead.
pub const PAGE_HEADER_SIZE: usize = 32;

/// Overflow pages use a compact header so each chunk carries
/// `page_size - OVERFLOW_HEADER_SIZE` payload bytes.
pub const OVERFLOW_HEADER_SIZE: usize = 16;

/// Keys are fixed-width 8-byte big-endian unsigned integers.
pub const KEY_SIZE: usize = 8;

/// A leaf slot is a 2-byte offset from the page start to its cell.
pub const LEAF_SLOT_SIZE: usize = 2;

/// Fixed prefix of a leaf cell: key_len, inline_len, total_len, overflow_head.
pub const LEAF_CELL_HEADER_SIZE: usize = 12;

/// An interior cell is an 8-byte key plus a 4-byte child page number.
pub const INTERIOR_CELL_SIZE: usize = KEY_SIZE + 4;

/// The meta page.
pub const META_PAGE: u32 = 0;
/// Reserved page, never allocated or freed.
pub const RESERVED_PAGE: u32 = 1;
/// The root leaf of a freshly initialized tree.
pub const INITIAL_ROOT_PAGE: u32 = 2;
/// Page count of a freshly initialized store.
pub const INITIAL_TOTAL_PAGES: u32 = 3;
/// Lowest page number the free list may contain.
pub const FIRST_FREE_CANDIDATE: u32 = 3;

/// Largest value tail a single overflow page can carry.
pub fn overflow_capacity(page_size: usize) -> usize {
    page_size - OVERFLOW_HEADER_SIZE
}

/// Largest value that fits inline in an otherwise empty leaf. Any excess
/// beyond this goes to an overflow chain.
pub fn max_inline_value(page_size: usize) -> usize {
    page_size - (PAGE_HEADER_SIZE + LEAF_SLOT_SIZE + KEY_SIZE + LEAF_CELL_HEADER_SIZE)
}
