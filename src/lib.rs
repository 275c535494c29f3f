//! # treestore - Durable B+Tree Key-Value Store
//!
//! treestore is a single-writer, multi-reader, disk-backed ordered map from
//! fixed-width 64-bit keys to arbitrary byte values, organized as a B+Tree
//! over fixed-size pages with a write-ahead log for crash recovery.
//!
//! ## Quick Start
//!
//! ```ignore
//! use treestore::{Store, StoreOptions};
//!
//! let store = Store::open(StoreOptions::new("./data.db"))?;
//! store.set(1, b"hello")?;
//! store.set(2, b"world")?;
//!
//! assert_eq!(store.get(1)?, Some(b"hello".to_vec()));
//! for entry in store.range(1, 2)? {
//!     let (key, value) = entry?;
//!     println!("{key} = {value:?}");
//! }
//! store.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │          Store (coordinator)        │  process RW lock, checkpoints
//! ├─────────────────────────────────────┤
//! │        BTree / cursors              │  splits, merges, sibling chain
//! ├──────────┬──────────┬───────────────┤
//! │ BufferPool│ Latches │ OverflowStore │  pins, page RW latches, chains
//! ├──────────┴────┬─────┴───────────────┤
//! │   PageStore   │        Wal          │  meta, free list, replay
//! ├───────────────┴─────────────────────┤
//! │     FileStore / SegmentedFileStore  │  positional page I/O
//! └─────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout
//!
//! The data file is a sequence of fixed-size pages (default 4096 bytes).
//! Page 0 holds the meta header (`BPTREE_V1`), page 1 is reserved, page 2
//! is the initial root leaf. Freed pages form a singly linked list headed
//! in the meta page. The WAL lives beside the data file (`<path>.wal`,
//! magic `TSWALV1`) and is truncated to its 32-byte header on every
//! checkpoint.
//!
//! ## Durability Contract
//!
//! A mutation is durable once its WAL commit record is fsynced; replay at
//! open applies exactly the committed transactions and tolerates a torn
//! tail. With `group_commit` enabled the fsync moves to the next
//! checkpoint or close, trading durability latency for write throughput
//! without affecting consistency.
//!
//! ## Module Overview
//!
//! - [`storage`]: page files, meta and free list, WAL, buffer pool,
//!   latches, overflow chains
//! - [`btree`]: page codecs and tree operations
//! - [`config`]: open-time options
//! - [`error`]: typed error kinds surfaced through `eyre`

pub mod btree;
pub mod config;
pub mod error;
pub mod storage;

mod store;

pub use config::{EvictionPolicy, Limits, StoreOptions, WalOptions};
pub use error::StoreError;
pub use storage::{PoolStats, VacuumReport};
pub use store::{Range, Store, StoreStats};
