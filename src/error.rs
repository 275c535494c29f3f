//! # Store Error Kinds
//!
//! This module defines the typed error surface of the store. Most internal
//! plumbing propagates `eyre::Result` with contextual messages; the variants
//! here exist for the conditions callers are expected to distinguish
//! programmatically (corruption classes, pool exhaustion, misuse of pins and
//! latches). They are raised into `eyre::Report` and recovered with
//! `Report::downcast_ref::<StoreError>()`.
//!
//! Absent keys are not errors: `get` returns `Option` and `delete` returns
//! `bool`.

use std::fmt;

/// Error kinds surfaced to callers of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A key input violated the fixed-width unsigned constraint.
    InvalidKey(String),
    /// A value exceeded the maximum representable total length (u32).
    ValueTooLarge { len: u64, max: u64 },
    /// A page's type tag or decoded structure violated an invariant.
    CorruptPage { page_no: u32, reason: String },
    /// The persistent free-list chain contains a cycle or an invalid page.
    CorruptFreeList(String),
    /// The WAL header magic is malformed beyond auto-repair.
    CorruptWal(String),
    /// An overflow chain ended before the expected number of bytes.
    TruncatedChain { expected: u64, got: u64 },
    /// The buffer pool is full and every frame is pinned.
    PoolExhausted,
    /// A pin or latch was released or dropped out of protocol.
    LockMisuse(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidKey(reason) => write!(f, "invalid key: {reason}"),
            StoreError::ValueTooLarge { len, max } => {
                write!(f, "value of {len} bytes exceeds maximum of {max}")
            }
            StoreError::CorruptPage { page_no, reason } => {
                write!(f, "corrupt page {page_no}: {reason}")
            }
            StoreError::CorruptFreeList(reason) => write!(f, "corrupt free list: {reason}"),
            StoreError::CorruptWal(reason) => write!(f, "corrupt WAL: {reason}"),
            StoreError::TruncatedChain { expected, got } => {
                write!(f, "overflow chain truncated: expected {expected} bytes, got {got}")
            }
            StoreError::PoolExhausted => {
                write!(f, "buffer pool exhausted: all frames are pinned")
            }
            StoreError::LockMisuse(reason) => write!(f, "lock misuse: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = StoreError::ValueTooLarge {
            len: 5_000_000_000,
            max: u32::MAX as u64,
        };
        assert!(err.to_string().contains("5000000000"));

        let err = StoreError::CorruptPage {
            page_no: 7,
            reason: "type tag 9".into(),
        };
        assert!(err.to_string().contains("page 7"));
    }

    #[test]
    fn downcasts_through_eyre() {
        let report: eyre::Report = StoreError::PoolExhausted.into();
        let kind = report.downcast_ref::<StoreError>();
        assert_eq!(kind, Some(&StoreError::PoolExhausted));
    }
}
