//! # Overflow Chains
//!
//! Values larger than the inline leaf capacity keep their tail in a linked
//! chain of overflow pages. Each chunk page stores up to `page_size - 16`
//! payload bytes plus the next chunk's page number; the chain head is
//! recorded in the owning leaf cell.
//!
//! ```text
//! leaf cell ──> [chunk 0 | next] ──> [chunk 1 | next] ──> [chunk 2 | 0]
//! ```
//!
//! Chain allocation pins one chunk at a time: once a chunk is linked from
//! its predecessor, the predecessor is flushed and dropped from the pool,
//! so writing an arbitrarily large value needs only two resident frames.

use eyre::{bail, ensure, Result};
use hashbrown::HashSet;

use super::{
    overflow_capacity, BufferPool, OverflowHeader, PageStore, Wal, OVERFLOW_HEADER_SIZE,
};
use crate::error::StoreError;

/// Writer-side access to overflow chains.
pub struct OverflowStore<'a> {
    pager: &'a mut PageStore,
    pool: &'a BufferPool,
    wal: &'a mut Wal,
}

impl<'a> OverflowStore<'a> {
    pub fn new(pager: &'a mut PageStore, pool: &'a BufferPool, wal: &'a mut Wal) -> Self {
        Self { pager, pool, wal }
    }

    /// Writes `bytes` into a fresh chain and returns its head page, or 0 for
    /// empty input.
    pub fn allocate_chain(&mut self, bytes: &[u8]) -> Result<u32> {
        if bytes.is_empty() {
            return Ok(0);
        }

        let capacity = overflow_capacity(self.pager.page_size());
        let mut head = 0u32;
        let mut prev: Option<u32> = None;

        for chunk in bytes.chunks(capacity) {
            let page_no = self.pager.allocate_page()?;
            {
                let mut guard = self
                    .pool
                    .get_page_for_write(self.pager, self.wal, page_no)?;
                let data = guard.data_mut();
                data.fill(0);
                OverflowHeader::init(data, 0, chunk.len() as u32);
                data[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + chunk.len()]
                    .copy_from_slice(chunk);
            }

            match prev {
                None => head = page_no,
                Some(prev_page) => {
                    {
                        let mut guard =
                            self.pool
                                .get_page_for_write(self.pager, self.wal, prev_page)?;
                        OverflowHeader::from_bytes_mut(guard.data_mut())?.set_next(page_no);
                    }
                    // The predecessor is complete; keep the pool footprint flat.
                    self.pool.flush_page(self.pager, self.wal, prev_page)?;
                    self.pool.drop_page(prev_page)?;
                }
            }
            prev = Some(page_no);
        }

        Ok(head)
    }

    /// Walks the chain from `head`, freeing every page. A zero head is a
    /// no-op.
    pub fn free_chain(&mut self, head: u32) -> Result<()> {
        let mut seen = HashSet::new();
        let mut current = head;

        while current != 0 {
            if !seen.insert(current) {
                bail!(StoreError::CorruptPage {
                    page_no: current,
                    reason: "overflow chain cycle".into(),
                });
            }
            let next = {
                let guard = self.pool.get_page(self.pager, current)?;
                let header = OverflowHeader::from_bytes(guard.data())?;
                ensure_overflow(current, header)?;
                header.next()
            };
            self.pool.drop_page(current)?;
            self.pager.free_page(current)?;
            current = next;
        }
        Ok(())
    }
}

/// Reads `total_len` bytes from the chain at `head`, concatenating chunk
/// payloads. Fails with `TruncatedChain` if the chain ends early.
pub fn read_chain(
    pool: &BufferPool,
    pager: &PageStore,
    head: u32,
    total_len: u64,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(total_len as usize);
    let capacity = overflow_capacity(pager.page_size());
    let mut current = head;

    while (out.len() as u64) < total_len {
        if current == 0 {
            bail!(StoreError::TruncatedChain {
                expected: total_len,
                got: out.len() as u64,
            });
        }
        let guard = pool.get_page(pager, current)?;
        let data = guard.data();
        let header = OverflowHeader::from_bytes(data)?;
        ensure_overflow(current, header)?;

        let length = header.length() as usize;
        ensure!(
            length <= capacity,
            StoreError::CorruptPage {
                page_no: current,
                reason: format!("overflow chunk length {} exceeds capacity {}", length, capacity),
            }
        );

        let remaining = (total_len - out.len() as u64) as usize;
        let take = length.min(remaining);
        out.extend_from_slice(&data[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + take]);
        current = header.next();
    }

    Ok(out)
}

/// Frees the chain at `head` without constructing an [`OverflowStore`].
pub fn free_chain(
    pager: &mut PageStore,
    pool: &BufferPool,
    wal: &mut Wal,
    head: u32,
) -> Result<()> {
    OverflowStore::new(pager, pool, wal).free_chain(head)
}

fn ensure_overflow(page_no: u32, header: &OverflowHeader) -> Result<()> {
    if !header.is_overflow() {
        bail!(StoreError::CorruptPage {
            page_no,
            reason: "expected overflow page".into(),
        });
    }
    Ok(())
}
