//! # Page and Meta Header Layout
//!
//! This module defines the on-disk header structs shared by the storage and
//! tree layers. All structs are zerocopy views so headers can be read and
//! edited directly inside buffer pool frames without intermediate copies.
//!
//! ## Meta Page (page 0)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       16    magic        "BPTREE_V1" zero-padded
//! 16      4     page_size    u32 LE, fixed at creation
//! 20      4     root_page    u32 LE, current tree root
//! 24      4     tree_depth   u32 LE, levels including leaves (>= 1)
//! 28      4     total_pages  u32 LE, pages ever allocated (>= 3)
//! 32      8     key_count    u64 LE, live keys in the tree
//! 40      4     free_head    u32 LE, free-list head (0 = empty)
//! ```
//!
//! ## Page Header (internal, leaf and overflow pages)
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  --------------------------------------
//! 0       1     page_type      1 = internal, 2 = leaf, 3 = overflow
//! 1       1     flags          unused, zero
//! 2       2     cell_count     number of cells
//! 4       2     free_start     end of the slot array (leaf)
//! 6       2     free_end       start of packed cell content (leaf)
//! 8       2     frag_bytes     reclaimable bytes inside the cell area
//! 10      18    reserved
//! 28      4     right_sibling  same-level right neighbor (0 = none)
//! ```
//!
//! Leaf slot pointers grow forward from offset 32 while cell content grows
//! backward from the page end. Interior pages keep their left child pointer
//! at offset 32 followed by fixed 12-byte cells.
//!
//! Overflow pages use a 16-byte layout of their own (tag, next, length) so a
//! chunk carries `page_size - 16` payload bytes; see [`OverflowHeader`].
//!
//! All multi-byte fields are little-endian except keys, which are stored as
//! 8-byte big-endian so lexicographic byte order equals numeric order.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{OVERFLOW_HEADER_SIZE, PAGE_HEADER_SIZE};
use crate::error::StoreError;

/// Magic bytes identifying the meta page of a data file.
pub const META_MAGIC: &[u8; 16] = b"BPTREE_V1\x00\x00\x00\x00\x00\x00\x00";

/// Size of the fixed portion of the meta page.
pub const META_HEADER_SIZE: usize = 44;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Meta = 0,
    Internal = 1,
    Leaf = 2,
    Overflow = 3,
}

impl PageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PageType::Meta),
            1 => Some(PageType::Internal),
            2 => Some(PageType::Leaf),
            3 => Some(PageType::Overflow),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MetaHeader {
    magic: [u8; 16],
    page_size: U32,
    root_page: U32,
    tree_depth: U32,
    total_pages: U32,
    key_count: U64,
    free_head: U32,
}

const _: () = assert!(std::mem::size_of::<MetaHeader>() == META_HEADER_SIZE);

impl MetaHeader {
    pub fn fresh(page_size: u32) -> Self {
        Self {
            magic: *META_MAGIC,
            page_size: U32::new(page_size),
            root_page: U32::new(super::INITIAL_ROOT_PAGE),
            tree_depth: U32::new(1),
            total_pages: U32::new(super::INITIAL_TOTAL_PAGES),
            key_count: U64::new(0),
            free_head: U32::new(0),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= META_HEADER_SIZE,
            "buffer too small for MetaHeader: {} < {}",
            bytes.len(),
            META_HEADER_SIZE
        );
        let header = Self::ref_from_bytes(&bytes[..META_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse MetaHeader: {:?}", e))?;
        Ok(header)
    }

    pub fn has_valid_magic(&self) -> bool {
        &self.magic == META_MAGIC
    }

    pub fn write_to(&self, page: &mut [u8]) -> Result<()> {
        ensure!(
            page.len() >= META_HEADER_SIZE,
            "buffer too small for MetaHeader: {} < {}",
            page.len(),
            META_HEADER_SIZE
        );
        page[..META_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn root_page(&self) -> u32 {
        self.root_page.get()
    }

    pub fn set_root_page(&mut self, page_no: u32) {
        self.root_page = U32::new(page_no);
    }

    pub fn tree_depth(&self) -> u32 {
        self.tree_depth.get()
    }

    pub fn set_tree_depth(&mut self, depth: u32) {
        self.tree_depth = U32::new(depth);
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages.get()
    }

    pub fn set_total_pages(&mut self, pages: u32) {
        self.total_pages = U32::new(pages);
    }

    pub fn key_count(&self) -> u64 {
        self.key_count.get()
    }

    pub fn set_key_count(&mut self, count: u64) {
        self.key_count = U64::new(count);
    }

    pub fn free_head(&self) -> u32 {
        self.free_head.get()
    }

    pub fn set_free_head(&mut self, page_no: u32) {
        self.free_head = U32::new(page_no);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    page_type: u8,
    flags: u8,
    cell_count: U16,
    free_start: U16,
    free_end: U16,
    frag_bytes: U16,
    reserved: [u8; 18],
    right_sibling: U32,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn init(page: &mut [u8], page_type: PageType) {
        let header = Self {
            page_type: page_type as u8,
            flags: 0,
            cell_count: U16::new(0),
            free_start: U16::new(PAGE_HEADER_SIZE as u16),
            free_end: U16::new(page.len() as u16),
            frag_bytes: U16::new(0),
            reserved: [0; 18],
            right_sibling: U32::new(0),
        };
        page[..PAGE_HEADER_SIZE].copy_from_slice(header.as_bytes());
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_byte(self.page_type)
    }

    pub fn type_byte(&self) -> u8 {
        self.page_type
    }

    pub fn cell_count(&self) -> u16 {
        self.cell_count.get()
    }

    pub fn set_cell_count(&mut self, count: u16) {
        self.cell_count = U16::new(count);
    }

    pub fn free_start(&self) -> u16 {
        self.free_start.get()
    }

    pub fn set_free_start(&mut self, offset: u16) {
        self.free_start = U16::new(offset);
    }

    pub fn free_end(&self) -> u16 {
        self.free_end.get()
    }

    pub fn set_free_end(&mut self, offset: u16) {
        self.free_end = U16::new(offset);
    }

    pub fn contiguous_free(&self) -> u16 {
        self.free_end.get().saturating_sub(self.free_start.get())
    }

    pub fn frag_bytes(&self) -> u16 {
        self.frag_bytes.get()
    }

    pub fn set_frag_bytes(&mut self, bytes: u16) {
        self.frag_bytes = U16::new(bytes);
    }

    pub fn right_sibling(&self) -> u32 {
        self.right_sibling.get()
    }

    pub fn set_right_sibling(&mut self, page_no: u32) {
        self.right_sibling = U32::new(page_no);
    }
}

/// Overflow pages carry a compact header so chunk capacity stays at
/// `page_size - 16` bytes.
///
/// ```text
/// Offset  Size  Field      Description
/// 0       1     page_type  3
/// 1       3     reserved
/// 4       4     next       next chunk page (0 = terminal)
/// 8       4     length     payload bytes in this chunk
/// 12      4     reserved
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct OverflowHeader {
    page_type: u8,
    reserved: [u8; 3],
    next: U32,
    length: U32,
    reserved2: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<OverflowHeader>() == OVERFLOW_HEADER_SIZE);

impl OverflowHeader {
    pub fn init(page: &mut [u8], next: u32, length: u32) {
        let header = Self {
            page_type: PageType::Overflow as u8,
            reserved: [0; 3],
            next: U32::new(next),
            length: U32::new(length),
            reserved2: [0; 4],
        };
        page[..OVERFLOW_HEADER_SIZE].copy_from_slice(header.as_bytes());
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= OVERFLOW_HEADER_SIZE,
            "buffer too small for OverflowHeader: {} < {}",
            data.len(),
            OVERFLOW_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..OVERFLOW_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read OverflowHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= OVERFLOW_HEADER_SIZE,
            "buffer too small for OverflowHeader: {} < {}",
            data.len(),
            OVERFLOW_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..OVERFLOW_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read OverflowHeader: {:?}", e))
    }

    pub fn is_overflow(&self) -> bool {
        self.page_type == PageType::Overflow as u8
    }

    pub fn next(&self) -> u32 {
        self.next.get()
    }

    pub fn set_next(&mut self, page_no: u32) {
        self.next = U32::new(page_no);
    }

    pub fn length(&self) -> u32 {
        self.length.get()
    }

    pub fn set_length(&mut self, length: u32) {
        self.length = U32::new(length);
    }
}

/// Checks that a page header carries the expected type tag.
pub fn validate_page_header(page_no: u32, data: &[u8], expected: PageType) -> Result<()> {
    let header = PageHeader::from_bytes(data)?;
    match header.page_type() {
        Some(t) if t == expected => Ok(()),
        Some(t) => Err(StoreError::CorruptPage {
            page_no,
            reason: format!("expected {:?} page, found {:?}", expected, t),
        }
        .into()),
        None => Err(StoreError::CorruptPage {
            page_no,
            reason: format!("unknown page type tag {:#04x}", header.type_byte()),
        }
        .into()),
    }
}
