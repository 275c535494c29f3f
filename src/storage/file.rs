//! # Block File I/O
//!
//! This module implements uniform random page I/O over one or more files.
//! The [`PageIo`] trait is a copy-based interface: callers hand in a page
//! sized buffer and the backend fills or persists it. Positional reads and
//! writes (`pread`/`pwrite`) keep the handles shareable between concurrent
//! readers without seek coordination.
//!
//! ## Backends
//!
//! - [`FileStore`]: a single file, page n at byte offset `n * page_size`.
//! - [`SegmentedFileStore`]: routes page n to segment `n / segment_pages` at
//!   offset `(n % segment_pages) * page_size`. Segment 0 lives at the base
//!   path, segment N at `<base>.seg<N>`. Segments are created lazily on
//!   first access and closed together.
//!
//! ## Padding Semantics
//!
//! Reading a page past the current end of file extends the file with zero
//! pages first, so a freshly allocated page always reads as zeros. Writes
//! past the end extend the file implicitly; the gap reads back as zeros.
//!
//! ## Failure Model
//!
//! Any I/O error propagates to the caller; there are no retries.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;

/// Copy-based random page I/O.
pub trait PageIo: Send + Sync {
    /// Reads page `page_no` into `buf`, padding the file to at least
    /// `page_no + 1` pages of zeros on demand.
    fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes the full page, extending the file with zero padding if needed.
    fn write_page(&self, page_no: u32, data: &[u8]) -> Result<()>;

    /// Shrinks the store to exactly `page_count` pages.
    fn truncate_pages(&self, page_count: u32) -> Result<()>;

    /// Flushes OS buffers to durable media.
    fn sync(&self) -> Result<()>;

    /// Current size in pages, rounded up.
    fn page_count(&self) -> Result<u32>;

    /// Page size this backend was opened with.
    fn page_size(&self) -> usize;
}

/// Single-file page store.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    page_size: usize,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())
            .wrap_err_with(|| format!("failed to open data file {:?}", path.as_ref()))?;
        Ok(Self { file, page_size })
    }

    fn offset(&self, page_no: u32) -> u64 {
        page_no as u64 * self.page_size as u64
    }
}

impl PageIo for FileStore {
    fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() == self.page_size,
            "read buffer is {} bytes, page size is {}",
            buf.len(),
            self.page_size
        );
        let end = self.offset(page_no) + self.page_size as u64;
        let len = self.file.metadata().wrap_err("failed to stat data file")?.len();
        if len < end {
            self.file
                .set_len(end)
                .wrap_err_with(|| format!("failed to pad data file to page {}", page_no))?;
        }
        self.file
            .read_exact_at(buf, self.offset(page_no))
            .wrap_err_with(|| format!("failed to read page {}", page_no))?;
        Ok(())
    }

    fn write_page(&self, page_no: u32, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() == self.page_size,
            "write buffer is {} bytes, page size is {}",
            data.len(),
            self.page_size
        );
        self.file
            .write_all_at(data, self.offset(page_no))
            .wrap_err_with(|| format!("failed to write page {}", page_no))?;
        Ok(())
    }

    fn truncate_pages(&self, page_count: u32) -> Result<()> {
        self.file
            .set_len(page_count as u64 * self.page_size as u64)
            .wrap_err_with(|| format!("failed to truncate data file to {} pages", page_count))?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all().wrap_err("failed to sync data file")
    }

    fn page_count(&self) -> Result<u32> {
        let len = self.file.metadata().wrap_err("failed to stat data file")?.len();
        Ok(len.div_ceil(self.page_size as u64) as u32)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

/// Multi-file page store splitting the address space into fixed-size
/// segments.
pub struct SegmentedFileStore {
    base_path: PathBuf,
    segment_pages: u32,
    page_size: usize,
    segments: Mutex<HashMap<u32, File>>,
}

impl SegmentedFileStore {
    pub fn open<P: AsRef<Path>>(base_path: P, page_size: usize, segment_pages: u32) -> Result<Self> {
        ensure!(segment_pages >= 1, "segment_pages must be >= 1");
        let store = Self {
            base_path: base_path.as_ref().to_path_buf(),
            segment_pages,
            page_size,
            segments: Mutex::new(HashMap::new()),
        };
        // Segment 0 always exists so an empty store is observable on disk.
        store.with_segment(0, |_| Ok(()))?;
        Ok(store)
    }

    fn segment_path(&self, index: u32) -> PathBuf {
        if index == 0 {
            self.base_path.clone()
        } else {
            let mut name = self.base_path.as_os_str().to_os_string();
            name.push(format!(".seg{}", index));
            PathBuf::from(name)
        }
    }

    fn route(&self, page_no: u32) -> (u32, u64) {
        let segment = page_no / self.segment_pages;
        let offset = (page_no % self.segment_pages) as u64 * self.page_size as u64;
        (segment, offset)
    }

    fn with_segment<T>(&self, index: u32, f: impl FnOnce(&File) -> Result<T>) -> Result<T> {
        let mut segments = self.segments.lock();
        if !segments.contains_key(&index) {
            let path = self.segment_path(index);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .wrap_err_with(|| format!("failed to open segment {} at {:?}", index, path))?;
            segments.insert(index, file);
        }
        f(segments.get(&index).expect("segment was just inserted"))
    }
}

impl PageIo for SegmentedFileStore {
    fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() == self.page_size,
            "read buffer is {} bytes, page size is {}",
            buf.len(),
            self.page_size
        );
        let (segment, offset) = self.route(page_no);
        self.with_segment(segment, |file| {
            let end = offset + self.page_size as u64;
            let len = file
                .metadata()
                .wrap_err_with(|| format!("failed to stat segment {}", segment))?
                .len();
            if len < end {
                file.set_len(end)
                    .wrap_err_with(|| format!("failed to pad segment {}", segment))?;
            }
            file.read_exact_at(buf, offset)
                .wrap_err_with(|| format!("failed to read page {} from segment {}", page_no, segment))
        })
    }

    fn write_page(&self, page_no: u32, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() == self.page_size,
            "write buffer is {} bytes, page size is {}",
            data.len(),
            self.page_size
        );
        let (segment, offset) = self.route(page_no);
        self.with_segment(segment, |file| {
            file.write_all_at(data, offset)
                .wrap_err_with(|| format!("failed to write page {} to segment {}", page_no, segment))
        })
    }

    fn truncate_pages(&self, page_count: u32) -> Result<()> {
        let last_segment = if page_count == 0 {
            0
        } else {
            (page_count - 1) / self.segment_pages
        };
        let pages_in_last = page_count - last_segment * self.segment_pages;

        self.with_segment(last_segment, |file| {
            file.set_len(pages_in_last as u64 * self.page_size as u64)
                .wrap_err_with(|| format!("failed to truncate segment {}", last_segment))
        })?;

        let mut segments = self.segments.lock();
        let mut index = last_segment + 1;
        loop {
            let path = self.segment_path(index);
            segments.remove(&index);
            if !path.exists() {
                break;
            }
            std::fs::remove_file(&path)
                .wrap_err_with(|| format!("failed to remove segment {} at {:?}", index, path))?;
            index += 1;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let segments = self.segments.lock();
        for (index, file) in segments.iter() {
            file.sync_all()
                .wrap_err_with(|| format!("failed to sync segment {}", index))?;
        }
        Ok(())
    }

    fn page_count(&self) -> Result<u32> {
        // Pages are allocated contiguously, so segments exist in order.
        let mut last = 0u32;
        while self.segment_path(last + 1).exists() {
            last += 1;
        }
        let len = self.with_segment(last, |file| {
            Ok(file
                .metadata()
                .wrap_err_with(|| format!("failed to stat segment {}", last))?
                .len())
        })?;
        Ok(last * self.segment_pages + len.div_ceil(self.page_size as u64) as u32)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: usize = 512;

    #[test]
    fn file_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("t.db"), PAGE).unwrap();

        let mut page = vec![0u8; PAGE];
        page[0] = 0xAB;
        page[PAGE - 1] = 0xCD;
        store.write_page(3, &page).unwrap();

        let mut out = vec![0u8; PAGE];
        store.read_page(3, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn file_store_read_pads_with_zeros() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("t.db"), PAGE).unwrap();

        let mut out = vec![0xFFu8; PAGE];
        store.read_page(7, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(store.page_count().unwrap(), 8);
    }

    #[test]
    fn file_store_write_extends_with_zero_gap() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("t.db"), PAGE).unwrap();

        store.write_page(5, &vec![9u8; PAGE]).unwrap();
        assert_eq!(store.page_count().unwrap(), 6);

        let mut out = vec![0xFFu8; PAGE];
        store.read_page(2, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn file_store_truncate_shrinks() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("t.db"), PAGE).unwrap();

        store.write_page(9, &vec![1u8; PAGE]).unwrap();
        assert_eq!(store.page_count().unwrap(), 10);

        store.truncate_pages(4).unwrap();
        assert_eq!(store.page_count().unwrap(), 4);
    }

    #[test]
    fn file_store_rejects_wrong_buffer_size() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("t.db"), PAGE).unwrap();

        let mut short = vec![0u8; PAGE - 1];
        assert!(store.read_page(0, &mut short).is_err());
        assert!(store.write_page(0, &short).is_err());
    }

    #[test]
    fn segmented_store_routes_across_segments() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t.db");
        let store = SegmentedFileStore::open(&base, PAGE, 4).unwrap();

        for page_no in 0..10u32 {
            let page = vec![page_no as u8; PAGE];
            store.write_page(page_no, &page).unwrap();
        }

        assert!(base.exists());
        assert!(dir.path().join("t.db.seg1").exists());
        assert!(dir.path().join("t.db.seg2").exists());

        for page_no in 0..10u32 {
            let mut out = vec![0u8; PAGE];
            store.read_page(page_no, &mut out).unwrap();
            assert!(out.iter().all(|&b| b == page_no as u8));
        }
        assert_eq!(store.page_count().unwrap(), 10);
    }

    #[test]
    fn segmented_store_truncate_removes_tail_segments() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t.db");
        let store = SegmentedFileStore::open(&base, PAGE, 4).unwrap();

        store.write_page(11, &vec![7u8; PAGE]).unwrap();
        assert!(dir.path().join("t.db.seg2").exists());

        store.truncate_pages(5).unwrap();
        assert!(!dir.path().join("t.db.seg2").exists());
        assert!(dir.path().join("t.db.seg1").exists());
        assert_eq!(store.page_count().unwrap(), 5);
    }

    #[test]
    fn segmented_store_reopen_sees_pages() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("t.db");

        {
            let store = SegmentedFileStore::open(&base, PAGE, 2).unwrap();
            store.write_page(3, &vec![0x5Au8; PAGE]).unwrap();
            store.sync().unwrap();
        }

        let store = SegmentedFileStore::open(&base, PAGE, 2).unwrap();
        let mut out = vec![0u8; PAGE];
        store.read_page(3, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0x5A));
        assert_eq!(store.page_count().unwrap(), 4);
    }
}
