//! # Write-Ahead Log
//!
//! Append-only transactional log providing the durability half of the store.
//! Every mutation stages full page images under a transaction id, then
//! commits; a page image is durably visible after a crash iff its matching
//! commit record reached the log before the crash.
//!
//! ## File Layout
//!
//! ```text
//! +--------------------+
//! | File Header (32B)  |  "TSWALV1" + page size
//! +--------------------+
//! | Record             |  20-byte header + payload
//! | Record             |
//! | ...                |
//! +--------------------+
//! ```
//!
//! Record header fields (all u32 little-endian):
//!
//! ```text
//! Offset  Field         Description
//! 0       record_type   0 = Begin, 1 = Page, 2 = Commit
//! 4       tx_id         transaction this record belongs to
//! 8       page_no       page number (Page records only)
//! 12      payload_len   0 for Begin/Commit, page size for Page
//! 16      checksum      CRC-32C of the payload (0 when empty)
//! ```
//!
//! ## Write Protocol
//!
//! 1. `begin_transaction` appends a Begin record and opens a staging buffer
//! 2. `stage_page` collects page images in memory, touching no disk
//! 3. `commit_transaction` appends one Page record per staged image, then a
//!    Commit record, then fsyncs (skipped under group commit)
//! 4. `rollback_transaction` drops the staging buffer; the dangling Begin is
//!    harmless because replay only applies committed transactions
//!
//! ## Replay
//!
//! The scan walks records from the header. Page records accumulate in an
//! in-flight map per transaction and move to the committed list when the
//! matching Commit is reached. The scan stops at the first incomplete
//! header, short payload or unknown record type (a torn tail is expected
//! after a crash, not an error); a checksum mismatch drops that single frame
//! and continues. Committed frames are then applied in log order and the
//! file is truncated back to its header.
//!
//! ## Concurrency
//!
//! The WAL is serialized by the coordinator's write lock; replay runs only
//! at open and checkpoint under that lock.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISCSI};
use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::PageStore;
use crate::error::StoreError;

/// Magic bytes at the start of every WAL file.
pub const WAL_MAGIC: &[u8; 16] = b"TSWALV1\x00\x00\x00\x00\x00\x00\x00\x00\x00";
/// Size of the WAL file header.
pub const WAL_HEADER_SIZE: usize = 32;
/// Size of a record header.
pub const WAL_RECORD_HEADER_SIZE: usize = 20;

pub const RECORD_BEGIN: u32 = 0;
pub const RECORD_PAGE: u32 = 1;
pub const RECORD_COMMIT: u32 = 2;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// CRC-32C over a record payload; zero for empty payloads.
pub fn compute_checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    let mut digest = CRC32C.digest();
    digest.update(payload);
    digest.finalize()
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct WalFileHeader {
    magic: [u8; 16],
    page_size: U32,
    reserved: [u8; 12],
}

const _: () = assert!(std::mem::size_of::<WalFileHeader>() == WAL_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct WalRecordHeader {
    record_type: U32,
    tx_id: U32,
    page_no: U32,
    payload_len: U32,
    checksum: U32,
}

const _: () = assert!(std::mem::size_of::<WalRecordHeader>() == WAL_RECORD_HEADER_SIZE);

impl WalRecordHeader {
    fn new(record_type: u32, tx_id: u32, page_no: u32, payload: &[u8]) -> Self {
        Self {
            record_type: U32::new(record_type),
            tx_id: U32::new(tx_id),
            page_no: U32::new(page_no),
            payload_len: U32::new(payload.len() as u32),
            checksum: U32::new(compute_checksum(payload)),
        }
    }

    pub fn record_type(&self) -> u32 {
        self.record_type.get()
    }

    pub fn tx_id(&self) -> u32 {
        self.tx_id.get()
    }

    pub fn page_no(&self) -> u32 {
        self.page_no.get()
    }

    pub fn payload_len(&self) -> u32 {
        self.payload_len.get()
    }

    pub fn checksum(&self) -> u32 {
        self.checksum.get()
    }
}

#[derive(Debug)]
struct StagedFrame {
    page_no: u32,
    image: Vec<u8>,
}

#[derive(Debug)]
pub struct Wal {
    file: File,
    path: PathBuf,
    page_size: usize,
    end_offset: u64,
    next_tx_id: u32,
    staged: HashMap<u32, Vec<StagedFrame>>,
}

impl Wal {
    /// Opens or creates the log, validating the header. A missing or short
    /// header is rewritten; a present header with a foreign magic or a
    /// different page size is corrupt.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open WAL at {:?}", path))?;

        let mut wal = Self {
            file,
            path,
            page_size,
            end_offset: 0,
            next_tx_id: 1,
            staged: HashMap::new(),
        };

        let len = wal.file.metadata().wrap_err("failed to stat WAL")?.len();
        if len < WAL_HEADER_SIZE as u64 {
            wal.rewrite_header()?;
        } else {
            let mut header_bytes = [0u8; WAL_HEADER_SIZE];
            wal.file
                .read_exact_at(&mut header_bytes, 0)
                .wrap_err("failed to read WAL header")?;
            let header = WalFileHeader::read_from_bytes(&header_bytes)
                .map_err(|e| eyre::eyre!("failed to parse WAL header: {:?}", e))?;
            if &header.magic != WAL_MAGIC {
                bail!(StoreError::CorruptWal("header magic mismatch".into()));
            }
            if header.page_size.get() as usize != page_size {
                bail!(StoreError::CorruptWal(format!(
                    "WAL page size {} does not match store page size {}",
                    header.page_size.get(),
                    page_size
                )));
            }
            wal.end_offset = len;
            wal.next_tx_id = wal.scan(None)?.max_tx_id.saturating_add(1).max(1);
        }

        Ok(wal)
    }

    fn rewrite_header(&mut self) -> Result<()> {
        let header = WalFileHeader {
            magic: *WAL_MAGIC,
            page_size: U32::new(self.page_size as u32),
            reserved: [0; 12],
        };
        self.file.set_len(0).wrap_err("failed to truncate WAL")?;
        self.file
            .write_all_at(header.as_bytes(), 0)
            .wrap_err("failed to write WAL header")?;
        self.file.sync_all().wrap_err("failed to sync WAL header")?;
        self.end_offset = WAL_HEADER_SIZE as u64;
        Ok(())
    }

    fn append(&mut self, record_type: u32, tx_id: u32, page_no: u32, payload: &[u8]) -> Result<()> {
        let header = WalRecordHeader::new(record_type, tx_id, page_no, payload);
        self.file
            .write_all_at(header.as_bytes(), self.end_offset)
            .wrap_err("failed to append WAL record header")?;
        if !payload.is_empty() {
            self.file
                .write_all_at(payload, self.end_offset + WAL_RECORD_HEADER_SIZE as u64)
                .wrap_err("failed to append WAL record payload")?;
        }
        self.end_offset += (WAL_RECORD_HEADER_SIZE + payload.len()) as u64;
        Ok(())
    }

    /// Starts a transaction: appends a Begin record and registers an
    /// in-memory staging buffer. Transaction ids are monotone from 1.
    pub fn begin_transaction(&mut self) -> Result<u32> {
        let tx_id = self.next_tx_id;
        self.next_tx_id += 1;
        self.append(RECORD_BEGIN, tx_id, 0, &[])?;
        self.staged.insert(tx_id, Vec::new());
        Ok(tx_id)
    }

    /// Stages a full page image under `tx_id`. Touches no disk.
    pub fn stage_page(&mut self, tx_id: u32, page_no: u32, image: &[u8]) -> Result<()> {
        ensure!(
            image.len() == self.page_size,
            "staged image is {} bytes, page size is {}",
            image.len(),
            self.page_size
        );
        let frames = self
            .staged
            .get_mut(&tx_id)
            .ok_or_else(|| eyre::eyre!("stage_page on unknown transaction {}", tx_id))?;
        frames.push(StagedFrame {
            page_no,
            image: image.to_vec(),
        });
        Ok(())
    }

    /// Writes the staged Page records and the Commit record. Fsyncs unless
    /// `skip_sync` (group commit) is set.
    pub fn commit_transaction(&mut self, tx_id: u32, skip_sync: bool) -> Result<()> {
        let frames = self
            .staged
            .remove(&tx_id)
            .ok_or_else(|| eyre::eyre!("commit of unknown transaction {}", tx_id))?;

        for frame in &frames {
            self.append(RECORD_PAGE, tx_id, frame.page_no, &frame.image)?;
        }
        self.append(RECORD_COMMIT, tx_id, 0, &[])?;

        if !skip_sync {
            self.file.sync_all().wrap_err("failed to sync WAL commit")?;
        }
        Ok(())
    }

    /// Drops the staging buffer. The Begin record stays in the log; replay
    /// ignores transactions without a Commit.
    pub fn rollback_transaction(&mut self, tx_id: u32) -> Result<()> {
        self.staged
            .remove(&tx_id)
            .ok_or_else(|| eyre::eyre!("rollback of unknown transaction {}", tx_id))?;
        Ok(())
    }

    /// Applies every committed transaction to the page store, then truncates
    /// the log to its header. Returns the number of frames applied.
    pub fn replay(&mut self, pager: &PageStore) -> Result<usize> {
        let mut committed: Vec<(u32, Vec<u8>)> = Vec::new();
        let outcome = self.scan(Some(&mut committed))?;

        for (page_no, image) in &committed {
            pager
                .write_page(*page_no, image)
                .wrap_err_with(|| format!("failed to apply WAL frame for page {}", page_no))?;
        }

        if outcome.dropped_frames > 0 {
            log::warn!(
                "WAL replay dropped {} corrupt frames",
                outcome.dropped_frames
            );
        }
        if !committed.is_empty() {
            log::info!(
                "WAL replay applied {} frames from {:?}",
                committed.len(),
                self.path
            );
        }

        self.file
            .set_len(WAL_HEADER_SIZE as u64)
            .wrap_err("failed to truncate WAL after replay")?;
        self.file.sync_all().wrap_err("failed to sync WAL truncate")?;
        self.end_offset = WAL_HEADER_SIZE as u64;

        Ok(committed.len())
    }

    /// Replays committed frames and syncs the data file. After a checkpoint
    /// the log is exactly its 32-byte header.
    pub fn checkpoint(&mut self, pager: &PageStore) -> Result<usize> {
        let applied = self.replay(pager)?;
        pager.sync()?;
        Ok(applied)
    }

    /// Discards the log entirely and rewrites an empty header.
    pub fn reset(&mut self) -> Result<()> {
        self.staged.clear();
        self.next_tx_id = 1;
        self.rewrite_header()
    }

    /// Bytes currently in the log, header included.
    pub fn len(&self) -> u64 {
        self.end_offset
    }

    pub fn is_empty(&self) -> bool {
        self.end_offset <= WAL_HEADER_SIZE as u64
    }

    fn scan(&self, mut committed: Option<&mut Vec<(u32, Vec<u8>)>>) -> Result<ScanOutcome> {
        let len = self.file.metadata().wrap_err("failed to stat WAL")?.len() as usize;
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, 0)
            .wrap_err("failed to read WAL for scan")?;

        let mut in_flight: HashMap<u32, Vec<(u32, Vec<u8>)>> = HashMap::new();
        let mut outcome = ScanOutcome::default();
        let mut pos = WAL_HEADER_SIZE;

        while pos + WAL_RECORD_HEADER_SIZE <= len {
            let header =
                WalRecordHeader::read_from_bytes(&buf[pos..pos + WAL_RECORD_HEADER_SIZE])
                    .map_err(|e| eyre::eyre!("failed to parse WAL record header: {:?}", e))?;
            let payload_len = header.payload_len() as usize;
            let tx_id = header.tx_id();

            match header.record_type() {
                RECORD_BEGIN => {
                    if payload_len != 0 {
                        break;
                    }
                    pos += WAL_RECORD_HEADER_SIZE;
                    outcome.max_tx_id = outcome.max_tx_id.max(tx_id);
                    in_flight.insert(tx_id, Vec::new());
                }
                RECORD_PAGE => {
                    if payload_len != self.page_size {
                        break;
                    }
                    if pos + WAL_RECORD_HEADER_SIZE + payload_len > len {
                        break;
                    }
                    let payload_start = pos + WAL_RECORD_HEADER_SIZE;
                    let payload = &buf[payload_start..payload_start + payload_len];
                    pos = payload_start + payload_len;
                    outcome.max_tx_id = outcome.max_tx_id.max(tx_id);

                    if compute_checksum(payload) != header.checksum() {
                        outcome.dropped_frames += 1;
                        continue;
                    }
                    if let Some(frames) = in_flight.get_mut(&tx_id) {
                        frames.push((header.page_no(), payload.to_vec()));
                    }
                }
                RECORD_COMMIT => {
                    if payload_len != 0 {
                        break;
                    }
                    pos += WAL_RECORD_HEADER_SIZE;
                    outcome.max_tx_id = outcome.max_tx_id.max(tx_id);
                    if let Some(frames) = in_flight.remove(&tx_id) {
                        if let Some(committed) = committed.as_deref_mut() {
                            committed.extend(frames);
                        }
                    }
                }
                _ => break,
            }
        }

        Ok(outcome)
    }
}

#[derive(Default)]
struct ScanOutcome {
    max_tx_id: u32,
    dropped_frames: usize,
}
