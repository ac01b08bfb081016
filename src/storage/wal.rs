//! # Write-Ahead Log
//!
//! Full-page-image logging for the index file. Every logged mutation appends
//! a frame carrying the complete new image of one page; recovery replays
//! valid frames in order and stops at the first bad checksum, which marks
//! the tail of an incomplete write.
//!
//! ## Frame Format
//!
//! ```text
//! +------------------+------------------+
//! | Frame Header     | Page Data        |
//! | (32 bytes)       | (8192 bytes)     |
//! +------------------+------------------+
//! ```
//!
//! The frame header contains:
//! - `page_no`: which page in the index file this frame represents
//! - `db_size`: index size (in pages) after applying this frame
//! - `salt1`, `salt2`: values mixed into the checksum
//! - `checksum`: CRC64 over the header fields and page data
//!
//! ## Write Protocol
//!
//! 1. Compute checksum over header + data
//! 2. Write header then data to the log file
//! 3. Sync to disk
//!
//! The log is a single append-only file next to the index file. After a
//! clean flush of the index the log is truncated (checkpoint), so it only
//! ever holds frames since the last durable state.
//!
//! ## Concurrency
//!
//! Appends are serialized behind a `parking_lot::Mutex`; callers hold their
//! page write lock across the append, so log order matches lock order for
//! any single page.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::{MmapStorage, PAGE_SIZE};

pub const WAL_FRAME_HEADER_SIZE: usize = 32;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable)]
pub struct WalFrameHeader {
    pub page_no: u32,
    pub db_size: u32,
    pub salt1: u32,
    pub salt2: u32,
    pub checksum: u64,
    _reserved: [u8; 8],
}

impl WalFrameHeader {
    pub fn new(page_no: u32, db_size: u32, salt1: u32, salt2: u32, checksum: u64) -> Self {
        Self {
            page_no,
            db_size,
            salt1,
            salt2,
            checksum,
            _reserved: [0; 8],
        }
    }
}

pub fn compute_checksum(header: &WalFrameHeader, page_data: &[u8]) -> u64 {
    let mut digest = CRC64.digest();

    digest.update(&header.page_no.to_le_bytes());
    digest.update(&header.db_size.to_le_bytes());
    digest.update(&header.salt1.to_le_bytes());
    digest.update(&header.salt2.to_le_bytes());

    digest.update(page_data);

    digest.finalize()
}

pub fn validate_checksum(header: &WalFrameHeader, page_data: &[u8]) -> bool {
    let computed = compute_checksum(header, page_data);
    computed == header.checksum
}

pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalFile>,
}

struct WalFile {
    file: File,
    offset: u64,
}

impl Wal {
    /// Opens the log at `path`, creating it if absent. Existing frames are
    /// preserved so the caller can replay them before appending.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open WAL file '{}'", path.display()))?;

        let offset = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(WalFile { file, offset }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_offset(&self) -> u64 {
        self.inner.lock().offset
    }

    /// Appends one full-page-image frame and syncs it to disk.
    pub fn append_page_image(&self, page_no: u32, db_size: u32, page_data: &[u8]) -> Result<()> {
        ensure!(
            page_data.len() == PAGE_SIZE,
            "page data must be exactly {} bytes, got {}",
            PAGE_SIZE,
            page_data.len()
        );

        let mut header = WalFrameHeader::new(page_no, db_size, 0, 0, 0);
        header.checksum = compute_checksum(&header, page_data);

        let mut inner = self.inner.lock();
        let offset = inner.offset;

        inner
            .file
            .seek(SeekFrom::Start(offset))
            .wrap_err("failed to seek to WAL tail")?;
        inner
            .file
            .write_all(header.as_bytes())
            .wrap_err("failed to write WAL frame header")?;
        inner
            .file
            .write_all(page_data)
            .wrap_err("failed to write WAL frame page data")?;
        inner
            .file
            .sync_all()
            .wrap_err("failed to sync WAL frame to disk")?;

        inner.offset += (WAL_FRAME_HEADER_SIZE + PAGE_SIZE) as u64;

        Ok(())
    }

    /// Replays every valid frame into `storage`, growing it as frames
    /// demand. Returns the number of frames applied. A frame with a bad
    /// checksum ends the replay; anything past it is a torn tail.
    pub fn replay(&self, storage: &mut MmapStorage) -> Result<u32> {
        let mut inner = self.inner.lock();

        inner
            .file
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to seek to start of WAL")?;

        let mut frames_applied = 0;
        loop {
            let frame = match read_frame(&mut inner.file) {
                Ok(frame) => frame,
                Err(_) => break,
            };
            let (header, page_data) = frame;

            if header.db_size > storage.page_count() {
                storage.grow(header.db_size).wrap_err_with(|| {
                    format!("failed to grow index to {} pages for WAL replay", header.db_size)
                })?;
            }

            let page_mut = storage.page_mut(header.page_no).wrap_err_with(|| {
                format!("failed to get page {} for WAL replay", header.page_no)
            })?;
            page_mut.copy_from_slice(&page_data);

            frames_applied += 1;
        }

        Ok(frames_applied)
    }

    /// Discards all frames. Called after the index file itself has been
    /// durably flushed.
    pub fn truncate(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        inner
            .file
            .set_len(0)
            .wrap_err("failed to truncate WAL file")?;
        inner
            .file
            .sync_all()
            .wrap_err("failed to sync WAL after truncate")?;

        inner.offset = 0;

        Ok(())
    }
}

fn read_frame(file: &mut File) -> Result<(WalFrameHeader, Vec<u8>)> {
    let mut header_bytes = [0u8; WAL_FRAME_HEADER_SIZE];
    file.read_exact(&mut header_bytes)
        .wrap_err("failed to read WAL frame header")?;

    let header = WalFrameHeader::read_from_bytes(&header_bytes)
        .map_err(|e| eyre::eyre!("invalid WAL frame header: {:?}", e))?;

    let mut page_data = vec![0u8; PAGE_SIZE];
    file.read_exact(&mut page_data)
        .wrap_err("failed to read WAL frame page data")?;

    if !validate_checksum(&header, &page_data) {
        bail!("WAL frame checksum validation failed");
    }

    Ok((header, page_data))
}
