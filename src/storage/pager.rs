//! # Pager
//!
//! Buffer pool and lock manager for the index file. Every hot page gets a
//! frame: an in-memory copy of the page bytes behind its own `RwLock`, plus
//! a dirty flag and a pin count. Tree code never touches the mmap directly;
//! it acquires pages through the pager and works on frames.
//!
//! ## Locking Model
//!
//! Per-page reader/writer locks are the concurrency story of the whole
//! index: many readers or one writer per page, never a tree-wide lock. The
//! `arc_lock` feature of `parking_lot` makes the guards owned values
//! (`ArcRwLockReadGuard`), so a descent can acquire the child's lock, let
//! the parent's guard drop, and keep walking downward with no borrow tying
//! it to the pager.
//!
//! `acquire_cleanup` is the super-exclusive variant: an exclusive lock that
//! additionally waits for every pin to drain. Vacuum uses it on leaf pages
//! so that no reader is left holding the buffer while entries shift
//! underneath it.
//!
//! ## Dirty Tracking and Durability
//!
//! Dropping a write guard marks the frame dirty. `flush()` copies dirty
//! frames back through the mmap, syncs the file, and truncates the WAL
//! (a checkpoint: once the file is durable the logged images are redundant).
//!
//! ## Eviction
//!
//! When the frame table exceeds its capacity, unreferenced frames are
//! written back (if dirty) and dropped. A frame is evictable only when the
//! table holds the last `Arc` to it and its pin count is zero.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use super::{Freelist, MmapStorage, Wal, PAGE_SIZE};

const DEFAULT_FRAME_CAPACITY: usize = 256;

struct Frame {
    page_no: u32,
    data: Arc<RwLock<[u8; PAGE_SIZE]>>,
    dirty: AtomicBool,
    pins: AtomicU32,
}

impl Frame {
    fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }

    fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }
}

/// Shared lock on one page. Derefs to the page bytes.
pub struct PageReadGuard {
    frame: Arc<Frame>,
    guard: ArcRwLockReadGuard<RawRwLock, [u8; PAGE_SIZE]>,
}

impl PageReadGuard {
    pub fn page_no(&self) -> u32 {
        self.frame.page_no
    }
}

impl Deref for PageReadGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..]
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}

/// Exclusive lock on one page. Dropping it marks the frame dirty, so a
/// write guard should only be taken when a mutation is intended.
pub struct PageWriteGuard {
    frame: Arc<Frame>,
    guard: ArcRwLockWriteGuard<RawRwLock, [u8; PAGE_SIZE]>,
}

impl PageWriteGuard {
    pub fn page_no(&self) -> u32 {
        self.frame.page_no
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[..]
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard[..]
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        self.frame.dirty.store(true, Ordering::Release);
        self.frame.unpin();
    }
}

pub struct Pager {
    storage: Mutex<MmapStorage>,
    wal: Option<Wal>,
    frames: RwLock<HashMap<u32, Arc<Frame>>>,
    freelist: Mutex<Freelist>,
    capacity: usize,
}

impl Pager {
    pub fn new(storage: MmapStorage, wal: Option<Wal>) -> Self {
        Self {
            storage: Mutex::new(storage),
            wal,
            frames: RwLock::new(HashMap::new()),
            freelist: Mutex::new(Freelist::new()),
            capacity: DEFAULT_FRAME_CAPACITY,
        }
    }

    pub fn page_count(&self) -> u32 {
        self.storage.lock().page_count()
    }

    pub fn has_wal(&self) -> bool {
        self.wal.is_some()
    }

    /// Takes the shared lock on `page_no` and pins its frame.
    pub fn acquire_read(&self, page_no: u32) -> Result<PageReadGuard> {
        let frame = self.frame(page_no)?;
        let guard = frame.data.read_arc();
        frame.pin();
        Ok(PageReadGuard { frame, guard })
    }

    /// Takes the exclusive lock on `page_no` and pins its frame.
    pub fn acquire_write(&self, page_no: u32) -> Result<PageWriteGuard> {
        let frame = self.frame(page_no)?;
        let guard = frame.data.write_arc();
        frame.pin();
        Ok(PageWriteGuard { frame, guard })
    }

    /// Super-exclusive lock: the exclusive lock plus a wait for every pin
    /// to drain. Pins are only ever taken while holding the page's lock,
    /// so any pin still visible after we hold the write lock belongs to a
    /// guard that is mid-drop; the wait is brief.
    pub fn acquire_cleanup(&self, page_no: u32) -> Result<PageWriteGuard> {
        let frame = self.frame(page_no)?;
        let guard = frame.data.write_arc();
        while frame.is_pinned() {
            std::thread::yield_now();
        }
        frame.pin();
        Ok(PageWriteGuard { frame, guard })
    }

    /// Hands out a usable page number: a recycled page from the freelist
    /// (zeroed first) or a fresh page appended to the file.
    pub fn allocate(&self) -> Result<u32> {
        if let Some(page_no) = self.freelist.lock().pop() {
            self.frames.write().remove(&page_no);
            let mut storage = self.storage.lock();
            storage
                .page_mut(page_no)
                .wrap_err_with(|| format!("failed to reset recycled page {}", page_no))?
                .fill(0);
            return Ok(page_no);
        }

        let mut storage = self.storage.lock();
        let page_no = storage.page_count();
        storage
            .grow(page_no + 1)
            .wrap_err_with(|| format!("failed to extend index file for page {}", page_no))?;
        Ok(page_no)
    }

    pub fn record_free(&self, page_no: u32) {
        self.freelist.lock().record_free(page_no);
    }

    pub fn free_page_count(&self) -> u32 {
        self.freelist.lock().free_count()
    }

    pub fn vacuum_freelist(&self) {
        self.freelist.lock().vacuum();
    }

    /// Appends a full-page image to the WAL, if one is configured. Callers
    /// hold the page's write lock across this, so log order matches lock
    /// order for any single page.
    pub fn log_page(&self, page_no: u32, data: &[u8]) -> Result<()> {
        if let Some(wal) = &self.wal {
            let db_size = self.storage.lock().page_count();
            wal.append_page_image(page_no, db_size, data)
                .wrap_err_with(|| format!("failed to log image of page {}", page_no))?;
        }
        Ok(())
    }

    /// Writes a page image straight through to the file, bypassing the
    /// frame table. This is the bulk builder's sequential write path; the
    /// file is grown (zero-filling any holes) when the image lands past the
    /// current end.
    pub fn write_page_image(&self, page_no: u32, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() == PAGE_SIZE,
            "page image must be exactly {} bytes, got {}",
            PAGE_SIZE,
            data.len()
        );

        self.frames.write().remove(&page_no);

        {
            let mut storage = self.storage.lock();
            if page_no >= storage.page_count() {
                storage.grow(page_no + 1).wrap_err_with(|| {
                    format!("failed to extend index file for page {}", page_no)
                })?;
            }
            storage.page_mut(page_no)?.copy_from_slice(data);
        }

        self.log_page(page_no, data)
    }

    /// Writes every dirty frame back through the mmap, syncs the file, and
    /// truncates the WAL. This is the checkpoint boundary.
    pub fn flush(&self) -> Result<()> {
        {
            let frames = self.frames.read();
            for (&page_no, frame) in frames.iter() {
                if !frame.dirty.load(Ordering::Acquire) {
                    continue;
                }
                let data = frame.data.read();
                let mut storage = self.storage.lock();
                storage
                    .page_mut(page_no)
                    .wrap_err_with(|| format!("failed to write back page {}", page_no))?
                    .copy_from_slice(&data[..]);
                frame.dirty.store(false, Ordering::Release);
            }
        }

        self.storage.lock().sync()?;

        if let Some(wal) = &self.wal {
            wal.truncate()?;
        }

        Ok(())
    }

    fn frame(&self, page_no: u32) -> Result<Arc<Frame>> {
        if let Some(frame) = self.frames.read().get(&page_no) {
            return Ok(frame.clone());
        }

        let mut frames = self.frames.write();
        if let Some(frame) = frames.get(&page_no) {
            return Ok(frame.clone());
        }

        let mut buf = [0u8; PAGE_SIZE];
        {
            let storage = self.storage.lock();
            buf.copy_from_slice(storage.page(page_no)?);
        }

        if frames.len() >= self.capacity {
            self.evict_excess(&mut frames)?;
        }

        let frame = Arc::new(Frame {
            page_no,
            data: Arc::new(RwLock::new(buf)),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
        });
        frames.insert(page_no, frame.clone());
        Ok(frame)
    }

    fn evict_excess(&self, frames: &mut HashMap<u32, Arc<Frame>>) -> Result<()> {
        let mut victims = Vec::new();
        for (&page_no, frame) in frames.iter() {
            if Arc::strong_count(frame) > 1 || frame.is_pinned() {
                continue;
            }
            victims.push(page_no);
            if frames.len() - victims.len() < self.capacity {
                break;
            }
        }

        for page_no in victims {
            let Some(frame) = frames.remove(&page_no) else {
                continue;
            };
            if frame.dirty.load(Ordering::Acquire) {
                let data = frame.data.read();
                let mut storage = self.storage.lock();
                storage
                    .page_mut(page_no)
                    .wrap_err_with(|| format!("failed to write back evicted page {}", page_no))?
                    .copy_from_slice(&data[..]);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_pager(pages: u32) -> (tempfile::TempDir, Pager) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rix");
        let storage = MmapStorage::create(&path, pages).unwrap();
        (dir, Pager::new(storage, None))
    }

    #[test]
    fn write_then_read_through_frames() {
        let (_dir, pager) = test_pager(2);

        {
            let mut guard = pager.acquire_write(1).unwrap();
            guard[0] = 0xAB;
            guard[PAGE_SIZE - 1] = 0xCD;
        }

        let guard = pager.acquire_read(1).unwrap();
        assert_eq!(guard.page_no(), 1);
        assert_eq!(guard[0], 0xAB);
        assert_eq!(guard[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn flush_persists_dirty_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rix");

        {
            let storage = MmapStorage::create(&path, 2).unwrap();
            let pager = Pager::new(storage, None);
            let mut guard = pager.acquire_write(1).unwrap();
            guard[7] = 0x42;
            drop(guard);
            pager.flush().unwrap();
        }

        let storage = MmapStorage::open(&path).unwrap();
        assert_eq!(storage.page(1).unwrap()[7], 0x42);
    }

    #[test]
    fn allocate_grows_the_file() {
        let (_dir, pager) = test_pager(1);

        assert_eq!(pager.allocate().unwrap(), 1);
        assert_eq!(pager.allocate().unwrap(), 2);
        assert_eq!(pager.page_count(), 3);
    }

    #[test]
    fn allocate_recycles_freed_pages_zeroed() {
        let (_dir, pager) = test_pager(1);

        let page_no = pager.allocate().unwrap();
        {
            let mut guard = pager.acquire_write(page_no).unwrap();
            guard[0] = 0xFF;
        }
        pager.flush().unwrap();
        pager.record_free(page_no);

        let recycled = pager.allocate().unwrap();
        assert_eq!(recycled, page_no);

        let guard = pager.acquire_read(recycled).unwrap();
        assert!(guard.iter().all(|&b| b == 0));
    }

    #[test]
    fn acquire_out_of_bounds_fails() {
        let (_dir, pager) = test_pager(2);

        assert!(pager.acquire_read(1).is_ok());
        assert!(pager.acquire_read(2).is_err());
    }

    #[test]
    fn concurrent_readers_share_a_page() {
        let (_dir, pager) = test_pager(2);

        let a = pager.acquire_read(1).unwrap();
        let b = pager.acquire_read(1).unwrap();
        assert_eq!(a[0], b[0]);
    }

    #[test]
    fn cleanup_lock_waits_out_pins() {
        let (_dir, pager) = test_pager(2);

        // No outstanding guards, so the cleanup lock is immediate.
        let guard = pager.acquire_cleanup(1).unwrap();
        assert_eq!(guard.page_no(), 1);
    }

    #[test]
    fn wal_images_replay_after_crash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rix");
        let wal_path = dir.path().join("test.rix.wal");

        {
            let storage = MmapStorage::create(&path, 2).unwrap();
            let wal = Wal::open(&wal_path).unwrap();
            let pager = Pager::new(storage, Some(wal));

            let mut guard = pager.acquire_write(1).unwrap();
            guard[0] = 0x77;
            let image = guard.to_vec();
            pager.log_page(1, &image).unwrap();
            // Dropped without flush: the mmap copy of page 1 is stale.
        }

        let mut storage = MmapStorage::open(&path).unwrap();
        let wal = Wal::open(&wal_path).unwrap();
        wal.replay(&mut storage).unwrap();

        assert_eq!(storage.page(1).unwrap()[0], 0x77);
    }
}
