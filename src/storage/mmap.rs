//! # Memory-Mapped File Storage
//!
//! The index file, memory-mapped and addressed in whole pages. This layer
//! knows nothing about pages' contents; it hands out bounds-checked byte
//! slices and grows the file on demand.
//!
//! The pager copies page bytes into its own locked frames rather than
//! holding mmap slices, so the only consumers of `page`/`page_mut` are
//! short copy loops (frame fill, write-back, WAL replay, the bulk
//! builder's direct writes). That keeps the aliasing story simple: `grow`
//! takes `&mut self`, and the borrow checker guarantees no page slice can
//! be alive when the mapping is replaced.
//!
//! Growth goes through `set_len`, which zero-fills the new tail; a page
//! that has never been written reads as all zeroes, which the tree layer
//! relies on to recognize never-formatted pages.

use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::PAGE_SIZE;

#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    map: MmapMut,
    page_count: u32,
}

impl MmapStorage {
    /// Creates (or truncates) the file at `path` with room for
    /// `initial_pages` pages.
    pub fn create<P: AsRef<Path>>(path: P, initial_pages: u32) -> Result<Self> {
        let path = path.as_ref();
        ensure!(initial_pages > 0, "initial page count must be at least 1");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create index file '{}'", path.display()))?;
        file.set_len(initial_pages as u64 * PAGE_SIZE as u64)
            .wrap_err_with(|| format!("failed to size index file '{}'", path.display()))?;

        Self::map(file, initial_pages)
    }

    /// Maps an existing index file. The file must be a whole number of
    /// pages and not empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open index file '{}'", path.display()))?;
        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat index file '{}'", path.display()))?
            .len();

        ensure!(len > 0, "index file '{}' is empty", path.display());
        ensure!(
            len % PAGE_SIZE as u64 == 0,
            "index file '{}' size {} is not a multiple of the {} byte page size",
            path.display(),
            len,
            PAGE_SIZE
        );

        Self::map(file, (len / PAGE_SIZE as u64) as u32)
    }

    fn map(file: File, page_count: u32) -> Result<Self> {
        // SAFETY: mapping a file mutably is UB if something else mutates it
        // concurrently. The file is held read+write for the lifetime of this
        // value, nothing else in the process maps it, and external mutation
        // of an index file is outside the supported contract. All access is
        // bounds-checked through span().
        let map = unsafe { MmapMut::map_mut(&file).wrap_err("failed to memory-map index file")? };

        Ok(Self {
            file,
            map,
            page_count,
        })
    }

    fn span(&self, page_no: u32) -> Result<Range<usize>> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );
        let start = page_no as usize * PAGE_SIZE;
        Ok(start..start + PAGE_SIZE)
    }

    pub fn page(&self, page_no: u32) -> Result<&[u8]> {
        let span = self.span(page_no)?;
        Ok(&self.map[span])
    }

    pub fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        let span = self.span(page_no)?;
        Ok(&mut self.map[span])
    }

    /// Extends the file to `new_page_count` pages and remaps it. Shrinking
    /// is a no-op; pages are never given back to the filesystem.
    pub fn grow(&mut self, new_page_count: u32) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        self.map
            .flush()
            .wrap_err("failed to flush mapping before grow")?;
        self.file
            .set_len(new_page_count as u64 * PAGE_SIZE as u64)
            .wrap_err_with(|| format!("failed to extend index file to {} pages", new_page_count))?;

        // SAFETY: same contract as map(); additionally no page borrows can
        // exist here because grow takes &mut self, and the old mapping was
        // flushed before being replaced.
        self.map = unsafe {
            MmapMut::map_mut(&self.file).wrap_err("failed to remap index file after grow")?
        };
        self.page_count = new_page_count;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.map.flush().wrap_err("failed to sync index file")
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_sizes_the_file_in_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rix");

        let storage = MmapStorage::create(&path, 4).unwrap();

        assert_eq!(storage.page_count(), 4);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            4 * PAGE_SIZE as u64
        );
    }

    #[test]
    fn create_rejects_zero_pages() {
        let dir = tempdir().unwrap();

        let result = MmapStorage::create(dir.path().join("test.rix"), 0);

        assert!(result
            .unwrap_err()
            .to_string()
            .contains("at least 1"));
    }

    #[test]
    fn open_sees_what_create_wrote() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rix");

        {
            let mut storage = MmapStorage::create(&path, 5).unwrap();
            storage.page_mut(0).unwrap()[0] = 0xAB;
            storage.sync().unwrap();
        }

        let storage = MmapStorage::open(&path).unwrap();
        assert_eq!(storage.page_count(), 5);
        assert_eq!(storage.page(0).unwrap()[0], 0xAB);
    }

    #[test]
    fn open_rejects_missing_and_ragged_files() {
        let dir = tempdir().unwrap();

        assert!(MmapStorage::open(dir.path().join("absent.rix")).is_err());

        let ragged = dir.path().join("ragged.rix");
        std::fs::write(&ragged, vec![0u8; PAGE_SIZE + 1]).unwrap();
        assert!(MmapStorage::open(&ragged).is_err());
    }

    #[test]
    fn page_access_is_bounds_checked() {
        let dir = tempdir().unwrap();
        let storage = MmapStorage::create(dir.path().join("test.rix"), 5).unwrap();

        assert!(storage.page(4).is_ok());
        assert!(storage.page(5).is_err());
        assert!(storage.page(u32::MAX).is_err());
    }

    #[test]
    fn grow_extends_and_zero_fills() {
        let dir = tempdir().unwrap();
        let mut storage = MmapStorage::create(dir.path().join("test.rix"), 2).unwrap();

        storage.page_mut(1).unwrap()[..2].copy_from_slice(&[0xCA, 0xFE]);
        storage.grow(6).unwrap();

        assert_eq!(storage.page_count(), 6);
        assert_eq!(&storage.page(1).unwrap()[..2], &[0xCA, 0xFE]);
        assert!(storage.page(5).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn grow_never_shrinks() {
        let dir = tempdir().unwrap();
        let mut storage = MmapStorage::create(dir.path().join("test.rix"), 5).unwrap();

        storage.grow(5).unwrap();
        storage.grow(3).unwrap();

        assert_eq!(storage.page_count(), 5);
    }
}
