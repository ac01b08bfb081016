//! # Index Handle
//!
//! `RankIndex` is the public face of the crate: one positional index in
//! one file. It owns the storage stack (mmap, pager, optional WAL) and a
//! `CountedTree` over it, and exposes the operational surface: create or
//! open, bulk build, single insert, rank lookup, scans, bulk delete with
//! cleanup, flush, and the offline checks.
//!
//! Opening with `use_wal` replays any intact tail of the sibling `.wal`
//! file into the index before the first page is read, then keeps logging
//! page images until the next flush truncates the log. Without WAL the
//! index is only as durable as the last `flush`.
//!
//! Ranks are 1-based throughout. `ItemPointer` is the caller's record
//! address; the index never dereferences it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};

use crate::btree::{CountedTree, IndexOptions, ItemPointer, TreeShape, VacuumStats};
use crate::storage::{MmapStorage, Pager, Wal};

fn wal_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".wal");
    PathBuf::from(name)
}

fn index_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// A positional index over external records, stored in a single file.
pub struct RankIndex {
    tree: CountedTree,
    path: PathBuf,
}

impl RankIndex {
    /// Creates a new, empty index file (truncating any previous one) and
    /// formats its meta page.
    pub fn create<P: AsRef<Path>>(path: P, opts: IndexOptions) -> Result<Self> {
        opts.validate()?;
        let path = path.as_ref().to_path_buf();

        let storage = MmapStorage::create(&path, 1)
            .wrap_err_with(|| format!("failed to create index at '{}'", path.display()))?;
        let wal = if opts.use_wal {
            Some(Wal::open(&wal_path(&path))?)
        } else {
            None
        };

        let pager = Arc::new(Pager::new(storage, wal));
        let tree = CountedTree::new(pager, index_name(&path), opts);
        tree.build_empty()?;

        Ok(Self { tree, path })
    }

    /// Opens an existing index file. With `use_wal`, any intact logged
    /// page images are replayed into the file first.
    pub fn open<P: AsRef<Path>>(path: P, opts: IndexOptions) -> Result<Self> {
        opts.validate()?;
        let path = path.as_ref().to_path_buf();

        let mut storage = MmapStorage::open(&path)
            .wrap_err_with(|| format!("failed to open index at '{}'", path.display()))?;
        let wal = if opts.use_wal {
            let wal = Wal::open(&wal_path(&path))?;
            wal.replay(&mut storage)
                .wrap_err_with(|| format!("failed to recover index at '{}'", path.display()))?;
            Some(wal)
        } else {
            None
        };

        let pager = Arc::new(Pager::new(storage, wal));
        let tree = CountedTree::new(pager, index_name(&path), opts);

        // Surface a wrong or corrupt file now, not on the first lookup.
        tree.total_count()?;

        Ok(Self { tree, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.tree.name
    }

    /// Bulk-loads records in rank order into a freshly created index.
    /// Returns the number of tuples loaded.
    pub fn build<I>(&self, records: I) -> Result<u64>
    where
        I: IntoIterator<Item = ItemPointer>,
    {
        self.tree.build(records)
    }

    /// Formats the index as empty. Only valid on a fresh file; `create`
    /// already does this.
    pub fn build_empty(&self) -> Result<()> {
        self.tree.build_empty()
    }

    /// Inserts a record so it becomes the `rank`-th tuple; successors
    /// shift one position up. A rank past the end appends.
    pub fn insert(&self, rank: u32, heap_ptr: ItemPointer) -> Result<()> {
        self.tree.insert(rank, heap_ptr)
    }

    /// The record currently at `rank`, or `None` past the end.
    pub fn lookup(&self, rank: u32) -> Result<Option<ItemPointer>> {
        self.tree.lookup(rank)
    }

    /// Number of live tuples in the index.
    pub fn total_count(&self) -> Result<u64> {
        self.tree.total_count()
    }

    /// Removes every tuple the predicate matches; emptied pages are
    /// retired. Successors of each removed tuple shift one position down.
    pub fn bulk_delete<F>(&self, mut predicate: F) -> Result<VacuumStats>
    where
        F: FnMut(ItemPointer) -> bool,
    {
        self.tree.bulk_delete(&mut predicate)
    }

    /// Post-delete maintenance pass: counts surviving tuples and makes
    /// retired pages reusable.
    pub fn cleanup(&self) -> Result<VacuumStats> {
        self.tree.cleanup()
    }

    /// Writes all buffered changes to the file and syncs it. With WAL,
    /// this is also the checkpoint that truncates the log.
    pub fn flush(&self) -> Result<()> {
        self.tree.pager.flush()
    }

    pub fn begin_scan(&self) -> RankScan<'_> {
        RankScan {
            index: self,
            target: None,
            done: false,
        }
    }

    /// Full structural audit; see the check module. For tests and
    /// maintenance windows.
    pub fn verify(&self) -> Result<()> {
        self.tree.verify()
    }

    /// The tree's silhouette: height, pages per level, leaf entry counts.
    pub fn shape(&self) -> Result<TreeShape> {
        self.tree.shape()
    }
}

/// A positional scan. Each `rescan` targets one rank; `next` yields that
/// tuple once and then reports exhaustion until the next `rescan`.
pub struct RankScan<'a> {
    index: &'a RankIndex,
    target: Option<u32>,
    done: bool,
}

impl<'a> RankScan<'a> {
    /// Re-aims the scan at `rank` and re-arms it.
    pub fn rescan(&mut self, rank: u32) {
        self.target = Some(rank);
        self.done = false;
    }

    /// The targeted tuple on the first call after a `rescan`, `None`
    /// afterwards (or when the rank is out of range or never set).
    pub fn next(&mut self) -> Result<Option<ItemPointer>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        match self.target {
            Some(rank) => self.index.lookup(rank),
            None => Ok(None),
        }
    }
}
