//! # Counted B-Tree
//!
//! A B-tree indexed by position instead of key. Internal entries carry the
//! number of live leaf tuples in their subtree, so the k-th tuple is found
//! by walking prefix sums downward: at each page, scan entries left to
//! right accumulating counts until the running total reaches k, then
//! descend into that entry's child with the accumulated lead carried along.
//!
//! Because ordering is positional, inserting at rank k shifts every
//! successor up by one and deleting shifts them down, with no key
//! comparisons anywhere. The price is that every structural change must
//! keep the ancestor counts exact; the count maintenance protocols
//! (stack-walk on insert, parent back-pointer walk on vacuum, full
//! resummation on split) live here.
//!
//! ## Module Organization
//!
//! - `page`: on-disk page codec (header, entry array, trailer, meta page)
//! - `search`: rank descent and root fetch with cache-then-validate
//! - `insert`: single-tuple insert, page split, count propagation
//! - `build`: sequential bulk build from a record iterator
//! - `vacuum`: predicate bulk delete, page retirement, cleanup pass
//! - `check`: structural verification used by tests and maintenance
//!
//! ## Concurrency
//!
//! Page-level locking only. Descents hold at most one page lock at a time
//! (child acquired after the parent is released); count propagation holds
//! one ancestor lock at a time; a split holds its own halves, the relevant
//! parent, and briefly the old right sibling and moved children. Vacuum
//! runs under the index's maintenance lock and takes super-exclusive leaf
//! locks so no pinned reader survives an entry shift.

mod build;
mod check;
mod insert;
mod page;
mod search;
mod vacuum;

use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

pub use check::TreeShape;
pub use page::{Entry, ItemPointer, TreePage, TreePageMut};
pub use page::{
    ENTRY_SIZE, INVALID_PAGE, LEAF_LEVEL, MAX_PAGE_ENTRIES, META_MAGIC, META_PAGE_NO,
    PAGE_DELETED, PAGE_HALF_DEAD, PAGE_HEADER_SIZE, PAGE_LEAF, PAGE_META, PAGE_ROOT,
    PAGE_TRAILER_SIZE,
};
pub use vacuum::VacuumStats;

pub(crate) use search::PathFrame;

use crate::storage::{PageWriteGuard, Pager};

/// Inline capacity of the descent stack; deeper trees spill to the heap.
pub const MAX_TREE_DEPTH: usize = 8;

pub const DEFAULT_LEAF_FILL_FACTOR: u8 = 90;
pub const DEFAULT_INTERNAL_FILL_FACTOR: u8 = 70;
const MIN_FILL_FACTOR: u8 = 10;

/// Tuning knobs for an index. Fill factors cap how full pages are packed;
/// `max_entries` additionally clamps the per-page entry count, which keeps
/// multi-level trees reachable in tests without millions of tuples.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub leaf_fill_factor: u8,
    pub internal_fill_factor: u8,
    pub max_entries: Option<u16>,
    pub use_wal: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            leaf_fill_factor: DEFAULT_LEAF_FILL_FACTOR,
            internal_fill_factor: DEFAULT_INTERNAL_FILL_FACTOR,
            max_entries: None,
            use_wal: false,
        }
    }
}

impl IndexOptions {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (MIN_FILL_FACTOR..=100).contains(&self.leaf_fill_factor),
            "leaf fill factor {} out of range ({}..=100)",
            self.leaf_fill_factor,
            MIN_FILL_FACTOR
        );
        ensure!(
            (MIN_FILL_FACTOR..=100).contains(&self.internal_fill_factor),
            "internal fill factor {} out of range ({}..=100)",
            self.internal_fill_factor,
            MIN_FILL_FACTOR
        );
        if let Some(max_entries) = self.max_entries {
            ensure!(
                max_entries >= 2,
                "max_entries must be at least 2, got {}",
                max_entries
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CachedRoot {
    pub root: u32,
    pub level: u32,
}

/// The tree proper: pager plus the mutable odds and ends every operation
/// shares. All operations take `&self`; concurrency control is per-page.
pub struct CountedTree {
    pub(crate) pager: Arc<Pager>,
    pub(crate) name: String,
    pub(crate) opts: IndexOptions,
    pub(crate) cached_root: Mutex<Option<CachedRoot>>,
    pub(crate) maintenance: Mutex<()>,
}

impl CountedTree {
    pub(crate) fn new(pager: Arc<Pager>, name: String, opts: IndexOptions) -> Self {
        Self {
            pager,
            name,
            opts,
            cached_root: Mutex::new(None),
            maintenance: Mutex::new(()),
        }
    }

    /// Usable entry capacity of a page at `level`, after fill clamping.
    /// Never below 2, or a split could not distribute entries.
    pub(crate) fn capacity_for(&self, level: u32) -> usize {
        let fill = if level > LEAF_LEVEL {
            self.opts.internal_fill_factor
        } else {
            self.opts.leaf_fill_factor
        };
        let mut cap = MAX_PAGE_ENTRIES * fill as usize / 100;
        if let Some(max_entries) = self.opts.max_entries {
            cap = cap.min(max_entries as usize);
        }
        cap.max(2)
    }

    pub(crate) fn log_guard(&self, guard: &PageWriteGuard) -> Result<()> {
        self.pager.log_page(guard.page_no(), &guard[..])
    }

    pub(crate) fn invalidate_cached_root(&self) {
        *self.cached_root.lock() = None;
    }

    /// Adds `delta` to the ancestor entries recorded in a descent stack,
    /// from the immediate parent up to the root. One exclusive lock at a
    /// time; each page is unlocked before its own parent is touched.
    pub(crate) fn propagate_stack(&self, ancestors: &[PathFrame], delta: i64) -> Result<()> {
        for frame in ancestors.iter().rev() {
            let mut guard = self.pager.acquire_write(frame.page_no)?;
            let mut page = TreePageMut::new(&mut guard)?;
            page.add_child_count(frame.slot, delta).wrap_err_with(|| {
                format!(
                    "while adjusting subtree count on page {} of index \"{}\"",
                    frame.page_no, self.name
                )
            })?;
            self.log_guard(&guard)?;
        }
        Ok(())
    }

    /// Adds `delta` along a parent back-pointer chain, for callers that
    /// have no descent stack (vacuum). Stops at the first page without a
    /// recorded parent.
    pub(crate) fn propagate_parents(&self, start: Option<(u32, u16)>, delta: i64) -> Result<()> {
        let mut next = start;
        while let Some((page_no, slot)) = next {
            let mut guard = self.pager.acquire_write(page_no)?;
            let mut page = TreePageMut::new(&mut guard)?;
            page.add_child_count(slot, delta).wrap_err_with(|| {
                format!(
                    "while adjusting subtree count on page {} of index \"{}\"",
                    page_no, self.name
                )
            })?;
            next = page.as_read().parent();
            self.log_guard(&guard)?;
        }
        Ok(())
    }
}
