//! # Free Page Tracking
//!
//! Pages retired by vacuum are recorded here rather than being reclaimed by
//! truncating the file. `Pager::allocate` pops from this list before growing
//! the file, so deleted subtrees get recycled into later inserts.
//!
//! The list is not persisted. Vacuum's cleanup pass rebuilds it from the
//! page flags on disk (a retired page keeps its DELETED flag, a never-used
//! page is all zeroes), so a reopened index recovers its free space the
//! first time cleanup runs.
//!
//! ## Thread Safety
//!
//! `Freelist` is not thread-safe on its own; the `Pager` holds it behind a
//! mutex.

#[derive(Debug, Default)]
pub struct Freelist {
    free: Vec<u32>,
}

impl Freelist {
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    pub fn free_count(&self) -> u32 {
        self.free.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn record_free(&mut self, page_no: u32) {
        debug_assert_ne!(page_no, 0, "meta page can never be freed");
        self.free.push(page_no);
    }

    pub fn pop(&mut self) -> Option<u32> {
        self.free.pop()
    }

    /// Drops duplicates and orders the list so low page numbers are reused
    /// first, keeping the file compact under churn.
    pub fn vacuum(&mut self) {
        self.free.sort_unstable_by(|a, b| b.cmp(a));
        self.free.dedup();
    }
}
