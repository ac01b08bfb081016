//! # Vacuum
//!
//! Bulk deletion sweeps the file in physical page order rather than
//! walking the tree: every live leaf is visited exactly once no matter how
//! siblings interleave on disk. Matching entries are removed after a -1 is
//! propagated up the parent back-pointer chain, so ancestor counts never
//! understate a subtree while the delete is in flight.
//!
//! Leaf pages are taken with the cleanup lock (exclusive plus a wait for
//! pins to drain): entries shift left on removal, and a reader still
//! holding the buffer would see its slot move under it.
//!
//! An emptied page is retired, not unlinked: its parent entry (already
//! counting zero) is deleted, the DELETED flag is set, and the cascade
//! repeats upward if the parent empties too. Retiring the root clears the
//! meta instead, shrinking the tree to empty. Retired pages keep their
//! sibling links so concurrent right-walks still terminate; the cleanup
//! pass later splices them out of their chains and feeds them to the
//! freelist. A page must never reach the freelist still linked: once
//! recycled it is reformatted with fresh links, and any neighbour still
//! pointing at it would hold a dangling edge into an unrelated page.

use eyre::Result;

use crate::storage::PageWriteGuard;

use super::page::{ItemPointer, TreePage, TreePageMut};
use super::page::{INVALID_PAGE, META_PAGE_NO, PAGE_DELETED};
use super::CountedTree;

/// What a vacuum pass did, in the shape maintenance jobs report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VacuumStats {
    /// Pages in the index file, including the meta page.
    pub num_pages: u32,
    /// Pages retired by this pass.
    pub pages_deleted: u32,
    /// Reusable pages found by the cleanup pass.
    pub pages_free: u32,
    /// Leaf tuples removed by this pass.
    pub tuples_removed: u64,
    /// Leaf tuples remaining, counted by the cleanup pass.
    pub num_index_tuples: u64,
}

impl CountedTree {
    /// Removes every leaf tuple the predicate matches. Runs under the
    /// index maintenance lock; one pass over the file in block order.
    pub(crate) fn bulk_delete(
        &self,
        predicate: &mut dyn FnMut(ItemPointer) -> bool,
    ) -> Result<VacuumStats> {
        let _maintenance = self.maintenance.lock();

        let mut stats = VacuumStats::default();
        let mut page_no = 1;
        // Re-read the page count each round: concurrent inserts may extend
        // the file mid-sweep and those pages need visiting too.
        while page_no < self.pager.page_count() {
            self.vacuum_leaf(page_no, predicate, &mut stats)?;
            page_no += 1;
        }

        stats.num_pages = self.pager.page_count();
        Ok(stats)
    }

    /// Second vacuum pass: tallies surviving tuples and feeds every
    /// reusable page (never formatted, or retired) to the freelist. Never
    /// moves or removes tree pages.
    pub(crate) fn cleanup(&self) -> Result<VacuumStats> {
        let _maintenance = self.maintenance.lock();

        let mut stats = VacuumStats::default();
        let num_pages = self.pager.page_count();
        for page_no in 1..num_pages {
            let (is_free, is_retired, leaf_entries) = {
                let guard = self.pager.acquire_read(page_no)?;
                let page = TreePage::new(&guard[..])?;
                (
                    page.is_new() || page.is_deleted(),
                    page.is_deleted(),
                    if page.is_leaf() && !page.is_ignored() {
                        page.entry_count() as u64
                    } else {
                        0
                    },
                )
            };

            if is_free {
                if is_retired {
                    self.unlink_retired(page_no)?;
                }
                self.pager.record_free(page_no);
                stats.pages_free += 1;
            } else {
                stats.num_index_tuples += leaf_entries;
            }
        }

        // Repeated cleanups re-report the same pages; the freelist drops
        // the duplicates.
        self.pager.vacuum_freelist();
        stats.num_pages = num_pages;
        Ok(stats)
    }

    /// Splices a retired page out of its level's sibling chain and clears
    /// its own links, so the chain stays doubly linked once the page is
    /// recycled into an unrelated spot. One lock at a time; the neighbour
    /// patches are conditional so repeated cleanups and runs of adjacent
    /// retired pages settle correctly in any order.
    fn unlink_retired(&self, page_no: u32) -> Result<()> {
        let (prev, next) = {
            let guard = self.pager.acquire_read(page_no)?;
            let page = TreePage::new(&guard[..])?;
            (page.prev(), page.next())
        };
        if prev == INVALID_PAGE && next == INVALID_PAGE {
            return Ok(());
        }

        if prev != INVALID_PAGE {
            let mut guard = self.pager.acquire_write(prev)?;
            {
                let mut page = TreePageMut::new(&mut guard[..])?;
                if page.as_read().next() == page_no {
                    page.set_next(next);
                }
            }
            self.log_guard(&guard)?;
        }
        if next != INVALID_PAGE {
            let mut guard = self.pager.acquire_write(next)?;
            {
                let mut page = TreePageMut::new(&mut guard[..])?;
                if page.as_read().prev() == page_no {
                    page.set_prev(prev);
                }
            }
            self.log_guard(&guard)?;
        }

        let mut guard = self.pager.acquire_write(page_no)?;
        {
            let mut page = TreePageMut::new(&mut guard[..])?;
            page.set_prev(INVALID_PAGE);
            page.set_next(INVALID_PAGE);
        }
        self.log_guard(&guard)?;
        Ok(())
    }

    fn vacuum_leaf(
        &self,
        page_no: u32,
        predicate: &mut dyn FnMut(ItemPointer) -> bool,
        stats: &mut VacuumStats,
    ) -> Result<()> {
        {
            let guard = self.pager.acquire_read(page_no)?;
            let page = TreePage::new(&guard[..])?;
            if !page.is_leaf() || page.is_ignored() {
                return Ok(());
            }
        }

        // Trade up to the cleanup lock, then recheck: the page can change
        // shape in the unlocked window.
        let mut guard = self.pager.acquire_cleanup(page_no)?;
        {
            let page = TreePage::new(&guard[..])?;
            if !page.is_leaf() || page.is_ignored() {
                return Ok(());
            }
        }

        let mut pending: Vec<(u32, u32, u16)> = Vec::new();
        let mut slot: u16 = 0;
        loop {
            let page = TreePage::new(&guard[..])?;
            if slot >= page.entry_count() {
                break;
            }
            let ptr = page.entry_at(slot)?.ptr();
            if predicate(ptr) {
                self.delete_leaf_entry(&mut guard, slot, stats, &mut pending)?;
                // Successors slid into this slot; re-examine it.
            } else {
                slot += 1;
            }
        }

        drop(guard);
        for (child, parent_page, parent_slot) in pending {
            self.set_child_parent(child, parent_page, parent_slot)?;
        }
        Ok(())
    }

    /// Removes one leaf entry: ancestors first (the back-pointer walk, one
    /// lock at a time), then the physical shift. An emptied page is
    /// retired on the spot.
    fn delete_leaf_entry(
        &self,
        guard: &mut PageWriteGuard,
        slot: u16,
        stats: &mut VacuumStats,
        pending: &mut Vec<(u32, u32, u16)>,
    ) -> Result<()> {
        let parent = TreePage::new(&guard[..])?.parent();
        self.propagate_parents(parent, -1)?;

        {
            let mut page = TreePageMut::new(&mut guard[..])?;
            page.delete_entry_at(slot)?;
        }
        self.log_guard(guard)?;
        stats.tuples_removed += 1;

        if TreePage::new(&guard[..])?.entry_count() == 0 {
            self.retire_page(guard, stats, pending)?;
        }
        Ok(())
    }

    /// Takes an emptied page out of the tree. Ancestor counts already
    /// reflect the removals that emptied it, so only the structural edits
    /// remain: drop the parent's entry (cascading if the parent empties),
    /// or clear the meta root when the page was the root, then flag the
    /// page DELETED.
    fn retire_page(
        &self,
        guard: &mut PageWriteGuard,
        stats: &mut VacuumStats,
        pending: &mut Vec<(u32, u32, u16)>,
    ) -> Result<()> {
        match TreePage::new(&guard[..])?.parent() {
            None => {
                let mut meta_guard = self.pager.acquire_write(META_PAGE_NO)?;
                {
                    let mut meta_page = TreePageMut::new(&mut meta_guard[..])?;
                    meta_page.write_meta(INVALID_PAGE, 0);
                }
                self.log_guard(&meta_guard)?;
                self.invalidate_cached_root();
            }
            Some((parent_page, parent_slot)) => {
                let mut parent_guard = self.pager.acquire_write(parent_page)?;
                self.delete_inner_entry(&mut parent_guard, parent_slot, stats, pending)?;
            }
        }

        {
            let mut page = TreePageMut::new(&mut guard[..])?;
            page.add_flags(PAGE_DELETED);
        }
        self.log_guard(guard)?;
        stats.pages_deleted += 1;
        Ok(())
    }

    /// Removes a downlink whose subtree is gone. The entry counts zero by
    /// now, so no ancestor adjustment is due; surviving entries shift left
    /// and their children's recorded slots go onto the repair queue.
    fn delete_inner_entry(
        &self,
        guard: &mut PageWriteGuard,
        slot: u16,
        stats: &mut VacuumStats,
        pending: &mut Vec<(u32, u32, u16)>,
    ) -> Result<()> {
        let page_no = guard.page_no();
        {
            let mut page = TreePageMut::new(&mut guard[..])?;
            page.delete_entry_at(slot)?;
        }
        {
            let page = TreePage::new(&guard[..])?;
            for moved in slot..page.entry_count() {
                pending.push((page.entry_at(moved)?.child_page(), page_no, moved));
            }
        }
        self.log_guard(guard)?;

        if TreePage::new(&guard[..])?.entry_count() == 0 {
            self.retire_page(guard, stats, pending)?;
        }
        Ok(())
    }
}
