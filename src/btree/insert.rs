//! # Insertion Engine
//!
//! Single-tuple insert at a rank. The write-mode descent finds the leaf
//! entry currently holding the target rank; the new tuple lands at that
//! slot and every successor shifts one to the right. Ancestor counts are
//! bumped through the descent stack before the physical insert, so a
//! failure between the two leaves counts too high rather than too low,
//! which a later split's resummation corrects.
//!
//! A rank past the current total appends: the total is recomputed from the
//! root, the descent re-run at the last tuple, and the leaf slot bumped
//! one past it. An empty tree short-circuits to the freshly created root.
//!
//! ## Page Split
//!
//! A full page splits around its midpoint. The left half is assembled in
//! scratch memory and only copied over the original page in the commit
//! step, so a failure before that point leaves the original page untouched
//! and the new right page unreachable. Left and right totals are resummed
//! from the distributed entries, not derived from the old parent count, so
//! any drift stops at the split. The right sibling's back link is patched
//! under its own lock after a consistency check; a mismatch there means
//! the sibling chain is corrupt, and the operation aborts loudly (zeroing
//! the unreachable right page first).
//!
//! Splitting the root allocates the next root one level up and points the
//! meta page at it before the downlinks go in; splitting anything else
//! updates the parent's entry to the left total and inserts the right
//! downlink just after it, recursing if the parent is full too.
//!
//! ## Deferred Back-Pointer Repairs
//!
//! Moving an internal entry invalidates the recorded (parent, slot) of its
//! child. Those repairs are queued and applied only after every split lock
//! is released: a moved child can be a page this very call chain holds
//! exclusively (the page whose split triggered the parent's), so locking
//! it inline would self-deadlock.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use eyre::{bail, ensure, eyre, Result};
use smallvec::SmallVec;

use crate::storage::{PageWriteGuard, PAGE_SIZE};

use super::page::{Entry, ItemPointer, TreePage, TreePageMut};
use super::page::{INVALID_PAGE, META_PAGE_NO, PAGE_ROOT};
use super::search::{Access, DescentStack, PathFrame};
use super::{CachedRoot, CountedTree};

/// Queued child back-pointer repairs: (child page, parent page, parent slot).
type ParentUpdates = Vec<(u32, u32, u16)>;

impl CountedTree {
    /// Inserts a tuple pointing at `heap_ptr` so that it becomes the
    /// `rank`-th tuple of the index. Ranks are 1-based; a rank past the
    /// end appends.
    pub(crate) fn insert(&self, rank: u32, heap_ptr: ItemPointer) -> Result<()> {
        ensure!(rank >= 1, "insert position must be at least 1, got {}", rank);

        let (mut stack, leaf) = match self.search(rank as u64, Access::Write)? {
            Some(descent) => (descent.stack, descent.leaf.into_write()?),
            None => self.append_position()?,
        };

        let leaf_idx = stack.len() - 1;
        self.propagate_stack(&stack[..leaf_idx], 1)?;

        let entry = Entry::new(heap_ptr, 1);
        let mut pending: ParentUpdates = Vec::new();
        let guard = self.insert_on_page(&mut stack, leaf_idx, entry, leaf, &mut pending)?;
        drop(guard);

        for (child, parent_page, parent_slot) in pending {
            self.set_child_parent(child, parent_page, parent_slot)?;
        }

        Ok(())
    }

    /// Descent target for an out-of-range rank: one past the last tuple,
    /// or slot 0 of a brand-new root when the tree is empty.
    fn append_position(&self) -> Result<(DescentStack, PageWriteGuard)> {
        let total = self.total_count()?;

        if total == 0 {
            let guard = self
                .fetch_root(Access::Write)?
                .ok_or_else(|| eyre!("failed to initialize root of index \"{}\"", self.name))?;
            let page_no = guard.page_no();
            drop(guard);
            let write = self.pager.acquire_write(page_no)?;

            let mut stack: DescentStack = SmallVec::new();
            stack.push(PathFrame {
                page_no,
                slot: 0,
                lead_count: 0,
            });
            return Ok((stack, write));
        }

        let descent = self
            .search(total, Access::Write)?
            .ok_or_else(|| eyre!("index \"{}\" lost its last tuple mid-descent", self.name))?;
        let mut stack = descent.stack;
        if let Some(last) = stack.last_mut() {
            last.slot += 1;
        }
        Ok((stack, descent.leaf.into_write()?))
    }

    /// Places `entry` at `stack[idx]`'s slot on the locked page, splitting
    /// when the page is at capacity. Returns the (possibly different)
    /// locked page the entry ended up on, with `stack[idx]` updated to its
    /// final location.
    fn insert_on_page(
        &self,
        stack: &mut DescentStack,
        idx: usize,
        entry: Entry,
        mut guard: PageWriteGuard,
        pending: &mut ParentUpdates,
    ) -> Result<PageWriteGuard> {
        let (entry_count, is_leaf, capacity) = {
            let page = TreePage::new(&guard[..])?;
            (
                page.entry_count(),
                page.is_leaf(),
                self.capacity_for(page.level()),
            )
        };

        if (entry_count as usize) >= capacity {
            return self.split_page(stack, idx, entry, guard, pending);
        }

        let slot = stack[idx].slot;
        {
            let mut page = TreePageMut::new(&mut guard[..])?;
            page.insert_entry_at(slot, entry)?;
        }

        if !is_leaf {
            // Entries past the insertion point moved one slot right; their
            // children's recorded slots are stale until the repairs run.
            let page_no = guard.page_no();
            let page = TreePage::new(&guard[..])?;
            for moved in (slot + 1)..page.entry_count() {
                pending.push((page.entry_at(moved)?.child_page(), page_no, moved));
            }
        }

        self.log_guard(&guard)?;
        Ok(guard)
    }

    /// Splits the page at `stack[idx]` while inserting `entry`, updating
    /// the parent level (recursively if needed). Returns the locked half
    /// holding the new entry.
    fn split_page(
        &self,
        stack: &mut DescentStack,
        idx: usize,
        new_entry: Entry,
        mut orig_guard: PageWriteGuard,
        pending: &mut ParentUpdates,
    ) -> Result<PageWriteGuard> {
        let orig_no = orig_guard.page_no();
        let right_no = self.pager.allocate()?;
        let mut right_guard = self.pager.acquire_write(right_no)?;

        let arena = Bump::new();
        let mut old_entries = BumpVec::new_in(&arena);
        let (level, flags, old_prev, old_next, old_parent, is_leaf) = {
            let page = TreePage::new(&orig_guard[..])?;
            for slot in 0..page.entry_count() {
                old_entries.push(page.entry_at(slot)?);
            }
            (
                page.level(),
                page.flags(),
                page.prev(),
                page.next(),
                page.parent(),
                page.is_leaf(),
            )
        };

        // Distribute entries around the midpoint, weaving the new entry in
        // at its slot. Totals are resummed from what actually lands on
        // each side.
        let maxoff = old_entries.len();
        let first_right = maxoff / 2;
        let new_slot = stack[idx].slot as usize;
        let new_on_left = new_slot < first_right;

        let mut left_entries = BumpVec::new_in(&arena);
        let mut right_entries = BumpVec::new_in(&arena);
        let mut left_count: u64 = 0;
        let mut right_count: u64 = 0;
        let mut result_on_left = false;
        let mut result_slot: u16 = 0;

        for (i, entry) in old_entries.iter().enumerate() {
            if i == new_slot {
                if new_on_left {
                    result_on_left = true;
                    result_slot = left_entries.len() as u16;
                    left_count += new_entry.child_count() as u64;
                    left_entries.push(new_entry);
                } else {
                    result_on_left = false;
                    result_slot = right_entries.len() as u16;
                    right_count += new_entry.child_count() as u64;
                    right_entries.push(new_entry);
                }
            }

            if i < first_right {
                if !is_leaf {
                    pending.push((entry.child_page(), orig_no, left_entries.len() as u16));
                }
                left_count += entry.child_count() as u64;
                left_entries.push(*entry);
            } else {
                if !is_leaf {
                    pending.push((entry.child_page(), right_no, right_entries.len() as u16));
                }
                right_count += entry.child_count() as u64;
                right_entries.push(*entry);
            }
        }
        if new_slot >= maxoff {
            // Appending past the last entry always lands on the right
            // half; the left half alone could not have overflowed.
            result_on_left = false;
            result_slot = right_entries.len() as u16;
            right_count += new_entry.child_count() as u64;
            right_entries.push(new_entry);
        }

        // The right page is unreachable until the commit step, so it can
        // be written in place. The left half goes to scratch and replaces
        // the original only at the end.
        {
            let mut page = TreePageMut::new(&mut right_guard[..])?;
            page.init(level, flags & !PAGE_ROOT);
            page.set_prev(orig_no);
            page.set_next(old_next);
            for (slot, entry) in right_entries.iter().enumerate() {
                page.insert_entry_at(slot as u16, *entry)?;
            }
        }

        let scratch = arena.alloc_slice_fill_copy(PAGE_SIZE, 0u8);
        {
            let mut page = TreePageMut::new(scratch)?;
            page.init(level, flags & !PAGE_ROOT);
            page.set_prev(old_prev);
            page.set_next(right_no);
            for (slot, entry) in left_entries.iter().enumerate() {
                page.insert_entry_at(slot as u16, *entry)?;
            }
        }

        // Parent level. A root split raises the tree: new root allocated,
        // meta repointed, then the left downlink goes in. Otherwise the
        // existing parent entry is rewritten to the exact left total.
        let mut our_idx = idx;
        let parent_idx;
        let mut parent_guard;
        let left_parent;

        if idx == 0 {
            let mut meta_guard = self.pager.acquire_write(META_PAGE_NO)?;
            let new_root_no = self.pager.allocate()?;
            parent_guard = self.pager.acquire_write(new_root_no)?;
            {
                let mut page = TreePageMut::new(&mut parent_guard[..])?;
                page.init(level + 1, PAGE_ROOT);
            }
            {
                let mut meta_page = TreePageMut::new(&mut meta_guard[..])?;
                meta_page.write_meta(new_root_no, level + 1);
            }
            self.log_guard(&meta_guard)?;
            *self.cached_root.lock() = Some(CachedRoot {
                root: new_root_no,
                level: level + 1,
            });
            drop(meta_guard);

            stack.insert(
                0,
                PathFrame {
                    page_no: new_root_no,
                    slot: 0,
                    lead_count: 0,
                },
            );
            our_idx += 1;
            parent_idx = 0;

            let left_down = Entry::new(ItemPointer::new(orig_no, 0), left_count as u32);
            parent_guard = self.insert_on_page(stack, parent_idx, left_down, parent_guard, pending)?;
            left_parent = Some((new_root_no, 0));
        } else {
            parent_idx = idx - 1;
            parent_guard = self.pager.acquire_write(stack[parent_idx].page_no)?;
            {
                let mut page = TreePageMut::new(&mut parent_guard[..])?;
                page.set_child_count(stack[parent_idx].slot, left_count as u32)?;
            }
            // The left half keeps the original page's downlink; a parent
            // split below may still move it, which the queued repairs fix.
            left_parent = old_parent;
        }

        // Right downlink goes just after the left one. The parent may
        // split in turn; a root split in there prepends a stack frame, so
        // reanchor our indices by the growth.
        let right_down = Entry::new(ItemPointer::new(right_no, 0), right_count as u32);
        stack[parent_idx].slot += 1;
        let depth_before = stack.len();
        parent_guard = self.insert_on_page(stack, parent_idx, right_down, parent_guard, pending)?;
        let shift = stack.len() - depth_before;
        our_idx += shift;
        let right_parent = stack[parent_idx + shift];
        {
            let mut page = TreePageMut::new(&mut right_guard[..])?;
            page.set_parent(right_parent.page_no, right_parent.slot);
        }
        self.log_guard(&right_guard)?;
        drop(parent_guard);

        {
            let mut page = TreePageMut::new(scratch)?;
            match left_parent {
                Some((page_no, slot)) => page.set_parent(page_no, slot),
                None => page.clear_parent(),
            }
        }

        // Grab the old right sibling (if any) to fix its back link. This
        // is deadlock-free: no writer moves left while holding a page
        // lock, and readers release a page before fetching its neighbors.
        let mut sibling_guard = None;
        if old_next != INVALID_PAGE {
            let guard = self.pager.acquire_write(old_next)?;
            let sibling_prev = TreePage::new(&guard[..])?.prev();
            if sibling_prev != orig_no {
                // Scrub the unlinked right page before aborting so no
                // half-built page full of entries survives.
                right_guard[..].fill(0);
                bail!(
                    "right sibling's left-link doesn't match: \
                     block {} links to {} instead of expected {} in index \"{}\"",
                    old_next,
                    sibling_prev,
                    orig_no,
                    self.name
                );
            }
            sibling_guard = Some(guard);
        }

        // Commit step: everything is prepared and locked, nothing below
        // fails. The left half replaces the original page, then the old
        // sibling's back link swings to the new right page.
        {
            let mut page = TreePageMut::new(&mut orig_guard[..])?;
            page.restore_image(scratch)?;
        }
        if let Some(guard) = sibling_guard.as_mut() {
            let mut page = TreePageMut::new(&mut guard[..])?;
            page.set_prev(right_no);
        }

        self.log_guard(&orig_guard)?;
        self.log_guard(&right_guard)?;
        if let Some(guard) = sibling_guard.as_ref() {
            self.log_guard(guard)?;
        }
        drop(sibling_guard);

        if result_on_left {
            stack[our_idx].page_no = orig_no;
            stack[our_idx].slot = result_slot;
            drop(right_guard);
            Ok(orig_guard)
        } else {
            stack[our_idx].page_no = right_no;
            stack[our_idx].slot = result_slot;
            drop(orig_guard);
            Ok(right_guard)
        }
    }

    pub(crate) fn set_child_parent(
        &self,
        child: u32,
        parent_page: u32,
        parent_slot: u16,
    ) -> Result<()> {
        let mut guard = self.pager.acquire_write(child)?;
        {
            let mut page = TreePageMut::new(&mut guard[..])?;
            page.set_parent(parent_page, parent_slot);
        }
        self.log_guard(&guard)
    }
}
