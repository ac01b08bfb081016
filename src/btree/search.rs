//! # Rank Search
//!
//! Descent by position. Each page is scanned left to right accumulating
//! `child_count` values; the first entry whose running total reaches the
//! target rank is the one to follow. The accumulated lead travels down the
//! descent, so the rank stays global the whole way: at the leaf, the chosen
//! entry is exactly the rank-th tuple.
//!
//! The descent records one `PathFrame` per visited page: the page number,
//! the chosen slot, and the tuple count to the left of that entry across
//! the whole tree. Insertions replay this stack upward to bump ancestor
//! counts.
//!
//! ## Root Fetch
//!
//! The root is found through the meta page, with a cached fast path: the
//! cached page is locked and accepted if it still looks like a root (live,
//! leftmost, rightmost, at the cached level). Otherwise the cache is
//! dropped and the meta page consulted. An empty tree under write access
//! creates the first root here; the meta lock is upgraded and the root
//! field re-checked after the upgrade, since another writer may have won
//! the same race during the window.
//!
//! Locks are handed over one page at a time: the parent's lock is released
//! before the child's is taken. A concurrent split can therefore move
//! tuples rightward mid-descent; the search does not chase right-links to
//! recover (the rank read simply reflects one of the two orders).

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::storage::{PageReadGuard, PageWriteGuard};

use super::page::{ItemPointer, TreePage, TreePageMut};
use super::page::{INVALID_PAGE, LEAF_LEVEL, META_MAGIC, META_PAGE_NO, PAGE_LEAF, PAGE_ROOT};
use super::{CachedRoot, CountedTree, MAX_TREE_DEPTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

/// One visited page on the way down: the slot chosen there and the global
/// tuple count to the left of that entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PathFrame {
    pub page_no: u32,
    pub slot: u16,
    pub lead_count: u64,
}

pub(crate) type DescentStack = SmallVec<[PathFrame; MAX_TREE_DEPTH]>;

pub(crate) enum LeafLock {
    Read(PageReadGuard),
    Write(PageWriteGuard),
}

impl LeafLock {
    pub fn bytes(&self) -> &[u8] {
        match self {
            LeafLock::Read(guard) => &guard[..],
            LeafLock::Write(guard) => &guard[..],
        }
    }

    pub fn into_write(self) -> Result<PageWriteGuard> {
        match self {
            LeafLock::Write(guard) => Ok(guard),
            LeafLock::Read(_) => eyre::bail!("rank descent did not take the leaf write lock"),
        }
    }
}

/// A completed descent: the path frames root-to-leaf and the locked leaf.
/// The last frame addresses the found entry on the leaf.
pub(crate) struct Descent {
    pub stack: DescentStack,
    pub leaf: LeafLock,
}

impl CountedTree {
    /// Locates and read-locks the root page. `None` means the tree is
    /// empty under read access; under write access an empty tree gets its
    /// first root created right here.
    pub(crate) fn fetch_root(&self, access: Access) -> Result<Option<PageReadGuard>> {
        let cached = *self.cached_root.lock();
        if let Some(cached) = cached {
            let guard = self.pager.acquire_read(cached.root)?;
            let page = TreePage::new(&guard)?;
            if !page.is_meta()
                && !page.is_ignored()
                && page.is_leftmost()
                && page.is_rightmost()
                && page.level() == cached.level
            {
                return Ok(Some(guard));
            }
            drop(guard);
            self.invalidate_cached_root();
        }

        loop {
            let meta_guard = self.pager.acquire_read(META_PAGE_NO)?;
            let meta = TreePage::new(&meta_guard)?.meta()?;
            ensure!(
                meta.magic.get() == META_MAGIC,
                "index \"{}\" is not a counted tree (meta magic {:#x}, expected {:#x})",
                self.name,
                meta.magic.get(),
                META_MAGIC
            );

            let root = meta.root.get();
            if root == INVALID_PAGE {
                if access == Access::Read {
                    return Ok(None);
                }

                // Upgrade to the meta write lock and re-check: another
                // writer may have initialized the root in the window.
                drop(meta_guard);
                let mut meta_write = self.pager.acquire_write(META_PAGE_NO)?;
                let current = TreePage::new(&meta_write)?.meta()?;
                if current.root.get() != INVALID_PAGE {
                    continue;
                }

                let root_no = self.pager.allocate()?;
                let mut root_guard = self.pager.acquire_write(root_no)?;
                {
                    let mut page = TreePageMut::new(&mut root_guard)?;
                    page.init(LEAF_LEVEL, PAGE_LEAF | PAGE_ROOT);
                }
                {
                    let mut meta_page = TreePageMut::new(&mut meta_write)?;
                    meta_page.write_meta(root_no, LEAF_LEVEL);
                }
                self.log_guard(&root_guard)?;
                self.log_guard(&meta_write)?;
                *self.cached_root.lock() = Some(CachedRoot {
                    root: root_no,
                    level: LEAF_LEVEL,
                });

                // Trade the fresh root's write lock for a read lock while
                // still holding the meta lock, so nobody can retire it in
                // between.
                drop(root_guard);
                let guard = self.pager.acquire_read(root_no)?;
                drop(meta_write);
                return Ok(Some(guard));
            }

            let level = meta.level.get();
            *self.cached_root.lock() = Some(CachedRoot { root, level });
            drop(meta_guard);

            // The meta root can briefly point at a retired page; walk the
            // right-sibling chain to the live top page.
            let mut page_no = root;
            loop {
                let guard = self.pager.acquire_read(page_no)?;
                let page = TreePage::new(&guard)?;
                if !page.is_ignored() {
                    ensure!(
                        page.level() == level,
                        "root page {} of index \"{}\" has level {}, expected {}",
                        page_no,
                        self.name,
                        page.level(),
                        level
                    );
                    return Ok(Some(guard));
                }
                ensure!(
                    !page.is_rightmost(),
                    "no live root page found in index \"{}\"",
                    self.name
                );
                page_no = page.next();
            }
        }
    }

    /// Descends to the tuple at `rank` (1-based). Returns `None` when the
    /// tree is empty or `rank` exceeds the tuple count. Under write access
    /// the leaf lock is traded up to exclusive before returning.
    pub(crate) fn search(&self, rank: u64, access: Access) -> Result<Option<Descent>> {
        if rank == 0 {
            return Ok(None);
        }

        let mut guard = match self.fetch_root(access)? {
            Some(guard) => guard,
            None => return Ok(None),
        };
        let mut stack: DescentStack = SmallVec::new();

        loop {
            let page = TreePage::new(&guard)?;
            let lead = stack.last().map_or(0, |frame| frame.lead_count);
            let frame = match search_in_page(&page, guard.page_no(), rank, lead)? {
                Some(frame) => frame,
                None => return Ok(None),
            };

            let is_leaf = page.is_leaf();
            let child = if is_leaf {
                INVALID_PAGE
            } else {
                page.entry_at(frame.slot)?.child_page()
            };
            stack.push(frame);

            if is_leaf {
                break;
            }

            // Hand-over-hand, parent released first.
            drop(guard);
            guard = self.pager.acquire_read(child)?;
        }

        let leaf = match access {
            Access::Read => LeafLock::Read(guard),
            Access::Write => {
                let page_no = guard.page_no();
                drop(guard);
                LeafLock::Write(self.pager.acquire_write(page_no)?)
            }
        };

        Ok(Some(Descent { stack, leaf }))
    }

    /// Total number of live tuples: the sum over the root's entries.
    pub(crate) fn total_count(&self) -> Result<u64> {
        match self.fetch_root(Access::Read)? {
            None => Ok(0),
            Some(guard) => Ok(TreePage::new(&guard)?.total_count()),
        }
    }

    /// Single-rank lookup: the heap pointer of the `rank`-th tuple.
    pub(crate) fn lookup(&self, rank: u32) -> Result<Option<ItemPointer>> {
        let descent = match self.search(rank as u64, Access::Read)? {
            Some(descent) => descent,
            None => return Ok(None),
        };

        let frame = descent
            .stack
            .last()
            .ok_or_else(|| eyre::eyre!("rank descent produced an empty path"))?;
        let page = TreePage::new(descent.leaf.bytes())?;
        Ok(Some(page.entry_at(frame.slot)?.ptr()))
    }
}

/// Prefix-sum scan of one page. `lead` is the global tuple count to the
/// left of this page's first entry; the returned frame keeps rank global
/// across the descent.
fn search_in_page(
    page: &TreePage,
    page_no: u32,
    rank: u64,
    mut lead: u64,
) -> Result<Option<PathFrame>> {
    for slot in 0..page.entry_count() {
        let entry = page.entry_at(slot)?;
        let reach = lead + entry.child_count() as u64;
        if reach >= rank {
            return Ok(Some(PathFrame {
                page_no,
                slot,
                lead_count: lead,
            }));
        }
        lead = reach;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PAGE_SIZE;

    use super::super::page::Entry;

    fn internal_page(counts: &[u32]) -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut page = TreePageMut::new(&mut buf).unwrap();
        page.init(2, PAGE_ROOT);
        for (i, &count) in counts.iter().enumerate() {
            page.insert_entry_at(
                i as u16,
                Entry::new(ItemPointer::new(100 + i as u32, 0), count),
            )
            .unwrap();
        }
        buf
    }

    #[test]
    fn prefix_sums_pick_the_covering_entry() {
        let buf = internal_page(&[3, 2, 4]);
        let page = TreePage::new(&buf).unwrap();

        let frame = search_in_page(&page, 1, 1, 0).unwrap().unwrap();
        assert_eq!((frame.slot, frame.lead_count), (0, 0));

        let frame = search_in_page(&page, 1, 3, 0).unwrap().unwrap();
        assert_eq!((frame.slot, frame.lead_count), (0, 0));

        let frame = search_in_page(&page, 1, 4, 0).unwrap().unwrap();
        assert_eq!((frame.slot, frame.lead_count), (1, 3));

        let frame = search_in_page(&page, 1, 9, 0).unwrap().unwrap();
        assert_eq!((frame.slot, frame.lead_count), (2, 5));
    }

    #[test]
    fn rank_past_the_total_finds_nothing() {
        let buf = internal_page(&[3, 2, 4]);
        let page = TreePage::new(&buf).unwrap();

        assert!(search_in_page(&page, 1, 10, 0).unwrap().is_none());
    }

    #[test]
    fn lead_offsets_shift_the_target() {
        let buf = internal_page(&[3, 2, 4]);
        let page = TreePage::new(&buf).unwrap();

        // With 5 tuples somewhere to the left, global rank 6 lands in the
        // first entry here.
        let frame = search_in_page(&page, 1, 6, 5).unwrap().unwrap();
        assert_eq!((frame.slot, frame.lead_count), (0, 5));
    }
}
