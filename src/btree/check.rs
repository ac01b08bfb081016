//! # Structural Verification
//!
//! Offline consistency checks over a quiesced tree. `verify` walks every
//! reachable page and proves the invariants the operational code relies
//! on: each internal entry's count equals the live tuple total of its
//! subtree, parent back-pointers name the exact (page, slot) holding the
//! downlink, levels decrease by one per step down to the leaves, and
//! sibling links are symmetric across the whole file. `shape` reports the
//! tree's silhouette for tests that assert on page layout.
//!
//! Both take plain read locks page by page; they are meant for tests and
//! maintenance windows, not for running against a concurrent writer.

use eyre::{ensure, Result};

use super::page::TreePage;
use super::page::{INVALID_PAGE, LEAF_LEVEL, META_MAGIC, META_PAGE_NO};
use super::CountedTree;

/// The silhouette of a tree: page counts per level from the root down and
/// the entry count of every leaf, left to right.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeShape {
    /// Number of levels; 0 for an empty tree, 1 for a lone leaf root.
    pub height: u32,
    /// Live pages on each level, root level first.
    pub pages_per_level: Vec<u32>,
    /// Entries on each live leaf, in sibling order.
    pub leaf_entry_counts: Vec<u16>,
    /// Live tuples in the whole tree.
    pub total_count: u64,
}

impl CountedTree {
    fn read_meta_raw(&self) -> Result<(u32, u32)> {
        let guard = self.pager.acquire_read(META_PAGE_NO)?;
        let meta = TreePage::new(&guard)?.meta()?;
        ensure!(
            meta.magic.get() == META_MAGIC,
            "index \"{}\" is not a counted tree (meta magic {:#x}, expected {:#x})",
            self.name,
            meta.magic.get(),
            META_MAGIC
        );
        Ok((meta.root.get(), meta.level.get()))
    }

    /// Measures the tree by walking each level's sibling chain from its
    /// leftmost page.
    pub(crate) fn shape(&self) -> Result<TreeShape> {
        let (root, height) = self.read_meta_raw()?;
        let mut shape = TreeShape {
            height,
            ..TreeShape::default()
        };
        if root == INVALID_PAGE {
            return Ok(shape);
        }

        let mut leftmost = root;
        loop {
            let mut pages = 0u32;
            let mut next_leftmost = INVALID_PAGE;
            let mut leaf_level = false;
            let mut page_no = leftmost;
            while page_no != INVALID_PAGE {
                let guard = self.pager.acquire_read(page_no)?;
                let page = TreePage::new(&guard)?;
                if !page.is_ignored() {
                    pages += 1;
                    if page.is_leaf() {
                        leaf_level = true;
                        shape.leaf_entry_counts.push(page.entry_count());
                    } else if next_leftmost == INVALID_PAGE && page.entry_count() > 0 {
                        next_leftmost = page.entry_at(0)?.child_page();
                    }
                }
                page_no = page.next();
            }

            shape.pages_per_level.push(pages);
            if leaf_level || next_leftmost == INVALID_PAGE {
                break;
            }
            leftmost = next_leftmost;
        }

        shape.total_count = self.total_count()?;
        Ok(shape)
    }

    /// Full structural audit. Errors name the first page that breaks an
    /// invariant.
    pub(crate) fn verify(&self) -> Result<()> {
        let (root, height) = self.read_meta_raw()?;
        if root == INVALID_PAGE {
            ensure!(
                height == 0,
                "index \"{}\" has no root but claims height {}",
                self.name,
                height
            );
            return Ok(());
        }

        {
            let guard = self.pager.acquire_read(root)?;
            let page = TreePage::new(&guard)?;
            ensure!(
                page.level() == height,
                "root page {} of index \"{}\" sits at level {}, meta says {}",
                root,
                self.name,
                page.level(),
                height
            );
            ensure!(
                page.is_root(),
                "root page {} of index \"{}\" is not flagged as root",
                root,
                self.name
            );
            ensure!(
                page.is_leftmost() && page.is_rightmost(),
                "root page {} of index \"{}\" has siblings",
                root,
                self.name
            );
        }

        self.verify_subtree(root, height, None)?;
        self.verify_sibling_links()
    }

    /// Recursive audit of one subtree; returns its live tuple total.
    fn verify_subtree(
        &self,
        page_no: u32,
        level: u32,
        expected_parent: Option<(u32, u16)>,
    ) -> Result<u64> {
        let guard = self.pager.acquire_read(page_no)?;
        let page = TreePage::new(&guard)?;
        ensure!(
            !page.is_ignored(),
            "page {} of index \"{}\" is retired but still reachable",
            page_no,
            self.name
        );
        ensure!(
            page.level() == level,
            "page {} of index \"{}\" sits at level {}, expected {}",
            page_no,
            self.name,
            page.level(),
            level
        );
        ensure!(
            page.parent() == expected_parent,
            "page {} of index \"{}\" records parent {:?}, expected {:?}",
            page_no,
            self.name,
            page.parent(),
            expected_parent
        );

        if page.is_leaf() {
            ensure!(
                level == LEAF_LEVEL,
                "leaf page {} of index \"{}\" sits at level {}",
                page_no,
                self.name,
                level
            );
            for slot in 0..page.entry_count() {
                let entry = page.entry_at(slot)?;
                ensure!(
                    entry.child_count() == 1,
                    "leaf entry {} on page {} of index \"{}\" counts {} tuples",
                    slot,
                    page_no,
                    self.name,
                    entry.child_count()
                );
            }
            return Ok(page.entry_count() as u64);
        }

        let mut entries = Vec::with_capacity(page.entry_count() as usize);
        for slot in 0..page.entry_count() {
            entries.push(page.entry_at(slot)?);
        }
        drop(guard);

        let mut total = 0u64;
        for (slot, entry) in entries.iter().enumerate() {
            let child_total =
                self.verify_subtree(entry.child_page(), level - 1, Some((page_no, slot as u16)))?;
            ensure!(
                child_total == entry.child_count() as u64,
                "page {} slot {} of index \"{}\" counts {} tuples, subtree holds {}",
                page_no,
                slot,
                self.name,
                entry.child_count(),
                child_total
            );
            total += child_total;
        }
        Ok(total)
    }

    /// Every prev/next pair must agree, retired pages included (retirement
    /// keeps a page linked so in-flight right-walks terminate).
    fn verify_sibling_links(&self) -> Result<()> {
        for page_no in 1..self.pager.page_count() {
            let (prev, next) = {
                let guard = self.pager.acquire_read(page_no)?;
                let page = TreePage::new(&guard)?;
                if page.is_new() {
                    continue;
                }
                (page.prev(), page.next())
            };

            if next != INVALID_PAGE {
                let guard = self.pager.acquire_read(next)?;
                let linked = TreePage::new(&guard)?.prev();
                ensure!(
                    linked == page_no,
                    "page {} of index \"{}\" links right to {}, which links back to {}",
                    page_no,
                    self.name,
                    next,
                    linked
                );
            }
            if prev != INVALID_PAGE {
                let guard = self.pager.acquire_read(prev)?;
                let linked = TreePage::new(&guard)?.next();
                ensure!(
                    linked == page_no,
                    "page {} of index \"{}\" links left to {}, which links forward to {}",
                    page_no,
                    self.name,
                    prev,
                    linked
                );
            }
        }
        Ok(())
    }
}
