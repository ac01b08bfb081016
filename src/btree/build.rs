//! # Bulk Build
//!
//! Sequential construction from a record iterator. One in-memory page per
//! level is kept open (the leaf's parent chain growing lazily upward);
//! records append to the leaf until it reaches the fill limit, at which
//! point the page is closed: a downlink carrying its exact total is pushed
//! into the parent builder (possibly overflowing it the same way), sibling
//! links are wired, the image is written straight to the file, and a fresh
//! page opens at that level.
//!
//! Pages are written in close order, which is not block order (a parent
//! closes long after children with higher numbers were written); the write
//! path grows the file on demand so holes read back as zeroed pages until
//! overwritten.
//!
//! The finish pass closes the last open page of every level from the leaf
//! up, linking each into its parent; the level left without a parent is
//! the root and gets flagged as such. The meta page is written last, so a
//! crash mid-build leaves an index that still reads as empty.

use eyre::{bail, ensure, Result};

use crate::storage::PAGE_SIZE;

use super::page::{Entry, ItemPointer, TreePage, TreePageMut};
use super::page::{INVALID_PAGE, LEAF_LEVEL, META_PAGE_NO, PAGE_LEAF, PAGE_ROOT};
use super::CountedTree;

/// The open page of one level: its image under construction, the page
/// number reserved for it, and the running tuple total that becomes its
/// downlink count when it closes.
struct LevelBuilder {
    page: Vec<u8>,
    page_no: u32,
    level: u32,
    total_count: u64,
    parent: Option<Box<LevelBuilder>>,
}

impl LevelBuilder {
    fn new(level: u32, page_no: u32) -> Result<Self> {
        let mut builder = Self {
            page: vec![0u8; PAGE_SIZE],
            page_no,
            level,
            total_count: 0,
            parent: None,
        };
        builder.format()?;
        Ok(builder)
    }

    /// Reopens this level on a fresh page after the previous one closed.
    fn reset(&mut self, page_no: u32) -> Result<()> {
        self.page_no = page_no;
        self.total_count = 0;
        self.format()
    }

    fn format(&mut self) -> Result<()> {
        let level = self.level;
        let mut page = TreePageMut::new(&mut self.page)?;
        page.init(level, if level == LEAF_LEVEL { PAGE_LEAF } else { 0 });
        Ok(())
    }

    fn entry_count(&self) -> Result<u16> {
        Ok(TreePage::new(&self.page)?.entry_count())
    }
}

/// Streaming bulk loader. Feed records in rank order, then `finish()`.
pub(crate) struct TreeBuilder<'a> {
    tree: &'a CountedTree,
    leaf: Option<Box<LevelBuilder>>,
    /// Highest page number handed out so far; the meta page is 0.
    next_page: u32,
    tuples: u64,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(tree: &'a CountedTree) -> Result<Self> {
        ensure!(
            tree.pager.page_count() <= 1,
            "index \"{}\" already contains data",
            tree.name
        );
        Ok(Self {
            tree,
            leaf: None,
            next_page: META_PAGE_NO,
            tuples: 0,
        })
    }

    /// Appends the next record; its rank is its arrival position.
    pub fn add_record(&mut self, heap_ptr: ItemPointer) -> Result<()> {
        if self.leaf.is_none() {
            self.next_page += 1;
            self.leaf = Some(Box::new(LevelBuilder::new(LEAF_LEVEL, self.next_page)?));
        }
        let Some(leaf) = self.leaf.as_mut() else {
            bail!("bulk build lost its leaf level");
        };
        add_entry(
            self.tree,
            &mut self.next_page,
            leaf,
            Entry::new(heap_ptr, 1),
        )?;
        self.tuples += 1;
        Ok(())
    }

    /// Closes every level, writes the meta page, and flushes. Returns the
    /// number of tuples loaded.
    pub fn finish(mut self) -> Result<u64> {
        let mut state = self.leaf.take();
        let mut root_no = INVALID_PAGE;
        let mut levels = 0u32;

        while let Some(mut node) = state {
            levels += 1;
            if node.parent.is_none() {
                let mut page = TreePageMut::new(&mut node.page)?;
                page.add_flags(PAGE_ROOT);
            } else {
                let downlink = Entry::new(
                    ItemPointer::new(node.page_no, 0),
                    node.total_count as u32,
                );
                let (parent_no, parent_slot) = match node.parent.as_mut() {
                    Some(parent) => {
                        add_entry(self.tree, &mut self.next_page, parent, downlink)?;
                        (parent.page_no, parent.entry_count()? - 1)
                    }
                    None => bail!("bulk build lost a parent level"),
                };
                let mut page = TreePageMut::new(&mut node.page)?;
                page.set_parent(parent_no, parent_slot);
            }

            self.tree.pager.write_page_image(node.page_no, &node.page)?;
            root_no = node.page_no;
            state = node.parent.take();
        }

        let mut meta_guard = self.tree.pager.acquire_write(META_PAGE_NO)?;
        {
            let mut meta_page = TreePageMut::new(&mut meta_guard[..])?;
            meta_page.write_meta(root_no, levels);
        }
        self.tree.log_guard(&meta_guard)?;
        drop(meta_guard);

        self.tree.invalidate_cached_root();
        self.tree.pager.flush()?;
        Ok(self.tuples)
    }
}

impl CountedTree {
    /// Bulk-loads the tree from records in rank order. The index must be
    /// freshly created. Returns the number of tuples loaded.
    pub(crate) fn build(&self, records: impl IntoIterator<Item = ItemPointer>) -> Result<u64> {
        let _maintenance = self.maintenance.lock();
        let mut builder = TreeBuilder::new(self)?;
        for heap_ptr in records {
            builder.add_record(heap_ptr)?;
        }
        builder.finish()
    }

    /// Formats a freshly created index as empty: just the meta page, no
    /// root.
    pub(crate) fn build_empty(&self) -> Result<()> {
        let _maintenance = self.maintenance.lock();
        ensure!(
            self.pager.page_count() <= 1,
            "index \"{}\" already contains data",
            self.name
        );

        let mut guard = self.pager.acquire_write(META_PAGE_NO)?;
        {
            let mut page = TreePageMut::new(&mut guard[..])?;
            page.init_meta(INVALID_PAGE, 0);
        }
        self.log_guard(&guard)?;
        drop(guard);

        self.invalidate_cached_root();
        self.pager.flush()
    }
}

/// Appends one entry at `node`'s level, closing and replacing the open
/// page first when it is at its fill limit.
fn add_entry(
    tree: &CountedTree,
    next_page: &mut u32,
    node: &mut LevelBuilder,
    entry: Entry,
) -> Result<()> {
    let capacity = tree.capacity_for(node.level);
    if node.entry_count()? as usize >= capacity {
        if node.parent.is_none() {
            // First overflow at this level adds a tree level above it.
            *next_page += 1;
            node.parent = Some(Box::new(LevelBuilder::new(node.level + 1, *next_page)?));
        }

        let downlink = Entry::new(ItemPointer::new(node.page_no, 0), node.total_count as u32);
        let (parent_no, parent_slot) = match node.parent.as_mut() {
            Some(parent) => {
                add_entry(tree, next_page, parent, downlink)?;
                (parent.page_no, parent.entry_count()? - 1)
            }
            None => bail!("bulk build lost a parent level"),
        };

        // Close the old page: record where its downlink landed, chain it
        // to the successor page, write it out. It is never touched again.
        *next_page += 1;
        let new_page_no = *next_page;
        let old_page_no = node.page_no;
        {
            let mut page = TreePageMut::new(&mut node.page)?;
            page.set_parent(parent_no, parent_slot);
            page.set_next(new_page_no);
        }
        tree.pager.write_page_image(old_page_no, &node.page)?;

        node.reset(new_page_no)?;
        let mut page = TreePageMut::new(&mut node.page)?;
        page.set_prev(old_page_no);
    }

    let slot = node.entry_count()?;
    {
        let mut page = TreePageMut::new(&mut node.page)?;
        page.insert_entry_at(slot, entry)?;
    }
    node.total_count += entry.child_count() as u64;
    Ok(())
}
