//! # Page Codec
//!
//! On-disk layout of counted-tree pages. A page is a flat byte region with
//! a small header, a packed entry array in rank order, and a trailer of
//! structural metadata at the tail:
//!
//! ```text
//! +0                PageHeader  { entry_count }                   (8 bytes)
//! +8                Entry[0], Entry[1], ...                  (12 bytes each)
//! ...
//! PAGE_SIZE - 20    PageTrailer { prev, next, parent_page,
//!                                 parent_slot, flags, level }    (20 bytes)
//! +
//! ```
//!
//! Every entry is `{ ptr: (page_no, slot), child_count }`. On a leaf the
//! pointer addresses a heap record and the count is always 1; on an
//! internal page the pointer addresses a child tree page and the count is
//! the number of live leaf tuples under that child. The entry position
//! inside the page is its local rank, so a prefix sum over `child_count`
//! answers "which subtree holds the k-th tuple" without any keys.
//!
//! Page 0 is always the meta page (`MetaPage { magic, root, level }`).
//! Because of that, page number 0 doubles as the invalid sentinel in
//! sibling and parent links: a page with `prev == 0` is the leftmost of
//! its level, `next == 0` the rightmost, `parent_page == 0` has no parent
//! recorded.
//!
//! The view types follow the usual split: `TreePage` borrows a page
//! immutably, `TreePageMut` exclusively. Construction validates the buffer
//! size once; field access after that is infallible.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::PAGE_SIZE;

pub const PAGE_HEADER_SIZE: usize = 8;
pub const PAGE_TRAILER_SIZE: usize = 20;
pub const ENTRY_SIZE: usize = 12;

/// Physical entry capacity of one page; fill factors clamp below this.
pub const MAX_PAGE_ENTRIES: usize = (PAGE_SIZE - PAGE_HEADER_SIZE - PAGE_TRAILER_SIZE) / ENTRY_SIZE;

pub const META_PAGE_NO: u32 = 0;
pub const META_MAGIC: u32 = 0x0451253;

/// Page number 0 is the meta page, so it doubles as "no page" in links.
pub const INVALID_PAGE: u32 = 0;

/// Leaf pages sit at level 1; the meta stores the root's level, which is
/// also the height of the tree (0 while empty).
pub const LEAF_LEVEL: u32 = 1;

pub const PAGE_LEAF: u16 = 1 << 0;
pub const PAGE_ROOT: u16 = 1 << 1;
pub const PAGE_META: u16 = 1 << 2;
pub const PAGE_DELETED: u16 = 1 << 3;
pub const PAGE_HALF_DEAD: u16 = 1 << 4;

const TRAILER_OFFSET: usize = PAGE_SIZE - PAGE_TRAILER_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PageHeader {
    entry_count: U16,
    _reserved: [u8; 6],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PageTrailer {
    prev: U32,
    next: U32,
    parent_page: U32,
    parent_slot: U16,
    flags: U16,
    level: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MetaPage {
    pub magic: U32,
    pub root: U32,
    pub level: U32,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<PageTrailer>() == PAGE_TRAILER_SIZE);
const _: () = assert!(std::mem::size_of::<Entry>() == ENTRY_SIZE);
const _: () = assert!(std::mem::size_of::<MetaPage>() == 12);

/// Address of a record: a heap location for leaf entries, `(child_page, 0)`
/// for internal entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemPointer {
    pub page_no: u32,
    pub slot: u16,
}

impl ItemPointer {
    pub fn new(page_no: u32, slot: u16) -> Self {
        Self { page_no, slot }
    }
}

/// One on-page entry. Fixed 12-byte stride keeps slot arithmetic trivial.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Entry {
    page_no: U32,
    slot: U16,
    _pad: U16,
    child_count: U32,
}

impl Entry {
    pub fn new(ptr: ItemPointer, child_count: u32) -> Self {
        Self {
            page_no: U32::new(ptr.page_no),
            slot: U16::new(ptr.slot),
            _pad: U16::ZERO,
            child_count: U32::new(child_count),
        }
    }

    pub fn ptr(&self) -> ItemPointer {
        ItemPointer::new(self.page_no.get(), self.slot.get())
    }

    /// For internal entries: the child page this entry summarizes.
    pub fn child_page(&self) -> u32 {
        self.page_no.get()
    }

    pub fn child_count(&self) -> u32 {
        self.child_count.get()
    }

    pub fn set_child_count(&mut self, count: u32) {
        self.child_count = U32::new(count);
    }
}

fn entry_offset(slot: u16) -> usize {
    PAGE_HEADER_SIZE + slot as usize * ENTRY_SIZE
}

/// Shared view of one tree page.
#[derive(Clone, Copy)]
pub struct TreePage<'a> {
    data: &'a [u8],
}

impl<'a> TreePage<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        Ok(Self { data })
    }

    fn header(&self) -> &PageHeader {
        PageHeader::ref_from_bytes(&self.data[..PAGE_HEADER_SIZE]).unwrap()
    }

    fn trailer(&self) -> &PageTrailer {
        PageTrailer::ref_from_bytes(&self.data[TRAILER_OFFSET..]).unwrap()
    }

    pub fn entry_count(&self) -> u16 {
        self.header().entry_count.get()
    }

    pub fn flags(&self) -> u16 {
        self.trailer().flags.get()
    }

    pub fn level(&self) -> u32 {
        self.trailer().level.get()
    }

    pub fn prev(&self) -> u32 {
        self.trailer().prev.get()
    }

    pub fn next(&self) -> u32 {
        self.trailer().next.get()
    }

    /// Back-pointer to this page's own entry in its parent, if one has been
    /// recorded.
    pub fn parent(&self) -> Option<(u32, u16)> {
        let trailer = self.trailer();
        let page = trailer.parent_page.get();
        if page == INVALID_PAGE {
            None
        } else {
            Some((page, trailer.parent_slot.get()))
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.flags() & PAGE_LEAF != 0
    }

    pub fn is_root(&self) -> bool {
        self.flags() & PAGE_ROOT != 0
    }

    pub fn is_meta(&self) -> bool {
        self.flags() & PAGE_META != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags() & PAGE_DELETED != 0
    }

    pub fn is_half_dead(&self) -> bool {
        self.flags() & PAGE_HALF_DEAD != 0
    }

    /// Deleted and half-dead pages are skipped by every traversal.
    pub fn is_ignored(&self) -> bool {
        self.flags() & (PAGE_DELETED | PAGE_HALF_DEAD) != 0
    }

    pub fn is_leftmost(&self) -> bool {
        self.prev() == INVALID_PAGE
    }

    pub fn is_rightmost(&self) -> bool {
        self.next() == INVALID_PAGE
    }

    /// A page that has never been formatted reads as all zero bytes.
    pub fn is_new(&self) -> bool {
        self.entry_count() == 0 && self.flags() == 0 && self.level() == 0
    }

    pub fn entry_at(&self, slot: u16) -> Result<Entry> {
        ensure!(
            slot < self.entry_count(),
            "entry slot {} out of bounds (entry_count={})",
            slot,
            self.entry_count()
        );
        let offset = entry_offset(slot);
        Entry::read_from_bytes(&self.data[offset..offset + ENTRY_SIZE])
            .map_err(|e| eyre::eyre!("failed to read entry at slot {}: {:?}", slot, e))
    }

    /// Sum of all entry counts: live tuples under this page.
    pub fn total_count(&self) -> u64 {
        let mut total = 0u64;
        for slot in 0..self.entry_count() {
            let offset = entry_offset(slot);
            if let Ok(entry) = Entry::read_from_bytes(&self.data[offset..offset + ENTRY_SIZE]) {
                total += entry.child_count() as u64;
            }
        }
        total
    }

    pub fn meta(&self) -> Result<MetaPage> {
        ensure!(self.is_meta(), "page is not a meta page (flags={:#x})", self.flags());
        let offset = PAGE_HEADER_SIZE;
        MetaPage::read_from_bytes(&self.data[offset..offset + std::mem::size_of::<MetaPage>()])
            .map_err(|e| eyre::eyre!("failed to read meta page: {:?}", e))
    }
}

/// Exclusive view of one tree page.
pub struct TreePageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> TreePageMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        Ok(Self { data })
    }

    pub fn as_read(&self) -> TreePage<'_> {
        TreePage { data: self.data }
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        PageHeader::mut_from_bytes(&mut self.data[..PAGE_HEADER_SIZE]).unwrap()
    }

    fn trailer_mut(&mut self) -> &mut PageTrailer {
        PageTrailer::mut_from_bytes(&mut self.data[TRAILER_OFFSET..]).unwrap()
    }

    /// Zeroes the page and formats an empty page at `level` with `flags`.
    pub fn init(&mut self, level: u32, flags: u16) {
        self.data.fill(0);
        let trailer = self.trailer_mut();
        trailer.flags = U16::new(flags);
        trailer.level = U32::new(level);
    }

    pub fn entry_count(&self) -> u16 {
        self.as_read().entry_count()
    }

    pub fn level(&self) -> u32 {
        self.as_read().level()
    }

    pub fn is_leaf(&self) -> bool {
        self.as_read().is_leaf()
    }

    pub fn entry_at(&self, slot: u16) -> Result<Entry> {
        self.as_read().entry_at(slot)
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.trailer_mut().flags = U16::new(flags);
    }

    pub fn add_flags(&mut self, flags: u16) {
        let current = self.as_read().flags();
        self.trailer_mut().flags = U16::new(current | flags);
    }

    pub fn set_level(&mut self, level: u32) {
        self.trailer_mut().level = U32::new(level);
    }

    pub fn set_prev(&mut self, prev: u32) {
        self.trailer_mut().prev = U32::new(prev);
    }

    pub fn set_next(&mut self, next: u32) {
        self.trailer_mut().next = U32::new(next);
    }

    pub fn set_parent(&mut self, parent_page: u32, parent_slot: u16) {
        let trailer = self.trailer_mut();
        trailer.parent_page = U32::new(parent_page);
        trailer.parent_slot = U16::new(parent_slot);
    }

    pub fn clear_parent(&mut self) {
        self.set_parent(INVALID_PAGE, 0);
    }

    /// Inserts `entry` at `slot`, shifting every entry at or past it one
    /// stride to the right.
    pub fn insert_entry_at(&mut self, slot: u16, entry: Entry) -> Result<()> {
        let count = self.entry_count();
        ensure!(
            slot <= count,
            "insert slot {} out of bounds (entry_count={})",
            slot,
            count
        );
        ensure!(
            (count as usize) < MAX_PAGE_ENTRIES,
            "page is full ({} entries)",
            count
        );

        let src = entry_offset(slot);
        let tail = (count - slot) as usize * ENTRY_SIZE;
        self.data.copy_within(src..src + tail, src + ENTRY_SIZE);
        self.data[src..src + ENTRY_SIZE].copy_from_slice(entry.as_bytes());
        self.header_mut().entry_count = U16::new(count + 1);
        Ok(())
    }

    /// Removes the entry at `slot`, shifting successors one stride left.
    pub fn delete_entry_at(&mut self, slot: u16) -> Result<()> {
        let count = self.entry_count();
        ensure!(
            slot < count,
            "delete slot {} out of bounds (entry_count={})",
            slot,
            count
        );

        let dst = entry_offset(slot);
        let tail = (count - slot - 1) as usize * ENTRY_SIZE;
        self.data.copy_within(dst + ENTRY_SIZE..dst + ENTRY_SIZE + tail, dst);
        let end = entry_offset(count - 1);
        self.data[end..end + ENTRY_SIZE].fill(0);
        self.header_mut().entry_count = U16::new(count - 1);
        Ok(())
    }

    pub fn replace_entry(&mut self, slot: u16, entry: Entry) -> Result<()> {
        ensure!(
            slot < self.entry_count(),
            "replace slot {} out of bounds (entry_count={})",
            slot,
            self.entry_count()
        );
        let offset = entry_offset(slot);
        self.data[offset..offset + ENTRY_SIZE].copy_from_slice(entry.as_bytes());
        Ok(())
    }

    pub fn set_child_count(&mut self, slot: u16, count: u32) -> Result<()> {
        let mut entry = self.entry_at(slot)?;
        entry.set_child_count(count);
        self.replace_entry(slot, entry)
    }

    /// Adjusts the count at `slot` by `delta`, guarding against underflow
    /// and overflow.
    pub fn add_child_count(&mut self, slot: u16, delta: i64) -> Result<()> {
        let entry = self.entry_at(slot)?;
        let adjusted = entry.child_count() as i64 + delta;
        ensure!(
            (0..=u32::MAX as i64).contains(&adjusted),
            "entry count adjustment out of range: {} {:+}",
            entry.child_count(),
            delta
        );
        self.set_child_count(slot, adjusted as u32)
    }

    /// Formats this page as the meta page with the given root.
    pub fn init_meta(&mut self, root: u32, level: u32) {
        self.init(0, PAGE_META);
        self.write_meta(root, level);
    }

    /// Updates root and level on an already formatted meta page.
    pub fn write_meta(&mut self, root: u32, level: u32) {
        let meta = MetaPage {
            magic: U32::new(META_MAGIC),
            root: U32::new(root),
            level: U32::new(level),
        };
        let offset = PAGE_HEADER_SIZE;
        self.data[offset..offset + std::mem::size_of::<MetaPage>()]
            .copy_from_slice(meta.as_bytes());
    }

    /// Copies a fully formed page image over this page.
    pub fn restore_image(&mut self, image: &[u8]) -> Result<()> {
        ensure!(
            image.len() == PAGE_SIZE,
            "page image must be exactly {} bytes, got {}",
            PAGE_SIZE,
            image.len()
        );
        self.data.copy_from_slice(image);
        Ok(())
    }
}
