//! # Storage Module
//!
//! Foundational storage layer for rankidx: a memory-mapped paged file, a
//! buffer pool with per-page reader/writer locks, a full-page-image
//! write-ahead log, and a free page map.
//!
//! ## Architecture Overview
//!
//! The index lives in a single file of fixed-size pages. `MmapStorage` maps
//! the file into the address space and hands out page slices; growth goes
//! through `&mut self` so the borrow checker rules out dangling page
//! references across a remap.
//!
//! On top of that, `Pager` keeps an in-memory frame per hot page. Each frame
//! carries its own `RwLock`, so tree descents can lock pages individually:
//! take the child's lock, release the parent's, keep going. Guards are owned
//! (`arc_lock`), which is what makes that hand-over-hand pattern expressible
//! as ordinary values moving between functions.
//!
//! ## File Format
//!
//! Index files are concatenated 8KB pages:
//!
//! ```text
//! Offset 0:       Page 0 (meta page)
//! Offset 8192:    Page 1
//! Offset 16384:   Page 2
//! ...
//! ```
//!
//! Page 0 is always the meta page, which means page number 0 can double as
//! the "no page" sentinel in sibling and parent links.
//!
//! ## Durability
//!
//! Mutations are optionally logged as full page images to the WAL before the
//! dirty frames are flushed back through the mmap. Recovery replays valid
//! frames until the first bad checksum.
//!
//! ## Module Organization
//!
//! - `mmap`: low-level memory-mapped storage (`MmapStorage`)
//! - `pager`: frame table, per-page locks, pins, allocation, flush
//! - `wal`: append-only full-page-image log with CRC64 frames
//! - `freelist`: recyclable page tracking

mod freelist;
mod mmap;
mod pager;
mod wal;

pub use freelist::Freelist;
pub use mmap::MmapStorage;
pub use pager::{PageReadGuard, PageWriteGuard, Pager};
pub use wal::{Wal, WalFrameHeader, WAL_FRAME_HEADER_SIZE};

pub const PAGE_SIZE: usize = 8192;
