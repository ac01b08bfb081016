//! # rankidx
//!
//! A disk-resident counted B-tree: an index ordered by position instead
//! of key. Internal entries store how many live tuples their subtree
//! holds, so the k-th tuple is found by summing counts on the way down
//! rather than by comparisons. Lookup by rank, insert-at-rank (shifting
//! successors), predicate bulk delete, sequential bulk build, and an
//! offline structural audit all run against one memory-mapped file, with
//! optional write-ahead logging of page images for crash recovery.
//!
//! ```no_run
//! use rankidx::{IndexOptions, ItemPointer, RankIndex};
//!
//! # fn main() -> eyre::Result<()> {
//! let index = RankIndex::create("orders.rix", IndexOptions::default())?;
//! index.build((0..100).map(|i| ItemPointer::new(1, i as u16)))?;
//! index.insert(3, ItemPointer::new(7, 0))?;
//! assert_eq!(index.lookup(3)?, Some(ItemPointer::new(7, 0)));
//! assert_eq!(index.total_count()?, 101);
//! # Ok(())
//! # }
//! ```
//!
//! Concurrency is page-grained: readers and writers take per-page locks
//! through the pager, descents hold one lock at a time, and maintenance
//! (build, vacuum) serializes on a per-index lock. See the `btree` module
//! docs for the count maintenance protocols.

pub mod btree;
pub mod index;
pub mod storage;

pub use btree::{IndexOptions, ItemPointer, TreeShape, VacuumStats};
pub use index::{RankIndex, RankScan};
