//! # Rank Index Integration Tests
//!
//! End-to-end coverage of the public surface: bulk build, positional
//! insert with successor shifting, rank lookup, scans, predicate bulk
//! delete with page retirement and cleanup, WAL crash recovery, and the
//! structural audit after each of them.
//!
//! Multi-level scenarios clamp `max_entries` to 2 so a handful of tuples
//! produces a three-level tree; the audit then proves the subtree counts,
//! parent back-pointers, and sibling chains page by page.

use tempfile::tempdir;

use rankidx::{IndexOptions, ItemPointer, RankIndex};

fn tiny_pages() -> IndexOptions {
    IndexOptions {
        max_entries: Some(2),
        ..IndexOptions::default()
    }
}

fn create_index(opts: IndexOptions) -> (tempfile::TempDir, RankIndex) {
    let dir = tempdir().expect("failed to create temp dir");
    let index = RankIndex::create(dir.path().join("test.rix"), opts)
        .expect("failed to create index");
    (dir, index)
}

fn ptr(n: u16) -> ItemPointer {
    ItemPointer::new(1, n)
}

mod empty_index {
    use super::*;

    #[test]
    fn reads_as_empty() {
        let (_dir, index) = create_index(IndexOptions::default());

        assert_eq!(index.total_count().unwrap(), 0);
        assert_eq!(index.lookup(1).unwrap(), None);
        index.verify().unwrap();

        let shape = index.shape().unwrap();
        assert_eq!(shape.height, 0);
        assert!(shape.pages_per_level.is_empty());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rix");

        RankIndex::create(&path, IndexOptions::default()).unwrap();
        let index = RankIndex::open(&path, IndexOptions::default()).unwrap();

        assert_eq!(index.total_count().unwrap(), 0);
        index.verify().unwrap();
    }

    #[test]
    fn open_rejects_a_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not_an_index.rix");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();

        assert!(RankIndex::open(&path, IndexOptions::default()).is_err());
    }
}

mod bulk_build {
    use super::*;

    #[test]
    fn five_records_make_a_three_level_tree() {
        let (_dir, index) = create_index(tiny_pages());

        let loaded = index.build((0..5).map(ptr)).unwrap();
        assert_eq!(loaded, 5);
        assert_eq!(index.total_count().unwrap(), 5);

        let shape = index.shape().unwrap();
        assert_eq!(shape.height, 3);
        assert_eq!(shape.pages_per_level, vec![1, 2, 3]);
        assert_eq!(shape.leaf_entry_counts, vec![2, 2, 1]);

        index.verify().unwrap();
    }

    #[test]
    fn ranks_follow_load_order() {
        let (_dir, index) = create_index(tiny_pages());
        index.build((0..25).map(ptr)).unwrap();

        for rank in 1..=25u32 {
            assert_eq!(index.lookup(rank).unwrap(), Some(ptr(rank as u16 - 1)));
        }
        assert_eq!(index.lookup(26).unwrap(), None);
        index.verify().unwrap();
    }

    #[test]
    fn single_record_tree_has_height_one() {
        let (_dir, index) = create_index(IndexOptions::default());
        index.build([ptr(0)]).unwrap();

        let shape = index.shape().unwrap();
        assert_eq!(shape.height, 1);
        assert_eq!(shape.pages_per_level, vec![1]);
        assert_eq!(shape.leaf_entry_counts, vec![1]);
        assert_eq!(index.lookup(1).unwrap(), Some(ptr(0)));
        index.verify().unwrap();
    }

    #[test]
    fn rejects_a_nonempty_index() {
        let (_dir, index) = create_index(IndexOptions::default());
        index.build((0..3).map(ptr)).unwrap();

        let err = index.build((0..3).map(ptr)).unwrap_err();
        assert!(err.to_string().contains("already contains data"));
    }

    #[test]
    fn empty_build_leaves_an_empty_index() {
        let (_dir, index) = create_index(IndexOptions::default());

        assert_eq!(index.build(std::iter::empty()).unwrap(), 0);
        assert_eq!(index.total_count().unwrap(), 0);
        index.verify().unwrap();
    }

    #[test]
    fn matches_incremental_inserts() {
        let (_dir, built) = create_index(tiny_pages());
        built.build((0..20).map(ptr)).unwrap();

        let (_dir2, grown) = create_index(tiny_pages());
        for i in 0..20u32 {
            grown.insert(i + 1, ptr(i as u16)).unwrap();
        }

        for rank in 1..=20u32 {
            assert_eq!(built.lookup(rank).unwrap(), grown.lookup(rank).unwrap());
        }
        built.verify().unwrap();
        grown.verify().unwrap();
    }
}

mod insert {
    use super::*;

    #[test]
    fn first_insert_creates_the_root() {
        let (_dir, index) = create_index(IndexOptions::default());

        index.insert(1, ptr(7)).unwrap();

        assert_eq!(index.total_count().unwrap(), 1);
        assert_eq!(index.lookup(1).unwrap(), Some(ptr(7)));
        assert_eq!(index.shape().unwrap().height, 1);
        index.verify().unwrap();
    }

    #[test]
    fn inserting_mid_rank_shifts_successors() {
        let (_dir, index) = create_index(tiny_pages());
        index.build((0..5).map(ptr)).unwrap();

        index.insert(3, ptr(100)).unwrap();

        assert_eq!(index.total_count().unwrap(), 6);
        assert_eq!(index.lookup(2).unwrap(), Some(ptr(1)));
        assert_eq!(index.lookup(3).unwrap(), Some(ptr(100)));
        assert_eq!(index.lookup(4).unwrap(), Some(ptr(2)));
        assert_eq!(index.lookup(6).unwrap(), Some(ptr(4)));
        index.verify().unwrap();
    }

    #[test]
    fn rank_past_the_end_appends() {
        let (_dir, index) = create_index(IndexOptions::default());
        index.build((0..3).map(ptr)).unwrap();

        index.insert(1000, ptr(50)).unwrap();

        assert_eq!(index.total_count().unwrap(), 4);
        assert_eq!(index.lookup(4).unwrap(), Some(ptr(50)));
        index.verify().unwrap();
    }

    #[test]
    fn rank_zero_is_rejected() {
        let (_dir, index) = create_index(IndexOptions::default());
        assert!(index.insert(0, ptr(0)).is_err());
    }

    #[test]
    fn repeated_front_inserts_reverse_the_order() {
        let (_dir, index) = create_index(tiny_pages());

        for i in 0..12u16 {
            index.insert(1, ptr(i)).unwrap();
        }

        assert_eq!(index.total_count().unwrap(), 12);
        for rank in 1..=12u32 {
            assert_eq!(index.lookup(rank).unwrap(), Some(ptr(12 - rank as u16)));
        }
        index.verify().unwrap();
    }

    #[test]
    fn many_appends_split_cleanly() {
        let (_dir, index) = create_index(tiny_pages());

        for i in 0..50u32 {
            index.insert(i + 1, ptr(i as u16)).unwrap();
        }

        assert_eq!(index.total_count().unwrap(), 50);
        for rank in 1..=50u32 {
            assert_eq!(index.lookup(rank).unwrap(), Some(ptr(rank as u16 - 1)));
        }
        assert!(index.shape().unwrap().height >= 3);
        index.verify().unwrap();
    }

    #[test]
    fn interleaved_positions_stay_consistent() {
        let (_dir, index) = create_index(tiny_pages());

        // Mirror the index against a plain vector.
        let mut model: Vec<u16> = Vec::new();
        for i in 0..30u16 {
            let rank = (i as u32 * 7 % (model.len() as u32 + 1)) + 1;
            index.insert(rank, ptr(i)).unwrap();
            model.insert(rank as usize - 1, i);
        }

        assert_eq!(index.total_count().unwrap(), model.len() as u64);
        for (i, &expected) in model.iter().enumerate() {
            assert_eq!(index.lookup(i as u32 + 1).unwrap(), Some(ptr(expected)));
        }
        index.verify().unwrap();
    }
}

mod scan {
    use super::*;

    #[test]
    fn yields_one_tuple_per_rescan() {
        let (_dir, index) = create_index(IndexOptions::default());
        index.build((0..10).map(ptr)).unwrap();

        let mut scan = index.begin_scan();
        assert_eq!(scan.next().unwrap(), None);

        scan.rescan(4);
        assert_eq!(scan.next().unwrap(), Some(ptr(3)));
        assert_eq!(scan.next().unwrap(), None);

        scan.rescan(10);
        assert_eq!(scan.next().unwrap(), Some(ptr(9)));

        scan.rescan(11);
        assert_eq!(scan.next().unwrap(), None);
    }
}

mod bulk_delete {
    use super::*;

    #[test]
    fn survivors_close_ranks() {
        let (_dir, index) = create_index(tiny_pages());
        index.build((0..10).map(ptr)).unwrap();

        let stats = index.bulk_delete(|p| p.slot % 2 == 1).unwrap();

        assert_eq!(stats.tuples_removed, 5);
        assert_eq!(index.total_count().unwrap(), 5);
        for rank in 1..=5u32 {
            assert_eq!(index.lookup(rank).unwrap(), Some(ptr((rank as u16 - 1) * 2)));
        }
        index.verify().unwrap();
    }

    #[test]
    fn matching_nothing_changes_nothing() {
        let (_dir, index) = create_index(tiny_pages());
        index.build((0..8).map(ptr)).unwrap();

        let stats = index.bulk_delete(|_| false).unwrap();

        assert_eq!(stats.tuples_removed, 0);
        assert_eq!(stats.pages_deleted, 0);
        assert_eq!(index.total_count().unwrap(), 8);
        index.verify().unwrap();
    }

    #[test]
    fn deleting_everything_retires_the_tree() {
        let (_dir, index) = create_index(tiny_pages());
        index.build((0..5).map(ptr)).unwrap();

        let stats = index.bulk_delete(|_| true).unwrap();

        assert_eq!(stats.tuples_removed, 5);
        assert!(stats.pages_deleted >= 3);
        assert_eq!(index.total_count().unwrap(), 0);
        assert_eq!(index.lookup(1).unwrap(), None);
        assert_eq!(index.shape().unwrap().height, 0);
        index.verify().unwrap();
    }

    #[test]
    fn cleanup_counts_survivors_and_frees_pages() {
        let (_dir, index) = create_index(tiny_pages());
        index.build((0..10).map(ptr)).unwrap();

        index.bulk_delete(|p| p.slot < 6).unwrap();
        let stats = index.cleanup().unwrap();

        assert_eq!(stats.num_index_tuples, 4);
        assert_eq!(index.total_count().unwrap(), 4);
        index.verify().unwrap();
    }

    #[test]
    fn retired_pages_get_reused() {
        let (_dir, index) = create_index(tiny_pages());
        index.build((0..5).map(ptr)).unwrap();

        index.bulk_delete(|_| true).unwrap();
        let stats = index.cleanup().unwrap();
        assert!(stats.pages_free > 0);

        for i in 0..5u32 {
            index.insert(i + 1, ptr(i as u16)).unwrap();
        }

        assert_eq!(index.total_count().unwrap(), 5);
        for rank in 1..=5u32 {
            assert_eq!(index.lookup(rank).unwrap(), Some(ptr(rank as u16 - 1)));
        }
        assert!(index.shape().unwrap().height >= 1);
        // Every recycled page went back into the tree before the file was
        // allowed to grow.
        assert_eq!(index.cleanup().unwrap().pages_free, 0);
        index.verify().unwrap();
    }

    #[test]
    fn recycled_pages_leave_clean_sibling_chains() {
        let (_dir, index) = create_index(tiny_pages());
        index.build((0..9).map(ptr)).unwrap();

        // Empty out the middle leaves, recycle them, then force splits
        // that reuse those pages elsewhere in the tree.
        index.bulk_delete(|p| (3..7).contains(&p.slot)).unwrap();
        index.cleanup().unwrap();
        for i in 0..8u16 {
            index.insert(1, ptr(100 + i)).unwrap();
        }

        assert_eq!(index.total_count().unwrap(), 13);
        for rank in 1..=8u32 {
            assert_eq!(index.lookup(rank).unwrap(), Some(ptr(107 - rank as u16 + 1)));
        }
        index.verify().unwrap();
    }

    #[test]
    fn partial_page_retirement_keeps_counts_exact() {
        let (_dir, index) = create_index(tiny_pages());
        index.build((0..9).map(ptr)).unwrap();

        // Empty out the middle leaves only.
        index.bulk_delete(|p| (3..7).contains(&p.slot)).unwrap();

        assert_eq!(index.total_count().unwrap(), 5);
        let expected: Vec<u16> = vec![0, 1, 2, 7, 8];
        for (i, &slot) in expected.iter().enumerate() {
            assert_eq!(index.lookup(i as u32 + 1).unwrap(), Some(ptr(slot)));
        }
        index.verify().unwrap();
    }
}

mod durability {
    use super::*;

    fn wal_opts() -> IndexOptions {
        IndexOptions {
            max_entries: Some(2),
            use_wal: true,
            ..IndexOptions::default()
        }
    }

    #[test]
    fn flushed_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rix");

        {
            let index = RankIndex::create(&path, tiny_pages()).unwrap();
            index.build((0..7).map(ptr)).unwrap();
            index.insert(3, ptr(99)).unwrap();
            index.flush().unwrap();
        }

        let index = RankIndex::open(&path, tiny_pages()).unwrap();
        assert_eq!(index.total_count().unwrap(), 8);
        assert_eq!(index.lookup(3).unwrap(), Some(ptr(99)));
        index.verify().unwrap();
    }

    #[test]
    fn wal_replay_recovers_unflushed_inserts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rix");

        {
            let index = RankIndex::create(&path, wal_opts()).unwrap();
            index.build((0..7).map(ptr)).unwrap();
            // Dropped without flush: these live only in the log.
            index.insert(1, ptr(77)).unwrap();
            index.insert(9, ptr(88)).unwrap();
        }

        let index = RankIndex::open(&path, wal_opts()).unwrap();
        assert_eq!(index.total_count().unwrap(), 9);
        assert_eq!(index.lookup(1).unwrap(), Some(ptr(77)));
        assert_eq!(index.lookup(2).unwrap(), Some(ptr(0)));
        assert_eq!(index.lookup(9).unwrap(), Some(ptr(88)));
        index.verify().unwrap();
    }

    #[test]
    fn wal_replay_recovers_unflushed_deletes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rix");

        {
            let index = RankIndex::create(&path, wal_opts()).unwrap();
            index.build((0..6).map(ptr)).unwrap();
            index.bulk_delete(|p| p.slot % 3 == 0).unwrap();
        }

        let index = RankIndex::open(&path, wal_opts()).unwrap();
        assert_eq!(index.total_count().unwrap(), 4);
        assert_eq!(index.lookup(1).unwrap(), Some(ptr(1)));
        assert_eq!(index.lookup(2).unwrap(), Some(ptr(2)));
        assert_eq!(index.lookup(3).unwrap(), Some(ptr(4)));
        index.verify().unwrap();
    }
}

mod concurrency {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn parallel_readers_see_a_settled_tree() {
        let (_dir, index) = create_index(tiny_pages());
        index.build((0..40).map(ptr)).unwrap();
        let index = Arc::new(index);

        let mut handles = Vec::new();
        for t in 0..4 {
            let index = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                for round in 0..50u32 {
                    let rank = (t * 50 + round) % 40 + 1;
                    assert_eq!(
                        index.lookup(rank).unwrap(),
                        Some(ptr(rank as u16 - 1))
                    );
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn readers_stay_alive_during_appends() {
        let (_dir, index) = create_index(tiny_pages());
        index.build((0..10).map(ptr)).unwrap();
        let index = Arc::new(index);

        let writer = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                for i in 10..60u32 {
                    index.insert(i + 1, ptr(i as u16)).unwrap();
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..3 {
            let index = Arc::clone(&index);
            readers.push(std::thread::spawn(move || {
                for round in 0..200u32 {
                    // Mid-split reads may miss a rank; they must never
                    // error or tear.
                    let rank = round % 60 + 1;
                    index.lookup(rank).unwrap();
                    assert!(index.total_count().unwrap() >= 10);
                }
            }));
        }

        writer.join().unwrap();
        for handle in readers {
            handle.join().unwrap();
        }

        assert_eq!(index.total_count().unwrap(), 60);
        for rank in 1..=60u32 {
            assert_eq!(index.lookup(rank).unwrap(), Some(ptr(rank as u16 - 1)));
        }
        index.verify().unwrap();
    }
}
