//! End-to-end coverage of the bucketed allocator, direct maps, realloc,
//! purging and the integrity checks.

use partition_alloc::*;

fn new_root() -> &'static PartitionRoot {
    PartitionAllocator::new(PartitionOptions::default()).root()
}

// Cookie-free partitions have zero per-slot overhead, which makes byte
// accounting in the assertions exact.
fn new_bare_root() -> &'static PartitionRoot {
    PartitionAllocator::new(PartitionOptions {
        cookies: CookiesMode::Disallowed,
        ..PartitionOptions::default()
    })
    .root()
}

#[derive(Default)]
struct StatsCollector {
    totals: MemoryStats,
    buckets: Vec<BucketMemoryStats>,
}

impl PartitionStatsDumper for StatsCollector {
    fn partition_dump_totals(&mut self, _name: &str, stats: &MemoryStats) {
        self.totals = *stats;
    }

    fn partition_dump_bucket_stats(&mut self, _name: &str, stats: &BucketMemoryStats) {
        self.buckets.push(*stats);
    }
}

fn collect_stats(root: &PartitionRoot) -> StatsCollector {
    let mut collector = StatsCollector::default();
    root.dump_stats("test", false, &mut collector);
    collector
}

#[test]
fn s1_single_bucket_identity() {
    let root = new_root();
    let p = root.alloc(12, "s1");
    assert!(!p.is_null());
    unsafe {
        assert_eq!(root.bucket_index_of_pointer(p), root.bucket_index_for_size(12));
        root.free(p);
    }
    let q = root.alloc(12, "s1");
    assert_eq!(q, p);
    unsafe { root.free(q) };
}

#[test]
fn s2_inexact_size_shares_the_bucket() {
    let root = new_root();
    let p = root.alloc(12, "s2");
    unsafe { root.free(p) };
    let q = root.alloc(13, "s2");
    assert_eq!(q, p);
    unsafe { root.free(q) };
}

#[test]
fn p5_alignment_and_reported_sizes() {
    let root = new_root();
    for size in [1usize, 2, 8, 12, 100, 1000, 4096, 100_000, 1_500_000] {
        let p = root.alloc(size, "sizes");
        assert!(!p.is_null());
        assert_eq!(p as usize % 8, 0, "size {}", size);
        unsafe {
            assert!(root.get_size(p) >= size, "size {}", size);
            assert_eq!(root.get_size(p), root.actual_size(size), "size {}", size);
        }
        unsafe { root.free(p) };
    }
}

#[test]
fn p6_freelist_reuse_is_lifo() {
    let root = new_root();
    let p = root.alloc(96, "lifo");
    let q = root.alloc(96, "lifo");
    unsafe {
        root.free(q);
        root.free(p);
    }
    // Most recently freed comes back first.
    let r = root.alloc(96, "lifo");
    assert_eq!(r, p);
    let s = root.alloc(90, "lifo");
    assert_eq!(s, q);
    unsafe {
        root.free(r);
        root.free(s);
    }
}

#[test]
fn p7_realloc_within_one_bucket_keeps_the_pointer() {
    let root = new_root();
    let p = root.alloc(100, "realloc");
    let q = unsafe { root.realloc(p, 101, "realloc") };
    assert_eq!(q, p);
    unsafe { root.free(q) };
}

#[test]
fn realloc_moves_and_copies_across_buckets() {
    let root = new_root();
    let p = root.alloc(16, "realloc");
    unsafe {
        core::ptr::write_bytes(p, 0x5A, 16);
        let q = root.realloc(p, 5000, "realloc");
        assert_ne!(q, p);
        for i in 0..16 {
            assert_eq!(*q.add(i), 0x5A);
        }
        root.free(q);
    }
}

#[test]
fn realloc_null_and_zero_edge_cases() {
    let root = new_root();
    let p = unsafe { root.realloc(core::ptr::null_mut(), 64, "edge") };
    assert!(!p.is_null());
    let q = unsafe { root.realloc(p, 0, "edge") };
    assert!(q.is_null());
}

#[test]
fn s5_direct_map_grows_in_place() {
    let root = new_bare_root();
    let one_mib = 1024 * 1024;
    let grown = 1200 * 1024;
    let p = root.alloc(one_mib, "dm");
    assert!(!p.is_null());
    let committed_before = root.total_size_of_committed_pages();
    let q = unsafe { root.realloc(p, grown, "dm") };
    assert_eq!(q, p);
    let committed_after = root.total_size_of_committed_pages();
    // Both sizes are system-page multiples already.
    assert_eq!(committed_after - committed_before, grown - one_mib);
    unsafe { root.free(q) };
}

#[test]
fn s6_direct_map_shrink_thresholds() {
    let root = new_bare_root();
    let p = root.alloc(1024 * 1024, "dm");
    unsafe {
        core::ptr::write_bytes(p, 0x77, 1024);
        // 900KiB / 1MiB is above the 80% keep-in-place threshold.
        let q = root.realloc(p, 900 * 1024, "dm");
        assert_eq!(q, p);
        assert_eq!(root.get_size(q), 900 * 1024);
        // 500KiB / 900KiB is below it; the data moves.
        let r = root.realloc(q, 500 * 1024, "dm");
        assert_ne!(r, q);
        for i in 0..1024 {
            assert_eq!(*r.add(i), 0x77);
        }
        root.free(r);
    }
}

#[test]
fn s7_empty_span_decommit_through_purge() {
    let root = new_bare_root();
    // Slot 4096 packs exactly four slots into a one-partition-page span.
    let count = 4;
    let ptrs: Vec<*mut u8> = (0..count).map(|_| root.alloc(4096, "s7")).collect();
    let committed_full = root.total_size_of_committed_pages();
    for &p in &ptrs {
        unsafe { root.free(p) };
    }

    let stats = collect_stats(root);
    let bucket = stats
        .buckets
        .iter()
        .find(|b| b.bucket_slot_size == 4096)
        .expect("bucket with live spans");
    assert_eq!(bucket.num_empty_slot_spans, 1);
    assert_eq!(bucket.num_decommitted_slot_spans, 0);

    root.purge_memory(PURGE_DECOMMIT_EMPTY_SLOT_SPANS);

    let stats = collect_stats(root);
    let bucket = stats
        .buckets
        .iter()
        .find(|b| b.bucket_slot_size == 4096)
        .expect("bucket with live spans");
    assert_eq!(bucket.num_empty_slot_spans, 0);
    assert_eq!(bucket.num_decommitted_slot_spans, 1);
    assert_eq!(
        root.total_size_of_committed_pages(),
        committed_full - count * 4096
    );
}

#[test]
fn p10_purge_is_idempotent() {
    let root = new_root();
    let ptrs: Vec<*mut u8> = (0..32).map(|_| root.alloc(8192, "purge")).collect();
    for &p in &ptrs[16..] {
        unsafe { root.free(p) };
    }
    root.purge_memory(PURGE_DECOMMIT_EMPTY_SLOT_SPANS | PURGE_DISCARD_UNUSED_SYSTEM_PAGES);
    let committed_first = root.total_size_of_committed_pages();
    root.purge_memory(PURGE_DECOMMIT_EMPTY_SLOT_SPANS | PURGE_DISCARD_UNUSED_SYSTEM_PAGES);
    assert_eq!(root.total_size_of_committed_pages(), committed_first);
    for &p in &ptrs[..16] {
        unsafe { root.free(p) };
    }
}

#[test]
#[should_panic(expected = "double free")]
fn p9_double_free_is_detected() {
    let root = new_bare_root();
    let p = root.alloc(16, "double");
    unsafe {
        root.free(p);
        root.free(p);
    }
}

#[test]
fn excessive_sizes_return_null_when_asked() {
    let root = new_root();
    assert!(root
        .alloc_flags(ALLOC_RETURN_NULL, MAX_DIRECT_MAPPED + 1, "huge")
        .is_null());
    assert!(root
        .alloc_flags(ALLOC_RETURN_NULL, usize::MAX / 2, "huge")
        .is_null());
}

#[test]
fn zero_fill_applies_to_recycled_slots() {
    let root = new_root();
    let p = root.alloc(1000, "zero");
    unsafe {
        core::ptr::write_bytes(p, 0xFF, 1000);
        root.free(p);
    }
    let q = root.alloc_flags(ALLOC_ZERO_FILL, 1000, "zero");
    assert_eq!(q, p);
    unsafe {
        for i in 0..1000 {
            assert_eq!(*q.add(i), 0, "offset {}", i);
        }
        root.free(q);
    }
}

#[test]
fn aligned_alloc_honours_the_request() {
    let root = PartitionAllocator::new(PartitionOptions {
        alignment: Alignment::AlignedAllocCapable,
        cookies: CookiesMode::Disallowed,
        ..PartitionOptions::default()
    })
    .root();
    for alignment in [16usize, 64, 1024, 4096, 16384] {
        for size in [1usize, 100, 8000] {
            let p = root.aligned_alloc(alignment, size);
            assert!(!p.is_null());
            assert_eq!(p as usize % alignment, 0, "alignment {}", alignment);
            unsafe {
                assert!(root.get_size(p) >= size);
                root.free(p);
            }
        }
    }
}

#[test]
fn p4_direct_map_list_stays_linked() {
    let root = new_bare_root();
    let a = root.alloc(1024 * 1024, "dm-list");
    let b = root.alloc(1536 * 1024, "dm-list");
    let c = root.alloc(2048 * 1024, "dm-list");

    let stats = collect_stats(root);
    let mut direct_sizes: Vec<usize> = stats
        .buckets
        .iter()
        .filter(|s| s.is_direct_map)
        .map(|s| s.bucket_slot_size)
        .collect();
    direct_sizes.sort_unstable();
    assert_eq!(direct_sizes, vec![1024 * 1024, 1536 * 1024, 2048 * 1024]);

    // Unlink from the middle of the list.
    unsafe { root.free(b) };
    let stats = collect_stats(root);
    let mut direct_sizes: Vec<usize> = stats
        .buckets
        .iter()
        .filter(|s| s.is_direct_map)
        .map(|s| s.bucket_slot_size)
        .collect();
    direct_sizes.sort_unstable();
    assert_eq!(direct_sizes, vec![1024 * 1024, 2048 * 1024]);

    unsafe {
        root.free(a);
        root.free(c);
    }
    let stats = collect_stats(root);
    assert!(stats.buckets.iter().all(|s| !s.is_direct_map));
}

#[test]
fn p1_p2_p3_structural_invariants_hold_under_load() {
    let root = new_root();
    let mut live: Vec<(*mut u8, usize)> = Vec::new();
    let sizes = [8usize, 24, 100, 300, 1024, 9000, 70_000, 200_000];
    for round in 0..6 {
        for (i, &size) in sizes.iter().enumerate() {
            for _ in 0..(8 - i) {
                live.push((root.alloc(size, "load"), size));
            }
        }
        root.verify_integrity();
        // Free a staggered half.
        let mut index = 0;
        live.retain(|&(p, _)| {
            index += 1;
            if (index + round) % 2 == 0 {
                unsafe { root.free(p) };
                false
            } else {
                true
            }
        });
        root.verify_integrity();
    }
    for (p, size) in live.drain(..) {
        unsafe {
            assert!(root.get_size(p) >= size);
            root.free(p);
        }
    }
    root.verify_integrity();
}

#[test]
fn concurrent_alloc_free_smoke() {
    let root = new_root();
    let mut handles = Vec::new();
    for t in 0..4 {
        let root = root as *const PartitionRoot as usize;
        handles.push(std::thread::spawn(move || {
            let root = unsafe { &*(root as *const PartitionRoot) };
            let mut live = Vec::new();
            for i in 0..2000usize {
                let size = 8 + ((i * 37 + t * 101) % 3000);
                live.push((root.alloc(size, "mt"), size));
                if live.len() > 64 {
                    let (p, _) = live.swap_remove((i * 13) % live.len());
                    unsafe { root.free(p) };
                }
            }
            for (p, size) in live {
                unsafe {
                    assert!(root.get_size(p) >= size);
                    root.free(p);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    root.verify_integrity();
}

#[test]
fn single_slot_spans_track_their_raw_size() {
    let root = new_bare_root();
    // 100000 bytes land in a single-slot span of 106496 bytes; the unused
    // tail past the requested size is discardable page by page.
    let p = root.alloc(100_000, "raw");
    let stats = collect_stats(root);
    let bucket = stats
        .buckets
        .iter()
        .find(|b| b.bucket_slot_size == 106_496)
        .expect("single-slot bucket");
    assert_eq!(bucket.active_bytes, 100_000);
    assert_eq!(bucket.discardable_bytes, 106_496 - 102_400);

    // Discarding does not decommit: the accounting stays put while the OS
    // may drop the backing.
    let committed = root.total_size_of_committed_pages();
    root.purge_memory(PURGE_DISCARD_UNUSED_SYSTEM_PAGES);
    assert_eq!(root.total_size_of_committed_pages(), committed);

    // A same-bucket realloc updates the recorded size in place.
    let q = unsafe { root.realloc(p, 102_401, "raw") };
    assert_eq!(q, p);
    let stats = collect_stats(root);
    let bucket = stats
        .buckets
        .iter()
        .find(|b| b.bucket_slot_size == 106_496)
        .expect("single-slot bucket");
    assert_eq!(bucket.active_bytes, 102_401);
    assert_eq!(bucket.discardable_bytes, 0);
    unsafe { root.free(q) };
}

#[test]
fn stats_totals_are_consistent() {
    let root = new_bare_root();
    let p = root.alloc(100_000, "stats");
    let stats = collect_stats(root);
    assert!(stats.totals.total_committed_bytes > 0);
    assert!(stats.totals.total_mmapped_bytes >= SUPER_PAGE_SIZE);
    assert!(stats.totals.total_committed_bytes <= stats.totals.total_mmapped_bytes);
    assert!(stats.totals.total_active_bytes >= 100_000);
    assert_eq!(
        stats.totals.total_committed_bytes,
        root.total_size_of_committed_pages()
    );
    unsafe { root.free(p) };
}
