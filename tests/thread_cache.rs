//! Thread-cache behaviour: hit/miss counts, LIFO reuse, limits, and the
//! purge protocols. Only one partition per process may carry the cache, so
//! every test in this binary shares one root.

use once_cell::sync::Lazy;
use partition_alloc::*;

static ALLOCATOR: Lazy<PartitionAllocator> = Lazy::new(|| {
    PartitionAllocator::new(PartitionOptions {
        thread_cache: ThreadCacheMode::Enabled,
        cookies: CookiesMode::Disallowed,
        ..PartitionOptions::default()
    })
});

fn root() -> &'static PartitionRoot {
    ALLOCATOR.root()
}

// The purge protocols reach across threads (purge-all flags every cache), so
// the tests in this binary run one at a time.
static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn serialize() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn cache_count(index: u16) -> u16 {
    let tcache = ThreadCache::get();
    assert!(!tcache.is_null(), "no cache on this thread yet");
    unsafe { (*tcache).bucket_count_for_testing(index as usize) }
}

fn purge_own_cache() {
    let tcache = ThreadCache::get();
    if !tcache.is_null() {
        unsafe { (*tcache).purge() };
    }
}

#[test]
fn s3_cached_objects_come_back_in_lifo_order() {
    let _guard = serialize();
    let root = root();
    let index = root.bucket_index_for_size(100);

    let ptrs: Vec<*mut u8> = (0..10).map(|_| root.alloc(100, "s3")).collect();
    purge_own_cache();
    assert_eq!(cache_count(index), 0);

    for &p in &ptrs {
        unsafe { root.free(p) };
    }
    assert_eq!(cache_count(index), 10);

    let again: Vec<*mut u8> = (0..10).map(|_| root.alloc(100, "s3")).collect();
    assert_eq!(cache_count(index), 0);
    // The cache is a LIFO: the last free is the first alloc.
    let reversed: Vec<*mut u8> = ptrs.iter().rev().copied().collect();
    assert_eq!(again, reversed);

    for &p in &again {
        unsafe { root.free(p) };
    }
    purge_own_cache();
}

#[test]
fn s4_cache_count_is_bounded_by_the_limit() {
    let _guard = serialize();
    let root = root();
    let index = root.bucket_index_for_size(100);

    let ptrs: Vec<*mut u8> = (0..1000).map(|_| root.alloc(100, "s4")).collect();
    for &p in &ptrs {
        unsafe { root.free(p) };
    }

    let count = cache_count(index);
    let limit = unsafe { (*ThreadCache::get()).bucket_limit_for_testing(index as usize) };
    assert!(count > 0);
    assert!((count as usize) < 1000);
    assert!(count <= limit);
    purge_own_cache();
}

#[test]
fn large_slots_bypass_the_cache() {
    let _guard = serialize();
    let root = root();
    let p = root.alloc(10_000, "large");
    let index = root.bucket_index_for_size(10_000);
    unsafe { root.free(p) };
    // Either no cache exists yet on this thread, or the bucket stayed empty.
    let tcache = ThreadCache::get();
    if !tcache.is_null() {
        assert_eq!(unsafe { (*tcache).bucket_count_for_testing(index as usize) }, 0);
    }
}

#[test]
fn purge_all_empties_the_calling_thread() {
    let _guard = serialize();
    let root = root();
    let index = root.bucket_index_for_size(64);
    let ptrs: Vec<*mut u8> = (0..8).map(|_| root.alloc(64, "purge")).collect();
    for &p in &ptrs {
        unsafe { root.free(p) };
    }
    assert!(cache_count(index) >= 8);
    ThreadCacheRegistry::instance().purge_all();
    assert_eq!(cache_count(index), 0);
}

#[test]
fn registry_accumulates_stats_across_threads() {
    let _guard = serialize();
    let root = root();
    // Generate traffic here and on a second thread.
    for _ in 0..50 {
        let p = root.alloc(128, "stats");
        unsafe { root.free(p) };
    }
    let root_addr = root as *const PartitionRoot as usize;
    std::thread::spawn(move || {
        let root = unsafe { &*(root_addr as *const PartitionRoot) };
        for _ in 0..50 {
            let p = root.alloc(128, "stats");
            unsafe { root.free(p) };
        }
        let mut stats = ThreadCacheStats::default();
        ThreadCacheRegistry::instance().dump_stats(true, &mut stats);
        assert!(stats.alloc_count >= 50);
    })
    .join()
    .unwrap();

    let mut stats = ThreadCacheStats::default();
    ThreadCacheRegistry::instance().dump_stats(false, &mut stats);
    assert!(stats.alloc_count >= 50);
    assert!(stats.metadata_overhead > 0);
}

#[test]
fn caches_are_per_thread() {
    let _guard = serialize();
    let root = root();
    let index = root.bucket_index_for_size(48);
    let root_addr = root as *const PartitionRoot as usize;

    // Fill this thread's cache for the class.
    let ptrs: Vec<*mut u8> = (0..4).map(|_| root.alloc(48, "tls")).collect();
    for &p in &ptrs {
        unsafe { root.free(p) };
    }
    let local_count = cache_count(index);
    assert!(local_count >= 4);

    std::thread::spawn(move || {
        let root = unsafe { &*(root_addr as *const PartitionRoot) };
        // A fresh thread starts with a fresh cache.
        let p = root.alloc(48, "tls");
        unsafe { root.free(p) };
        let tcache = ThreadCache::get();
        assert!(!tcache.is_null());
    })
    .join()
    .unwrap();

    // The other thread's activity does not drain this thread's cache.
    assert_eq!(cache_count(index), local_count);
    purge_own_cache();
}

#[test]
fn periodic_purge_backs_off_when_idle() {
    let _guard = serialize();
    let root = root();
    // Make sure a cache exists.
    let p = root.alloc(32, "periodic");
    unsafe { root.free(p) };

    // Some traffic, then a purge decision.
    for _ in 0..16 {
        let p = root.alloc(32, "periodic");
        unsafe { root.free(p) };
    }
    let _rearm = ThreadCacheRegistry::instance().periodic_purge();
    // Whatever the decision, the purge itself ran on this thread.
    assert_eq!(cache_count(root.bucket_index_for_size(32)), 0);
}
