//! Per-thread, per-bucket caches of free slots. The hot alloc/free paths hit
//! these without taking the partition lock; the lock is only paid on batched
//! refills and flushes. A process-wide registry chains every live cache for
//! the purge protocols.

use core::cell::Cell;
use core::mem::size_of;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::freelist::FreelistEntry;
use crate::internal::partition_check;
use crate::root::PartitionRoot;
use crate::stats::ThreadCacheStats;
use crate::types::*;

// Slot sizes above this go straight to the root; caching big slots would
// trade too much memory for too few hits.
pub(crate) const TC_SIZE_THRESHOLD: usize = 1024;
const TC_MAX_COUNT_PER_BUCKET: u16 = 128;
// One refill populates limit / ratio entries; filling the whole bucket at
// once would bloat memory and risk fill/clear oscillation.
const TC_BATCH_FILL_RATIO: u16 = 4;

// Threshold of allocation activity under which the periodic purge stops
// rescheduling itself and switches to deallocation-triggered wakeups.
const TC_MIN_ALLOCS_FOR_PURGING: u64 = 1000;

/// Suggested cadence for driving `ThreadCacheRegistry::periodic_purge`.
pub const TC_PURGE_INTERVAL: Duration = Duration::from_secs(1);

const MODE_NORMAL: u8 = 0;
const MODE_PURGE: u8 = 1;
const MODE_NOTIFY_REGISTRY: u8 = 2;

// Only one partition per process may opt into the thread cache; the TLS
// slot is shared.
static HAS_INSTANCE: AtomicBool = AtomicBool::new(false);

#[repr(C)]
struct TcBucket {
    freelist_head: *mut FreelistEntry,
    count: u16,
    limit: u16,
    slot_size: u16,
}

pub struct ThreadCache {
    buckets: [TcBucket; NUM_BUCKETS],
    stats: ThreadCacheStats,
    root: *const PartitionRoot,
    mode: AtomicU8,
    next: *mut ThreadCache,
    prev: *mut ThreadCache,
}

struct ThreadCacheHolder {
    cache: Cell<*mut ThreadCache>,
}

impl Drop for ThreadCacheHolder {
    fn drop(&mut self) {
        let tcache = self.cache.get();
        if !tcache.is_null() {
            self.cache.set(null_mut());
            unsafe { ThreadCache::delete(tcache) };
        }
    }
}

thread_local! {
    static TLS_CACHE: ThreadCacheHolder = const {
        ThreadCacheHolder { cache: Cell::new(null_mut()) }
    };
    // Guards against the TLS runtime allocating re-entrantly while the
    // cache is being built; such allocations skip the cache.
    static CONSTRUCTING: Cell<bool> = const { Cell::new(false) };
}

impl ThreadCache {
    // Claims the process-wide thread-cache slot for `root`.
    pub(crate) fn init(root: &PartitionRoot) {
        partition_check!(
            !root.with_thread_cache.load(Ordering::Relaxed),
            "thread cache initialized twice for one partition"
        );
        partition_check!(
            HAS_INSTANCE
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
            "only one partition is allowed to have a thread cache"
        );
    }

    /// Tears down the calling thread's cache and frees the process-wide
    /// slot, so tests can bring up thread caching on a fresh root.
    pub fn swap_for_testing(root: Option<&PartitionRoot>) {
        unsafe {
            let tcache = Self::get();
            if !tcache.is_null() {
                TLS_CACHE.with(|holder| holder.cache.set(null_mut()));
                Self::delete(tcache);
            }
        }
        HAS_INSTANCE.store(false, Ordering::SeqCst);
        if let Some(root) = root {
            Self::init(root);
            root.with_thread_cache.store(true, Ordering::Release);
        }
    }

    /// The calling thread's cache, or null when none exists yet.
    #[inline]
    pub fn get() -> *mut ThreadCache {
        TLS_CACHE
            .try_with(|holder| holder.cache.get())
            .unwrap_or(null_mut())
    }

    pub(crate) unsafe fn get_or_create(root: &PartitionRoot) -> *mut ThreadCache {
        let existing = Self::get();
        if !existing.is_null() {
            return existing;
        }
        let constructing = CONSTRUCTING.try_with(|c| c.get()).unwrap_or(true);
        if constructing {
            return null_mut();
        }
        CONSTRUCTING.with(|c| c.set(true));
        let tcache = Self::create(root);
        if !tcache.is_null() {
            // Storing into the TLS slot may itself allocate on some
            // platforms, which is why the guard is still up.
            TLS_CACHE.with(|holder| holder.cache.set(tcache));
        }
        CONSTRUCTING.with(|c| c.set(false));
        tcache
    }

    // The cache's own memory comes from the partition it serves, through the
    // raw path: anything else would recurse when this partition backs the
    // process allocator.
    unsafe fn create(root: &PartitionRoot) -> *mut ThreadCache {
        let raw_size = root.adjust_size_add(size_of::<ThreadCache>());
        let index = root.size_to_bucket_index(raw_size);
        let mut utilized_slot_size = 0usize;
        let mut is_already_zeroed = false;
        let slot_start = {
            let mut core = root.lock_core();
            root.alloc_from_bucket_locked(
                &mut core,
                index,
                ALLOC_RETURN_NULL,
                raw_size,
                &mut utilized_slot_size,
                &mut is_already_zeroed,
            )
        };
        if slot_start == 0 {
            return null_mut();
        }
        let tcache = slot_start as *mut ThreadCache;

        let mut buckets: [TcBucket; NUM_BUCKETS] = core::array::from_fn(|_| TcBucket {
            freelist_head: null_mut(),
            count: 0,
            limit: 0,
            slot_size: 0,
        });
        for (i, bucket) in buckets.iter_mut().enumerate() {
            let slot_size = root.bucket_slot_size(i as u16);
            // Invalid (pseudo) classes and anything above the threshold stay
            // at limit 0 and bypass the cache.
            if slot_size % SMALLEST_BUCKET != 0 || slot_size > TC_SIZE_THRESHOLD {
                continue;
            }
            bucket.slot_size = slot_size as u16;
            // Small allocations dominate; cache more of them and fewer of
            // the larger ones to bound the held memory.
            bucket.limit = if slot_size <= 128 {
                TC_MAX_COUNT_PER_BUCKET
            } else if slot_size <= 256 {
                TC_MAX_COUNT_PER_BUCKET / 2
            } else {
                TC_MAX_COUNT_PER_BUCKET / 4
            };
        }

        tcache.write(ThreadCache {
            buckets,
            stats: ThreadCacheStats::default(),
            root: root as *const PartitionRoot,
            mode: AtomicU8::new(MODE_NORMAL),
            next: null_mut(),
            prev: null_mut(),
        });
        ThreadCacheRegistry::instance().register(tcache);
        tcache
    }

    // Runs on thread exit (or a test swap): flush everything back to the
    // root and return the cache's own slot.
    pub(crate) unsafe fn delete(tcache: *mut ThreadCache) {
        ThreadCacheRegistry::instance().unregister(tcache);
        (*tcache).purge();
        let root = &*(*tcache).root;
        let slot_start = tcache as usize;
        let span = span_from_addr(slot_start);
        root.raw_free(slot_start, span);
    }

    /* -----------------------------------------------------------
      Hot paths
    ----------------------------------------------------------- */

    // Returns a slot start, or 0 when the root has to serve the request.
    pub(crate) unsafe fn try_alloc(&mut self, bucket_index: usize) -> usize {
        self.stats.alloc_count += 1;
        if self.buckets[bucket_index].limit == 0 {
            self.stats.alloc_misses += 1;
            self.stats.alloc_miss_too_large += 1;
            return 0;
        }
        if self.buckets[bucket_index].freelist_head.is_null() {
            self.stats.alloc_misses += 1;
            self.stats.alloc_miss_empty += 1;
            self.fill_bucket(bucket_index);
            if self.buckets[bucket_index].freelist_head.is_null() {
                return 0;
            }
        }
        let bucket = &mut self.buckets[bucket_index];
        let entry = bucket.freelist_head;
        bucket.freelist_head = FreelistEntry::get_next(entry);
        bucket.count -= 1;
        self.stats.alloc_hits += 1;
        entry as usize
    }

    // Returns whether the slot was taken by the cache.
    pub(crate) unsafe fn try_free(&mut self, bucket_index: usize, slot_start: usize) -> bool {
        self.stats.cache_fill_count += 1;
        if self.buckets[bucket_index].limit == 0 {
            self.stats.cache_fill_misses += 1;
            return false;
        }
        let bucket = &mut self.buckets[bucket_index];
        let entry = slot_start as *mut FreelistEntry;
        FreelistEntry::set_next(entry, bucket.freelist_head);
        bucket.freelist_head = entry;
        bucket.count += 1;
        self.stats.cache_fill_hits += 1;
        if self.buckets[bucket_index].count > self.buckets[bucket_index].limit {
            // Drain halfway, not fully: clearing the whole bucket invites
            // fill/clear oscillation.
            let limit = self.buckets[bucket_index].limit / 2;
            self.clear_bucket(bucket_index, limit);
        }
        if self.mode.load(Ordering::Relaxed) != MODE_NORMAL {
            self.handle_non_normal_mode();
        }
        true
    }

    /* -----------------------------------------------------------
      Batched traffic with the root
    ----------------------------------------------------------- */

    // Grabs the partition lock once and pulls a quarter of the bucket's
    // capacity. Amortizes the lock, improves locality, and keeps the bucket
    // neither full nor empty. Refills never leave the root's fast path: a
    // fill that would activate a new span does nothing.
    unsafe fn fill_bucket(&mut self, bucket_index: usize) {
        self.stats.batch_fill_count += 1;
        let count = self.buckets[bucket_index].limit / TC_BATCH_FILL_RATIO;
        let raw_size = self.buckets[bucket_index].slot_size as usize;
        let root = &*self.root;
        let mut core = root.lock_core();
        for _ in 0..count {
            let mut utilized_slot_size = 0usize;
            let mut is_already_zeroed = false;
            let slot_start = root.alloc_from_bucket_locked(
                &mut core,
                bucket_index as u16,
                ALLOC_FAST_PATH_OR_RETURN_NULL | ALLOC_RETURN_NULL,
                raw_size,
                &mut utilized_slot_size,
                &mut is_already_zeroed,
            );
            if slot_start == 0 {
                break;
            }
            let bucket = &mut self.buckets[bucket_index];
            let entry = slot_start as *mut FreelistEntry;
            FreelistEntry::set_next(entry, bucket.freelist_head);
            bucket.freelist_head = entry;
            bucket.count += 1;
        }
    }

    unsafe fn clear_bucket(&mut self, bucket_index: usize, limit: u16) {
        if self.buckets[bucket_index].count <= limit {
            return;
        }
        // One lock acquisition for the whole batch; entries of one bucket
        // tend to share cache lines in the root as well.
        let root = &*self.root;
        let mut core = root.lock_core();
        while self.buckets[bucket_index].count > limit {
            let entry = self.buckets[bucket_index].freelist_head;
            debug_assert!(!entry.is_null());
            self.buckets[bucket_index].freelist_head = FreelistEntry::get_next(entry);
            self.buckets[bucket_index].count -= 1;
            root.raw_free_locked(&mut core, entry as usize);
        }
        debug_assert!(self.buckets[bucket_index].count == limit);
    }

    /* -----------------------------------------------------------
      Purge protocols
    ----------------------------------------------------------- */

    fn handle_non_normal_mode(&mut self) {
        match self.mode.load(Ordering::Relaxed) {
            MODE_PURGE => {
                self.purge_internal();
                self.mode.store(MODE_NORMAL, Ordering::Relaxed);
            }
            MODE_NOTIFY_REGISTRY => {
                ThreadCacheRegistry::instance().on_deallocation();
            }
            _ => {}
        }
    }

    // Requested from another thread; the purge itself happens on this
    // cache's own thread at its next deallocation.
    fn set_should_purge(&self) {
        // Do not trample the notification mode, or the periodic purge could
        // starve itself.
        if self.mode.load(Ordering::Relaxed) != MODE_NORMAL {
            return;
        }
        // No urgency and no ordering needed, hence relaxed.
        self.mode.store(MODE_PURGE, Ordering::Relaxed);
    }

    fn set_notifies_registry(&self, enabled: bool) {
        self.mode.store(
            if enabled { MODE_NOTIFY_REGISTRY } else { MODE_NORMAL },
            Ordering::Relaxed,
        );
    }

    /// Returns every cached slot to the root. Runs on the cache's thread.
    pub fn purge(&mut self) {
        self.purge_internal();
    }

    fn purge_internal(&mut self) {
        for i in 0..NUM_BUCKETS {
            unsafe { self.clear_bucket(i, 0) };
        }
    }

    pub(crate) fn accumulate_stats(&self, stats: &mut ThreadCacheStats) {
        stats.alloc_count += self.stats.alloc_count;
        stats.alloc_hits += self.stats.alloc_hits;
        stats.alloc_misses += self.stats.alloc_misses;
        stats.alloc_miss_empty += self.stats.alloc_miss_empty;
        stats.alloc_miss_too_large += self.stats.alloc_miss_too_large;
        stats.cache_fill_count += self.stats.cache_fill_count;
        stats.cache_fill_hits += self.stats.cache_fill_hits;
        stats.cache_fill_misses += self.stats.cache_fill_misses;
        stats.batch_fill_count += self.stats.batch_fill_count;
        for bucket in &self.buckets {
            stats.bucket_total_memory += bucket.count as usize * bucket.slot_size as usize;
        }
        stats.metadata_overhead += size_of::<Self>();
    }

    /// Number of slots currently cached for the size class of `index`.
    pub fn bucket_count_for_testing(&self, index: usize) -> u16 {
        self.buckets[index].count
    }

    /// The configured cap for the size class of `index`.
    pub fn bucket_limit_for_testing(&self, index: usize) -> u16 {
        self.buckets[index].limit
    }
}

/* -----------------------------------------------------------
  Registry
----------------------------------------------------------- */

struct RegistryCore {
    list_head: *mut ThreadCache,
    allocations_at_last_purge: u64,
    deallocations: u64,
}

unsafe impl Send for RegistryCore {}

pub struct ThreadCacheRegistry {
    core: Mutex<RegistryCore>,
}

static REGISTRY: ThreadCacheRegistry = ThreadCacheRegistry {
    core: Mutex::new(RegistryCore {
        list_head: null_mut(),
        allocations_at_last_purge: 0,
        deallocations: 0,
    }),
};

impl ThreadCacheRegistry {
    pub fn instance() -> &'static ThreadCacheRegistry {
        &REGISTRY
    }

    fn register(&self, tcache: *mut ThreadCache) {
        let mut core = self.core.lock();
        unsafe {
            (*tcache).next = null_mut();
            (*tcache).prev = null_mut();
            let previous_head = core.list_head;
            core.list_head = tcache;
            (*tcache).next = previous_head;
            if !previous_head.is_null() {
                (*previous_head).prev = tcache;
            }
        }
    }

    fn unregister(&self, tcache: *mut ThreadCache) {
        let mut core = self.core.lock();
        unsafe {
            if !(*tcache).prev.is_null() {
                (*(*tcache).prev).next = (*tcache).next;
            }
            if !(*tcache).next.is_null() {
                (*(*tcache).next).prev = (*tcache).prev;
            }
            if tcache == core.list_head {
                core.list_head = (*tcache).next;
            }
        }
    }

    /// Accumulates cache counters, either for the calling thread only or
    /// across every registered cache. Cross-thread reads race with the
    /// owning threads; the numbers are for statistics only and need not
    /// balance exactly.
    pub fn dump_stats(&self, my_thread_only: bool, stats: &mut ThreadCacheStats) {
        *stats = ThreadCacheStats::default();
        let core = self.core.lock();
        unsafe {
            if my_thread_only {
                let tcache = ThreadCache::get();
                if tcache.is_null() {
                    return;
                }
                (*tcache).accumulate_stats(stats);
            } else {
                let mut tcache = core.list_head;
                while !tcache.is_null() {
                    (*tcache).accumulate_stats(stats);
                    tcache = (*tcache).next;
                }
            }
        }
    }

    /// Asks every thread to purge its cache at its next deallocation, and
    /// purges the calling thread's cache right away.
    pub fn purge_all(&self) {
        let current_thread_tcache = ThreadCache::get();
        {
            let core = self.core.lock();
            let mut tcache = core.list_head;
            while !tcache.is_null() {
                unsafe {
                    // Cannot purge another thread's cache directly; ask the
                    // owner. A thread that never deallocates again keeps its
                    // cache, which is tolerated.
                    if tcache != current_thread_tcache {
                        (*tcache).set_should_purge();
                    }
                    tcache = (*tcache).next;
                }
            }
        }
        // Possibly slow; run it outside the registry lock.
        if !current_thread_tcache.is_null() {
            unsafe { (*current_thread_tcache).purge() };
        }
    }

    /// Timer-driven purge decision, to be invoked every `TC_PURGE_INTERVAL`
    /// on the thread being monitored. Returns whether the timer should stay
    /// armed: with little allocation traffic the registry switches to
    /// deallocation-triggered notifications instead, and the next burst of
    /// frees re-arms purging.
    pub fn periodic_purge(&self) -> bool {
        let tcache = ThreadCache::get();
        if tcache.is_null() {
            return false;
        }
        let enough_allocations;
        unsafe {
            let allocations = (*tcache).stats.alloc_count;
            let mut core = self.core.lock();
            let since_last_purge = allocations - core.allocations_at_last_purge;
            enough_allocations = since_last_purge >= TC_MIN_ALLOCS_FOR_PURGING;
            if enough_allocations {
                core.allocations_at_last_purge = allocations;
            }
            core.deallocations = 0;
            (*tcache).set_notifies_registry(!enough_allocations);
        }
        self.purge_all();
        enough_allocations
    }

    // A deallocation burst arrived while purging was dormant: stop counting
    // and schedule a purge on this thread.
    pub(crate) fn on_deallocation(&self) {
        let mut core = self.core.lock();
        core.deallocations += 1;
        if core.deallocations > TC_MIN_ALLOCS_FOR_PURGING {
            core.deallocations = 0;
            drop(core);
            let tcache = ThreadCache::get();
            if !tcache.is_null() {
                unsafe {
                    (*tcache).set_notifies_registry(false);
                    (*tcache).set_should_purge();
                }
            }
        }
    }
}
