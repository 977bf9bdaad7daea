//! The partition root: one instance per logical heap partition. It owns the
//! bucket array, the size lookup tables, the super-page cursor and extent
//! list, the direct-map list, the empty-span ring, and the bookkeeping
//! counters, all guarded by a single lock. The public allocation surface
//! lives here.

use core::mem::size_of;
use core::ptr::null_mut;

use parking_lot::{Mutex, MutexGuard};

use crate::bucket;
use crate::direct_map;
use crate::hooks;
use crate::internal::{fill_bytes, partition_check};
use crate::oom::partition_excessive_allocation_size;
use crate::os;
use crate::page;
use crate::pcscan;
use crate::stats::{BucketMemoryStats, MemoryStats, PartitionStatsDumper};
use crate::thread_cache::{self, ThreadCache};
use crate::types::*;

/* -----------------------------------------------------------
  Configuration
----------------------------------------------------------- */

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Alignment {
    Regular,
    /// Slots carry no extras, so power-of-two size classes are naturally
    /// aligned and `aligned_alloc` works.
    AlignedAllocCapable,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadCacheMode {
    Disabled,
    Enabled,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QuarantineMode {
    Disallowed,
    /// Super pages reserve room for quarantine bitmaps; freeing switches to
    /// the quarantine once the partition registers with the scanner.
    Allowed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CookiesMode {
    Disallowed,
    Allowed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RefCountMode {
    Disabled,
    Enabled,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConfigurablePoolMode {
    No,
    IfAvailable,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemoryTaggingMode {
    Disabled,
    Enabled,
}

#[derive(Clone, Copy, Debug)]
pub struct PartitionOptions {
    pub alignment: Alignment,
    pub thread_cache: ThreadCacheMode,
    pub quarantine: QuarantineMode,
    pub cookies: CookiesMode,
    pub ref_count: RefCountMode,
    pub use_configurable_pool: ConfigurablePoolMode,
    pub memory_tagging: MemoryTaggingMode,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        PartitionOptions {
            alignment: Alignment::Regular,
            thread_cache: ThreadCacheMode::Disabled,
            quarantine: QuarantineMode::Disallowed,
            cookies: CookiesMode::Allowed,
            ref_count: RefCountMode::Disabled,
            use_configurable_pool: ConfigurablePoolMode::No,
            memory_tagging: MemoryTaggingMode::Disabled,
        }
    }
}

/* -----------------------------------------------------------
  Root state
----------------------------------------------------------- */

/// Mutable allocator state, guarded by the partition lock.
pub struct RootCore {
    pub(crate) total_size_of_committed_pages: usize,
    pub(crate) total_size_of_super_pages: usize,
    pub(crate) total_size_of_direct_mapped_pages: usize,
    // Super-page allocation cursor.
    pub(crate) next_super_page: usize,
    pub(crate) next_partition_page: usize,
    pub(crate) next_partition_page_end: usize,
    pub(crate) current_extent: *mut SuperPageExtentEntry,
    pub(crate) first_extent: *mut SuperPageExtentEntry,
    pub(crate) direct_map_list: *mut DirectMapExtent,
    pub(crate) global_empty_span_ring: [*mut SlotSpan; MAX_FREEABLE_SPANS],
    pub(crate) global_empty_span_ring_index: usize,
    pub(crate) buckets: Box<[Bucket; NUM_BUCKETS]>,
}

// The raw metadata pointers all target memory owned by this root; the lock
// provides the synchronization.
unsafe impl Send for RootCore {}

pub struct PartitionRoot {
    pub(crate) initialized: bool,
    /// Bitwise complement of this root's own address; consulted whenever a
    /// root is derived from an alleged metadata record.
    pub inverted_self: usize,
    pub(crate) quarantine_allowed: bool,
    pub(crate) allow_aligned_alloc: bool,
    pub(crate) use_cookies: bool,
    // Per-slot overhead and the user-data offset inside a slot.
    pub(crate) extras_size: u32,
    pub(crate) extras_offset: u32,
    pub(crate) with_thread_cache: core::sync::atomic::AtomicBool,
    pub(crate) with_quarantine: core::sync::atomic::AtomicBool,
    // Precomputed size-class tables.
    order_index_shifts: [usize; BITS_PER_SIZE_T + 1],
    order_sub_index_masks: [usize; BITS_PER_SIZE_T + 1],
    bucket_lookups: [u16; BUCKET_LOOKUP_LEN],
    // Base address of the bucket array, for lock-free reads of the
    // immutable bucket fields.
    buckets_base: usize,
    pub(crate) core: Mutex<RootCore>,
}

/* -----------------------------------------------------------
  Committed-page accounting
----------------------------------------------------------- */

pub(crate) fn increase_committed_pages(core: &mut RootCore, len: usize) {
    core.total_size_of_committed_pages += len;
    debug_assert!(
        core.total_size_of_committed_pages
            <= core.total_size_of_super_pages + core.total_size_of_direct_mapped_pages
    );
}

pub(crate) fn decrease_committed_pages(core: &mut RootCore, len: usize) {
    debug_assert!(core.total_size_of_committed_pages >= len);
    core.total_size_of_committed_pages -= len;
}

pub(crate) unsafe fn decommit_system_pages(core: &mut RootCore, addr: usize, len: usize) {
    os::decommit(addr, len);
    decrease_committed_pages(core, len);
}

pub(crate) unsafe fn recommit_system_pages(core: &mut RootCore, addr: usize, len: usize) {
    partition_check!(
        os::recommit(addr, len, os::PageAccess::ReadWrite),
        "recommit of {} bytes at {:#x} failed",
        len,
        addr
    );
    increase_committed_pages(core, len);
}

/* -----------------------------------------------------------
  Initialization
----------------------------------------------------------- */

impl PartitionRoot {
    pub fn new(opts: PartitionOptions) -> Box<PartitionRoot> {
        global_init_once();

        let aligned = opts.alignment == Alignment::AlignedAllocCapable;
        let cookies = opts.cookies == CookiesMode::Allowed;
        let ref_count = opts.ref_count == RefCountMode::Enabled;
        let configurable_pool = opts.use_configurable_pool == ConfigurablePoolMode::IfAvailable;
        partition_check!(
            !(aligned && (cookies || ref_count)),
            "aligned allocation is incompatible with cookies and reference counts"
        );
        partition_check!(
            !(opts.memory_tagging == MemoryTaggingMode::Enabled && configurable_pool),
            "memory tagging is incompatible with the configurable pool"
        );
        partition_check!(
            !(ref_count && configurable_pool),
            "reference counts cannot live in the configurable pool"
        );

        let use_cookies = cookies && cfg!(debug_assertions);
        let mut extras_size = 0usize;
        let mut extras_offset = 0usize;
        if use_cookies {
            extras_size += 2 * COOKIE_SIZE;
            extras_offset += COOKIE_SIZE;
        }
        if ref_count {
            // The reference count lives at the end of the slot.
            extras_size += size_of::<u64>();
        }

        // Shift and mask tables for the constant-time size -> order-index
        // computation. Example: a request of 41 == 0b101001 has order 6; the
        // order index is the next three bits (0b010 == 2); the sub-order
        // mask selects the remaining low bits that bump to the next class.
        let mut order_index_shifts = [0usize; BITS_PER_SIZE_T + 1];
        let mut order_sub_index_masks = [0usize; BITS_PER_SIZE_T + 1];
        for order in 0..=BITS_PER_SIZE_T {
            order_index_shifts[order] = if order < NUM_BUCKETS_PER_ORDER_BITS + 1 {
                0
            } else {
                order - (NUM_BUCKETS_PER_ORDER_BITS + 1)
            };
            order_sub_index_masks[order] = if order == BITS_PER_SIZE_T {
                // Shifting by the full width is undefined.
                usize::MAX >> (NUM_BUCKETS_PER_ORDER_BITS + 1)
            } else {
                ((1usize << order) - 1) >> (NUM_BUCKETS_PER_ORDER_BITS + 1)
            };
        }

        // The usable buckets. Typical parameters produce pseudo buckets
        // (sizes that are not a multiple of the smallest class); they are
        // tolerated to keep the lookup uniform but marked invalid so that
        // allocating from one faults.
        const EMPTY_BUCKET: Bucket = Bucket::sentinel();
        let mut buckets = Box::new([EMPTY_BUCKET; NUM_BUCKETS]);
        let mut current_size = SMALLEST_BUCKET;
        let mut current_increment = SMALLEST_BUCKET >> NUM_BUCKETS_PER_ORDER_BITS;
        let mut i = 0;
        for _order in 0..NUM_BUCKETED_ORDERS {
            for _j in 0..NUM_BUCKETS_PER_ORDER {
                bucket::bucket_init(&mut buckets[i], current_size);
                if current_size % SMALLEST_BUCKET != 0 {
                    buckets[i].active_head = null_mut();
                }
                current_size += current_increment;
                i += 1;
            }
            current_increment <<= 1;
        }
        debug_assert!(current_size == 1 << MAX_BUCKETED_ORDER);
        debug_assert!(i == NUM_BUCKETS);

        // The flat size -> bucket lookup table.
        let mut bucket_lookups = [SENTINEL_BUCKET_INDEX; BUCKET_LOOKUP_LEN];
        let mut lookup_pos = 0;
        let mut bucket_index = 0usize;
        for order in 0..=BITS_PER_SIZE_T {
            for _j in 0..NUM_BUCKETS_PER_ORDER {
                if order < MIN_BUCKETED_ORDER {
                    // The finest bucket covers malloc(0) and tiny sizes.
                    bucket_lookups[lookup_pos] = 0;
                } else if order > MAX_BUCKETED_ORDER {
                    bucket_lookups[lookup_pos] = SENTINEL_BUCKET_INDEX;
                } else {
                    let mut valid = bucket_index;
                    while buckets[valid].slot_size as usize % SMALLEST_BUCKET != 0 {
                        valid += 1;
                    }
                    bucket_lookups[lookup_pos] = valid as u16;
                    bucket_index += 1;
                }
                lookup_pos += 1;
            }
        }
        debug_assert!(bucket_index == NUM_BUCKETS);
        debug_assert!(lookup_pos == BUCKET_LOOKUP_LEN - 1);
        // The trailing entry catches sizes that overflow to a non-existent
        // order, e.g. malloc(-1).
        bucket_lookups[lookup_pos] = SENTINEL_BUCKET_INDEX;

        let buckets_base = buckets.as_ptr() as usize;
        let core = RootCore {
            total_size_of_committed_pages: 0,
            total_size_of_super_pages: 0,
            total_size_of_direct_mapped_pages: 0,
            next_super_page: 0,
            next_partition_page: 0,
            next_partition_page_end: 0,
            current_extent: null_mut(),
            first_extent: null_mut(),
            direct_map_list: null_mut(),
            global_empty_span_ring: [null_mut(); MAX_FREEABLE_SPANS],
            global_empty_span_ring_index: 0,
            buckets,
        };

        let mut root = Box::new(PartitionRoot {
            initialized: true,
            inverted_self: 0,
            quarantine_allowed: opts.quarantine == QuarantineMode::Allowed,
            allow_aligned_alloc: aligned,
            use_cookies,
            extras_size: extras_size as u32,
            extras_offset: extras_offset as u32,
            with_thread_cache: core::sync::atomic::AtomicBool::new(false),
            with_quarantine: core::sync::atomic::AtomicBool::new(false),
            order_index_shifts,
            order_sub_index_masks,
            bucket_lookups,
            buckets_base,
            core: Mutex::new(core),
        });
        root.inverted_self = !(&*root as *const PartitionRoot as usize);

        if opts.thread_cache == ThreadCacheMode::Enabled {
            ThreadCache::init(&root);
            // Publish only once the TLS key and registry are ready: a thread
            // observing the flag must also observe a usable cache setup.
            root.with_thread_cache
                .store(true, core::sync::atomic::Ordering::Release);
        }
        root
    }

    #[inline]
    pub(crate) fn lock_core(&self) -> MutexGuard<'_, RootCore> {
        self.core.lock()
    }

    #[inline]
    pub(crate) fn scan_mode(&self) -> bool {
        self.with_quarantine
            .load(core::sync::atomic::Ordering::Relaxed)
    }

    // Turns quarantined freeing on. Commits the bitmap areas of all existing
    // super pages first; holding the lock across both steps keeps new super
    // pages from slipping through uncommitted.
    pub(crate) fn enable_quarantine(&self) {
        partition_check!(
            self.quarantine_allowed,
            "partition was not configured for quarantine"
        );
        let mut core = self.core.lock();
        if self.scan_mode() {
            return;
        }
        unsafe {
            let mut extent = core.first_extent;
            while !extent.is_null() {
                let base = (*extent).super_page_base;
                let count = (*extent).num_consecutive_super_pages as usize;
                let next = (*extent).next;
                for i in 0..count {
                    let super_page = base + i * SUPER_PAGE_SIZE;
                    recommit_system_pages(
                        &mut core,
                        super_page + PARTITION_PAGE_SIZE,
                        QUARANTINE_AREA_SIZE,
                    );
                }
                extent = next;
            }
        }
        self.with_quarantine
            .store(true, core::sync::atomic::Ordering::Release);
    }

    /* -----------------------------------------------------------
      Size classes and extras
    ----------------------------------------------------------- */

    #[inline]
    pub(crate) fn size_to_bucket_index(&self, size: usize) -> u16 {
        let order = BITS_PER_SIZE_T - size.leading_zeros() as usize;
        let order_index =
            (size >> self.order_index_shifts[order]) & (NUM_BUCKETS_PER_ORDER - 1);
        let sub_order_index = size & self.order_sub_index_masks[order];
        let index = self.bucket_lookups[(order << NUM_BUCKETS_PER_ORDER_BITS)
            + order_index
            + (sub_order_index != 0) as usize];
        debug_assert!(
            index == SENTINEL_BUCKET_INDEX || self.bucket_slot_size(index) >= size
        );
        debug_assert!(
            index == SENTINEL_BUCKET_INDEX
                || self.bucket_slot_size(index) % SMALLEST_BUCKET == 0
        );
        index
    }

    #[inline]
    pub(crate) fn bucket_slot_size(&self, index: u16) -> usize {
        debug_assert!((index as usize) < NUM_BUCKETS);
        unsafe {
            (*(self.buckets_base as *const Bucket).add(index as usize)).slot_size as usize
        }
    }

    #[inline]
    pub(crate) fn bucket_index_of(&self, bucket: *const Bucket) -> u16 {
        let index = (bucket as usize - self.buckets_base) / size_of::<Bucket>();
        debug_assert!(index < NUM_BUCKETS);
        index as u16
    }

    #[inline]
    pub(crate) fn adjust_size_add(&self, size: usize) -> usize {
        let adjusted = size + self.extras_size as usize;
        debug_assert!(adjusted >= size);
        adjusted
    }

    #[inline]
    pub(crate) fn adjust_size_subtract(&self, size: usize) -> usize {
        debug_assert!(size >= self.extras_size as usize);
        size - self.extras_size as usize
    }

    #[inline]
    pub(crate) fn adjust_pointer_for_extras_add(&self, slot_start: usize) -> usize {
        slot_start + self.extras_offset as usize
    }

    #[inline]
    pub(crate) fn adjust_pointer_for_extras_subtract(&self, ptr: usize) -> usize {
        ptr - self.extras_offset as usize
    }

    /* -----------------------------------------------------------
      Allocation
    ----------------------------------------------------------- */

    /// Allocates `size` bytes. On exhaustion the OOM handler runs and the
    /// process goes down; use `alloc_flags` with `ALLOC_RETURN_NULL` for a
    /// null-returning variant.
    #[inline]
    pub fn alloc(&self, size: usize, type_name: &'static str) -> *mut u8 {
        self.alloc_flags(0, size, type_name)
    }

    pub fn alloc_flags(&self, flags: u32, size: usize, type_name: &'static str) -> *mut u8 {
        let no_hooks = flags & ALLOC_NO_HOOKS != 0;
        if !no_hooks {
            let mut overridden: *mut u8 = null_mut();
            if hooks::allocation_override_if_enabled(&mut overridden, flags, size, type_name) {
                // The override serviced the call; observers are skipped.
                return overridden;
            }
        }
        let ret = self.alloc_no_hooks(flags, size);
        if !no_hooks && !ret.is_null() {
            hooks::allocation_observer_if_enabled(ret, size, type_name);
        }
        ret
    }

    pub(crate) fn alloc_no_hooks(&self, flags: u32, size: usize) -> *mut u8 {
        debug_assert!(self.initialized);
        let raw_size = self.adjust_size_add(size);
        let index = self.size_to_bucket_index(raw_size);
        let mut utilized_slot_size = 0usize;
        let mut is_already_zeroed = false;
        let mut slot_start = 0usize;

        if index != SENTINEL_BUCKET_INDEX
            && self
                .with_thread_cache
                .load(core::sync::atomic::Ordering::Acquire)
            && self.bucket_slot_size(index) <= thread_cache::TC_SIZE_THRESHOLD
        {
            unsafe {
                let tcache = ThreadCache::get_or_create(self);
                if !tcache.is_null() {
                    slot_start = (*tcache).try_alloc(index as usize);
                    if slot_start != 0 {
                        utilized_slot_size = self.bucket_slot_size(index);
                    }
                }
            }
        }

        if slot_start == 0 {
            if self.quarantine_allowed {
                pcscan::join_scan_if_needed(self);
            }
            let mut core = self.core.lock();
            slot_start = unsafe {
                self.alloc_from_bucket_locked(
                    &mut core,
                    index,
                    flags,
                    raw_size,
                    &mut utilized_slot_size,
                    &mut is_already_zeroed,
                )
            };
            if slot_start == 0 {
                return null_mut();
            }
        }

        unsafe {
            let user_ptr = self.adjust_pointer_for_extras_add(slot_start);
            let usable_size = utilized_slot_size - self.extras_size as usize;
            if flags & ALLOC_ZERO_FILL != 0 {
                if !is_already_zeroed {
                    fill_bytes(user_ptr, 0, usable_size);
                }
            } else {
                #[cfg(debug_assertions)]
                fill_bytes(user_ptr, UNINITIALIZED_BYTE, usable_size);
            }
            #[cfg(debug_assertions)]
            if self.use_cookies {
                page::cookie_write_value(slot_start);
                page::cookie_write_value(slot_start + COOKIE_SIZE + usable_size);
            }
            user_ptr as *mut u8
        }
    }

    // The two-branch fast path: the bucket's active span either has a
    // freelist entry or the slow path takes over. Caller holds the lock.
    pub(crate) unsafe fn alloc_from_bucket_locked(
        &self,
        core: &mut RootCore,
        index: u16,
        flags: u32,
        raw_size: usize,
        utilized_slot_size: &mut usize,
        is_already_zeroed: &mut bool,
    ) -> usize {
        let bucket: *mut Bucket = if index == SENTINEL_BUCKET_INDEX {
            sentinel_bucket()
        } else {
            core.buckets.as_mut_ptr().add(index as usize)
        };
        let span = (*bucket).active_head;
        // Neither full nor freed.
        debug_assert!((*span).num_allocated_slots >= 0);
        let entry = (*span).freelist_head;
        if !entry.is_null() {
            // A firing assert here usually means corrupted memory.
            debug_assert!(span_pointer_is_valid(span));
            // Large allocations go through the slow path, which maintains
            // the raw size.
            debug_assert!(span_get_raw_size(span) == 0);
            let new_head = crate::freelist::FreelistEntry::get_next(entry);
            #[cfg(debug_assertions)]
            {
                let payload = span_to_slot_span_start(span);
                let bytes = (*(*span).bucket).bytes_per_span();
                debug_assert!(
                    new_head.is_null()
                        || ((new_head as usize) >= payload
                            && (new_head as usize) < payload + bytes),
                    "freelist corruption in bucket of slot size {}",
                    (*bucket).slot_size
                );
            }
            (*span).freelist_head = new_head;
            (*span).num_allocated_slots += 1;
            *utilized_slot_size = (*bucket).slot_size as usize;
            *is_already_zeroed = false;
            entry as usize
        } else {
            let slot_start =
                bucket::slow_path_alloc(self, core, bucket, flags, raw_size, is_already_zeroed);
            if slot_start == 0 {
                return 0;
            }
            let span = span_from_addr_no_alignment_check(slot_start);
            debug_assert!(span_pointer_is_valid(span));
            let span_raw_size = span_get_raw_size(span);
            *utilized_slot_size = if span_raw_size != 0 {
                span_raw_size
            } else {
                (*(*span).bucket).slot_size as usize
            };
            slot_start
        }
    }

    /* -----------------------------------------------------------
      Free
    ----------------------------------------------------------- */

    /// Frees `ptr`. Null is a no-op. The pointer must come from this
    /// partition's alloc/realloc and not have been freed since; violations
    /// are detected on a best-effort basis and crash.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if hooks::free_override_if_enabled(ptr) {
            return;
        }
        hooks::free_observer_if_enabled(ptr);
        self.free_no_hooks(ptr);
    }

    pub(crate) unsafe fn free_no_hooks(&self, ptr: *mut u8) {
        debug_assert!(self.initialized);
        let slot_start = self.adjust_pointer_for_extras_subtract(ptr as usize);
        let span = span_from_addr(slot_start);
        partition_check!(
            span_pointer_is_valid(span),
            "wild pointer passed to free: {:p}",
            ptr
        );
        debug_assert!(root_from_span(span) as *const PartitionRoot == self as *const _);

        #[cfg(debug_assertions)]
        if self.use_cookies {
            let mut utilized = (*(*span).bucket).slot_size as usize;
            let raw_size = span_get_raw_size(span);
            if raw_size != 0 {
                utilized = raw_size;
            }
            page::cookie_check_value(slot_start);
            page::cookie_check_value(slot_start + utilized - COOKIE_SIZE);
        }

        // Quarantined partitions defer the real free until a scan proves
        // the slot unreachable. Direct maps are not quarantined.
        if self.quarantine_allowed
            && self
                .with_quarantine
                .load(core::sync::atomic::Ordering::Acquire)
            && !(*(*span).bucket).is_direct_mapped()
        {
            pcscan::quarantine_on_free(self, span, slot_start);
            return;
        }

        self.free_no_hooks_immediate(slot_start, span);
    }

    pub(crate) unsafe fn free_no_hooks_immediate(&self, slot_start: usize, span: *mut SlotSpan) {
        let bucket = (*span).bucket;
        if self
            .with_thread_cache
            .load(core::sync::atomic::Ordering::Acquire)
            && !(*bucket).is_direct_mapped()
            && (*bucket).slot_size as usize <= thread_cache::TC_SIZE_THRESHOLD
        {
            let tcache = ThreadCache::get();
            if !tcache.is_null() {
                let index = self.bucket_index_of(bucket);
                if (*tcache).try_free(index as usize, slot_start) {
                    return;
                }
            }
        }
        self.raw_free(slot_start, span);
    }

    // Free without hooks, cookies, or caching: the quarantine sweeper and
    // the thread cache flush land here.
    pub(crate) unsafe fn raw_free(&self, slot_start: usize, span: *mut SlotSpan) {
        if self.quarantine_allowed {
            pcscan::join_scan_if_needed(self);
        }
        let mut core = self.core.lock();
        page::free_locked(&mut core, span, slot_start);
    }

    pub(crate) unsafe fn raw_free_locked(&self, core: &mut RootCore, slot_start: usize) {
        let span = span_from_addr(slot_start);
        page::free_locked(core, span, slot_start);
    }

    /* -----------------------------------------------------------
      Realloc
    ----------------------------------------------------------- */

    pub unsafe fn realloc(
        &self,
        ptr: *mut u8,
        new_size: usize,
        type_name: &'static str,
    ) -> *mut u8 {
        self.realloc_flags(0, ptr, new_size, type_name)
    }

    pub unsafe fn realloc_flags(
        &self,
        flags: u32,
        ptr: *mut u8,
        new_size: usize,
        type_name: &'static str,
    ) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc_flags(flags, new_size, type_name);
        }
        if new_size == 0 {
            self.free(ptr);
            return null_mut();
        }
        if new_size > MAX_DIRECT_MAPPED {
            if flags & ALLOC_RETURN_NULL != 0 {
                return null_mut();
            }
            partition_excessive_allocation_size(new_size);
        }

        let no_hooks = flags & ALLOC_NO_HOOKS != 0;
        let mut overridden_size = 0usize;
        let overridden =
            !no_hooks && hooks::realloc_override_if_enabled(&mut overridden_size, ptr);

        if !overridden {
            let slot_start = self.adjust_pointer_for_extras_subtract(ptr as usize);
            let span = span_from_addr(slot_start);
            debug_assert!(span_pointer_is_valid(span));

            if (*(*span).bucket).is_direct_mapped() {
                // Page-level tricks may satisfy the resize without moving.
                let in_place = {
                    let mut core = self.core.lock();
                    direct_map::realloc_in_place(self, &mut core, span, new_size)
                };
                if in_place {
                    if !no_hooks {
                        hooks::realloc_observer_if_enabled(ptr, ptr, new_size, type_name);
                    }
                    return ptr;
                }
            } else {
                let actual_new_size = self.actual_size(new_size);
                let actual_old_size = self.get_size(ptr);
                if actual_new_size == actual_old_size {
                    // Same bucket: keep the allocation, refresh the size
                    // bookkeeping and the trailing cookie.
                    let raw_size = self.adjust_size_add(new_size);
                    {
                        let mut _core = self.core.lock();
                        span_set_raw_size(span, raw_size);
                    }
                    #[cfg(debug_assertions)]
                    if self.use_cookies {
                        page::cookie_write_value(ptr as usize + new_size);
                    }
                    return ptr;
                }
            }
        }

        // No in-place option left; move the data.
        let ret = self.alloc_flags(flags, new_size, type_name);
        if ret.is_null() {
            debug_assert!(flags & ALLOC_RETURN_NULL != 0);
            return null_mut();
        }
        let old_usable_size = if overridden {
            overridden_size
        } else {
            self.get_size(ptr)
        };
        let copy_size = core::cmp::min(old_usable_size, new_size);
        core::ptr::copy_nonoverlapping(ptr, ret, copy_size);
        self.free(ptr);
        ret
    }

    /* -----------------------------------------------------------
      Aligned allocation
    ----------------------------------------------------------- */

    pub fn aligned_alloc(&self, alignment: usize, size: usize) -> *mut u8 {
        self.aligned_alloc_flags(0, alignment, size)
    }

    // Power-of-two size classes are naturally aligned to their size, so a
    // request gets bumped to the smallest such class that satisfies the
    // alignment. Only works on partitions carrying no extras.
    pub fn aligned_alloc_flags(&self, flags: u32, alignment: usize, size: usize) -> *mut u8 {
        partition_check!(alignment.is_power_of_two(), "alignment must be a power of two");
        partition_check!(
            self.allow_aligned_alloc,
            "partition is not configured for aligned allocation"
        );
        debug_assert!(self.extras_size == 0 && self.extras_offset == 0);

        let mut requested_size = size;
        if alignment > ALLOCATION_GRANULARITY {
            // Slot spans start on partition page boundaries, which is the
            // hardest natural alignment available.
            partition_check!(
                alignment <= PARTITION_PAGE_SIZE,
                "unsupported alignment {}",
                alignment
            );
            requested_size = core::cmp::max(size, alignment);
            if !requested_size.is_power_of_two() {
                requested_size = requested_size.next_power_of_two();
            }
        }

        let ptr = self.alloc_flags(flags, requested_size, "");
        debug_assert!(ptr as usize % alignment == 0);
        ptr
    }

    /* -----------------------------------------------------------
      Size introspection
    ----------------------------------------------------------- */

    /// The slot size that a request of `size` bytes would occupy.
    pub fn actual_size(&self, size: usize) -> usize {
        debug_assert!(self.initialized);
        let raw_size = self.adjust_size_add(size);
        let index = self.size_to_bucket_index(raw_size);
        let result = if index != SENTINEL_BUCKET_INDEX {
            self.bucket_slot_size(index)
        } else if raw_size > MAX_DIRECT_MAPPED {
            // Too large to allocate; report the size unchanged.
            raw_size
        } else {
            direct_map::direct_map_size(raw_size)
        };
        self.adjust_size_subtract(result)
    }

    /// User-visible size of the allocation `ptr`.
    pub unsafe fn get_size(&self, ptr: *mut u8) -> usize {
        let slot_start = self.adjust_pointer_for_extras_subtract(ptr as usize);
        let span = span_from_addr(slot_start);
        debug_assert!(span_pointer_is_valid(span));
        self.adjust_size_subtract((*(*span).bucket).slot_size as usize)
    }

    /* -----------------------------------------------------------
      Purging
    ----------------------------------------------------------- */

    pub fn purge_memory(&self, flags: u32) {
        let mut core = self.core.lock();
        // The shared sentinel must never have been written through.
        debug_assert!(unsafe { (*sentinel_slot_span()).num_allocated_slots } == 0);
        unsafe {
            if flags & PURGE_DECOMMIT_EMPTY_SLOT_SPANS != 0 {
                page::decommit_empty_spans(&mut core);
            }
            if flags & PURGE_DISCARD_UNUSED_SYSTEM_PAGES != 0 {
                for i in 0..NUM_BUCKETS {
                    let bucket = core.buckets.as_mut_ptr().add(i);
                    // Discarding only helps once a slot straddles a page.
                    if (*bucket).slot_size as usize >= SYSTEM_PAGE_SIZE {
                        page::purge_bucket(bucket);
                    }
                }
            }
        }
    }

    /* -----------------------------------------------------------
      Statistics
    ----------------------------------------------------------- */

    pub fn dump_stats(
        &self,
        partition_name: &str,
        is_light_dump: bool,
        dumper: &mut dyn PartitionStatsDumper,
    ) {
        let mut stats = MemoryStats::default();
        let mut bucket_stats = vec![BucketMemoryStats::default(); NUM_BUCKETS];
        let mut direct_map_lengths = Vec::new();
        let mut direct_mapped_allocations_total_size = 0usize;

        {
            let core = self.core.lock();
            stats.total_mmapped_bytes =
                core.total_size_of_super_pages + core.total_size_of_direct_mapped_pages;
            stats.total_committed_bytes = core.total_size_of_committed_pages;

            unsafe {
                for i in 0..NUM_BUCKETS {
                    let bucket = &core.buckets[i] as *const Bucket;
                    // Pseudo buckets are skipped; they keep the size lookup
                    // uniform but never hold memory.
                    if (*bucket).active_head.is_null() {
                        bucket_stats[i].is_valid = false;
                    } else {
                        dump_bucket_stats(&mut bucket_stats[i], bucket);
                    }
                    if bucket_stats[i].is_valid {
                        stats.total_resident_bytes += bucket_stats[i].resident_bytes;
                        stats.total_active_bytes += bucket_stats[i].active_bytes;
                        stats.total_decommittable_bytes += bucket_stats[i].decommittable_bytes;
                        stats.total_discardable_bytes += bucket_stats[i].discardable_bytes;
                    }
                }

                let mut extent = core.direct_map_list;
                while !extent.is_null() {
                    debug_assert!(
                        (*extent).next_extent.is_null()
                            || (*(*extent).next_extent).prev_extent == extent
                    );
                    let slot_size = (*(*extent).bucket).slot_size as usize;
                    direct_mapped_allocations_total_size += slot_size;
                    if !is_light_dump {
                        direct_map_lengths.push(slot_size);
                    }
                    extent = (*extent).next_extent;
                }
            }
        }

        // The dumper may allocate from this very partition, so it runs
        // outside the lock.
        if !is_light_dump {
            for bucket_stat in bucket_stats.iter().filter(|s| s.is_valid) {
                dumper.partition_dump_bucket_stats(partition_name, bucket_stat);
            }
            for length in &direct_map_lengths {
                let direct_stats = BucketMemoryStats {
                    is_valid: true,
                    is_direct_map: true,
                    bucket_slot_size: *length,
                    allocated_slot_span_size: *length,
                    active_bytes: *length,
                    resident_bytes: *length,
                    num_full_slot_spans: 1,
                    ..Default::default()
                };
                dumper.partition_dump_bucket_stats(partition_name, &direct_stats);
            }
        }

        stats.total_resident_bytes += direct_mapped_allocations_total_size;
        stats.total_active_bytes += direct_mapped_allocations_total_size;
        dumper.partition_dump_totals(partition_name, &stats);
    }

    /// Committed bytes, for tests and monitoring.
    pub fn total_size_of_committed_pages(&self) -> usize {
        self.core.lock().total_size_of_committed_pages
    }

    /// Size class index that a pointer's slot belongs to.
    pub unsafe fn bucket_index_of_pointer(&self, ptr: *mut u8) -> u16 {
        let slot_start = self.adjust_pointer_for_extras_subtract(ptr as usize);
        let span = span_from_addr(slot_start);
        debug_assert!(span_pointer_is_valid(span));
        self.bucket_index_of((*span).bucket)
    }

    /// Size class index serving requests of `size` user bytes.
    pub fn bucket_index_for_size(&self, size: usize) -> u16 {
        self.size_to_bucket_index(self.adjust_size_add(size))
    }

    /// Walks every bucket list and checks the structural invariants: list
    /// membership matches span state, spans point back at their bucket, and
    /// each freelist is slot-aligned, in-span, and exactly as long as the
    /// slot accounting says it must be.
    pub fn verify_integrity(&self) {
        let core = self.core.lock();
        unsafe {
            for i in 0..NUM_BUCKETS {
                let bucket = &core.buckets[i] as *const Bucket;
                if (*bucket).active_head.is_null() {
                    continue; // pseudo bucket
                }
                if (*bucket).active_head != sentinel_slot_span() {
                    let mut span = (*bucket).active_head;
                    while !span.is_null() {
                        verify_span_integrity(bucket, span);
                        span = (*span).next_span;
                    }
                }
                let mut span = (*bucket).empty_head;
                while !span.is_null() {
                    verify_span_integrity(bucket, span);
                    span = (*span).next_span;
                }
                let mut span = (*bucket).decommitted_head;
                while !span.is_null() {
                    verify_span_integrity(bucket, span);
                    assert!(span_is_decommitted(span));
                    span = (*span).next_span;
                }
            }
        }
    }

    /// Reserved bytes (super pages plus direct maps).
    pub fn total_size_of_reserved_pages(&self) -> usize {
        let core = self.core.lock();
        core.total_size_of_super_pages + core.total_size_of_direct_mapped_pages
    }
}

unsafe fn verify_span_integrity(bucket: *const Bucket, span: *mut SlotSpan) {
    assert!((*span).bucket as *const Bucket == bucket);
    assert!((*span).page_offset == 0);
    let payload = span_to_slot_span_start(span);
    let slot_size = (*bucket).slot_size as usize;
    let bytes_per_span = (*bucket).bytes_per_span();
    let mut freelist_len = 0usize;
    let mut entry = (*span).freelist_head;
    while !entry.is_null() {
        let addr = entry as usize;
        assert!(addr >= payload && addr < payload + bytes_per_span);
        assert!((addr - payload) % slot_size == 0);
        freelist_len += 1;
        assert!(freelist_len <= (*bucket).slots_per_span() as usize);
        entry = crate::freelist::FreelistEntry::get_next(entry);
    }
    let allocated = (*span).num_allocated_slots.unsigned_abs() as usize;
    assert_eq!(
        allocated + (*span).num_unprovisioned_slots as usize + freelist_len,
        (*bucket).slots_per_span() as usize
    );
}

unsafe fn dump_span_stats(stats_out: &mut BucketMemoryStats, span: *mut SlotSpan) {
    let bucket_num_slots = (*(*span).bucket).slots_per_span() as usize;

    if span_is_decommitted(span) {
        stats_out.num_decommitted_slot_spans += 1;
        return;
    }

    stats_out.discardable_bytes += page::purge_span(span, false);

    let raw_size = span_get_raw_size(span);
    if raw_size != 0 {
        stats_out.active_bytes += raw_size;
    } else {
        stats_out.active_bytes +=
            (*span).num_allocated_slots as usize * stats_out.bucket_slot_size;
    }

    let span_bytes_resident = round_up_to_system_page(
        (bucket_num_slots - (*span).num_unprovisioned_slots as usize)
            * stats_out.bucket_slot_size,
    );
    stats_out.resident_bytes += span_bytes_resident;
    if span_is_empty(span) {
        stats_out.decommittable_bytes += span_bytes_resident;
        stats_out.num_empty_slot_spans += 1;
    } else if span_is_full(span) {
        stats_out.num_full_slot_spans += 1;
    } else {
        debug_assert!(span_is_active(span));
        stats_out.num_active_slot_spans += 1;
    }
}

unsafe fn dump_bucket_stats(stats_out: &mut BucketMemoryStats, bucket: *const Bucket) {
    debug_assert!(!(*bucket).is_direct_mapped());
    stats_out.is_valid = false;
    // An empty active list can still mean a bucket worth reporting, if
    // there are empty, decommitted or full spans behind it.
    if (*bucket).active_head == sentinel_slot_span()
        && (*bucket).empty_head.is_null()
        && (*bucket).decommitted_head.is_null()
        && (*bucket).num_full_spans == 0
    {
        return;
    }

    *stats_out = BucketMemoryStats::default();
    stats_out.is_valid = true;
    stats_out.is_direct_map = false;
    stats_out.num_full_slot_spans = (*bucket).num_full_spans as usize;
    stats_out.bucket_slot_size = (*bucket).slot_size as usize;
    let bucket_num_slots = (*bucket).slots_per_span() as usize;
    let bucket_useful_storage = stats_out.bucket_slot_size * bucket_num_slots;
    stats_out.allocated_slot_span_size = (*bucket).bytes_per_span();
    stats_out.active_bytes = (*bucket).num_full_spans as usize * bucket_useful_storage;
    stats_out.resident_bytes =
        (*bucket).num_full_spans as usize * stats_out.allocated_slot_span_size;

    let mut span = (*bucket).empty_head;
    while !span.is_null() {
        debug_assert!(span_is_empty(span) || span_is_decommitted(span));
        dump_span_stats(stats_out, span);
        span = (*span).next_span;
    }
    let mut span = (*bucket).decommitted_head;
    while !span.is_null() {
        debug_assert!(span_is_decommitted(span));
        dump_span_stats(stats_out, span);
        span = (*span).next_span;
    }

    if (*bucket).active_head != sentinel_slot_span() {
        let mut span = (*bucket).active_head;
        while !span.is_null() {
            debug_assert!(span as *const _ != sentinel_slot_span() as *const _);
            dump_span_stats(stats_out, span);
            span = (*span).next_span;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_root() -> Box<PartitionRoot> {
        PartitionRoot::new(PartitionOptions::default())
    }

    #[test]
    fn size_to_bucket_index_rounds_up() {
        let root = test_root();
        // Sizes that are not multiples of the smallest class skip over the
        // pseudo buckets to the next valid one.
        for (size, expected_slot) in [
            (1usize, 8usize),
            (8, 8),
            (9, 16),
            (12, 16),
            (13, 16),
            (16, 16),
            (41, 48),
            (100, 104),
            (4000, 4096),
            (MAX_BUCKETED, MAX_BUCKETED),
        ] {
            let index = root.size_to_bucket_index(size);
            assert_ne!(index, SENTINEL_BUCKET_INDEX, "size {}", size);
            assert_eq!(root.bucket_slot_size(index), expected_slot, "size {}", size);
        }
    }

    #[test]
    fn oversized_requests_map_to_the_sentinel() {
        let root = test_root();
        assert_eq!(root.size_to_bucket_index(MAX_BUCKETED + 1), SENTINEL_BUCKET_INDEX);
        assert_eq!(root.size_to_bucket_index(usize::MAX), SENTINEL_BUCKET_INDEX);
    }

    #[test]
    fn actual_size_matches_bucket_geometry() {
        let root = test_root();
        // A bucketed request reports the slot it would occupy.
        let raw = root.adjust_size_add(100);
        let slot = root.bucket_slot_size(root.size_to_bucket_index(raw));
        assert_eq!(root.actual_size(100), root.adjust_size_subtract(slot));
        // Large direct-mapped sizes round to a system page.
        let big = MAX_BUCKETED + 12345;
        let actual = root.actual_size(big);
        assert!(actual >= big);
        assert_eq!(root.adjust_size_add(actual) % SYSTEM_PAGE_SIZE, 0);
    }
}
