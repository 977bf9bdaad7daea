//! A partitioned heap allocator.
//!
//! A process creates one or more independent partitions; each owns disjoint
//! virtual address space and serves the allocations of one logical
//! category. Isolation between partitions, freelist corruption detection,
//! double-free detection and an optional quarantine-with-scan of freed
//! memory are the security properties; a two-branch hot path, per-thread
//! caches and size-bucketed slot reuse are the performance ones.
//!
//! Memory is organized as 2MiB super pages carved into 16KiB partition
//! pages; runs of partition pages form slot spans, each cut into equal
//! slots of one size class. The first partition page of every super page
//! stores a 32-byte metadata record per partition page, so `free` finds its
//! metadata with a mask and a shift. Allocations too large for any size
//! class get their own direct mapping laid out to look like a super page.
//!
//! ```
//! use partition_alloc::{PartitionAllocator, PartitionOptions};
//!
//! let allocator = PartitionAllocator::new(PartitionOptions::default());
//! let root = allocator.root();
//! let p = root.alloc(64, "example");
//! assert!(!p.is_null());
//! unsafe { root.free(p) };
//! ```

mod internal;

mod bucket;
mod direct_map;
mod freelist;
mod hooks;
mod oom;
mod os;
mod page;
mod pcscan;
mod quarantine;
mod root;
mod stats;
mod thread_cache;
mod types;

pub use hooks::{
    set_allocation_observer, set_allocation_override, set_free_observer, set_free_override,
    set_realloc_override, AllocationObserverHook, AllocationOverrideHook, FreeObserverHook,
    FreeOverrideHook, ReallocOverrideHook,
};
pub use oom::{
    partition_alloc_global_init, partition_alloc_global_uninit_for_testing,
    reported_lots_of_uncommitted_pages, OomHandler,
};
pub use pcscan::{InvocationMode, PCScan, StackRangesOracle, QUARANTINE_SIZE_MIN_LIMIT};
pub use root::{
    Alignment, ConfigurablePoolMode, CookiesMode, MemoryTaggingMode, PartitionOptions,
    PartitionRoot, QuarantineMode, RefCountMode, ThreadCacheMode,
};
pub use stats::{
    BucketMemoryStats, MemoryStats, PartitionStatsDumper, ThreadCacheStats,
};
pub use thread_cache::{ThreadCache, ThreadCacheRegistry, TC_PURGE_INTERVAL};
pub use types::{
    ALLOC_FAST_PATH_OR_RETURN_NULL, ALLOC_NO_HOOKS, ALLOC_RETURN_NULL, ALLOC_ZERO_FILL,
    MAX_BUCKETED, MAX_DIRECT_MAPPED, PARTITION_PAGE_SIZE, PURGE_DECOMMIT_EMPTY_SLOT_SPANS,
    PURGE_DISCARD_UNUSED_SYSTEM_PAGES, SUPER_PAGE_SIZE, SYSTEM_PAGE_SIZE,
};

/// Handle to one partition root. Roots are pinned for the lifetime of the
/// process: super-page metadata and thread caches keep pointers back to
/// them, so they never move and never go away.
#[derive(Clone, Copy)]
pub struct PartitionAllocator {
    root: &'static PartitionRoot,
}

impl PartitionAllocator {
    pub fn new(options: PartitionOptions) -> PartitionAllocator {
        PartitionAllocator {
            root: Box::leak(PartitionRoot::new(options)),
        }
    }

    #[inline]
    pub fn root(&self) -> &'static PartitionRoot {
        self.root
    }
}
