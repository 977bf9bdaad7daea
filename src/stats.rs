//! Memory statistics surface. `PartitionRoot::dump_stats` walks the heap
//! under the partition lock, snapshots these records, and hands them to a
//! caller-provided dumper outside the lock (the dumper is allowed to
//! allocate from the same partition).

/// Total memory usage of one partition.
#[derive(Clone, Copy, Default, Debug)]
pub struct MemoryStats {
    /// Total bytes reserved from the system.
    pub total_mmapped_bytes: usize,
    /// Total size of committed pages.
    pub total_committed_bytes: usize,
    /// Total bytes provisioned by the partition.
    pub total_resident_bytes: usize,
    /// Total bytes in live allocations.
    pub total_active_bytes: usize,
    /// Bytes that a decommit-empty-spans purge would release.
    pub total_decommittable_bytes: usize,
    /// Bytes that a discard purge could release.
    pub total_discardable_bytes: usize,
}

/// Per-bucket statistics. Direct-mapped allocations are reported as one
/// record each, with `is_direct_map` set.
#[derive(Clone, Copy, Default, Debug)]
pub struct BucketMemoryStats {
    pub is_valid: bool,
    pub is_direct_map: bool,
    pub bucket_slot_size: usize,
    /// Bytes one slot span takes from the system.
    pub allocated_slot_span_size: usize,
    pub active_bytes: usize,
    pub resident_bytes: usize,
    pub decommittable_bytes: usize,
    pub discardable_bytes: usize,
    pub num_full_slot_spans: usize,
    pub num_active_slot_spans: usize,
    pub num_empty_slot_spans: usize,
    pub num_decommitted_slot_spans: usize,
}

/// Receiver for `dump_stats`.
pub trait PartitionStatsDumper {
    /// Called once per partition with the totals.
    fn partition_dump_totals(&mut self, partition_name: &str, stats: &MemoryStats);

    /// Called for each bucket that has ever held memory.
    fn partition_dump_bucket_stats(&mut self, partition_name: &str, stats: &BucketMemoryStats);
}

/// Counters of one thread cache, or the accumulated counters of all of them.
#[derive(Clone, Copy, Default, Debug)]
pub struct ThreadCacheStats {
    pub alloc_count: u64,
    pub alloc_hits: u64,
    pub alloc_misses: u64,
    /// Misses broken down by cause.
    pub alloc_miss_empty: u64,
    pub alloc_miss_too_large: u64,
    pub cache_fill_count: u64,
    pub cache_fill_hits: u64,
    pub cache_fill_misses: u64,
    pub batch_fill_count: u64,
    /// Memory held by cached slots, and the metadata cost of the caches.
    pub bucket_total_memory: usize,
    pub metadata_overhead: usize,
}
