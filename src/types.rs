use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr::null_mut;
use core::sync::atomic::AtomicU8;

use crate::freelist::FreelistEntry;
use crate::root::PartitionRoot;

// Allocation granularity of sizeof(void*) bytes.
pub const ALLOCATION_GRANULARITY: usize = size_of::<*mut ()>();
pub const ALLOCATION_GRANULARITY_MASK: usize = ALLOCATION_GRANULARITY - 1;

// ------------------------------------------------------
// Main layout parameters
// ------------------------------------------------------

// Underlying storage pages are a power-of-two size. It is typical for a
// partition page to be based on multiple system pages. Most references to
// "page" in this crate mean partition pages. The unit of address-space
// reservation is the "super page": partition pages live inside super pages,
// which also carry a small metadata record per partition page.
pub const SYSTEM_PAGE_SHIFT: usize = 12; // 4KiB
pub const SYSTEM_PAGE_SIZE: usize = 1 << SYSTEM_PAGE_SHIFT;
pub const SYSTEM_PAGE_OFFSET_MASK: usize = SYSTEM_PAGE_SIZE - 1;
pub const SYSTEM_PAGE_BASE_MASK: usize = !SYSTEM_PAGE_OFFSET_MASK;

pub const PARTITION_PAGE_SHIFT: usize = 14; // 16KiB
pub const PARTITION_PAGE_SIZE: usize = 1 << PARTITION_PAGE_SHIFT;
pub const PARTITION_PAGE_OFFSET_MASK: usize = PARTITION_PAGE_SIZE - 1;
pub const PARTITION_PAGE_BASE_MASK: usize = !PARTITION_PAGE_OFFSET_MASK;
pub const MAX_PARTITION_PAGES_PER_SLOT_SPAN: usize = 4;

// To avoid fragmentation via never-used freelist entries, freelist sections
// are handed out gradually, in units of the system page size. Writing a
// freelist pointer dirties a private page, which is wasteful if no object is
// ever stored there.
pub const NUM_SYSTEM_PAGES_PER_PARTITION_PAGE: usize =
    PARTITION_PAGE_SIZE / SYSTEM_PAGE_SIZE;
pub const MAX_SYSTEM_PAGES_PER_SLOT_SPAN: usize =
    NUM_SYSTEM_PAGES_PER_PARTITION_PAGE * MAX_PARTITION_PAGES_PER_SLOT_SPAN;

// Address space is reserved in 2MiB chunks aligned to 2MiB, so that the
// first pages of each chunk can hold the metadata for every partition page
// in it. This makes free() fast: any interior pointer reaches its metadata
// with a mask and a shift.
//
// The layout of a super page is as follows, by partition-page offset:
//
//   | Guard page (4KiB)       |
//   | Metadata page (4KiB)    |
//   | Guard pages (8KiB)      |
//   | Quarantine bitmaps      |  <- reserved; committed iff quarantine is on
//   | Slot span               |
//   | Slot span               |
//   | ...                     |
//   | Guard page (16KiB)      |
//
// The metadata page holds one `SuperPageExtentEntry` (in the slot of the
// unusable first partition page) followed by one 32-byte metadata slot per
// partition page. Only the first partition page of a slot span owns the
// canonical `SlotSpan` record; the slots of the other pages just store their
// offset back to it.
pub const SUPER_PAGE_SHIFT: usize = 21; // 2MiB
pub const SUPER_PAGE_SIZE: usize = 1 << SUPER_PAGE_SHIFT;
pub const SUPER_PAGE_OFFSET_MASK: usize = SUPER_PAGE_SIZE - 1;
pub const SUPER_PAGE_BASE_MASK: usize = !SUPER_PAGE_OFFSET_MASK;
pub const NUM_PARTITION_PAGES_PER_SUPER_PAGE: usize =
    SUPER_PAGE_SIZE / PARTITION_PAGE_SIZE;

pub const PAGE_METADATA_SHIFT: usize = 5; // 32 bytes per partition page
pub const PAGE_METADATA_SIZE: usize = 1 << PAGE_METADATA_SHIFT;

// ------------------------------------------------------
// Bucketing parameters
// ------------------------------------------------------

// The "order" of an allocation is the bit index of its most significant bit,
// counting from 1 for the least significant bit. Order 4 covers 8..=15 and
// is the smallest bucketed order; the largest bucketed slot stores just
// under 1MiB.
pub const MIN_BUCKETED_ORDER: usize = 4; // 8 bytes
pub const MAX_BUCKETED_ORDER: usize = 20;
pub const NUM_BUCKETED_ORDERS: usize = MAX_BUCKETED_ORDER - MIN_BUCKETED_ORDER + 1;
pub const NUM_BUCKETS_PER_ORDER_BITS: usize = 3;
pub const NUM_BUCKETS_PER_ORDER: usize = 1 << NUM_BUCKETS_PER_ORDER_BITS;
pub const NUM_BUCKETS: usize = NUM_BUCKETED_ORDERS * NUM_BUCKETS_PER_ORDER;
pub const SMALLEST_BUCKET: usize = 1 << (MIN_BUCKETED_ORDER - 1);
pub const MAX_BUCKET_SPACING: usize =
    1 << ((MAX_BUCKETED_ORDER - 1) - NUM_BUCKETS_PER_ORDER_BITS);
pub const MAX_BUCKETED: usize =
    (1 << (MAX_BUCKETED_ORDER - 1)) + ((NUM_BUCKETS_PER_ORDER - 1) * MAX_BUCKET_SPACING);
pub const MAX_DIRECT_MAPPED: usize = 1 << 31; // 2GiB
pub const BITS_PER_SIZE_T: usize = usize::BITS as usize;

// The flat size -> bucket lookup table, one row per order plus one trailing
// entry for sizes that overflow to a non-existent order.
pub const BUCKET_LOOKUP_LEN: usize = (BITS_PER_SIZE_T + 1) * NUM_BUCKETS_PER_ORDER + 1;

// Index value marking the sentinel bucket in the lookup table.
pub const SENTINEL_BUCKET_INDEX: u16 = NUM_BUCKETS as u16;

// ------------------------------------------------------
// Reclaim parameters
// ------------------------------------------------------

// Ring of recently emptied slot spans, kept committed for a while so a
// short-lived burst of frees does not pay decommit/recommit.
pub const MAX_FREEABLE_SPANS: usize = 16;

// If reserved-but-uncommitted bytes exceed this at OOM time, the failure is
// reported as address-space exhaustion rather than physical-memory
// exhaustion. Only meaningful on 32-bit.
pub const REASONABLE_SIZE_OF_UNUSED_PAGES: usize = 1024 * 1024 * 1024; // 1GiB

// ------------------------------------------------------
// Quarantine area layout
// ------------------------------------------------------

// Four partition pages directly after the metadata partition page hold the
// two quarantine bitmaps (one bit per 8-byte granule of the payload region)
// plus slack. The area is reserved in every super page of a
// quarantine-capable root and committed when the root registers with the
// scanner.
pub const QUARANTINE_AREA_SIZE: usize = 4 * PARTITION_PAGE_SIZE;
pub const QUARANTINE_GRANULE_SHIFT: usize = 3;
pub const QUARANTINE_GRANULE: usize = 1 << QUARANTINE_GRANULE_SHIFT;
pub const QUARANTINE_PAYLOAD_SIZE: usize =
    SUPER_PAGE_SIZE - 2 * PARTITION_PAGE_SIZE - QUARANTINE_AREA_SIZE;
pub const QUARANTINE_BITMAP_SIZE: usize = QUARANTINE_PAYLOAD_SIZE / QUARANTINE_GRANULE / 8;

// ------------------------------------------------------
// Debug fill patterns and cookies
// ------------------------------------------------------

pub const UNINITIALIZED_BYTE: u8 = 0xAB;
pub const FREED_BYTE: u8 = 0xCD;
pub const COOKIE_SIZE: usize = 16; // handles alignment up to XMM loads
pub const COOKIE_VALUE: [u8; COOKIE_SIZE] = [
    0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0xD0, 0x0D, 0x13, 0x37, 0xF0, 0x05, 0xBA, 0x11,
    0xAB, 0x1E,
];

// ------------------------------------------------------
// Allocation and purge flags
// ------------------------------------------------------

pub const ALLOC_RETURN_NULL: u32 = 1 << 0;
pub const ALLOC_ZERO_FILL: u32 = 1 << 1;
pub const ALLOC_NO_HOOKS: u32 = 1 << 2;
// Refuses any allocation that would leave the fast path; used by the thread
// cache so a batched fill never activates a new span under the covers.
pub const ALLOC_FAST_PATH_OR_RETURN_NULL: u32 = 1 << 3;

// Decommitting the ring of empty slot spans is reasonably fast. Discarding
// unused system pages is slower, as it walks the freelists of all spans with
// slot size >= system page size.
pub const PURGE_DECOMMIT_EMPTY_SLOT_SPANS: u32 = 1 << 0;
pub const PURGE_DISCARD_UNUSED_SYSTEM_PAGES: u32 = 1 << 1;

// ------------------------------------------------------
// Metadata records
// ------------------------------------------------------

// Slot-span states:
// 1) Active: has available free or unprovisioned slots.
// 2) Full: every slot in use; detached from all lists.
// 3) Empty: no slot in use, freelist still provisioned.
// 4) Decommitted: empty, with its backing pages returned to the OS.
//
// The active list is an approximation: full, empty and decommitted spans may
// sit in it until the next scan sweeps them to where they belong. The empty
// and decommitted lists are accurate.
#[repr(C)]
pub struct SlotSpan {
    pub freelist_head: *mut FreelistEntry,
    pub next_span: *mut SlotSpan,
    pub bucket: *mut Bucket,
    // Deliberately signed: 0 for an empty or decommitted span, -n for a full
    // span holding n slots. A 0 -> -1 transition is a double free.
    pub num_allocated_slots: i16,
    pub num_unprovisioned_slots: u16,
    pub page_offset: u16,
    pub empty_cache_index: i16, // -1 if not in the empty ring
}

#[repr(C)]
pub struct Bucket {
    // Hot-path field first.
    pub active_head: *mut SlotSpan,
    pub empty_head: *mut SlotSpan,
    pub decommitted_head: *mut SlotSpan,
    pub slot_size: u32,
    pub num_system_pages_per_slot_span: u8,
    pub num_full_spans: u16,
}

// An extent is a run of consecutive super pages. Every super page stores the
// owning root in its first metadata slot; the super page that starts an
// extent also records the extent bounds and the link to the next extent.
// The card byte is the coarse "this super page holds quarantined objects"
// filter read during scans.
#[repr(C)]
pub struct SuperPageExtentEntry {
    pub root: *mut PartitionRoot,
    pub next: *mut SuperPageExtentEntry,
    pub super_page_base: usize,
    pub num_consecutive_super_pages: u32,
    pub card: AtomicU8,
}

#[repr(C)]
pub struct DirectMapExtent {
    pub next_extent: *mut DirectMapExtent,
    pub prev_extent: *mut DirectMapExtent,
    pub bucket: *mut Bucket,
    // Total reserved mapping, guard and metadata pages included.
    pub reservation_size: usize,
}

const _: () = assert!(size_of::<SlotSpan>() <= PAGE_METADATA_SIZE);
const _: () = assert!(size_of::<Bucket>() <= PAGE_METADATA_SIZE);
const _: () = assert!(size_of::<SuperPageExtentEntry>() <= PAGE_METADATA_SIZE);
const _: () = assert!(size_of::<DirectMapExtent>() <= PAGE_METADATA_SIZE);
const _: () = assert!(PAGE_METADATA_SIZE * NUM_PARTITION_PAGES_PER_SUPER_PAGE <= SYSTEM_PAGE_SIZE);
const _: () = assert!(SYSTEM_PAGE_SIZE * 4 <= PARTITION_PAGE_SIZE);
const _: () = assert!(PARTITION_PAGE_SIZE * 4 <= SUPER_PAGE_SIZE);
const _: () = assert!(SMALLEST_BUCKET == 8);
const _: () = assert!(MAX_BUCKETED == 983040);
const _: () = assert!(MAX_SYSTEM_PAGES_PER_SLOT_SPAN < (1 << 8));
const _: () = assert!(2 * QUARANTINE_BITMAP_SIZE <= QUARANTINE_AREA_SIZE);

impl Bucket {
    pub const fn sentinel() -> Bucket {
        Bucket {
            active_head: null_mut(),
            empty_head: null_mut(),
            decommitted_head: null_mut(),
            slot_size: 0,
            num_system_pages_per_slot_span: 0,
            num_full_spans: 0,
        }
    }

    #[inline]
    pub fn is_direct_mapped(&self) -> bool {
        self.num_system_pages_per_slot_span == 0
    }

    #[inline]
    pub fn bytes_per_span(&self) -> usize {
        self.num_system_pages_per_slot_span as usize * SYSTEM_PAGE_SIZE
    }

    #[inline]
    pub fn slots_per_span(&self) -> u16 {
        (self.bytes_per_span() / self.slot_size as usize) as u16
    }

    #[inline]
    pub fn num_partition_pages(&self) -> u16 {
        ((self.num_system_pages_per_slot_span as usize
            + (NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - 1))
            / NUM_SYSTEM_PAGES_PER_PARTITION_PAGE) as u16
    }
}

impl SlotSpan {
    pub const fn sentinel() -> SlotSpan {
        SlotSpan {
            freelist_head: null_mut(),
            next_span: null_mut(),
            bucket: null_mut(),
            num_allocated_slots: 0,
            num_unprovisioned_slots: 0,
            page_offset: 0,
            empty_cache_index: -1,
        }
    }
}

// ------------------------------------------------------
// Sentinels
// ------------------------------------------------------

// The sentinel span terminates every bucket's active list so that the hot
// allocation path needs no null check: its freelist head is null, which
// routes straight to the slow path.
pub(crate) struct SyncCell<T>(pub UnsafeCell<T>);

// The sentinels are written once, under the global init guard.
unsafe impl<T> Sync for SyncCell<T> {}

static SENTINEL_SLOT_SPAN: SyncCell<SlotSpan> = SyncCell(UnsafeCell::new(SlotSpan::sentinel()));
static SENTINEL_BUCKET: SyncCell<Bucket> = SyncCell(UnsafeCell::new(Bucket::sentinel()));

#[inline]
pub fn sentinel_slot_span() -> *mut SlotSpan {
    SENTINEL_SLOT_SPAN.0.get()
}

#[inline]
pub fn sentinel_bucket() -> *mut Bucket {
    SENTINEL_BUCKET.0.get()
}

static GLOBAL_INIT: once_cell::sync::OnceCell<()> = once_cell::sync::OnceCell::new();

// Marks the sentinel bucket as "freelist exhausted" so the slot-span search
// logic skips it. Runs once, before the first root comes up.
pub(crate) fn global_init_once() {
    GLOBAL_INIT.get_or_init(|| unsafe {
        (*sentinel_bucket()).active_head = sentinel_slot_span();
        crate::os::page_sizes_init();
    });
}

// ------------------------------------------------------
// Address arithmetic
// ------------------------------------------------------

#[inline]
pub const fn round_up_to_system_page(addr: usize) -> usize {
    (addr + SYSTEM_PAGE_OFFSET_MASK) & SYSTEM_PAGE_BASE_MASK
}

#[inline]
pub const fn round_down_to_system_page(addr: usize) -> usize {
    addr & SYSTEM_PAGE_BASE_MASK
}

#[inline]
pub const fn super_page_base(addr: usize) -> usize {
    addr & SUPER_PAGE_BASE_MASK
}

// The metadata area is exactly one system page (past the leading guard page)
// into the super page.
#[inline]
pub fn super_page_metadata_area(super_page: usize) -> usize {
    debug_assert!(super_page & SUPER_PAGE_OFFSET_MASK == 0);
    super_page + SYSTEM_PAGE_SIZE
}

#[inline]
pub fn extent_entry_from_super_page(super_page: usize) -> *mut SuperPageExtentEntry {
    super_page_metadata_area(super_page) as *mut SuperPageExtentEntry
}

// First usable payload byte of a super page. Quarantine-capable roots give
// up the leading partition pages that hold the quarantine bitmaps.
#[inline]
pub const fn super_page_payload_begin(super_page: usize, with_quarantine: bool) -> usize {
    super_page + PARTITION_PAGE_SIZE + if with_quarantine { QUARANTINE_AREA_SIZE } else { 0 }
}

#[inline]
pub const fn super_page_payload_end(super_page: usize) -> usize {
    super_page + SUPER_PAGE_SIZE - PARTITION_PAGE_SIZE
}

#[inline]
pub fn is_within_super_page_payload(addr: usize, with_quarantine: bool) -> bool {
    let base = super_page_base(addr);
    addr >= super_page_payload_begin(base, with_quarantine)
        && addr < super_page_payload_end(base)
}

// Metadata record of the partition page containing `addr`. The input cannot
// be trusted; callers sanitize the result before acting on it.
#[inline]
pub unsafe fn span_from_addr_no_alignment_check(addr: usize) -> *mut SlotSpan {
    let base = super_page_base(addr);
    let partition_page_index = (addr & SUPER_PAGE_OFFSET_MASK) >> PARTITION_PAGE_SHIFT;
    // Index 0 is the metadata and guard area, the last index is a guard page.
    debug_assert!(partition_page_index > 0);
    debug_assert!(partition_page_index < NUM_PARTITION_PAGES_PER_SUPER_PAGE - 1);
    let slot = super_page_metadata_area(base) + (partition_page_index << PAGE_METADATA_SHIFT);
    let span = slot as *mut SlotSpan;
    // Partition pages of one slot span share the first page's record.
    let delta = ((*span).page_offset as usize) << PAGE_METADATA_SHIFT;
    (slot - delta) as *mut SlotSpan
}

#[inline]
pub unsafe fn span_from_addr(addr: usize) -> *mut SlotSpan {
    let span = span_from_addr_no_alignment_check(addr);
    // The pointer must sit on a slot boundary.
    debug_assert!(
        (addr - span_to_slot_span_start(span)) % (*(*span).bucket).slot_size as usize == 0
    );
    span
}

// Start of the slot span described by a metadata record.
#[inline]
pub unsafe fn span_to_slot_span_start(span: *const SlotSpan) -> usize {
    let p = span as usize;
    let super_page_offset = p & SUPER_PAGE_OFFSET_MASK;
    // A valid record lies past the guard system page, within the metadata.
    debug_assert!(super_page_offset > SYSTEM_PAGE_SIZE);
    debug_assert!(
        super_page_offset
            < SYSTEM_PAGE_SIZE + NUM_PARTITION_PAGES_PER_SUPER_PAGE * PAGE_METADATA_SIZE
    );
    let partition_page_index = (super_page_offset - SYSTEM_PAGE_SIZE) >> PAGE_METADATA_SHIFT;
    debug_assert!(partition_page_index > 0);
    debug_assert!(partition_page_index < NUM_PARTITION_PAGES_PER_SUPER_PAGE - 1);
    (p & SUPER_PAGE_BASE_MASK) + (partition_page_index << PARTITION_PAGE_SHIFT)
}

// Every metadata slot of a super page lives in one system page, whose base
// is the extent entry. That gives any span record a path back to its root.
#[inline]
pub unsafe fn root_from_span(span: *const SlotSpan) -> *mut PartitionRoot {
    let extent = ((span as usize) & SYSTEM_PAGE_BASE_MASK) as *mut SuperPageExtentEntry;
    (*extent).root
}

// Detects wild pointers handed to free(): a legitimate span record reaches a
// root whose integrity value is the complement of its own address.
#[inline]
pub unsafe fn span_pointer_is_valid(span: *const SlotSpan) -> bool {
    let root = root_from_span(span);
    !root.is_null() && (*root).inverted_self == !(root as usize)
}

// ------------------------------------------------------
// Slot-span states
// ------------------------------------------------------

// Only meaningful for spans found on one of the bucket lists; full spans are
// detached and never see these predicates.
#[inline]
pub unsafe fn span_is_active(span: *const SlotSpan) -> bool {
    debug_assert!(span as *const _ != sentinel_slot_span() as *const _);
    debug_assert!((*span).page_offset == 0);
    (*span).num_allocated_slots > 0
        && (!(*span).freelist_head.is_null() || (*span).num_unprovisioned_slots > 0)
}

#[inline]
pub unsafe fn span_is_full(span: *const SlotSpan) -> bool {
    debug_assert!(span as *const _ != sentinel_slot_span() as *const _);
    debug_assert!((*span).page_offset == 0);
    let full = (*span).num_allocated_slots == (*(*span).bucket).slots_per_span() as i16;
    if full {
        debug_assert!((*span).freelist_head.is_null());
        debug_assert!((*span).num_unprovisioned_slots == 0);
    }
    full
}

#[inline]
pub unsafe fn span_is_empty(span: *const SlotSpan) -> bool {
    debug_assert!(span as *const _ != sentinel_slot_span() as *const _);
    debug_assert!((*span).page_offset == 0);
    (*span).num_allocated_slots == 0 && !(*span).freelist_head.is_null()
}

#[inline]
pub unsafe fn span_is_decommitted(span: *const SlotSpan) -> bool {
    debug_assert!(span as *const _ != sentinel_slot_span() as *const _);
    debug_assert!((*span).page_offset == 0);
    let ret = (*span).num_allocated_slots == 0 && (*span).freelist_head.is_null();
    if ret {
        debug_assert!((*span).num_unprovisioned_slots == 0);
        debug_assert!((*span).empty_cache_index == -1);
    }
    ret
}

// ------------------------------------------------------
// Raw-size storage
// ------------------------------------------------------

// Single-slot spans (and direct maps) have spare metadata room right after
// their record; the first word of that neighbouring slot stores the precise
// requested size for stats, realloc and get_size.
#[inline]
pub unsafe fn span_raw_size_ptr(span: *mut SlotSpan) -> *mut usize {
    let bucket = (*span).bucket;
    if (*bucket).slot_size as usize <= MAX_SYSTEM_PAGES_PER_SLOT_SPAN * SYSTEM_PAGE_SIZE {
        return null_mut();
    }
    debug_assert!((*bucket).slot_size as usize % SYSTEM_PAGE_SIZE == 0);
    debug_assert!((*bucket).is_direct_mapped() || (*bucket).slots_per_span() == 1);
    (span as usize + PAGE_METADATA_SIZE) as *mut usize
}

#[inline]
pub unsafe fn span_get_raw_size(span: *mut SlotSpan) -> usize {
    let ptr = span_raw_size_ptr(span);
    if ptr.is_null() {
        0
    } else {
        *ptr
    }
}

#[inline]
pub unsafe fn span_set_raw_size(span: *mut SlotSpan, raw_size: usize) {
    let ptr = span_raw_size_ptr(span);
    if !ptr.is_null() {
        *ptr = raw_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_constants_hold() {
        assert_eq!(NUM_BUCKETS, 136);
        assert_eq!(MAX_BUCKET_SPACING, 65536);
        assert_eq!(NUM_PARTITION_PAGES_PER_SUPER_PAGE, 128);
        // One metadata slot per partition page, all inside one system page.
        assert_eq!(
            NUM_PARTITION_PAGES_PER_SUPER_PAGE * PAGE_METADATA_SIZE,
            SYSTEM_PAGE_SIZE
        );
    }

    #[test]
    fn metadata_records_fit_their_slots() {
        assert_eq!(size_of::<SlotSpan>(), 32);
        assert!(size_of::<Bucket>() <= PAGE_METADATA_SIZE);
        assert_eq!(size_of::<SuperPageExtentEntry>(), 32);
        assert_eq!(size_of::<DirectMapExtent>(), 32);
    }

    #[test]
    fn quarantine_area_fits_both_bitmaps() {
        assert!(2 * QUARANTINE_BITMAP_SIZE <= QUARANTINE_AREA_SIZE);
        // Payload offsets stay partition-page aligned.
        assert_eq!(QUARANTINE_AREA_SIZE % PARTITION_PAGE_SIZE, 0);
        assert_eq!(super_page_payload_begin(0, true) % PARTITION_PAGE_SIZE, 0);
    }
}
