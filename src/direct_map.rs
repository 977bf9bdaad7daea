//! Direct-map allocation. Sizes too large to bucket get a dedicated,
//! super-page-aligned mapping laid out to mimic a super page, so that every
//! interior-pointer lookup works the same as for bucketed memory:
//!
//!   | Guard page (4KiB)    |
//!   | Metadata page (4KiB) |
//!   | Guard pages (8KiB)   |
//!   | Direct-mapped object |
//!   | Guard / slack        |
//!
//! The metadata page carries the extent entry, the slot-span record, the
//! raw-size word, a per-allocation bucket, and the direct-map extent record
//! in consecutive 32-byte slots. Reservations are super-page granular, which
//! leaves slack for growing in place.

use core::ptr::null_mut;

use crate::freelist::FreelistEntry;
use crate::os;
use crate::root::{
    decommit_system_pages, decrease_committed_pages, increase_committed_pages,
    recommit_system_pages, PartitionRoot, RootCore,
};
use crate::types::*;

#[cfg(target_pointer_width = "32")]
const TRAILING_GUARD_SIZE: usize = SYSTEM_PAGE_SIZE;
#[cfg(not(target_pointer_width = "32"))]
const TRAILING_GUARD_SIZE: usize = 0;

#[inline]
pub(crate) fn direct_map_size(size: usize) -> usize {
    // The caller rejects sizes above the direct-map limit, which also keeps
    // this arithmetic from overflowing.
    debug_assert!(size <= MAX_DIRECT_MAPPED);
    round_up_to_system_page(size)
}

#[inline]
pub(crate) unsafe fn direct_map_extent_from_span(span: *mut SlotSpan) -> *mut DirectMapExtent {
    debug_assert!((*(*span).bucket).is_direct_mapped());
    (span as usize + 3 * PAGE_METADATA_SIZE) as *mut DirectMapExtent
}

// Bytes of payload the existing reservation can hold.
#[inline]
unsafe fn payload_capacity(extent: *const DirectMapExtent) -> usize {
    (*extent).reservation_size - PARTITION_PAGE_SIZE - TRAILING_GUARD_SIZE
}

pub(crate) unsafe fn direct_map(
    root: &PartitionRoot,
    core: &mut RootCore,
    raw_size: usize,
) -> *mut SlotSpan {
    let size = direct_map_size(raw_size);
    let map_size = size + PARTITION_PAGE_SIZE + TRAILING_GUARD_SIZE;
    let reservation_size = (map_size + SUPER_PAGE_OFFSET_MASK) & SUPER_PAGE_BASE_MASK;

    let base = os::reserve(
        0,
        reservation_size,
        SUPER_PAGE_SIZE,
        os::PageAccess::Inaccessible,
    );
    if base == 0 {
        return null_mut();
    }

    let slot = base + PARTITION_PAGE_SIZE;
    // Only the metadata system page and the payload become accessible; the
    // guards and the slack stay mapped but inaccessible.
    os::set_access(
        base + SYSTEM_PAGE_SIZE,
        SYSTEM_PAGE_SIZE,
        os::PageAccess::ReadWrite,
    );
    os::set_access(slot, size, os::PageAccess::ReadWrite);

    let committed_size = size + SYSTEM_PAGE_SIZE;
    core.total_size_of_direct_mapped_pages += reservation_size;
    increase_committed_pages(core, committed_size);

    let extent_entry = extent_entry_from_super_page(base);
    (*extent_entry).root = root as *const PartitionRoot as *mut PartitionRoot;
    // The rest of the entry stays zero: this mapping is not part of any
    // super-page extent chain.
    debug_assert!((*extent_entry).super_page_base == 0);
    debug_assert!((*extent_entry).num_consecutive_super_pages == 0);
    debug_assert!((*extent_entry).next.is_null());

    let span = span_from_addr_no_alignment_check(slot);
    let bucket = (span as usize + 2 * PAGE_METADATA_SIZE) as *mut Bucket;
    // The metadata page is fresh, so the records start out zeroed.
    debug_assert!((*span).next_span.is_null());
    debug_assert!((*span).num_allocated_slots == 0);
    debug_assert!((*span).num_unprovisioned_slots == 0);
    debug_assert!((*span).page_offset == 0);
    (*span).bucket = bucket;
    (*span).empty_cache_index = -1;
    (*span).freelist_head = slot as *mut FreelistEntry;
    FreelistEntry::set_next(slot as *mut FreelistEntry, null_mut());

    debug_assert!((*bucket).active_head.is_null());
    debug_assert!((*bucket).empty_head.is_null());
    debug_assert!((*bucket).decommitted_head.is_null());
    debug_assert!((*bucket).num_system_pages_per_slot_span == 0);
    debug_assert!((*bucket).num_full_spans == 0);
    (*bucket).slot_size = size as u32;

    let map_extent = direct_map_extent_from_span(span);
    (*map_extent).reservation_size = reservation_size;
    (*map_extent).bucket = bucket;

    // Link into the root's list of direct mappings.
    (*map_extent).next_extent = core.direct_map_list;
    if !(*map_extent).next_extent.is_null() {
        (*(*map_extent).next_extent).prev_extent = map_extent;
    }
    (*map_extent).prev_extent = null_mut();
    core.direct_map_list = map_extent;

    span
}

pub(crate) unsafe fn direct_unmap(core: &mut RootCore, span: *mut SlotSpan) {
    let extent = direct_map_extent_from_span(span);
    let reservation_size = (*extent).reservation_size;

    if !(*extent).prev_extent.is_null() {
        debug_assert!((*(*extent).prev_extent).next_extent == extent);
        (*(*extent).prev_extent).next_extent = (*extent).next_extent;
    } else {
        debug_assert!(core.direct_map_list == extent);
        core.direct_map_list = (*extent).next_extent;
    }
    if !(*extent).next_extent.is_null() {
        debug_assert!((*(*extent).next_extent).prev_extent == extent);
        (*(*extent).next_extent).prev_extent = (*extent).prev_extent;
    }

    let committed_size = (*(*span).bucket).slot_size as usize + SYSTEM_PAGE_SIZE;
    decrease_committed_pages(core, committed_size);
    debug_assert!(core.total_size_of_direct_mapped_pages >= reservation_size);
    core.total_size_of_direct_mapped_pages -= reservation_size;

    // The mapping starts one partition page before the payload.
    let base = span_to_slot_span_start(span) - PARTITION_PAGE_SIZE;
    os::release(base, reservation_size);
}

// Grows or shrinks a direct mapping without moving it. Shrinking below 80 %
// of the current footprint is refused, as that would pin too much dead
// reserved space; growing works within the reservation's slack. Returns
// false when the caller has to fall back to allocate-copy-free.
pub(crate) unsafe fn realloc_in_place(
    root: &PartitionRoot,
    core: &mut RootCore,
    span: *mut SlotSpan,
    requested_size: usize,
) -> bool {
    debug_assert!((*(*span).bucket).is_direct_mapped());

    let raw_size = root.adjust_size_add(requested_size);
    let new_size = direct_map_size(raw_size);
    let bucket = (*span).bucket;
    let current_size = (*bucket).slot_size as usize;
    let slot = span_to_slot_span_start(span);

    if new_size < current_size {
        if (new_size / SYSTEM_PAGE_SIZE) * 5 < (current_size / SYSTEM_PAGE_SIZE) * 4 {
            return false;
        }
        // Shrink: the tail pages lose their backing and become inaccessible.
        decommit_system_pages(core, slot + new_size, current_size - new_size);
    } else if new_size > current_size {
        let extent = direct_map_extent_from_span(span);
        if new_size > payload_capacity(extent) {
            return false;
        }
        // Grow within the reservation.
        let recommit_size = new_size - current_size;
        recommit_system_pages(core, slot + current_size, recommit_size);
        #[cfg(debug_assertions)]
        crate::internal::fill_bytes(slot + current_size, UNINITIALIZED_BYTE, recommit_size);
    }

    #[cfg(debug_assertions)]
    if root.use_cookies {
        crate::page::cookie_write_value(slot + raw_size - COOKIE_SIZE);
    }

    span_set_raw_size(span, raw_size);
    (*bucket).slot_size = new_size as u32;
    true
}
