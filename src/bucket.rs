//! Bucket management: sizing of slot spans, the size class tables, and the
//! slow allocation path that finds or creates a usable slot span.

use core::ptr::null_mut;

use crate::direct_map;
use crate::freelist::FreelistEntry;
use crate::internal::partition_check;
use crate::oom::{partition_excessive_allocation_size, partition_out_of_memory};
use crate::os;
use crate::root::{recommit_system_pages, PartitionRoot, RootCore};
use crate::types::*;

/* -----------------------------------------------------------
  Slot span sizing
----------------------------------------------------------- */

// Picks how many system pages a slot span of this bucket occupies, by
// minimizing the waste ratio over the candidate span lengths. Leaving a page
// unfaulted is not free either (it still occupies a page table entry), which
// the pointer-size term approximates. Slot sizes above the largest span are
// page-multiples and get exactly their own size.
pub(crate) fn bucket_num_system_pages(size: usize) -> u8 {
    if size > MAX_SYSTEM_PAGES_PER_SLOT_SPAN * SYSTEM_PAGE_SIZE {
        debug_assert!(size % SYSTEM_PAGE_SIZE == 0);
        let best_pages = size / SYSTEM_PAGE_SIZE;
        partition_check!(best_pages < (1 << 8), "slot size {} spans too many pages", size);
        return best_pages as u8;
    }

    let mut best_waste_ratio = 1.0f64;
    let mut best_pages: u16 = 0;
    for i in (NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - 1)..=MAX_SYSTEM_PAGES_PER_SLOT_SPAN {
        let page_size = SYSTEM_PAGE_SIZE * i;
        let num_slots = page_size / size;
        let mut waste = page_size - num_slots * size;
        let num_remainder_pages = i & (NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - 1);
        let num_unfaulted_pages = if num_remainder_pages != 0 {
            NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - num_remainder_pages
        } else {
            0
        };
        waste += core::mem::size_of::<*mut ()>() * num_unfaulted_pages;
        let waste_ratio = waste as f64 / page_size as f64;
        if waste_ratio < best_waste_ratio {
            best_waste_ratio = waste_ratio;
            best_pages = i as u16;
        }
    }
    debug_assert!(best_pages > 0);
    best_pages as u8
}

pub(crate) fn bucket_init(bucket: &mut Bucket, slot_size: usize) {
    bucket.slot_size = slot_size as u32;
    bucket.active_head = sentinel_slot_span();
    bucket.empty_head = null_mut();
    bucket.decommitted_head = null_mut();
    bucket.num_full_spans = 0;
    bucket.num_system_pages_per_slot_span = bucket_num_system_pages(slot_size);
}

/* -----------------------------------------------------------
  Slot span metadata setup
----------------------------------------------------------- */

pub(crate) unsafe fn span_reset(span: *mut SlotSpan) {
    debug_assert!(span_is_decommitted(span));
    (*span).num_unprovisioned_slots = (*(*span).bucket).slots_per_span();
    debug_assert!((*span).num_unprovisioned_slots > 0);
    (*span).next_span = null_mut();
}

pub(crate) unsafe fn span_setup(span: *mut SlotSpan, bucket: *mut Bucket) {
    // The bucket never changes after this point.
    (*span).bucket = bucket;
    (*span).empty_cache_index = -1;
    span_reset(span);

    // Point the metadata slots of the other partition pages in the span back
    // at the first one, so interior pointers normalize to this record.
    let num_partition_pages = (*bucket).num_partition_pages();
    for i in 1..num_partition_pages as usize {
        let secondary = (span as usize + i * PAGE_METADATA_SIZE) as *mut SlotSpan;
        (*secondary).page_offset = i as u16;
    }
}

/* -----------------------------------------------------------
  Gradual freelist provisioning
----------------------------------------------------------- */

// Returns one slot and provisions freelist entries for the others, but only
// up to the end of the system page that holds the first new entry. Dirtying
// the whole span up front would fault private pages that may never store an
// object.
unsafe fn alloc_and_fill_freelist(span: *mut SlotSpan) -> usize {
    debug_assert!(span as *const _ != sentinel_slot_span() as *const _);
    let mut num_slots = (*span).num_unprovisioned_slots;
    debug_assert!(num_slots > 0);
    let bucket = (*span).bucket;
    // Every slot is either used or unprovisioned here; a non-empty freelist
    // would have been consumed instead.
    debug_assert!(
        num_slots as i16 + (*span).num_allocated_slots == (*bucket).slots_per_span() as i16
    );
    debug_assert!((*span).freelist_head.is_null());
    debug_assert!((*span).num_allocated_slots >= 0);

    let size = (*bucket).slot_size as usize;
    let base = span_to_slot_span_start(span);
    let return_slot = base + size * (*span).num_allocated_slots as usize;
    let first_freelist_pointer = return_slot + size;
    let first_freelist_pointer_extent =
        first_freelist_pointer + core::mem::size_of::<*mut FreelistEntry>();
    // Provision up to the end of the system page containing the first new
    // entry, or the end of the span, whichever comes first.
    let sub_page_limit = round_up_to_system_page(first_freelist_pointer);
    let slots_limit = return_slot + size * num_slots as usize;
    let freelist_limit = core::cmp::min(sub_page_limit, slots_limit);

    let mut num_new_freelist_entries: u16 = 0;
    if first_freelist_pointer_extent <= freelist_limit {
        // Only consider used space in the span: counting wasted space can be
        // off by one when a pointer fits where a whole slot does not.
        num_new_freelist_entries = 1;
        num_new_freelist_entries +=
            ((freelist_limit - first_freelist_pointer_extent) / size) as u16;
    }

    debug_assert!(num_new_freelist_entries + 1 <= num_slots);
    num_slots -= num_new_freelist_entries + 1;
    (*span).num_unprovisioned_slots = num_slots;
    (*span).num_allocated_slots += 1;

    if num_new_freelist_entries > 0 {
        let mut freelist_pointer = first_freelist_pointer;
        let mut entry = freelist_pointer as *mut FreelistEntry;
        (*span).freelist_head = entry;
        let mut remaining = num_new_freelist_entries;
        while remaining > 1 {
            freelist_pointer += size;
            let next_entry = freelist_pointer as *mut FreelistEntry;
            FreelistEntry::set_next(entry, next_entry);
            entry = next_entry;
            remaining -= 1;
        }
        FreelistEntry::set_next(entry, null_mut());
    } else {
        (*span).freelist_head = null_mut();
    }
    return_slot
}

/* -----------------------------------------------------------
  Active list maintenance
----------------------------------------------------------- */

// Walks the bucket's active list for a span that can serve an allocation,
// tidying every span encountered on the way: empty spans move to the empty
// list, decommitted spans to the decommitted list, and full spans get
// detached with a negated slot count so that free() can recognize them.
pub(crate) unsafe fn set_new_active_span(bucket: *mut Bucket) -> bool {
    let mut span = (*bucket).active_head;
    if span == sentinel_slot_span() {
        return false;
    }

    while !span.is_null() {
        let next_span = (*span).next_span;
        debug_assert!((*span).bucket == bucket);
        debug_assert!(span != (*bucket).empty_head);
        debug_assert!(span != (*bucket).decommitted_head);

        if span_is_active(span) {
            // Usable: has freelist entries, or unprovisioned slots to make
            // freelist entries from.
            (*bucket).active_head = span;
            return true;
        }
        if span_is_empty(span) {
            (*span).next_span = (*bucket).empty_head;
            (*bucket).empty_head = span;
        } else if span_is_decommitted(span) {
            (*span).next_span = (*bucket).decommitted_head;
            (*bucket).decommitted_head = span;
        } else {
            debug_assert!(span_is_full(span));
            // Tag as full (negative count) and detach, so free() can move it
            // back onto the active list.
            (*span).num_allocated_slots = -(*span).num_allocated_slots;
            (*bucket).num_full_spans = (*bucket).num_full_spans.wrapping_add(1);
            partition_check!(
                (*bucket).num_full_spans != 0,
                "full-span counter overflow in bucket of slot size {}",
                (*bucket).slot_size
            );
            // Not strictly needed, but stops accidents.
            (*span).next_span = null_mut();
        }
        span = next_span;
    }

    (*bucket).active_head = sentinel_slot_span();
    false
}

/* -----------------------------------------------------------
  Super page acquisition
----------------------------------------------------------- */

// Hands out `num_partition_pages` contiguous partition pages, reserving a
// new super page when the current one is exhausted. Consecutive super pages
// are requested at adjacent addresses so that extents grow instead of
// multiplying; on 32-bit this is what keeps address space from fragmenting.
pub(crate) unsafe fn alloc_partition_pages(
    root: &PartitionRoot,
    core: &mut RootCore,
    num_partition_pages: u16,
) -> usize {
    debug_assert!(core.next_partition_page % PARTITION_PAGE_SIZE == 0);
    debug_assert!(core.next_partition_page_end % PARTITION_PAGE_SIZE == 0);
    debug_assert!((num_partition_pages as usize) <= NUM_PARTITION_PAGES_PER_SUPER_PAGE);
    let total_size = PARTITION_PAGE_SIZE * num_partition_pages as usize;
    let num_partition_pages_left =
        (core.next_partition_page_end - core.next_partition_page) >> PARTITION_PAGE_SHIFT;
    if num_partition_pages_left >= num_partition_pages as usize {
        // Still room in the current super page.
        let ret = core.next_partition_page;
        core.next_partition_page += total_size;
        crate::root::increase_committed_pages(core, total_size);
        return ret;
    }

    let requested_address = core.next_super_page;
    let super_page = os::reserve(
        requested_address,
        SUPER_PAGE_SIZE,
        SUPER_PAGE_SIZE,
        os::PageAccess::ReadWrite,
    );
    if super_page == 0 {
        return 0;
    }
    log::trace!("new super page at {:#x}", super_page);

    core.total_size_of_super_pages += SUPER_PAGE_SIZE;
    crate::root::increase_committed_pages(core, total_size);

    core.next_super_page = super_page + SUPER_PAGE_SIZE;
    let ret = super_page_payload_begin(super_page, root.quarantine_allowed);
    core.next_partition_page = ret + total_size;
    core.next_partition_page_end = super_page + SUPER_PAGE_SIZE - PARTITION_PAGE_SIZE;

    // First partition page: a guard system page, the metadata system page,
    // then guard pages to the partition page boundary.
    os::set_access(super_page, SYSTEM_PAGE_SIZE, os::PageAccess::Inaccessible);
    os::set_access(
        super_page + 2 * SYSTEM_PAGE_SIZE,
        PARTITION_PAGE_SIZE - 2 * SYSTEM_PAGE_SIZE,
        os::PageAccess::Inaccessible,
    );
    // The last partition page is all guard.
    os::set_access(
        super_page + SUPER_PAGE_SIZE - PARTITION_PAGE_SIZE,
        PARTITION_PAGE_SIZE,
        os::PageAccess::Inaccessible,
    );
    // The quarantine bitmap area stays inaccessible until the scanner claims
    // this partition; with the scanner already on, commit it right away.
    if root.quarantine_allowed {
        if root.scan_mode() {
            crate::root::increase_committed_pages(core, QUARANTINE_AREA_SIZE);
        } else {
            os::set_access(
                super_page + PARTITION_PAGE_SIZE,
                QUARANTINE_AREA_SIZE,
                os::PageAccess::Inaccessible,
            );
        }
    }

    // If a specific address was requested and something else came back, the
    // kernel's placement is probably unhelpful (most kernels allocate right
    // before the previous mapping, which is anything but random), so start
    // from a fresh address next time.
    if requested_address != 0 && requested_address != super_page {
        core.next_super_page = 0;
    }

    // Record the extent metadata. Every super page stores the root; only the
    // first of an extent carries the bounds and the next-extent link.
    let latest_extent = extent_entry_from_super_page(super_page);
    (*latest_extent).root = root as *const PartitionRoot as *mut PartitionRoot;
    (*latest_extent).next = null_mut();
    (*latest_extent).super_page_base = 0;
    (*latest_extent).num_consecutive_super_pages = 0;

    let current_extent = core.current_extent;
    let is_new_extent = super_page != requested_address;
    if is_new_extent {
        if current_extent.is_null() {
            debug_assert!(core.first_extent.is_null());
            core.first_extent = latest_extent;
        } else {
            debug_assert!((*current_extent).super_page_base != 0);
            (*current_extent).next = latest_extent;
        }
        core.current_extent = latest_extent;
        (*latest_extent).super_page_base = super_page;
        (*latest_extent).num_consecutive_super_pages = 1;
    } else {
        // Allocated next to the previous extent; just widen it.
        debug_assert!(!current_extent.is_null());
        debug_assert!((*current_extent).num_consecutive_super_pages > 0);
        (*current_extent).num_consecutive_super_pages += 1;
        debug_assert!(
            ret > (*current_extent).super_page_base
                && ret < (*current_extent).super_page_base
                    + (*current_extent).num_consecutive_super_pages as usize * SUPER_PAGE_SIZE
        );
    }
    ret
}

/* -----------------------------------------------------------
  Slow path
----------------------------------------------------------- */

// Reached when the active span has no freelist entry. In order of
// preference: rescan the active list, adopt an empty or decommitted span,
// carve a fresh span out of the super-page cursor. Sentinel buckets route to
// the direct mapper instead.
pub(crate) unsafe fn slow_path_alloc(
    root: &PartitionRoot,
    core: &mut RootCore,
    bucket: *mut Bucket,
    flags: u32,
    raw_size: usize,
    is_already_zeroed: &mut bool,
) -> usize {
    debug_assert!((*(*bucket).active_head).freelist_head.is_null());
    *is_already_zeroed = false;

    // Batched callers only want what the freelists already hold.
    if flags & ALLOC_FAST_PATH_OR_RETURN_NULL != 0 {
        return 0;
    }

    let return_null = flags & ALLOC_RETURN_NULL != 0;
    let mut new_span: *mut SlotSpan = null_mut();

    if (*bucket).is_direct_mapped() {
        debug_assert!(raw_size > MAX_BUCKETED);
        debug_assert!(bucket == sentinel_bucket());
        debug_assert!((*bucket).active_head == sentinel_slot_span());
        if raw_size > MAX_DIRECT_MAPPED {
            if return_null {
                return 0;
            }
            partition_excessive_allocation_size(raw_size);
        }
        new_span = direct_map::direct_map(root, core, raw_size);
        // A fresh mapping is known to be zero-filled.
        *is_already_zeroed = true;
    } else if set_new_active_span(bucket) {
        // Found a usable span in the active list.
        new_span = (*bucket).active_head;
        debug_assert!(span_is_active(new_span));
    } else if !(*bucket).empty_head.is_null() || !(*bucket).decommitted_head.is_null() {
        // Prefer empty spans, but beware that one may have been decommitted
        // behind our back; such spans get re-filed on the way.
        loop {
            new_span = (*bucket).empty_head;
            if new_span.is_null() {
                break;
            }
            debug_assert!((*new_span).bucket == bucket);
            debug_assert!(span_is_empty(new_span) || span_is_decommitted(new_span));
            (*bucket).empty_head = (*new_span).next_span;
            if !(*new_span).freelist_head.is_null() {
                (*new_span).next_span = null_mut();
                break;
            }
            debug_assert!(span_is_decommitted(new_span));
            (*new_span).next_span = (*bucket).decommitted_head;
            (*bucket).decommitted_head = new_span;
        }
        if new_span.is_null() && !(*bucket).decommitted_head.is_null() {
            new_span = (*bucket).decommitted_head;
            debug_assert!((*new_span).bucket == bucket);
            debug_assert!(span_is_decommitted(new_span));
            (*bucket).decommitted_head = (*new_span).next_span;
            let addr = span_to_slot_span_start(new_span);
            recommit_system_pages(core, addr, (*(*new_span).bucket).bytes_per_span());
            span_reset(new_span);
            *is_already_zeroed = true;
        }
        debug_assert!(!new_span.is_null());
    } else {
        // Brand new span.
        let num_partition_pages = (*bucket).num_partition_pages();
        let raw_pages = alloc_partition_pages(root, core, num_partition_pages);
        if raw_pages != 0 {
            new_span = span_from_addr_no_alignment_check(raw_pages);
            span_setup(new_span, bucket);
            *is_already_zeroed = true;
        }
    }

    if new_span.is_null() {
        debug_assert!((*bucket).active_head == sentinel_slot_span());
        if return_null {
            return 0;
        }
        partition_out_of_memory(
            core.total_size_of_super_pages + core.total_size_of_direct_mapped_pages,
            core.total_size_of_committed_pages,
            raw_size,
        );
    }

    // For direct maps this is the per-allocation bucket, not the sentinel.
    let bucket = (*new_span).bucket;
    debug_assert!(bucket != sentinel_bucket());
    (*bucket).active_head = new_span;
    span_set_raw_size(new_span, raw_size);

    // An active span with free slots, or an adopted empty span, has a usable
    // freelist head; otherwise provision one.
    if !(*new_span).freelist_head.is_null() {
        let entry = (*new_span).freelist_head;
        let new_head = FreelistEntry::get_next(entry);
        (*new_span).freelist_head = new_head;
        (*new_span).num_allocated_slots += 1;
        return entry as usize;
    }
    debug_assert!((*new_span).num_unprovisioned_slots > 0);
    alloc_and_fill_freelist(new_span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_sizing_packs_without_waste_for_small_classes() {
        // 8..=16KiB-sized classes always pack perfectly against a system
        // page boundary with the current constants.
        for slot_size in [8usize, 16, 24, 32, 96, 128, 256, 1024, 4096] {
            let pages = bucket_num_system_pages(slot_size) as usize;
            assert!(pages >= NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - 1);
            assert!(pages <= MAX_SYSTEM_PAGES_PER_SLOT_SPAN);
            let bytes = pages * SYSTEM_PAGE_SIZE;
            assert_eq!(bytes % slot_size, 0, "slot size {} wastes space", slot_size);
        }
    }

    #[test]
    fn span_sizing_is_exact_for_page_multiples() {
        let size = 96 * 1024;
        assert_eq!(bucket_num_system_pages(size) as usize, size / SYSTEM_PAGE_SIZE);
    }
}
