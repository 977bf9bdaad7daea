//! Slot-span level operations: the locked free path with its state
//! transitions, the ring of recently emptied spans, span decommit, and the
//! purge machinery that hands unused system pages back to the OS.

use core::ptr::null_mut;

use crate::bucket::set_new_active_span;
use crate::direct_map;
use crate::freelist::{self, FreelistEntry};
use crate::internal::partition_check;
use crate::os;
use crate::root::{decommit_system_pages, RootCore};
use crate::types::*;

// Discarded pages read back as zero on anonymous posix mappings, which
// matches the little-endian encoding of a null freelist link; that lets the
// tail entry's pointer word be discarded along with the rest of its page.
const CAN_DISCARD_FREELIST_TAIL: bool = cfg!(all(not(windows), target_endian = "little"));

/* -----------------------------------------------------------
  Locked free path
----------------------------------------------------------- */

// Pushes one slot back onto its span's freelist and walks the state machine
// for the span. Caller holds the partition lock. Cookie validation is the
// caller's business: slots flushed from a thread cache come through here a
// second time and no longer carry their cookies.
pub(crate) unsafe fn free_locked(core: &mut RootCore, span: *mut SlotSpan, slot_start: usize) {
    #[cfg(debug_assertions)]
    {
        let mut utilized = (*(*span).bucket).slot_size as usize;
        let raw_size = span_get_raw_size(span);
        if raw_size != 0 {
            utilized = raw_size;
        }
        crate::internal::fill_bytes(slot_start, FREED_BYTE, utilized);
    }

    debug_assert!((*span).num_allocated_slots != 0);
    let freelist_head = (*span).freelist_head;
    debug_assert!(freelist_head.is_null() || span_pointer_is_valid(span_from_addr(freelist_head as usize)));
    // Catches an immediate double free.
    partition_check!(
        slot_start != freelist_head as usize,
        "double free of {:#x}",
        slot_start
    );
    // Look for a double free one level deeper.
    debug_assert!(
        freelist_head.is_null()
            || slot_start != FreelistEntry::get_next(freelist_head) as usize
    );
    let entry = slot_start as *mut FreelistEntry;
    FreelistEntry::set_next(entry, freelist_head);
    (*span).freelist_head = entry;
    (*span).num_allocated_slots -= 1;
    if (*span).num_allocated_slots <= 0 {
        free_slow_path(core, span);
    } else {
        // Single-slot spans always take the slow path, which is where the
        // raw size gets maintained.
        debug_assert!(span_get_raw_size(span) == 0);
    }
}

// The span either became empty, or was full and regains a free slot.
pub(crate) unsafe fn free_slow_path(core: &mut RootCore, span: *mut SlotSpan) {
    let bucket = (*span).bucket;
    debug_assert!(span as *const _ != sentinel_slot_span() as *const _);
    if (*span).num_allocated_slots == 0 {
        // The span drained completely.
        if (*bucket).is_direct_mapped() {
            direct_map::direct_unmap(core, span);
            return;
        }
        // If it is the current active span, pick a successor; bouncing the
        // span towards the empty list nudges the bucket to defragment.
        if span == (*bucket).active_head {
            let _ = set_new_active_span(bucket);
        }
        debug_assert!((*bucket).active_head != span);

        span_set_raw_size(span, 0);
        debug_assert!(span_get_raw_size(span) == 0);

        register_empty_span(core, span);
    } else {
        debug_assert!(!(*bucket).is_direct_mapped());
        // The only other way here is a full span regaining a slot. A
        // transition from 0 to -1 means the span was already empty when the
        // slot came back: the same slot was freed twice.
        partition_check!(
            (*span).num_allocated_slots != -1,
            "double free emptied an already-empty slot span (slot size {})",
            (*bucket).slot_size
        );
        debug_assert!((*span).num_allocated_slots < 0);
        // One slot just went back on the freelist, so un-negate and account
        // for it in a single step.
        (*span).num_allocated_slots = -(*span).num_allocated_slots - 2;
        debug_assert!((*span).num_allocated_slots == (*bucket).slots_per_span() as i16 - 1);
        // Put the span back at the head of the active list to raise its
        // chance of filling up again.
        debug_assert!((*span).next_span.is_null());
        if (*bucket).active_head != sentinel_slot_span() {
            (*span).next_span = (*bucket).active_head;
        }
        (*bucket).active_head = span;
        (*bucket).num_full_spans -= 1;
        // A single-slot span is empty again right away.
        if (*span).num_allocated_slots == 0 {
            free_slow_path(core, span);
        }
    }
}

/* -----------------------------------------------------------
  Empty-span ring
----------------------------------------------------------- */

// A freshly emptied span goes into the ring rather than being decommitted
// outright, giving it a breathing period to be re-used at no cost. Whatever
// the incoming span evicts is decommitted in its place.
pub(crate) unsafe fn register_empty_span(core: &mut RootCore, span: *mut SlotSpan) {
    debug_assert!(span_is_empty(span));

    // Already registered: give the span another life.
    if (*span).empty_cache_index != -1 {
        debug_assert!((*span).empty_cache_index >= 0);
        debug_assert!(((*span).empty_cache_index as usize) < MAX_FREEABLE_SPANS);
        debug_assert!(core.global_empty_span_ring[(*span).empty_cache_index as usize] == span);
        core.global_empty_span_ring[(*span).empty_cache_index as usize] = null_mut();
    }

    let current_index = core.global_empty_span_ring_index;
    let span_to_decommit = core.global_empty_span_ring[current_index];
    // The evictee may well have been re-activated or filled up since.
    if !span_to_decommit.is_null() {
        decommit_span_if_possible(core, span_to_decommit);
    }

    core.global_empty_span_ring[current_index] = span;
    (*span).empty_cache_index = current_index as i16;
    core.global_empty_span_ring_index = (current_index + 1) % MAX_FREEABLE_SPANS;
}

pub(crate) unsafe fn decommit_span_if_possible(core: &mut RootCore, span: *mut SlotSpan) {
    debug_assert!((*span).empty_cache_index >= 0);
    debug_assert!(((*span).empty_cache_index as usize) < MAX_FREEABLE_SPANS);
    debug_assert!(span == core.global_empty_span_ring[(*span).empty_cache_index as usize]);
    (*span).empty_cache_index = -1;
    if span_is_empty(span) {
        decommit_span(core, span);
    }
}

unsafe fn decommit_span(core: &mut RootCore, span: *mut SlotSpan) {
    debug_assert!(span_is_empty(span));
    debug_assert!(!(*(*span).bucket).is_direct_mapped());
    let addr = span_to_slot_span_start(span);
    decommit_system_pages(core, addr, (*(*span).bucket).bytes_per_span());

    (*span).freelist_head = null_mut();
    (*span).num_unprovisioned_slots = 0;
    debug_assert!(span_is_decommitted(span));

    // Re-file from the empty list onto the decommitted list when the span is
    // sitting there; a span still in the active list gets swept to the right
    // place on the next active-list scan.
    let bucket = (*span).bucket;
    let mut prev: *mut SlotSpan = null_mut();
    let mut current = (*bucket).empty_head;
    while !current.is_null() {
        if current == span {
            if prev.is_null() {
                (*bucket).empty_head = (*span).next_span;
            } else {
                (*prev).next_span = (*span).next_span;
            }
            (*span).next_span = (*bucket).decommitted_head;
            (*bucket).decommitted_head = span;
            break;
        }
        prev = current;
        current = (*current).next_span;
    }
}

pub(crate) unsafe fn decommit_empty_spans(core: &mut RootCore) {
    for i in 0..MAX_FREEABLE_SPANS {
        let span = core.global_empty_span_ring[i];
        if !span.is_null() {
            decommit_span_if_possible(core, span);
        }
        core.global_empty_span_ring[i] = null_mut();
    }
}

/* -----------------------------------------------------------
  Discarding unused system pages
----------------------------------------------------------- */

// Reports, and with `discard` set releases, the system pages of a span that
// hold no live data: the tail beyond a single-slot allocation's raw size,
// whole trailing free slots (truncated back into unprovisioned space, with
// the freelist rewritten in address order), and page-sized holes inside
// free slots.
pub(crate) unsafe fn purge_span(span: *mut SlotSpan, discard: bool) -> usize {
    let bucket = (*span).bucket;
    let slot_size = (*bucket).slot_size as usize;
    if slot_size < SYSTEM_PAGE_SIZE || (*span).num_allocated_slots == 0 {
        return 0;
    }

    let num_slots_total = (*bucket).slots_per_span() as usize;
    let mut discardable_bytes = 0;

    let raw_size = span_get_raw_size(span);
    if raw_size != 0 {
        let used_bytes = round_up_to_system_page(raw_size);
        discardable_bytes = slot_size - used_bytes;
        if discardable_bytes != 0 && discard {
            let addr = span_to_slot_span_start(span) + used_bytes;
            os::discard(addr, discardable_bytes);
        }
        return discardable_bytes;
    }

    const MAX_SLOT_COUNT: usize =
        PARTITION_PAGE_SIZE * MAX_PARTITION_PAGES_PER_SLOT_SPAN / SYSTEM_PAGE_SIZE;
    debug_assert!(num_slots_total <= MAX_SLOT_COUNT);
    debug_assert!(((*span).num_unprovisioned_slots as usize) < num_slots_total);
    let mut num_slots = num_slots_total - (*span).num_unprovisioned_slots as usize;
    let mut slot_usage = [true; MAX_SLOT_COUNT];
    let mut last_slot = usize::MAX;
    let payload = span_to_slot_span_start(span);

    // Walk the freelist and build a map of the slots not in use.
    let mut entry = (*span).freelist_head;
    while !entry.is_null() {
        let slot_index = (entry as usize - payload) / slot_size;
        debug_assert!(slot_index < num_slots);
        slot_usage[slot_index] = false;
        let next = FreelistEntry::get_next(entry);
        if CAN_DISCARD_FREELIST_TAIL && next.is_null() {
            last_slot = slot_index;
        }
        entry = next;
    }

    // Free slots at the tail of the span can be truncated entirely.
    let mut truncated_slots = 0usize;
    while !slot_usage[num_slots - 1] {
        truncated_slots += 1;
        num_slots -= 1;
        debug_assert!(num_slots > 0);
    }

    let mut unprovisioned_bytes = 0;
    let mut truncation_begin = 0;
    if truncated_slots > 0 {
        truncation_begin = round_up_to_system_page(payload + num_slots * slot_size);
        // Round up at the end too: the span owns everything up to its last
        // page boundary.
        let truncation_end =
            round_up_to_system_page(payload + (num_slots + truncated_slots) * slot_size);
        debug_assert!(truncation_end <= payload + (*bucket).bytes_per_span());
        if truncation_begin < truncation_end {
            unprovisioned_bytes = truncation_end - truncation_begin;
            discardable_bytes += unprovisioned_bytes;
        }
    }

    if unprovisioned_bytes != 0 && discard {
        debug_assert!(truncated_slots > 0);
        let mut num_new_entries = 0usize;
        (*span).num_unprovisioned_slots += truncated_slots as u16;
        // Rewrite the freelist in address order, leaving the truncated tail
        // out. Every cell, the head included, is written encoded; the head
        // is decoded back at the end since heads are stored plain.
        let mut entry_cell =
            (&mut (*span).freelist_head) as *mut *mut FreelistEntry as *mut usize;
        for slot_index in 0..num_slots {
            if slot_usage[slot_index] {
                continue;
            }
            let entry_addr = payload + slot_index * slot_size;
            *entry_cell = freelist::encode_ptr(entry_addr as *mut FreelistEntry);
            entry_cell = entry_addr as *mut usize;
            num_new_entries += 1;
            if CAN_DISCARD_FREELIST_TAIL {
                last_slot = slot_index;
            }
        }
        *entry_cell = freelist::encode_ptr(null_mut());
        let head_cell = (&mut (*span).freelist_head) as *mut *mut FreelistEntry as *mut usize;
        (*span).freelist_head = freelist::decode(*head_cell);
        debug_assert!(num_new_entries == num_slots - (*span).num_allocated_slots as usize);
        os::discard(truncation_begin, unprovisioned_bytes);
    }

    // For the remaining free slots, release any whole system pages that do
    // not carry the freelist pointer or touch an adjacent slot.
    for i in 0..num_slots {
        if slot_usage[i] {
            continue;
        }
        let mut begin_addr = payload + i * slot_size;
        let end_addr = begin_addr + slot_size;
        if i != last_slot {
            begin_addr += core::mem::size_of::<*mut FreelistEntry>();
        }
        begin_addr = round_up_to_system_page(begin_addr);
        let end_addr = round_down_to_system_page(end_addr);
        if begin_addr < end_addr {
            let partial_slot_bytes = end_addr - begin_addr;
            discardable_bytes += partial_slot_bytes;
            if discard {
                os::discard(begin_addr, partial_slot_bytes);
            }
        }
    }
    discardable_bytes
}

pub(crate) unsafe fn purge_bucket(bucket: *mut Bucket) {
    if (*bucket).active_head != sentinel_slot_span() {
        let mut span = (*bucket).active_head;
        while !span.is_null() {
            debug_assert!(span as *const _ != sentinel_slot_span() as *const _);
            let _ = purge_span(span, true);
            span = (*span).next_span;
        }
    }
}

/* -----------------------------------------------------------
  Debug cookies
----------------------------------------------------------- */

#[cfg(debug_assertions)]
pub(crate) unsafe fn cookie_write_value(addr: usize) {
    let cookie = addr as *mut u8;
    for (i, byte) in COOKIE_VALUE.iter().enumerate() {
        *cookie.add(i) = *byte;
    }
}

#[cfg(debug_assertions)]
pub(crate) unsafe fn cookie_check_value(addr: usize) {
    let cookie = addr as *const u8;
    for (i, byte) in COOKIE_VALUE.iter().enumerate() {
        partition_check!(
            *cookie.add(i) == *byte,
            "cookie corrupted at {:#x}",
            addr + i
        );
    }
}
