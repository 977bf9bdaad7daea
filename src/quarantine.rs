//! Quarantine bitmaps. Each super page of a quarantine-capable partition
//! reserves two bitmaps with one bit per 8-byte granule of the payload
//! region. Mutators set bits in one of them as they free; the scanner owns
//! the other. The roles swap with the scan epoch's parity, so "swapping the
//! bitmaps" at scan start is just an epoch increment: bits accumulated by
//! mutators since the previous scan become the scanner's working set, and
//! concurrent frees feed the next cycle.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::types::*;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum BitmapKind {
    Mutator,
    Scanner,
}

#[inline]
fn bitmap_index(kind: BitmapKind, epoch: usize) -> usize {
    match kind {
        BitmapKind::Mutator => epoch & 1,
        BitmapKind::Scanner => (epoch + 1) & 1,
    }
}

#[inline]
fn bitmap_base(kind: BitmapKind, epoch: usize, super_page: usize) -> usize {
    debug_assert!(super_page & SUPER_PAGE_OFFSET_MASK == 0);
    super_page + PARTITION_PAGE_SIZE + bitmap_index(kind, epoch) * QUARANTINE_BITMAP_SIZE
}

// Word index and bit mask for a payload address.
#[inline]
fn bit_position(addr: usize) -> (usize, usize) {
    let super_page = super_page_base(addr);
    let payload_begin = super_page_payload_begin(super_page, true);
    debug_assert!(addr >= payload_begin);
    debug_assert!(addr < super_page_payload_end(super_page));
    let granule = (addr - payload_begin) >> QUARANTINE_GRANULE_SHIFT;
    (granule / BITS_PER_SIZE_T, 1usize << (granule % BITS_PER_SIZE_T))
}

#[inline]
unsafe fn word(kind: BitmapKind, epoch: usize, addr: usize, word_index: usize) -> &'static AtomicUsize {
    let base = bitmap_base(kind, epoch, super_page_base(addr));
    &*((base + word_index * core::mem::size_of::<usize>()) as *const AtomicUsize)
}

/// Sets the bit for `addr`; returns whether it was already set (a sign of a
/// double free when coming from the mutator path).
pub(crate) unsafe fn set_bit(kind: BitmapKind, epoch: usize, addr: usize) -> bool {
    let (word_index, mask) = bit_position(addr);
    let previous = word(kind, epoch, addr, word_index).fetch_or(mask, Ordering::Relaxed);
    previous & mask != 0
}

pub(crate) unsafe fn check_bit(kind: BitmapKind, epoch: usize, addr: usize) -> bool {
    let (word_index, mask) = bit_position(addr);
    word(kind, epoch, addr, word_index).load(Ordering::Relaxed) & mask != 0
}

pub(crate) unsafe fn clear_bit(kind: BitmapKind, epoch: usize, addr: usize) {
    let (word_index, mask) = bit_position(addr);
    word(kind, epoch, addr, word_index).fetch_and(!mask, Ordering::Relaxed);
}

const BITMAP_WORDS: usize = QUARANTINE_BITMAP_SIZE / core::mem::size_of::<usize>();

/// Calls `visitor` with the payload address of every set bit.
pub(crate) unsafe fn iterate(
    kind: BitmapKind,
    epoch: usize,
    super_page: usize,
    mut visitor: impl FnMut(usize),
) {
    let base = bitmap_base(kind, epoch, super_page);
    let payload_begin = super_page_payload_begin(super_page, true);
    for word_index in 0..BITMAP_WORDS {
        let cell = &*((base + word_index * core::mem::size_of::<usize>()) as *const AtomicUsize);
        let mut value = cell.load(Ordering::Relaxed);
        while value != 0 {
            let bit = value.trailing_zeros() as usize;
            value &= value - 1;
            let granule = word_index * BITS_PER_SIZE_T + bit;
            visitor(payload_begin + (granule << QUARANTINE_GRANULE_SHIFT));
        }
    }
}

/// Like `iterate`, but clears each word after visiting its bits.
pub(crate) unsafe fn iterate_and_clear(
    kind: BitmapKind,
    epoch: usize,
    super_page: usize,
    mut visitor: impl FnMut(usize),
) {
    let base = bitmap_base(kind, epoch, super_page);
    let payload_begin = super_page_payload_begin(super_page, true);
    for word_index in 0..BITMAP_WORDS {
        let cell = &*((base + word_index * core::mem::size_of::<usize>()) as *const AtomicUsize);
        let mut value = cell.load(Ordering::Relaxed);
        if value == 0 {
            continue;
        }
        cell.store(0, Ordering::Relaxed);
        while value != 0 {
            let bit = value.trailing_zeros() as usize;
            value &= value - 1;
            let granule = word_index * BITS_PER_SIZE_T + bit;
            visitor(payload_begin + (granule << QUARANTINE_GRANULE_SHIFT));
        }
    }
}

pub(crate) unsafe fn is_empty(kind: BitmapKind, epoch: usize, super_page: usize) -> bool {
    let base = bitmap_base(kind, epoch, super_page);
    for word_index in 0..BITMAP_WORDS {
        let cell = &*((base + word_index * core::mem::size_of::<usize>()) as *const AtomicUsize);
        if cell.load(Ordering::Relaxed) != 0 {
            return false;
        }
    }
    true
}

/* -----------------------------------------------------------
  Card bytes
----------------------------------------------------------- */

// One card byte per super page, in the extent-entry metadata slot. The card
// answers "may this super page contain quarantined objects" with no false
// negatives; sweeping clears it and the next cycle's marking phase restores
// it for objects that survived.

#[inline]
unsafe fn card_of(super_page: usize) -> &'static AtomicU8 {
    &(*extent_entry_from_super_page(super_page)).card
}

pub(crate) unsafe fn set_card(addr: usize) {
    card_of(super_page_base(addr)).store(1, Ordering::Relaxed);
}

pub(crate) unsafe fn clear_card(super_page: usize) {
    card_of(super_page).store(0, Ordering::Relaxed);
}

pub(crate) unsafe fn is_card_set(addr: usize) -> bool {
    card_of(super_page_base(addr)).load(Ordering::Relaxed) != 0
}
