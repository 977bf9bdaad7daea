//! Process-global allocation hooks.
//!
//! Two kinds exist: observers, which are told about every allocation and
//! free after the fact, and overrides, which may service the call entirely.
//! Order of operations: the override runs first; when it reports the call as
//! serviced, the matching observer is skipped.
//!
//! Registration is single-writer: installing a non-null hook over an
//! existing one is a usage error. The hot-path loads are relaxed; whoever
//! registers a hook is responsible for publishing whatever state the hook
//! body reads.

use core::mem::transmute;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::internal::partition_check;

pub type AllocationObserverHook = fn(address: *mut u8, size: usize, type_name: &'static str);
pub type FreeObserverHook = fn(address: *mut u8);
pub type AllocationOverrideHook =
    fn(out: &mut *mut u8, flags: u32, size: usize, type_name: &'static str) -> bool;
pub type FreeOverrideHook = fn(address: *mut u8) -> bool;
pub type ReallocOverrideHook = fn(out_size: &mut usize, address: *mut u8) -> bool;

static ALLOCATION_OBSERVER: AtomicUsize = AtomicUsize::new(0);
static FREE_OBSERVER: AtomicUsize = AtomicUsize::new(0);
static ALLOCATION_OVERRIDE: AtomicUsize = AtomicUsize::new(0);
static FREE_OVERRIDE: AtomicUsize = AtomicUsize::new(0);
static REALLOC_OVERRIDE: AtomicUsize = AtomicUsize::new(0);

fn set_hook(slot: &AtomicUsize, value: usize, what: &str) {
    if value == 0 {
        slot.store(0, Ordering::Release);
        return;
    }
    let registered = slot
        .compare_exchange(0, value, Ordering::AcqRel, Ordering::Acquire)
        .is_ok();
    partition_check!(registered, "overwriting registered {} hook", what);
}

pub fn set_allocation_observer(hook: Option<AllocationObserverHook>) {
    set_hook(
        &ALLOCATION_OBSERVER,
        hook.map_or(0, |f| f as usize),
        "allocation observer",
    );
}

pub fn set_free_observer(hook: Option<FreeObserverHook>) {
    set_hook(&FREE_OBSERVER, hook.map_or(0, |f| f as usize), "free observer");
}

pub fn set_allocation_override(hook: Option<AllocationOverrideHook>) {
    set_hook(
        &ALLOCATION_OVERRIDE,
        hook.map_or(0, |f| f as usize),
        "allocation override",
    );
}

pub fn set_free_override(hook: Option<FreeOverrideHook>) {
    set_hook(&FREE_OVERRIDE, hook.map_or(0, |f| f as usize), "free override");
}

pub fn set_realloc_override(hook: Option<ReallocOverrideHook>) {
    set_hook(
        &REALLOC_OVERRIDE,
        hook.map_or(0, |f| f as usize),
        "realloc override",
    );
}

#[inline]
pub(crate) fn allocation_observer_if_enabled(
    address: *mut u8,
    size: usize,
    type_name: &'static str,
) {
    let raw = ALLOCATION_OBSERVER.load(Ordering::Relaxed);
    if raw != 0 {
        let hook: AllocationObserverHook = unsafe { transmute(raw) };
        hook(address, size, type_name);
    }
}

#[inline]
pub(crate) fn free_observer_if_enabled(address: *mut u8) {
    let raw = FREE_OBSERVER.load(Ordering::Relaxed);
    if raw != 0 {
        let hook: FreeObserverHook = unsafe { transmute(raw) };
        hook(address);
    }
}

/// Reports a reallocation to the observers as a free followed by an
/// allocation.
#[inline]
pub(crate) fn realloc_observer_if_enabled(
    old_address: *mut u8,
    new_address: *mut u8,
    size: usize,
    type_name: &'static str,
) {
    let alloc_raw = ALLOCATION_OBSERVER.load(Ordering::Relaxed);
    let free_raw = FREE_OBSERVER.load(Ordering::Relaxed);
    if alloc_raw != 0 && free_raw != 0 {
        let free_hook: FreeObserverHook = unsafe { transmute(free_raw) };
        let alloc_hook: AllocationObserverHook = unsafe { transmute(alloc_raw) };
        free_hook(old_address);
        alloc_hook(new_address, size, type_name);
    }
}

#[inline]
pub(crate) fn allocation_override_if_enabled(
    out: &mut *mut u8,
    flags: u32,
    size: usize,
    type_name: &'static str,
) -> bool {
    let raw = ALLOCATION_OVERRIDE.load(Ordering::Relaxed);
    if raw != 0 {
        let hook: AllocationOverrideHook = unsafe { transmute(raw) };
        return hook(out, flags, size, type_name);
    }
    false
}

#[inline]
pub(crate) fn free_override_if_enabled(address: *mut u8) -> bool {
    let raw = FREE_OVERRIDE.load(Ordering::Relaxed);
    if raw != 0 {
        let hook: FreeOverrideHook = unsafe { transmute(raw) };
        return hook(address);
    }
    false
}

#[inline]
pub(crate) fn realloc_override_if_enabled(out_size: &mut usize, address: *mut u8) -> bool {
    let raw = REALLOC_OVERRIDE.load(Ordering::Relaxed);
    if raw != 0 {
        let hook: ReallocOverrideHook = unsafe { transmute(raw) };
        return hook(out_size, address);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize as Counter;

    static OBSERVED: Counter = Counter::new(0);

    fn count_frees(_address: *mut u8) {
        OBSERVED.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn observer_registration_round_trips() {
        set_free_observer(Some(count_frees));
        free_observer_if_enabled(0x1000 as *mut u8);
        assert!(OBSERVED.load(Ordering::Relaxed) >= 1);
        set_free_observer(None);
        let before = OBSERVED.load(Ordering::Relaxed);
        free_observer_if_enabled(0x1000 as *mut u8);
        assert_eq!(OBSERVED.load(Ordering::Relaxed), before);
    }
}
