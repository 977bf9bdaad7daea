//! Hook plumbing: observers see traffic, overrides service calls, and the
//! OOM handler runs on exhaustion. Hooks are process-global, so they get
//! their own binary and a serialization lock.

use core::sync::atomic::{AtomicUsize, Ordering};
use partition_alloc::*;

static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn serialize() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

static ALLOCS_SEEN: AtomicUsize = AtomicUsize::new(0);
static FREES_SEEN: AtomicUsize = AtomicUsize::new(0);

fn count_allocs(_address: *mut u8, _size: usize, _type_name: &'static str) {
    ALLOCS_SEEN.fetch_add(1, Ordering::Relaxed);
}

fn count_frees(_address: *mut u8) {
    FREES_SEEN.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn observers_fire_for_every_alloc_and_free() {
    let _guard = serialize();
    let root = PartitionAllocator::new(PartitionOptions::default()).root();

    set_allocation_observer(Some(count_allocs));
    set_free_observer(Some(count_frees));
    let allocs_before = ALLOCS_SEEN.load(Ordering::Relaxed);
    let frees_before = FREES_SEEN.load(Ordering::Relaxed);

    let p = root.alloc(64, "observed");
    unsafe { root.free(p) };

    assert!(ALLOCS_SEEN.load(Ordering::Relaxed) > allocs_before);
    assert!(FREES_SEEN.load(Ordering::Relaxed) > frees_before);

    set_allocation_observer(None);
    set_free_observer(None);
}

// A free override that swallows one specific pointer.
static SWALLOW_TARGET: AtomicUsize = AtomicUsize::new(0);
static SWALLOWED: AtomicUsize = AtomicUsize::new(0);

fn swallow_one_free(address: *mut u8) -> bool {
    if address as usize == SWALLOW_TARGET.load(Ordering::Relaxed) {
        SWALLOWED.fetch_add(1, Ordering::Relaxed);
        return true;
    }
    false
}

#[test]
fn free_override_services_the_call() {
    let _guard = serialize();
    let root = PartitionAllocator::new(PartitionOptions::default()).root();

    let p = root.alloc(48, "override");
    SWALLOW_TARGET.store(p as usize, Ordering::Relaxed);
    set_free_override(Some(swallow_one_free));

    unsafe { root.free(p) };
    assert_eq!(SWALLOWED.load(Ordering::Relaxed), 1);
    // The slot never reached the freelist, so the same request gets a
    // different slot.
    let q = root.alloc(48, "override");
    assert_ne!(q, p);

    set_free_override(None);
    SWALLOW_TARGET.store(0, Ordering::Relaxed);
    unsafe {
        root.free(q);
        root.free(p);
    }
}

fn failing_oom_handler(size: usize) {
    panic!("allocator exhausted requesting {} bytes", size);
}

#[test]
#[should_panic(expected = "allocator exhausted")]
fn oom_handler_runs_on_excessive_sizes() {
    let _guard = serialize();
    partition_alloc_global_init(failing_oom_handler);
    let root = PartitionAllocator::new(PartitionOptions::default()).root();
    // No return-null flag: the handler decides, and it panics.
    let _ = root.alloc(MAX_DIRECT_MAPPED + 1, "oom");
}
