//! Quarantine and scanner behaviour: deferred freeing, conservative
//! reachability through heap and stack roots, sweeping, and double-free
//! detection. Scans are process-global, so the tests run one at a time.

use core::sync::atomic::{AtomicUsize, Ordering};
use partition_alloc::*;

static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn serialize() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn new_scannable_root() -> &'static PartitionRoot {
    let root = PartitionAllocator::new(PartitionOptions {
        quarantine: QuarantineMode::Allowed,
        cookies: CookiesMode::Disallowed,
        ..PartitionOptions::default()
    })
    .root();
    PCScan::instance().register_scannable_root(root);
    root
}

fn scan_blocking() {
    let pcscan = PCScan::instance();
    // An asynchronous scan kicked off by a quarantine threshold may still be
    // draining; wait it out so this scan is ours.
    while pcscan.is_running() {
        std::thread::yield_now();
    }
    pcscan.perform_scan(InvocationMode::Blocking);
}

#[test]
fn free_quarantines_instead_of_recycling() {
    let _guard = serialize();
    let root = new_scannable_root();
    let p = root.alloc(64, "q");
    unsafe { root.free(p) };
    assert!(PCScan::instance().is_quarantined(root, p));
    // The slot is not on any freelist: a fresh allocation must not get it.
    let q = root.alloc(64, "q");
    assert_ne!(q, p);
    unsafe { root.free(q) };
    scan_blocking();
}

#[test]
fn s8_heap_reference_keeps_the_object_quarantined() {
    let _guard = serialize();
    let root = new_scannable_root();

    let a = root.alloc(64, "list") as *mut usize;
    let b = root.alloc(64, "list");
    unsafe {
        core::ptr::write_bytes(a as *mut u8, 0, 64);
        *a = b as usize; // A -> B
        root.free(b);
    }
    assert!(PCScan::instance().is_quarantined(root, b));

    scan_blocking();
    // Still reachable from A, so still quarantined and not reusable.
    assert!(PCScan::instance().is_quarantined(root, b));
    let probe = root.alloc(64, "probe");
    assert_ne!(probe, b);
    unsafe { core::ptr::write_bytes(probe, 0, 64) };

    // Drop the reference and scan again: now it gets swept.
    unsafe { *a = 0 };
    scan_blocking();
    assert!(!PCScan::instance().is_quarantined(root, b));
    let reused = root.alloc(64, "reuse");
    assert_eq!(reused, b);

    unsafe {
        root.free(reused);
        root.free(probe);
        root.free(a as *mut u8);
    }
    scan_blocking();
}

// A fake stack for the oracle-driven variant of the reachability test.
#[repr(align(32))]
struct FakeStack([AtomicUsize; 8]);

static FAKE_STACK: FakeStack = FakeStack([
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
]);

fn fake_stack_oracle(visit: &mut dyn FnMut(usize, usize)) {
    let begin = FAKE_STACK.0.as_ptr() as usize;
    visit(begin, begin + core::mem::size_of::<FakeStack>());
}

#[test]
fn p8_stack_reference_keeps_the_object_quarantined() {
    let _guard = serialize();
    let root = new_scannable_root();
    PCScan::instance().set_stack_ranges_oracle(Some(fake_stack_oracle));

    let p = root.alloc(128, "stack");
    FAKE_STACK.0[3].store(p as usize, Ordering::Relaxed);
    unsafe { root.free(p) };
    assert!(PCScan::instance().is_quarantined(root, p));

    scan_blocking();
    assert!(PCScan::instance().is_quarantined(root, p));

    FAKE_STACK.0[3].store(0, Ordering::Relaxed);
    scan_blocking();
    assert!(!PCScan::instance().is_quarantined(root, p));
    let reused = root.alloc(128, "stack");
    assert_eq!(reused, p);
    unsafe { root.free(reused) };

    PCScan::instance().set_stack_ranges_oracle(None);
    scan_blocking();
}

#[test]
fn interior_pointers_count_as_references() {
    let _guard = serialize();
    let root = new_scannable_root();
    let a = root.alloc(64, "interior") as *mut usize;
    let b = root.alloc(256, "interior");
    unsafe {
        core::ptr::write_bytes(a as *mut u8, 0, 64);
        // Point into the middle of B, not at its start.
        *a = b as usize + 100;
        root.free(b);
    }
    scan_blocking();
    assert!(PCScan::instance().is_quarantined(root, b));

    unsafe { *a = 0 };
    scan_blocking();
    assert!(!PCScan::instance().is_quarantined(root, b));
    unsafe { root.free(a as *mut u8) };
    scan_blocking();
}

#[test]
fn nonscannable_roots_are_swept_but_not_scanned() {
    let _guard = serialize();
    let opaque_root = PartitionAllocator::new(PartitionOptions {
        quarantine: QuarantineMode::Allowed,
        cookies: CookiesMode::Disallowed,
        ..PartitionOptions::default()
    })
    .root();
    PCScan::instance().register_nonscannable_root(opaque_root);

    let p = opaque_root.alloc(512, "opaque");
    unsafe { root_free_and_check(opaque_root, p) };

    scan_blocking();
    assert!(!PCScan::instance().is_quarantined(opaque_root, p));
    let reused = opaque_root.alloc(512, "opaque");
    assert_eq!(reused, p);
    unsafe { opaque_root.free(reused) };
    scan_blocking();
}

unsafe fn root_free_and_check(root: &PartitionRoot, p: *mut u8) {
    root.free(p);
    assert!(PCScan::instance().is_quarantined(root, p));
}

#[test]
fn direct_maps_are_released_immediately() {
    let _guard = serialize();
    let root = new_scannable_root();
    let committed_before = root.total_size_of_committed_pages();
    let p = root.alloc(2 * 1024 * 1024, "dm");
    unsafe { root.free(p) };
    // No quarantine for direct maps; the mapping is gone right away.
    assert_eq!(root.total_size_of_committed_pages(), committed_before);
}

#[test]
fn quarantine_limit_triggers_a_scan() {
    let _guard = serialize();
    let root = new_scannable_root();
    let before = PCScan::instance().quarantined_bytes();

    // Push well past the scheduler limit; nothing references the objects,
    // so the triggered scan sweeps them.
    let ptrs: Vec<*mut u8> = (0..600).map(|_| root.alloc(4096, "burst")).collect();
    for &p in &ptrs {
        unsafe { root.free(p) };
    }

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let now_quarantined = PCScan::instance().quarantined_bytes();
        if now_quarantined < before + 600 * 4096 && !PCScan::instance().is_running() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "scan never triggered");
        std::thread::yield_now();
    }
}

#[test]
#[should_panic(expected = "double free")]
fn quarantined_double_free_is_detected() {
    let _guard = serialize();
    let root = new_scannable_root();
    let p = root.alloc(32, "double");
    unsafe {
        root.free(p);
        root.free(p);
    }
}
