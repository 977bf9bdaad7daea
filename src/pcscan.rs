//! The quarantine scanner. Freed slots of a quarantined partition stay out
//! of the freelists until a conservative scan of the registered roots (and
//! an optional stack oracle) proves that no reachable word still points at
//! them. One scan runs at a time, through a small state machine:
//!
//!   NotRunning -> Scheduled -> Scanning -> SweepingAndFinishing -> NotRunning
//!
//! Mutators hitting a safepoint while a scan is in progress join it and
//! help drain the scan worklists; the scanner waits for every joined
//! mutator to leave before sweeping.

use core::cell::Cell;
use core::mem::transmute;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Condvar, Mutex};

use crate::internal::partition_check;
use crate::quarantine::{self, BitmapKind};
use crate::root::PartitionRoot;
use crate::types::*;

// Scan as soon as this many quarantined bytes accumulate; the limit adapts
// after every scan to twice the surviving footprint.
pub const QUARANTINE_SIZE_MIN_LIMIT: usize = 1 << 20; // 1MiB

// Slot spans at or above this slot size are scanned slot by slot, so whole
// quarantined (and therefore zeroed) slots can be skipped.
const LARGE_SCAN_AREA_THRESHOLD: usize = 8192;

// Stacks are conservatively over-scanned to the strictest alignment any
// platform uses for spilled pointers.
const STACK_SCAN_ALIGNMENT: usize = 32;

const STATE_NOT_RUNNING: u8 = 0;
const STATE_SCHEDULED: u8 = 1;
const STATE_SCANNING: u8 = 2;
const STATE_SWEEPING_AND_FINISHING: u8 = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InvocationMode {
    /// Run the scan to completion on the calling thread.
    Blocking,
    /// Hand the scan to the dedicated scanner thread.
    NonBlocking,
}

/// Enumerates the pointer-holding word ranges of the process's thread
/// stacks. Stack walking itself is outside this crate; whoever can produce
/// the ranges registers the oracle.
pub type StackRangesOracle = fn(visit: &mut dyn FnMut(usize, usize));

struct Roots {
    scannable: Vec<usize>,
    nonscannable: Vec<usize>,
}

pub struct PCScan {
    state: AtomicU8,
    epoch: AtomicUsize,
    quarantine_size: AtomicUsize,
    quarantine_limit: AtomicUsize,
    roots: Mutex<Roots>,
    current_task: Mutex<Option<Arc<PCScanTask>>>,
    stack_oracle: AtomicUsize,
}

static PCSCAN: PCScan = PCScan {
    state: AtomicU8::new(STATE_NOT_RUNNING),
    epoch: AtomicUsize::new(0),
    quarantine_size: AtomicUsize::new(0),
    quarantine_limit: AtomicUsize::new(QUARANTINE_SIZE_MIN_LIMIT),
    roots: Mutex::new(Roots {
        scannable: Vec::new(),
        nonscannable: Vec::new(),
    }),
    current_task: Mutex::new(None),
    stack_oracle: AtomicUsize::new(0),
};

thread_local! {
    // A thread already inside the scanner must not re-enter through one of
    // its own frees.
    static IN_SCANNER: Cell<bool> = const { Cell::new(false) };
}

impl PCScan {
    pub fn instance() -> &'static PCScan {
        &PCSCAN
    }

    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    /// Registers a partition whose heap is both swept and scanned for
    /// pointers. Flips the partition into quarantined freeing.
    pub fn register_scannable_root(&self, root: &PartitionRoot) {
        root.enable_quarantine();
        let addr = root as *const PartitionRoot as usize;
        let mut roots = self.roots.lock();
        if !roots.scannable.contains(&addr) {
            roots.scannable.push(addr);
        }
    }

    /// Registers a partition that is swept but never holds pointers worth
    /// scanning (its payloads are opaque data).
    pub fn register_nonscannable_root(&self, root: &PartitionRoot) {
        root.enable_quarantine();
        let addr = root as *const PartitionRoot as usize;
        let mut roots = self.roots.lock();
        if !roots.nonscannable.contains(&addr) {
            roots.nonscannable.push(addr);
        }
    }

    pub fn set_stack_ranges_oracle(&self, oracle: Option<StackRangesOracle>) {
        self.stack_oracle
            .store(oracle.map_or(0, |f| f as usize), Ordering::Release);
    }

    /// Whether `ptr` (a value returned by alloc) is currently quarantined.
    pub fn is_quarantined(&self, root: &PartitionRoot, ptr: *mut u8) -> bool {
        let slot_start = root.adjust_pointer_for_extras_subtract(ptr as usize);
        unsafe { quarantine::check_bit(BitmapKind::Mutator, self.epoch(), slot_start) }
    }

    /// Bytes currently accounted as quarantined.
    pub fn quarantined_bytes(&self) -> usize {
        self.quarantine_size.load(Ordering::Relaxed)
    }

    /// Whether a scan is scheduled or in progress.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_NOT_RUNNING
    }

    pub fn perform_scan_if_needed(&self, mode: InvocationMode) {
        if self.quarantine_size.load(Ordering::Relaxed)
            >= self.quarantine_limit.load(Ordering::Relaxed)
        {
            self.perform_scan(mode);
        }
    }

    pub fn perform_scan(&self, mode: InvocationMode) {
        // One scan at a time; a request racing an in-flight scan is
        // absorbed by it.
        if self
            .state
            .compare_exchange(
                STATE_NOT_RUNNING,
                STATE_SCHEDULED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        // Advancing the epoch swaps the bitmap roles: everything mutators
        // quarantined so far becomes the scanner's working set.
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let task = Arc::new(PCScanTask::new(epoch));
        *self.current_task.lock() = Some(task.clone());
        // The release store publishes the swapped bitmaps to any mutator
        // that observes the scanning state at a safepoint.
        let previous = self.state.swap(STATE_SCANNING, Ordering::AcqRel);
        debug_assert!(previous == STATE_SCHEDULED);

        match mode {
            InvocationMode::Blocking => task.run_from_scanner(),
            InvocationMode::NonBlocking => post_to_scanner_thread(task),
        }
    }
}

/* -----------------------------------------------------------
  Mutator integration
----------------------------------------------------------- */

// The quarantined flavour of free: zero the slot, publish it in the mutator
// bitmap and the card filter, and kick the scheduler. The slot touches no
// freelist until a sweep proves it unreachable.
pub(crate) unsafe fn quarantine_on_free(
    root: &PartitionRoot,
    span: *mut SlotSpan,
    slot_start: usize,
) {
    let slot_size = (*(*span).bucket).slot_size as usize;
    // Eager clearing: a quarantined slot retains no references, which also
    // lets the scan skip it wholesale.
    crate::internal::fill_bytes(slot_start, 0, slot_size);

    let epoch = PCSCAN.epoch.load(Ordering::Acquire);
    let was_quarantined = quarantine::set_bit(BitmapKind::Mutator, epoch, slot_start);
    partition_check!(!was_quarantined, "double free of quarantined {:#x}", slot_start);
    quarantine::set_card(slot_start);

    let total = PCSCAN.quarantine_size.fetch_add(slot_size, Ordering::Relaxed) + slot_size;
    if total >= PCSCAN.quarantine_limit.load(Ordering::Relaxed) {
        PCSCAN.perform_scan_if_needed(InvocationMode::NonBlocking);
    }
    join_scan_if_needed(root);
}

// Safepoint. Allocation and free slow paths of quarantined partitions pass
// through here; when a scan is underway the mutator joins it.
pub(crate) fn join_scan_if_needed(_root: &PartitionRoot) {
    if PCSCAN.state.load(Ordering::Acquire) != STATE_SCANNING {
        return;
    }
    if IN_SCANNER.try_with(|flag| flag.get()).unwrap_or(true) {
        return;
    }
    let task = PCSCAN.current_task.lock().clone();
    if let Some(task) = task {
        task.run_from_mutator();
    }
}

/* -----------------------------------------------------------
  The scan task
----------------------------------------------------------- */

#[derive(Clone, Copy)]
struct ScanArea {
    begin: usize,
    end: usize,
}

#[derive(Clone, Copy)]
struct LargeScanArea {
    begin: usize,
    end: usize,
    slot_size: usize,
}

struct Snapshot {
    // Sorted bases of every quarantine-enabled super page; the coarse
    // "is this a managed address" filter of the pointer check.
    super_pages: Vec<usize>,
    scan_areas: Mutex<Vec<ScanArea>>,
    large_scan_areas: Mutex<Vec<LargeScanArea>>,
    super_pages_worklist: Mutex<Vec<usize>>,
}

struct SyncState {
    scanning_threads: usize,
    clear_done: bool,
}

struct PCScanTask {
    epoch: usize,
    snapshot: OnceCell<Snapshot>,
    sync: Mutex<SyncState>,
    cv: Condvar,
    survived: AtomicUsize,
    swept: AtomicUsize,
}

impl PCScanTask {
    fn new(epoch: usize) -> PCScanTask {
        PCScanTask {
            epoch,
            snapshot: OnceCell::new(),
            sync: Mutex::new(SyncState {
                scanning_threads: 0,
                clear_done: false,
            }),
            cv: Condvar::new(),
            survived: AtomicUsize::new(0),
            swept: AtomicUsize::new(0),
        }
    }

    /* ----- snapshot (phase 1) ----- */

    fn take_snapshot(epoch: usize) -> Snapshot {
        let snapshot = Snapshot {
            super_pages: Vec::new(),
            scan_areas: Mutex::new(Vec::new()),
            large_scan_areas: Mutex::new(Vec::new()),
            super_pages_worklist: Mutex::new(Vec::new()),
        };
        let mut super_pages = Vec::new();
        {
            let roots = PCSCAN.roots.lock();
            for &root_addr in &roots.scannable {
                let root = unsafe { &*(root_addr as *const PartitionRoot) };
                let core = root.lock_core();
                unsafe {
                    let mut extent = core.first_extent;
                    while !extent.is_null() {
                        let base = (*extent).super_page_base;
                        for i in 0..(*extent).num_consecutive_super_pages as usize {
                            let super_page = base + i * SUPER_PAGE_SIZE;
                            let visited = snapshot_super_page(&snapshot, super_page);
                            if visited > 0 {
                                super_pages.push(super_page);
                                snapshot.super_pages_worklist.lock().push(super_page);
                            } else {
                                // No live span means nothing quarantined.
                                debug_assert!(quarantine::is_empty(
                                    BitmapKind::Scanner,
                                    epoch,
                                    super_page
                                ));
                            }
                        }
                        extent = (*extent).next;
                    }
                }
            }
            for &root_addr in &roots.nonscannable {
                let root = unsafe { &*(root_addr as *const PartitionRoot) };
                let core = root.lock_core();
                unsafe {
                    let mut extent = core.first_extent;
                    while !extent.is_null() {
                        let base = (*extent).super_page_base;
                        for i in 0..(*extent).num_consecutive_super_pages as usize {
                            let super_page = base + i * SUPER_PAGE_SIZE;
                            super_pages.push(super_page);
                            snapshot.super_pages_worklist.lock().push(super_page);
                        }
                        extent = (*extent).next;
                    }
                }
            }
        }
        super_pages.sort_unstable();
        Snapshot {
            super_pages,
            ..snapshot
        }
    }

    /* ----- clear and card marking (phase 2) ----- */

    fn clear_and_mark_cards(&self, snapshot: &Snapshot) {
        // Quarantined slots were zeroed eagerly on free; what is left is
        // raising the card filter for every super page that holds any.
        loop {
            let super_page = match snapshot.super_pages_worklist.lock().pop() {
                Some(super_page) => super_page,
                None => break,
            };
            unsafe {
                if !quarantine::is_empty(BitmapKind::Scanner, self.epoch, super_page) {
                    quarantine::set_card(super_page);
                }
            }
        }
        let mut sync = self.sync.lock();
        sync.clear_done = true;
        self.cv.notify_all();
    }

    fn wait_for_clear(&self) {
        let mut sync = self.sync.lock();
        while !sync.clear_done {
            self.cv.wait(&mut sync);
        }
    }

    /* ----- stack scan (phase 3) ----- */

    fn scan_stacks(&self, snapshot: &Snapshot) {
        let raw = PCSCAN.stack_oracle.load(Ordering::Acquire);
        if raw == 0 {
            return;
        }
        let oracle: StackRangesOracle = unsafe { transmute(raw) };
        let survived = Cell::new(0usize);
        oracle(&mut |begin, end| {
            let begin = begin & !(STACK_SCAN_ALIGNMENT - 1);
            let end = (end + STACK_SCAN_ALIGNMENT - 1) & !(STACK_SCAN_ALIGNMENT - 1);
            survived.set(survived.get() + self.scan_range(snapshot, begin, end));
        });
        self.survived.fetch_add(survived.get(), Ordering::Relaxed);
    }

    /* ----- heap scan (phase 4) ----- */

    fn scan_partitions(&self, snapshot: &Snapshot) {
        let mut survived = 0usize;
        // Large slots first: whole quarantined slots can be skipped, since
        // their contents were zeroed and retain nothing.
        loop {
            let area = match snapshot.large_scan_areas.lock().pop() {
                Some(area) => area,
                None => break,
            };
            let mut slot = area.begin;
            while slot < area.end {
                let slot_end = core::cmp::min(slot + area.slot_size, area.end);
                let quarantined =
                    unsafe { quarantine::check_bit(BitmapKind::Scanner, self.epoch, slot) };
                if !quarantined {
                    survived += self.scan_range(snapshot, slot, slot_end);
                }
                slot += area.slot_size;
            }
        }
        loop {
            let area = match snapshot.scan_areas.lock().pop() {
                Some(area) => area,
                None => break,
            };
            survived += self.scan_range(snapshot, area.begin, area.end);
        }
        self.survived.fetch_add(survived, Ordering::Relaxed);
    }

    // Reads every pointer-aligned word in [begin, end) and applies the
    // pointer check. Returns the bytes of quarantined memory kept alive.
    fn scan_range(&self, snapshot: &Snapshot, begin: usize, end: usize) -> usize {
        debug_assert!(begin % core::mem::size_of::<usize>() == 0);
        let mut survived = 0;
        let mut addr = begin;
        while addr < end {
            let value = unsafe { *(addr as *const usize) };
            survived += self.try_mark(snapshot, value);
            addr += core::mem::size_of::<usize>();
        }
        survived
    }

    // The pointer check: (a) the word must land in a managed super page,
    // (b) the card filter must be raised, (c) the containing slot must be in
    // the scanner bitmap. A hit moves the slot back to the mutator bitmap,
    // deferring its release to a future cycle.
    fn try_mark(&self, snapshot: &Snapshot, maybe_ptr: usize) -> usize {
        let super_page = super_page_base(maybe_ptr);
        if snapshot.super_pages.binary_search(&super_page).is_err() {
            return 0;
        }
        unsafe {
            if !quarantine::is_card_set(maybe_ptr) {
                return 0;
            }
            if !is_within_super_page_payload(maybe_ptr, true) {
                return 0;
            }
            let span = span_from_addr_no_alignment_check(maybe_ptr);
            let bucket = (*span).bucket;
            if bucket.is_null() || (*bucket).is_direct_mapped() {
                return 0;
            }
            let payload = span_to_slot_span_start(span);
            if maybe_ptr < payload {
                return 0;
            }
            let offset_in_span = maybe_ptr - payload;
            if offset_in_span >= (*bucket).bytes_per_span() {
                // Points into the unused tail of the span's last page.
                return 0;
            }
            let slot_size = (*bucket).slot_size as usize;
            let slot_start = payload + (offset_in_span / slot_size) * slot_size;
            // Interior pointers count, but not past the user-visible size.
            let root = &*root_from_span(span);
            let usable_size = root.adjust_size_subtract(slot_size);
            let user_start = root.adjust_pointer_for_extras_add(slot_start);
            if maybe_ptr >= user_start + usable_size {
                return 0;
            }
            if !quarantine::check_bit(BitmapKind::Scanner, self.epoch, slot_start) {
                return 0;
            }
            quarantine::clear_bit(BitmapKind::Scanner, self.epoch, slot_start);
            quarantine::set_bit(BitmapKind::Mutator, self.epoch, slot_start);
            slot_size
        }
    }

    /* ----- sweep (phase 5) ----- */

    fn sweep(&self, snapshot: &Snapshot) {
        let mut swept = 0usize;
        for &super_page in &snapshot.super_pages {
            unsafe {
                let root = &*(*extent_entry_from_super_page(super_page)).root;
                quarantine::iterate_and_clear(
                    BitmapKind::Scanner,
                    self.epoch,
                    super_page,
                    |slot_start| {
                        let span = span_from_addr_no_alignment_check(slot_start);
                        swept += (*(*span).bucket).slot_size as usize;
                        root.raw_free(slot_start, span);
                    },
                );
                quarantine::clear_card(super_page);
            }
        }
        self.swept.store(swept, Ordering::Relaxed);
    }

    /* ----- drivers ----- */

    fn run_from_scanner(&self) {
        IN_SCANNER.with(|flag| flag.set(true));
        {
            let mut sync = self.sync.lock();
            sync.scanning_threads += 1;
        }
        // The sentinel span must never see a stray write.
        debug_assert!(unsafe { (*sentinel_slot_span()).num_allocated_slots } == 0);

        let snapshot = self.snapshot.get_or_init(|| Self::take_snapshot(self.epoch));
        self.clear_and_mark_cards(snapshot);
        self.scan_stacks(snapshot);
        self.scan_partitions(snapshot);

        // Close the door for new joiners, then wait out the ones inside.
        let previous = PCSCAN
            .state
            .swap(STATE_SWEEPING_AND_FINISHING, Ordering::AcqRel);
        debug_assert!(previous == STATE_SCANNING);
        {
            let mut sync = self.sync.lock();
            sync.scanning_threads -= 1;
            while sync.scanning_threads != 0 {
                self.cv.wait(&mut sync);
            }
        }

        self.sweep(snapshot);
        self.finish();
        IN_SCANNER.with(|flag| flag.set(false));
    }

    fn run_from_mutator(&self) {
        {
            let mut sync = self.sync.lock();
            // Scanning may have finished while this mutator was on its way
            // to the safepoint.
            if PCSCAN.state.load(Ordering::Acquire) != STATE_SCANNING {
                return;
            }
            sync.scanning_threads += 1;
        }
        IN_SCANNER.with(|flag| flag.set(true));
        let snapshot = self.snapshot.get_or_init(|| Self::take_snapshot(self.epoch));
        self.wait_for_clear();
        self.scan_partitions(snapshot);
        IN_SCANNER.with(|flag| flag.set(false));
        let mut sync = self.sync.lock();
        sync.scanning_threads -= 1;
        self.cv.notify_all();
    }

    fn finish(&self) {
        let survived = self.survived.load(Ordering::Relaxed);
        let swept = self.swept.load(Ordering::Relaxed);
        // What survived is still quarantined; scale the next trigger to it.
        PCSCAN.quarantine_size.store(survived, Ordering::Relaxed);
        PCSCAN.quarantine_limit.store(
            core::cmp::max(QUARANTINE_SIZE_MIN_LIMIT, 2 * survived),
            Ordering::Relaxed,
        );
        log::debug!(
            "quarantine scan done: survived {} bytes, swept {} bytes",
            survived,
            swept
        );
        *PCSCAN.current_task.lock() = None;
        let previous = PCSCAN.state.swap(STATE_NOT_RUNNING, Ordering::AcqRel);
        debug_assert!(previous == STATE_SWEEPING_AND_FINISHING);
    }
}

// Record scan areas for the live spans of one super page. Returns how many
// spans were visited.
unsafe fn snapshot_super_page(snapshot: &Snapshot, super_page: usize) -> usize {
    let mut visited = 0;
    let payload_end = super_page_payload_end(super_page);
    let mut addr = super_page_payload_begin(super_page, true);
    while addr < payload_end {
        let span = span_from_addr_no_alignment_check(addr);
        let bucket = (*span).bucket;
        if bucket.is_null() {
            // Past the carve cursor; the rest of the super page is virgin.
            break;
        }
        let span_pages = (*bucket).num_partition_pages() as usize;
        if !span_is_empty(span) && !span_is_decommitted(span) {
            let payload_begin = span_to_slot_span_start(span);
            let slot_size = (*bucket).slot_size as usize;
            let provisioned_size = ((*bucket).slots_per_span() as usize
                - (*span).num_unprovisioned_slots as usize)
                * slot_size;
            debug_assert!(provisioned_size > 0);
            if slot_size >= LARGE_SCAN_AREA_THRESHOLD {
                snapshot.large_scan_areas.lock().push(LargeScanArea {
                    begin: payload_begin,
                    end: payload_begin + provisioned_size,
                    slot_size,
                });
            } else {
                snapshot.scan_areas.lock().push(ScanArea {
                    begin: payload_begin,
                    end: payload_begin + provisioned_size,
                });
            }
            visited += 1;
        }
        addr += span_pages * PARTITION_PAGE_SIZE;
    }
    visited
}

/* -----------------------------------------------------------
  Scanner thread
----------------------------------------------------------- */

struct ScanThreadState {
    queue: Mutex<Option<Arc<PCScanTask>>>,
    cv: Condvar,
}

static SCAN_THREAD: Lazy<&'static ScanThreadState> = Lazy::new(|| {
    let state: &'static ScanThreadState = Box::leak(Box::new(ScanThreadState {
        queue: Mutex::new(None),
        cv: Condvar::new(),
    }));
    let spawned = std::thread::Builder::new()
        .name("pcscan".into())
        .spawn(move || loop {
            let task = {
                let mut queue = state.queue.lock();
                loop {
                    match queue.take() {
                        Some(task) => break task,
                        None => state.cv.wait(&mut queue),
                    }
                }
            };
            task.run_from_scanner();
        });
    partition_check!(spawned.is_ok(), "failed to spawn the scanner thread");
    state
});

fn post_to_scanner_thread(task: Arc<PCScanTask>) {
    let state = *SCAN_THREAD;
    *state.queue.lock() = Some(task);
    state.cv.notify_one();
}
