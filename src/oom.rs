//! Out-of-memory handling.
//!
//! Two failure classes exist: an excessive allocation size (larger than any
//! direct map may be) and a failed page reservation. Both either return null
//! to the caller (when the return-null flag is set) or end up here, where
//! the registered handler runs and the process goes down. The handler is not
//! required to free memory and must not return.

use core::mem::transmute;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use log::error;

use crate::internal::partition_crash;

pub type OomHandler = fn(size: usize);

static OOM_HANDLER: AtomicUsize = AtomicUsize::new(0);

// Side channel distinguishing "out of virtual address space" from "out of
// physical memory" in crash reports.
static LOTS_OF_UNCOMMITTED_PAGES: AtomicBool = AtomicBool::new(false);

/// Installs the process-wide OOM handler. Must be called before the first
/// root is created.
pub fn partition_alloc_global_init(handler: OomHandler) {
    OOM_HANDLER.store(handler as usize, Ordering::Release);
}

/// Unhooks the handler and clears the OOM side channel.
pub fn partition_alloc_global_uninit_for_testing() {
    OOM_HANDLER.store(0, Ordering::Release);
    LOTS_OF_UNCOMMITTED_PAGES.store(false, Ordering::Relaxed);
}

/// Whether the last reservation failure was classified as address-space
/// exhaustion.
pub fn reported_lots_of_uncommitted_pages() -> bool {
    LOTS_OF_UNCOMMITTED_PAGES.load(Ordering::Relaxed)
}

fn run_handler(size: usize) {
    let raw = OOM_HANDLER.load(Ordering::Acquire);
    if raw != 0 {
        let handler: OomHandler = unsafe { transmute(raw) };
        handler(size);
    }
}

#[cold]
pub(crate) fn partition_excessive_allocation_size(size: usize) -> ! {
    error!("refusing excessive allocation of {} bytes", size);
    run_handler(size);
    partition_crash(format_args!("excessive allocation size: {} bytes", size));
}

#[cold]
pub(crate) fn partition_out_of_memory(total_reserved: usize, total_committed: usize, size: usize) -> ! {
    // A 32-bit process with a large committed/reserved gap almost certainly
    // ran out of address space, not RAM.
    #[cfg(target_pointer_width = "32")]
    {
        if total_reserved - total_committed > crate::types::REASONABLE_SIZE_OF_UNUSED_PAGES {
            LOTS_OF_UNCOMMITTED_PAGES.store(true, Ordering::Relaxed);
        }
    }
    #[cfg(not(target_pointer_width = "32"))]
    {
        let _ = (total_reserved, total_committed);
    }
    error!(
        "page reservation failed for {} bytes (reserved {}, committed {})",
        size, total_reserved, total_committed
    );
    run_handler(size);
    partition_crash(format_args!("out of memory allocating {} bytes", size));
}
