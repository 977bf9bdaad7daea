//! Page primitive adapter. Everything the allocator asks of the OS goes
//! through here: reserving aligned address space, committing and
//! decommitting system pages, flipping protection, and discard hints.
//! Addresses cross this boundary as plain `usize` values.

#[cfg(not(windows))]
use libc::{
    madvise, mmap, mprotect, munmap, sysconf, MADV_DONTNEED, MAP_ANONYMOUS, MAP_FAILED,
    MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE, _SC_PAGESIZE,
};
#[cfg(windows)]
use winapi::um::{
    memoryapi::{VirtualAlloc, VirtualFree},
    sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
    winnt::{
        MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET, PAGE_NOACCESS,
        PAGE_READWRITE,
    },
};

use core::sync::atomic::{AtomicUsize, Ordering};
use log::warn;

use crate::types::SYSTEM_PAGE_SIZE;

// Granularity of address-space reservations. On Windows, VirtualAlloc hands
// out regions on 64KiB boundaries; elsewhere mmap works in system pages.
#[cfg(windows)]
pub const PAGE_ALLOCATION_GRANULARITY: usize = 1 << 16;
#[cfg(not(windows))]
pub const PAGE_ALLOCATION_GRANULARITY: usize = SYSTEM_PAGE_SIZE;
pub const PAGE_ALLOCATION_GRANULARITY_OFFSET_MASK: usize = PAGE_ALLOCATION_GRANULARITY - 1;
pub const PAGE_ALLOCATION_GRANULARITY_BASE_MASK: usize = !PAGE_ALLOCATION_GRANULARITY_OFFSET_MASK;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageAccess {
    Inaccessible,
    ReadWrite,
}

// Runtime system page size, filled in by `page_sizes_init`.
static OS_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

#[cfg(not(windows))]
fn runtime_page_size() -> usize {
    unsafe { sysconf(_SC_PAGESIZE) as usize }
}

#[cfg(windows)]
fn runtime_page_size() -> usize {
    unsafe {
        let mut si: SYSTEM_INFO = Default::default();
        GetSystemInfo(&mut si);
        si.dwPageSize as usize
    }
}

// The layout constants bake in a system page size; check at startup that the
// platform actually operates at (a divisor of) it.
pub(crate) fn page_sizes_init() {
    let os_page = runtime_page_size();
    assert!(os_page.is_power_of_two(), "system page size {} is not a power of two", os_page);
    assert!(
        SYSTEM_PAGE_SIZE % os_page == 0,
        "system page size {} is unsupported (compiled for {})",
        os_page,
        SYSTEM_PAGE_SIZE
    );
    OS_PAGE_SIZE.store(os_page, Ordering::Relaxed);
}

#[inline]
pub fn os_page_size() -> usize {
    let size = OS_PAGE_SIZE.load(Ordering::Relaxed);
    debug_assert!(size != 0);
    size
}

/* -----------------------------------------------------------
  Reservation and release
----------------------------------------------------------- */

#[cfg(not(windows))]
unsafe fn system_reserve(hint: usize, size: usize, access: PageAccess) -> usize {
    let prot = match access {
        PageAccess::Inaccessible => PROT_NONE,
        PageAccess::ReadWrite => PROT_READ | PROT_WRITE,
    };
    let p = mmap(hint as *mut _, size, prot, MAP_PRIVATE | MAP_ANONYMOUS, -1, 0);
    if p == MAP_FAILED {
        0
    } else {
        p as usize
    }
}

#[cfg(windows)]
unsafe fn system_reserve(hint: usize, size: usize, access: PageAccess) -> usize {
    let protect = match access {
        PageAccess::Inaccessible => PAGE_NOACCESS,
        PageAccess::ReadWrite => PAGE_READWRITE,
    };
    let flags = match access {
        PageAccess::Inaccessible => MEM_RESERVE,
        PageAccess::ReadWrite => MEM_RESERVE | MEM_COMMIT,
    };
    VirtualAlloc(hint as *mut _, size, flags, protect) as usize
}

#[cfg(not(windows))]
unsafe fn system_release(base: usize, size: usize) {
    if munmap(base as *mut _, size) == -1 {
        warn!(
            "munmap failed: {}, addr {:#x}, size {}",
            errno::errno(),
            base,
            size
        );
    }
}

#[cfg(windows)]
unsafe fn system_release(base: usize, _size: usize) {
    if VirtualFree(base as *mut _, 0, MEM_RELEASE) == 0 {
        warn!("VirtualFree(MEM_RELEASE) failed, addr {:#x}", base);
    }
}

/// Reserve `size` bytes of address space aligned to `align`, preferring the
/// address `hint` (which the OS may ignore). Returns 0 on failure. `size`
/// must be a multiple of the allocation granularity and `align` a power of
/// two no smaller than it.
pub fn reserve(hint: usize, size: usize, align: usize, access: PageAccess) -> usize {
    debug_assert!(size > 0 && size % PAGE_ALLOCATION_GRANULARITY == 0);
    debug_assert!(align.is_power_of_two() && align >= PAGE_ALLOCATION_GRANULARITY);
    debug_assert!(hint % align == 0);

    unsafe {
        // First try with the hint. Many kernels return an aligned block
        // outright when the previous reservation ended on one.
        let p = system_reserve(hint, size, access);
        if p == 0 {
            return reserve_aligned_slow(size, align, access);
        }
        if p % align == 0 {
            return p;
        }
        // Misaligned: give it back and fall through to trimming.
        system_release(p, size);
        reserve_aligned_slow(size, align, access)
    }
}

// Overallocate by `align` and carve the aligned interior out of the larger
// block.
#[cfg(not(windows))]
unsafe fn reserve_aligned_slow(size: usize, align: usize, access: PageAccess) -> usize {
    let over_size = match size.checked_add(align) {
        Some(total) => total,
        None => return 0,
    };
    let p = system_reserve(0, over_size, access);
    if p == 0 {
        return 0;
    }
    let aligned = align_up(p, align);
    let pre_size = aligned - p;
    let post_size = over_size - pre_size - size;
    debug_assert!(pre_size < over_size && post_size < over_size);
    if pre_size > 0 {
        system_release(p, pre_size);
    }
    if post_size > 0 {
        system_release(aligned + size, post_size);
    }
    aligned
}

// Windows cannot unmap parts of a reservation, so release the overallocation
// and re-reserve exactly at the aligned interior address. Threads race for
// the region, hence the bounded retry.
#[cfg(windows)]
unsafe fn reserve_aligned_slow(size: usize, align: usize, access: PageAccess) -> usize {
    let over_size = match size.checked_add(align) {
        Some(total) => total,
        None => return 0,
    };
    for _ in 0..3 {
        let p = system_reserve(0, over_size, access);
        if p == 0 {
            return 0;
        }
        system_release(p, over_size);
        let aligned = align_up(p, align);
        let q = system_reserve(aligned, size, access);
        if q == aligned {
            return q;
        }
        if q != 0 {
            system_release(q, size);
        }
    }
    0
}

/// Return a reservation obtained from `reserve` to the OS in full.
pub fn release(base: usize, size: usize) {
    debug_assert!(base != 0 && size > 0);
    unsafe { system_release(base, size) }
}

/* -----------------------------------------------------------
  Access control, commit and decommit
----------------------------------------------------------- */

/// Change protection on a system-page-aligned sub-range.
pub fn set_access(addr: usize, size: usize, access: PageAccess) -> bool {
    debug_assert!(addr % SYSTEM_PAGE_SIZE == 0);
    debug_assert!(size % SYSTEM_PAGE_SIZE == 0);
    unsafe {
        #[cfg(not(windows))]
        {
            let prot = match access {
                PageAccess::Inaccessible => PROT_NONE,
                PageAccess::ReadWrite => PROT_READ | PROT_WRITE,
            };
            let err = mprotect(addr as *mut _, size, prot);
            if err != 0 {
                warn!(
                    "mprotect failed: {}, addr {:#x}, size {}",
                    errno::errno(),
                    addr,
                    size
                );
            }
            err == 0
        }
        #[cfg(windows)]
        {
            match access {
                PageAccess::Inaccessible => {
                    VirtualFree(addr as *mut _, size, MEM_DECOMMIT) != 0
                }
                PageAccess::ReadWrite => {
                    !VirtualAlloc(addr as *mut _, size, MEM_COMMIT, PAGE_READWRITE).is_null()
                }
            }
        }
    }
}

/// Release the physical backing of a committed range and make it
/// inaccessible. The address range stays reserved.
pub fn decommit(addr: usize, size: usize) {
    debug_assert!(addr % SYSTEM_PAGE_SIZE == 0);
    debug_assert!(size % SYSTEM_PAGE_SIZE == 0);
    unsafe {
        #[cfg(not(windows))]
        {
            if madvise(addr as *mut _, size, MADV_DONTNEED) != 0 {
                warn!(
                    "madvise(MADV_DONTNEED) failed: {}, addr {:#x}, size {}",
                    errno::errno(),
                    addr,
                    size
                );
            }
            let _ = mprotect(addr as *mut _, size, PROT_NONE);
        }
        #[cfg(windows)]
        {
            if VirtualFree(addr as *mut _, size, MEM_DECOMMIT) == 0 {
                warn!("VirtualFree(MEM_DECOMMIT) failed, addr {:#x}, size {}", addr, size);
            }
        }
    }
}

/// Bring a decommitted range back into read-write use. Contents read as
/// zero afterwards on anonymous memory.
pub fn recommit(addr: usize, size: usize, access: PageAccess) -> bool {
    debug_assert!(access == PageAccess::ReadWrite);
    set_access(addr, size, access)
}

/// Hint that a committed range's contents are disposable. The pages stay
/// mapped and accessible; the OS may drop their backing at will, after which
/// reads return zeroes.
pub fn discard(addr: usize, size: usize) {
    debug_assert!(addr % SYSTEM_PAGE_SIZE == 0);
    debug_assert!(size % SYSTEM_PAGE_SIZE == 0);
    unsafe {
        #[cfg(not(windows))]
        {
            if madvise(addr as *mut _, size, MADV_DONTNEED) != 0 {
                warn!(
                    "madvise discard failed: {}, addr {:#x}, size {}",
                    errno::errno(),
                    addr,
                    size
                );
            }
        }
        #[cfg(windows)]
        {
            // MEM_RESET beats DiscardVirtualMemory for reuse-heavy patterns.
            let p = VirtualAlloc(addr as *mut _, size, MEM_RESET, PAGE_READWRITE);
            debug_assert!(p as usize == addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_respects_alignment() {
        page_sizes_init();
        let size = 4 * PAGE_ALLOCATION_GRANULARITY;
        let align = 1 << 21;
        let base = reserve(0, size, align, PageAccess::ReadWrite);
        assert!(base != 0);
        assert_eq!(base % align, 0);
        unsafe {
            core::ptr::write_bytes(base as *mut u8, 0x5A, size);
        }
        release(base, size);
    }

    #[test]
    fn decommit_then_recommit_zeroes() {
        page_sizes_init();
        let size = PAGE_ALLOCATION_GRANULARITY;
        let base = reserve(0, size, PAGE_ALLOCATION_GRANULARITY, PageAccess::ReadWrite);
        assert!(base != 0);
        unsafe {
            *(base as *mut u8) = 0x42;
        }
        decommit(base, size);
        assert!(recommit(base, size, PageAccess::ReadWrite));
        unsafe {
            assert_eq!(*(base as *mut u8), 0);
        }
        release(base, size);
    }
}
