//! Freelist entries. Every free slot holds one encoded pointer to the next
//! free slot of the same bucket.

/// The transform is a bijective involution chosen so that using a freed
/// object, or partially overwriting a freelist pointer, produces a value
/// that faults when dereferenced:
///
/// * On little endian the pointer is byte-swapped. A stale vtable load
///   through a freed object lands in the high half of the address space,
///   and a linear overflow that rewrites the low bytes ends up corrupting
///   the *high* bytes of the decoded pointer.
/// * On big endian a byte swap gives no such guarantee, so the bits are
///   negated instead.
#[inline]
fn transform(address: usize) -> usize {
    #[cfg(target_endian = "little")]
    {
        address.swap_bytes()
    }
    #[cfg(target_endian = "big")]
    {
        !address
    }
}

#[repr(C)]
pub struct FreelistEntry {
    next: usize,
}

// The raw transform, for code that rewrites freelist cells in bulk (the
// purge path treats the head cell and entry cells uniformly).
#[inline]
pub(crate) fn encode_ptr(ptr: *mut FreelistEntry) -> usize {
    transform(ptr as usize)
}

#[inline]
pub(crate) fn decode(value: usize) -> *mut FreelistEntry {
    transform(value) as *mut FreelistEntry
}

impl FreelistEntry {
    #[inline]
    pub unsafe fn get_next(entry: *const FreelistEntry) -> *mut FreelistEntry {
        transform((*entry).next) as *mut FreelistEntry
    }

    #[inline]
    pub unsafe fn set_next(entry: *mut FreelistEntry, next: *mut FreelistEntry) {
        (*entry).next = transform(next as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_is_an_involution() {
        for value in [0usize, 1, 0xDEAD_BEEF, usize::MAX, usize::MAX / 3] {
            assert_eq!(transform(transform(value)), value);
        }
    }

    #[test]
    fn null_round_trips() {
        let mut entry = FreelistEntry { next: 0xFFFF_FFFF };
        unsafe {
            FreelistEntry::set_next(&mut entry, core::ptr::null_mut());
            assert!(FreelistEntry::get_next(&entry).is_null());
        }
    }

    #[test]
    fn partial_overwrite_corrupts_the_high_bytes() {
        // A linear overflow rewriting the first (low) bytes of the stored
        // value must not yield a plausible nearby pointer.
        let target = 0x5555_4000usize;
        let mut entry = FreelistEntry { next: 0 };
        unsafe {
            FreelistEntry::set_next(&mut entry, target as *mut FreelistEntry);
        }
        entry.next = (entry.next & !0xFF) | 0x41;
        let decoded = unsafe { FreelistEntry::get_next(&entry) } as usize;
        assert_ne!(decoded, target);
        #[cfg(target_endian = "little")]
        assert_ne!(decoded >> (usize::BITS - 8), target >> (usize::BITS - 8));
    }
}
