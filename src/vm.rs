//! Virtual memory facade.
//!
//! Thin platform layer over reserve/commit/decommit/release plus the direct
//! OS allocation paths used by the large registry. Reserved ranges hold
//! address space only; pages are committed lazily and can be handed back
//! without releasing the range.
//!
//! `reserve` is not required to return aligned bases; callers that need
//! cell or superblock alignment align up and shrink the usable range.

#[cfg(unix)]
mod sys {
    use std::ptr;

    fn anon_flags() -> libc::c_int {
        #[cfg(target_os = "linux")]
        {
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE
        }
        #[cfg(not(target_os = "linux"))]
        {
            libc::MAP_PRIVATE | libc::MAP_ANON
        }
    }

    pub fn reserve(size: usize) -> *mut u8 {
        // PROT_NONE keeps the range free of physical pages until commit.
        let ptr = unsafe {
            libc::mmap(ptr::null_mut(), size, libc::PROT_NONE, anon_flags(), -1, 0)
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    pub fn commit(addr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
    }

    pub fn decommit(addr: *mut u8, size: usize) {
        // Drop the physical pages, then re-seal the range so stray reads
        // fault instead of observing stale or zeroed data.
        unsafe {
            libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED);
            libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_NONE);
        }
    }

    pub fn release(base: *mut u8, size: usize) {
        unsafe {
            libc::munmap(base as *mut libc::c_void, size);
        }
    }

    pub fn os_alloc(size: usize, try_huge: bool) -> (*mut u8, bool) {
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        #[cfg(target_os = "linux")]
        if try_huge {
            let ptr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    size,
                    prot,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                    -1,
                    0,
                )
            };
            if ptr != libc::MAP_FAILED {
                return (ptr as *mut u8, true);
            }
            // Huge pages are advisory; fall through to standard pages.
        }
        #[cfg(not(target_os = "linux"))]
        let _ = try_huge;

        let ptr = unsafe { libc::mmap(ptr::null_mut(), size, prot, anon_flags_rw(), -1, 0) };
        if ptr == libc::MAP_FAILED {
            (ptr::null_mut(), false)
        } else {
            (ptr as *mut u8, false)
        }
    }

    pub fn os_free(base: *mut u8, len: usize) {
        unsafe {
            libc::munmap(base as *mut libc::c_void, len);
        }
    }

    pub fn os_alloc_aligned(size: usize, align: usize) -> (*mut u8, *mut u8, usize) {
        // Over-map by `align` and return an aligned offset inside the
        // mapping; the whole raw mapping is what gets released.
        let raw_len = size + align;
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                raw_len,
                libc::PROT_READ | libc::PROT_WRITE,
                anon_flags_rw(),
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return (ptr::null_mut(), ptr::null_mut(), 0);
        }
        let raw = raw as *mut u8;
        let aligned = ((raw as usize + align - 1) & !(align - 1)) as *mut u8;
        (aligned, raw, raw_len)
    }

    fn anon_flags_rw() -> libc::c_int {
        #[cfg(target_os = "linux")]
        {
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS
        }
        #[cfg(not(target_os = "linux"))]
        {
            libc::MAP_PRIVATE | libc::MAP_ANON
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_LARGE_PAGES, MEM_RELEASE,
        MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE,
    };

    pub fn reserve(size: usize) -> *mut u8 {
        unsafe { VirtualAlloc(ptr::null(), size, MEM_RESERVE, PAGE_NOACCESS) as *mut u8 }
    }

    pub fn commit(addr: *mut u8, size: usize) -> bool {
        unsafe { !VirtualAlloc(addr as *const _, size, MEM_COMMIT, PAGE_READWRITE).is_null() }
    }

    pub fn decommit(addr: *mut u8, size: usize) {
        unsafe {
            VirtualFree(addr as *mut _, size, MEM_DECOMMIT);
        }
    }

    pub fn release(base: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(base as *mut _, 0, MEM_RELEASE);
        }
    }

    pub fn os_alloc(size: usize, try_huge: bool) -> (*mut u8, bool) {
        if try_huge {
            // MEM_LARGE_PAGES needs SeLockMemoryPrivilege; fall back when absent.
            let ptr = unsafe {
                VirtualAlloc(
                    ptr::null(),
                    size,
                    MEM_COMMIT | MEM_RESERVE | MEM_LARGE_PAGES,
                    PAGE_READWRITE,
                )
            };
            if !ptr.is_null() {
                return (ptr as *mut u8, true);
            }
        }
        let ptr = unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        (ptr as *mut u8, false)
    }

    pub fn os_free(base: *mut u8, _len: usize) {
        unsafe {
            VirtualFree(base as *mut _, 0, MEM_RELEASE);
        }
    }

    pub fn os_alloc_aligned(size: usize, align: usize) -> (*mut u8, *mut u8, usize) {
        let raw_len = size + align;
        let raw = unsafe { VirtualAlloc(ptr::null(), raw_len, MEM_RESERVE, PAGE_NOACCESS) };
        if raw.is_null() {
            return (ptr::null_mut(), ptr::null_mut(), 0);
        }
        let raw = raw as *mut u8;
        let aligned = ((raw as usize + align - 1) & !(align - 1)) as *mut u8;
        let committed = unsafe {
            VirtualAlloc(aligned as *const _, size, MEM_COMMIT, PAGE_READWRITE)
        };
        if committed.is_null() {
            unsafe {
                VirtualFree(raw as *mut _, 0, MEM_RELEASE);
            }
            return (ptr::null_mut(), ptr::null_mut(), 0);
        }
        (aligned, raw, raw_len)
    }
}

/// Reserve `size` bytes of address space without committing pages.
/// Returns null on failure.
pub fn reserve(size: usize) -> *mut u8 {
    sys::reserve(size)
}

/// Back `[addr, addr + size)` with readable, writable pages.
pub fn commit(addr: *mut u8, size: usize) -> bool {
    sys::commit(addr, size)
}

/// Return the physical pages of `[addr, addr + size)` to the OS. The range
/// stays reserved; its contents are unspecified afterwards.
pub fn decommit(addr: *mut u8, size: usize) {
    sys::decommit(addr, size)
}

/// Release an entire reserved range.
pub fn release(base: *mut u8, size: usize) {
    sys::release(base, size)
}

/// Direct OS allocation for the large registry. `try_huge` is advisory;
/// the second element of the return is whether huge pages were actually
/// used.
pub fn os_alloc(size: usize, try_huge: bool) -> (*mut u8, bool) {
    sys::os_alloc(size, try_huge)
}

/// Free a direct OS allocation.
pub fn os_free(base: *mut u8, len: usize) {
    sys::os_free(base, len)
}

/// Direct OS allocation with explicit alignment. Returns
/// `(aligned_ptr, raw_base, raw_len)`; pass the raw pair to [`os_free`].
/// All three are null/zero on failure.
pub fn os_alloc_aligned(size: usize, align: usize) -> (*mut u8, *mut u8, usize) {
    sys::os_alloc_aligned(size, align)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = 4 * 1024 * 1024;
        let base = reserve(size);
        assert!(!base.is_null());

        assert!(commit(base, 4096));
        unsafe {
            base.write(0xAB);
            assert_eq!(base.read(), 0xAB);
        }

        decommit(base, 4096);
        assert!(commit(base, 4096));
        release(base, size);
    }

    #[test]
    fn test_os_alloc_roundtrip() {
        let (ptr, _huge) = os_alloc(1 << 20, false);
        assert!(!ptr.is_null());
        unsafe {
            ptr.write_bytes(0x5A, 1 << 20);
        }
        os_free(ptr, 1 << 20);
    }

    #[test]
    fn test_os_alloc_aligned() {
        let (aligned, raw, raw_len) = os_alloc_aligned(8192, 65536);
        assert!(!aligned.is_null());
        assert_eq!(aligned as usize % 65536, 0);
        unsafe {
            aligned.write_bytes(0x77, 8192);
        }
        os_free(raw, raw_len);
    }
}
