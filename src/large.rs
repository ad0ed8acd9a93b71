//! Registry of direct OS allocations above the buddy ceiling.
//!
//! Each entry records enough to release the allocation without an external
//! size argument, plus the raw mapping behind the aligned path (the
//! returned pointer sits at an aligned offset inside an over-sized
//! mapping).

use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::vm;

#[derive(Debug, Clone)]
struct LargeAlloc {
    size: usize,
    /// Base of the raw OS mapping (differs from the user pointer for
    /// aligned allocations).
    raw_base: usize,
    raw_len: usize,
    tag: u8,
    huge_pages: bool,
    aligned: bool,
}

/// Registry of large allocations, keyed by the user pointer.
pub struct LargeRegistry {
    allocs: Mutex<HashMap<usize, LargeAlloc>>,
    total_allocated: AtomicUsize,
}

impl LargeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            allocs: Mutex::new(HashMap::new()),
            total_allocated: AtomicUsize::new(0),
        }
    }

    /// Allocate `size` bytes directly from the OS, optionally trying huge
    /// pages (falling back to standard pages is mandatory).
    pub fn alloc(&self, size: usize, tag: u8, try_huge_pages: bool) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        let (ptr, used_huge) = vm::os_alloc(size, try_huge_pages);
        if ptr.is_null() {
            return ptr::null_mut();
        }

        self.allocs.lock().insert(
            ptr as usize,
            LargeAlloc {
                size,
                raw_base: ptr as usize,
                raw_len: size,
                tag,
                huge_pages: used_huge,
                aligned: false,
            },
        );
        self.total_allocated.fetch_add(size, Ordering::Relaxed);
        ptr
    }

    /// Allocate with an explicit power-of-two alignment.
    pub fn alloc_aligned(&self, size: usize, alignment: usize, tag: u8) -> *mut u8 {
        if size == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return ptr::null_mut();
        }

        let (aligned, raw, raw_len) = vm::os_alloc_aligned(size, alignment);
        if aligned.is_null() {
            return ptr::null_mut();
        }

        self.allocs.lock().insert(
            aligned as usize,
            LargeAlloc {
                size,
                raw_base: raw as usize,
                raw_len,
                tag,
                huge_pages: false,
                aligned: true,
            },
        );
        self.total_allocated.fetch_add(size, Ordering::Relaxed);
        aligned
    }

    /// Free a registered allocation. Unknown pointers (and null) are a
    /// no-op.
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let entry = self.allocs.lock().remove(&(ptr as usize));
        if let Some(entry) = entry {
            self.total_allocated.fetch_sub(entry.size, Ordering::Relaxed);
            vm::os_free(entry.raw_base as *mut u8, entry.raw_len);
        }
    }

    /// Resize a registered allocation: allocate new, copy
    /// `min(old, new)`, free old. Returns null (old block unchanged) when
    /// the pointer is unknown or the new allocation fails.
    pub fn realloc(&self, ptr: *mut u8, new_size: usize, tag: u8) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(new_size, tag, true);
        }
        if new_size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }

        let old = match self.get(ptr) {
            Some(info) => info,
            None => return ptr::null_mut(),
        };

        let new_ptr = self.alloc(new_size, tag, true);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            ptr::copy_nonoverlapping(ptr as *const u8, new_ptr, old.0.min(new_size));
        }
        self.free(ptr);
        new_ptr
    }

    /// Whether `ptr` is a live allocation of this registry.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.allocs.lock().contains_key(&(ptr as usize))
    }

    /// Recorded size and tag of a live allocation.
    pub fn get(&self, ptr: *const u8) -> Option<(usize, u8)> {
        self.allocs
            .lock()
            .get(&(ptr as usize))
            .map(|a| (a.size, a.tag))
    }

    /// Recorded size of a live allocation (budget accounting).
    pub fn get_alloc_size(&self, ptr: *const u8) -> Option<usize> {
        self.get(ptr).map(|(size, _)| size)
    }

    /// Whether a live allocation got huge pages.
    pub fn uses_huge_pages(&self, ptr: *const u8) -> bool {
        self.allocs
            .lock()
            .get(&(ptr as usize))
            .map(|a| a.huge_pages)
            .unwrap_or(false)
    }

    /// Bytes currently allocated through this registry.
    pub fn bytes_allocated(&self) -> usize {
        self.total_allocated.load(Ordering::Relaxed)
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.allocs.lock().len()
    }
}

impl Default for LargeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LargeRegistry {
    fn drop(&mut self) {
        // Everything still registered goes back to the OS.
        let mut allocs = self.allocs.lock();
        for (_, entry) in allocs.drain() {
            vm::os_free(entry.raw_base as *mut u8, entry.raw_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free() {
        let registry = LargeRegistry::new();

        let p = registry.alloc(3 * 1024 * 1024, 9, false);
        assert!(!p.is_null());
        assert!(registry.owns(p));
        assert_eq!(registry.get(p), Some((3 * 1024 * 1024, 9)));
        assert_eq!(registry.get_alloc_size(p), Some(3 * 1024 * 1024));
        assert!(!registry.uses_huge_pages(p));
        assert_eq!(registry.bytes_allocated(), 3 * 1024 * 1024);

        unsafe {
            p.write_bytes(0x11, 3 * 1024 * 1024);
        }

        registry.free(p);
        assert!(!registry.owns(p));
        assert_eq!(registry.bytes_allocated(), 0);
        assert_eq!(registry.allocation_count(), 0);
    }

    #[test]
    fn test_aligned() {
        let registry = LargeRegistry::new();

        let p = registry.alloc_aligned(1 << 20, 1 << 16, 0);
        assert!(!p.is_null());
        assert_eq!(p as usize % (1 << 16), 0);
        registry.free(p);

        // Non-power-of-two alignment is an invalid argument.
        assert!(registry.alloc_aligned(4096, 3000, 0).is_null());
        assert!(registry.alloc_aligned(0, 64, 0).is_null());
    }

    #[test]
    fn test_realloc_preserves_data() {
        let registry = LargeRegistry::new();

        let p = registry.alloc(1 << 20, 0, false);
        unsafe {
            p.write_bytes(0xBE, 1 << 20);
        }

        let q = registry.realloc(p, 4 << 20, 0);
        assert!(!q.is_null());
        assert!(!registry.owns(p) || p == q);
        unsafe {
            for i in (0..(1 << 20)).step_by(4096) {
                assert_eq!(q.add(i).read(), 0xBE);
            }
        }
        registry.free(q);
    }

    #[test]
    fn test_unknown_pointer_noop() {
        let registry = LargeRegistry::new();
        let bogus = 0x1234_5000 as *mut u8;
        registry.free(bogus);
        assert!(registry.realloc(bogus, 4096, 0).is_null());
        assert!(registry.get_alloc_size(bogus).is_none());
    }

    #[test]
    fn test_drop_releases_entries() {
        let registry = LargeRegistry::new();
        let _a = registry.alloc(1 << 20, 0, false);
        let _b = registry.alloc(1 << 20, 0, false);
        assert_eq!(registry.allocation_count(), 2);
        drop(registry);
    }
}
