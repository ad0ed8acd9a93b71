//! Optional debug instrumentation: guard bytes, leak tracking, and
//! allocation backtraces.
//!
//! Everything here is compile-time optional and has zero cost when its
//! feature is off; nothing changes the allocator's functional behavior.

#[cfg(feature = "guards")]
pub use guards::*;

#[cfg(feature = "leak-tracking")]
pub use leaks::*;

#[cfg(feature = "guards")]
mod guards {
    /// Byte pattern written into the guard regions.
    pub const GUARD_PATTERN: u8 = 0xAB;

    /// Bytes of guard placed before and after a guarded allocation.
    pub const GUARD_SIZE: usize = 16;

    /// Bytes of the front guard holding the stored user size (the rest is
    /// pattern). The free path needs the size to locate the back guard.
    const SIZE_FIELD: usize = 8;

    /// Lay out guards around a user region of `user_size` bytes starting
    /// at `block + GUARD_SIZE`.
    ///
    /// # Safety
    /// `block` must have at least `user_size + 2 * GUARD_SIZE` writable
    /// bytes.
    pub unsafe fn write_guards(block: *mut u8, user_size: usize) {
        block.cast::<u64>().write_unaligned(user_size as u64);
        block.add(SIZE_FIELD).write_bytes(GUARD_PATTERN, GUARD_SIZE - SIZE_FIELD);
        block
            .add(GUARD_SIZE + user_size)
            .write_bytes(GUARD_PATTERN, GUARD_SIZE);
    }

    /// User size recorded in the front guard.
    ///
    /// # Safety
    /// `block` must be a guarded block written by [`write_guards`].
    pub unsafe fn stored_user_size(block: *const u8) -> usize {
        block.cast::<u64>().read_unaligned() as usize
    }

    /// Check both guard regions. Returns false when any pattern byte was
    /// overwritten.
    ///
    /// # Safety
    /// `block` must be a guarded block written by [`write_guards`].
    pub unsafe fn verify_guards(block: *const u8) -> bool {
        let user_size = stored_user_size(block);
        for i in SIZE_FIELD..GUARD_SIZE {
            if block.add(i).read() != GUARD_PATTERN {
                return false;
            }
        }
        let back = block.add(GUARD_SIZE + user_size);
        for i in 0..GUARD_SIZE {
            if back.add(i).read() != GUARD_PATTERN {
                return false;
            }
        }
        true
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_guard_roundtrip() {
            let mut buf = vec![0u8; 256];
            let block = buf.as_mut_ptr();
            unsafe {
                write_guards(block, 100);
                assert_eq!(stored_user_size(block), 100);
                assert!(verify_guards(block));

                // Underrun: last byte before the user region.
                block.add(GUARD_SIZE - 1).write(0x00);
                assert!(!verify_guards(block));
                write_guards(block, 100);

                // Overrun: first byte after the user region.
                block.add(GUARD_SIZE + 100).write(0x00);
                assert!(!verify_guards(block));
            }
        }
    }
}

#[cfg(feature = "leak-tracking")]
mod leaks {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    /// Record kept for every live allocation.
    #[derive(Debug)]
    pub struct DebugAllocation {
        /// Requested size in bytes.
        pub size: usize,
        /// Application tag.
        pub tag: u8,
        /// Call stack captured at allocation time.
        #[cfg(feature = "stacktrace")]
        pub stack: backtrace::Backtrace,
    }

    /// Map of live allocations, keyed by user pointer.
    pub struct LeakMap {
        live: Mutex<HashMap<usize, DebugAllocation>>,
    }

    impl LeakMap {
        /// Create an empty map.
        pub fn new() -> Self {
            Self {
                live: Mutex::new(HashMap::new()),
            }
        }

        /// Record an allocation.
        pub fn insert(&self, ptr: *const u8, size: usize, tag: u8) {
            self.live.lock().insert(
                ptr as usize,
                DebugAllocation {
                    size,
                    tag,
                    #[cfg(feature = "stacktrace")]
                    stack: backtrace::Backtrace::new_unresolved(),
                },
            );
        }

        /// Remove an allocation record, returning it if present.
        pub fn remove(&self, ptr: *const u8) -> Option<DebugAllocation> {
            self.live.lock().remove(&(ptr as usize))
        }

        /// Update the recorded size of a live allocation (same-pointer
        /// realloc).
        pub fn update_size(&self, ptr: *const u8, size: usize) {
            if let Some(entry) = self.live.lock().get_mut(&(ptr as usize)) {
                entry.size = size;
            }
        }

        /// Number of live allocations.
        pub fn len(&self) -> usize {
            self.live.lock().len()
        }

        /// Whether no allocations are live.
        pub fn is_empty(&self) -> bool {
            self.live.lock().is_empty()
        }

        /// Log every live allocation.
        pub fn report(&self) {
            let live = self.live.lock();
            if live.is_empty() {
                return;
            }
            tracing::warn!(count = live.len(), "live allocations at teardown");
            for (ptr, entry) in live.iter() {
                #[cfg(feature = "stacktrace")]
                {
                    let mut stack = entry.stack.clone();
                    stack.resolve();
                    tracing::warn!(
                        ptr = format_args!("{ptr:#x}"),
                        size = entry.size,
                        tag = entry.tag,
                        stack = format_args!("{stack:?}"),
                        "leaked allocation"
                    );
                }
                #[cfg(not(feature = "stacktrace"))]
                tracing::warn!(
                    ptr = format_args!("{ptr:#x}"),
                    size = entry.size,
                    tag = entry.tag,
                    "leaked allocation"
                );
            }
        }
    }

    impl Default for LeakMap {
        fn default() -> Self {
            Self::new()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_leak_map_tracks_live_set() {
            let map = LeakMap::new();
            assert!(map.is_empty());

            map.insert(0x1000 as *const u8, 64, 1);
            map.insert(0x2000 as *const u8, 128, 2);
            assert_eq!(map.len(), 2);

            let entry = map.remove(0x1000 as *const u8).unwrap();
            assert_eq!(entry.size, 64);
            assert_eq!(entry.tag, 1);
            assert_eq!(map.len(), 1);

            map.update_size(0x2000 as *const u8, 256);
            assert_eq!(map.remove(0x2000 as *const u8).unwrap().size, 256);
            assert!(map.remove(0x3000 as *const u8).is_none());
        }
    }
}
