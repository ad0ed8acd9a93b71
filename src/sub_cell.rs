//! Segregated size-class allocator layered on cells.
//!
//! Each active cell serves exactly one bin: the cell is carved into equal
//! blocks of the bin's size and its free blocks form an intrusive list
//! rooted in the cell's metadata. Cells with at least one free block hang
//! off the bin's partial list under the bin lock. The hot bins additionally
//! keep a per-thread block cache refilled in batches, so the common
//! alloc/free pairs touch no lock at all.
//!
//! A cell that becomes fully empty is retained as a "warm" reserve while
//! the bin holds fewer than [`WARM_CELLS_PER_BIN`] of them; beyond that it
//! goes back to the cell pool.

use std::ptr;

use parking_lot::Mutex;

use crate::cell::{blocks_per_cell, metadata, payload, CellHeader, FreeBlock};
use crate::config::{
    BIN_SIZES, HOT_BIN_COUNT, NUM_SIZE_BINS, TLS_BIN_BATCH_REFILL, WARM_CELLS_PER_BIN,
};
use crate::pool::CellPool;
use crate::thread_cache;

struct BinLists {
    /// Head of the intrusive chain of cells with free blocks.
    partial_head: *mut CellHeader,
    /// Fully-empty cells currently on the partial list.
    warm_cells: usize,
}

// Safety: the raw list heads are only touched while the owning bin's
// mutex is held.
unsafe impl Send for BinLists {}

struct Bin {
    lists: Mutex<BinLists>,
}

/// The sub-cell allocator: one lock, one partial list, and (for hot bins)
/// one per-thread cache per size class.
pub struct SubCellAllocator {
    ctx_id: u64,
    bins: [Bin; NUM_SIZE_BINS],
}

impl SubCellAllocator {
    /// Create the bin table for the context identified by `ctx_id`.
    pub fn new(ctx_id: u64) -> Self {
        Self {
            ctx_id,
            bins: std::array::from_fn(|_| Bin {
                lists: Mutex::new(BinLists {
                    partial_head: ptr::null_mut(),
                    warm_cells: 0,
                }),
            }),
        }
    }

    /// Allocate one block from `bin`. Returns null only when the pool
    /// cannot supply a fresh cell.
    pub fn alloc_from_bin(&self, pool: &CellPool, bin: usize, tag: u8) -> *mut u8 {
        debug_assert!(bin < NUM_SIZE_BINS);

        if bin < HOT_BIN_COUNT {
            if let Some(block) = thread_cache::with_bin_caches(self.ctx_id, |c| c.pop(bin)) {
                return block;
            }

            // Cache ran dry: batch-refill under one lock acquisition.
            let mut batch = [ptr::null_mut(); TLS_BIN_BATCH_REFILL];
            let taken = {
                let mut lists = self.bins[bin].lists.lock();
                self.take_blocks(pool, &mut lists, bin, tag, &mut batch)
            };
            if taken == 0 {
                return ptr::null_mut();
            }

            let block = batch[taken - 1];
            if taken > 1 {
                thread_cache::with_bin_caches(self.ctx_id, |c| {
                    for &extra in &batch[..taken - 1] {
                        // The cache was empty and the batch never exceeds
                        // its capacity, so these pushes cannot fail.
                        c.push(bin, extra);
                    }
                });
            }
            block
        } else {
            let mut one = [ptr::null_mut()];
            let mut lists = self.bins[bin].lists.lock();
            match self.take_blocks(pool, &mut lists, bin, tag, &mut one) {
                0 => ptr::null_mut(),
                _ => one[0],
            }
        }
    }

    /// Free `block` back to its host cell's bin.
    ///
    /// `header` must be the host cell's header and `block` a block start
    /// within it.
    pub fn free_to_bin(&self, pool: &CellPool, block: *mut u8, header: *mut CellHeader) {
        let bin = unsafe { (*header).size_class } as usize;
        debug_assert!(bin < NUM_SIZE_BINS);

        #[cfg(debug_assertions)]
        unsafe {
            // Poison freed memory so use-after-free reads are conspicuous.
            block.write_bytes(0xDD, BIN_SIZES[bin]);
        }

        if bin < HOT_BIN_COUNT {
            let cached = thread_cache::with_bin_caches(self.ctx_id, |c| c.push(bin, block));
            if cached {
                return;
            }
        }

        let mut lists = self.bins[bin].lists.lock();
        unsafe { self.release_block(pool, &mut lists, bin, block, header) };
    }

    /// Drain every hot-bin thread cache through the locked path, so the
    /// blocks become visible to other threads again.
    pub fn flush_thread_caches(&self, pool: &CellPool) {
        for bin in 0..HOT_BIN_COUNT {
            while let Some(block) = thread_cache::with_bin_caches(self.ctx_id, |c| c.pop(bin)) {
                let header = crate::cell::header_for_ptr(block);
                let mut lists = self.bins[bin].lists.lock();
                unsafe { self.release_block(pool, &mut lists, bin, block, header) };
            }
        }
    }

    /// Pop up to `out.len()` blocks from the bin's partial cells, pulling
    /// a fresh cell from the pool when the bin has none. Returns the
    /// number of blocks written to `out`.
    fn take_blocks(
        &self,
        pool: &CellPool,
        lists: &mut BinLists,
        bin: usize,
        tag: u8,
        out: &mut [*mut u8],
    ) -> usize {
        let capacity = blocks_per_cell(bin);
        let mut taken = 0;

        while taken < out.len() {
            let cell = lists.partial_head;
            if cell.is_null() {
                if taken > 0 {
                    break;
                }
                let raw = pool.alloc_cell();
                if raw.is_null() {
                    break;
                }
                let cell = unsafe { init_cell_for_bin(raw, bin, tag) };
                unsafe {
                    (*metadata(cell)).next_partial = ptr::null_mut();
                }
                lists.partial_head = cell;
                lists.warm_cells += 1;
                continue;
            }

            unsafe {
                let meta = metadata(cell);
                let block = (*meta).free_list;
                debug_assert!(!block.is_null(), "partial cell with empty free list");
                (*meta).free_list = (*block).next;

                if (*cell).free_count as usize == capacity {
                    // First block taken from a fully-empty cell; it is no
                    // longer a warm reserve.
                    debug_assert!(lists.warm_cells > 0);
                    lists.warm_cells -= 1;
                }
                (*cell).free_count -= 1;

                if (*cell).free_count == 0 {
                    // Cell is now fully in use; drop it off the list head.
                    lists.partial_head = (*meta).next_partial;
                    (*meta).next_partial = ptr::null_mut();
                }

                out[taken] = block as *mut u8;
                taken += 1;
            }
        }
        taken
    }

    /// Put `block` back on its host cell's free list, restoring the cell's
    /// list membership and retiring it when it empties out.
    ///
    /// # Safety
    /// The bin lock for `bin` must be held; `block` and `header` must
    /// belong together.
    unsafe fn release_block(
        &self,
        pool: &CellPool,
        lists: &mut BinLists,
        bin: usize,
        block: *mut u8,
        header: *mut CellHeader,
    ) {
        let meta = metadata(header);
        let node = block as *mut FreeBlock;
        (*node).next = (*meta).free_list;
        (*meta).free_list = node;

        let was_full = (*header).free_count == 0;
        (*header).free_count += 1;

        if was_full {
            (*meta).next_partial = lists.partial_head;
            lists.partial_head = header;
        }

        let capacity = blocks_per_cell(bin);
        if (*header).free_count as usize == capacity {
            if lists.warm_cells < WARM_CELLS_PER_BIN {
                lists.warm_cells += 1;
            } else {
                unlink_partial(lists, header);
                pool.free_cell(header as *mut u8);
            }
        }
    }
}

impl Drop for SubCellAllocator {
    fn drop(&mut self) {
        // Mirrors the cell pool: only the destroying thread's caches are
        // reclaimed; other threads must flush before teardown.
        thread_cache::take_bin_caches(self.ctx_id);
    }
}

/// Prepare a fresh cell for `bin`: write header and metadata, then thread
/// the blocks so the free list starts at block 0.
///
/// # Safety
/// `raw` must be a committed, cell-aligned cell owned by the caller.
unsafe fn init_cell_for_bin(raw: *mut u8, bin: usize, tag: u8) -> *mut CellHeader {
    let header = raw as *mut CellHeader;
    let capacity = blocks_per_cell(bin);

    (*header).tag = tag;
    (*header).size_class = bin as u8;
    (*header).free_count = capacity as u16;

    let meta = metadata(header);
    (*meta).next_partial = ptr::null_mut();

    let block_size = BIN_SIZES[bin];
    let first = payload(header);
    let mut next: *mut FreeBlock = ptr::null_mut();
    for i in (0..capacity).rev() {
        let block = first.add(i * block_size) as *mut FreeBlock;
        (*block).next = next;
        next = block;
    }
    (*meta).free_list = next;

    header
}

/// Remove `target` from the bin's partial list.
///
/// # Safety
/// The bin lock must be held and `target` must be on the list.
unsafe fn unlink_partial(lists: &mut BinLists, target: *mut CellHeader) {
    if lists.partial_head == target {
        lists.partial_head = (*metadata(target)).next_partial;
        return;
    }
    let mut cursor = lists.partial_head;
    while !cursor.is_null() {
        let meta = metadata(cursor);
        if (*meta).next_partial == target {
            (*meta).next_partial = (*metadata(target)).next_partial;
            return;
        }
        cursor = (*meta).next_partial;
    }
    debug_assert!(false, "cell not found on partial list");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SUPERBLOCK_SIZE;
    use crate::vm;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_ID: AtomicU64 = AtomicU64::new(1 << 41);

    fn with_fixture(f: impl FnOnce(&CellPool, &SubCellAllocator)) {
        let raw_size = 5 * SUPERBLOCK_SIZE;
        let raw = vm::reserve(raw_size);
        assert!(!raw.is_null());
        let base = ((raw as usize + SUPERBLOCK_SIZE - 1) & !(SUPERBLOCK_SIZE - 1)) as *mut u8;
        let id = TEST_ID.fetch_add(1, Ordering::Relaxed);
        let pool = CellPool::new(base, 4 * SUPERBLOCK_SIZE, id);
        let sub = SubCellAllocator::new(id);
        f(&pool, &sub);
        sub.flush_thread_caches(&pool);
        pool.flush_thread_cache();
        drop(pool);
        vm::release(raw, raw_size);
    }

    #[test]
    fn test_alloc_free_single_block() {
        with_fixture(|pool, sub| {
            let block = sub.alloc_from_bin(pool, 2, 7);
            assert!(!block.is_null());

            let header = crate::cell::header_for_ptr(block);
            unsafe {
                assert_eq!((*header).size_class, 2);
                assert_eq!((*header).tag, 7);
                block.write_bytes(0xEE, 64);
            }
            sub.free_to_bin(pool, block, header);
        });
    }

    #[test]
    fn test_blocks_are_distinct_and_inside_cell() {
        with_fixture(|pool, sub| {
            let capacity = blocks_per_cell(3);
            let mut blocks = Vec::new();
            for _ in 0..capacity {
                let b = sub.alloc_from_bin(pool, 3, 0);
                assert!(!b.is_null());
                blocks.push(b as usize);
            }

            let mut sorted = blocks.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), capacity);

            // All blocks share one host cell.
            let first_header = crate::cell::header_for_ptr(blocks[0] as *mut u8) as usize;
            for &b in &blocks {
                assert_eq!(
                    crate::cell::header_for_ptr(b as *mut u8) as usize,
                    first_header
                );
            }

            for &b in &blocks {
                let p = b as *mut u8;
                sub.free_to_bin(pool, p, crate::cell::header_for_ptr(p));
            }
        });
    }

    #[test]
    fn test_warm_cell_retained_and_reused() {
        with_fixture(|pool, sub| {
            let capacity = blocks_per_cell(1);
            let mut blocks = Vec::new();
            for _ in 0..capacity {
                blocks.push(sub.alloc_from_bin(pool, 1, 0) as usize);
            }
            for &b in &blocks {
                let p = b as *mut u8;
                sub.free_to_bin(pool, p, crate::cell::header_for_ptr(p));
            }
            sub.flush_thread_caches(pool);

            // The emptied cell stays warm; reallocating must reuse the
            // same block set, not consume a second cell.
            let mut again = Vec::new();
            for _ in 0..capacity {
                again.push(sub.alloc_from_bin(pool, 1, 0) as usize);
            }
            let mut v1 = blocks.clone();
            let mut v2 = again.clone();
            v1.sort_unstable();
            v2.sort_unstable();
            assert_eq!(v1, v2);

            for &b in &again {
                let p = b as *mut u8;
                sub.free_to_bin(pool, p, crate::cell::header_for_ptr(p));
            }
        });
    }

    #[test]
    fn test_non_hot_bin_path() {
        with_fixture(|pool, sub| {
            // Bin 9 (8 KiB) has no thread cache and one block per cell.
            let b1 = sub.alloc_from_bin(pool, 9, 1);
            let b2 = sub.alloc_from_bin(pool, 9, 1);
            assert!(!b1.is_null() && !b2.is_null());
            assert_ne!(b1, b2);

            sub.free_to_bin(pool, b1, crate::cell::header_for_ptr(b1));
            sub.free_to_bin(pool, b2, crate::cell::header_for_ptr(b2));
        });
    }
}
