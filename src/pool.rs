//! Three-tier cell pool over the reserved cell region.
//!
//! Allocation tries, in order:
//!
//! 1. The calling thread's cell cache (no atomics).
//! 2. A global Treiber stack of free cells, threaded through the cells'
//!    own first word (CAS with release/acquire ordering on the head).
//! 3. Growth: advance an atomic committed-end cursor by one superblock,
//!    commit its pages, and carve it into cells.
//!
//! Before committing fresh address space, growth first recommits a
//! previously decommitted superblock, so churny workloads reuse reserved
//! space instead of marching through it.
//!
//! The stack relies on the no-reuse rule for ABA safety: a cell address
//! never migrates to another tier while any thread can still observe it
//! on the stack.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::cell::FreeCell;
use crate::config::{CELLS_PER_SUPERBLOCK, CELL_SIZE, SUPERBLOCK_SIZE};
use crate::thread_cache;
use crate::vm;

/// Lifecycle state of one superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SuperblockState {
    /// Pages never committed.
    Uncommitted = 0,
    /// At least one cell is in use.
    InUse = 1,
    /// Every cell is free; pages still committed.
    Free = 2,
    /// Pages returned to the OS; addresses remain reserved.
    Decommitted = 3,
}

impl SuperblockState {
    /// Convert from the raw stored value.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SuperblockState::Uncommitted),
            1 => Some(SuperblockState::InUse),
            2 => Some(SuperblockState::Free),
            3 => Some(SuperblockState::Decommitted),
            _ => None,
        }
    }
}

struct Superblock {
    state: AtomicU8,
    /// Cells not currently handed out to a caller. Incremented on free,
    /// decremented on alloc; full count flips the state to `Free`.
    free_cells: AtomicU32,
}

/// The cell pool. Owns no address space itself; it borrows the cell
/// region from the context for the context's lifetime.
pub struct CellPool {
    id: u64,
    base: *mut u8,
    region_size: usize,
    /// High-water commit cursor, in bytes from `base`.
    committed_end: AtomicUsize,
    /// Head of the global free-cell stack.
    global_head: AtomicPtr<FreeCell>,
    superblocks: Vec<Superblock>,
    decommit_lock: Mutex<()>,
}

// Safety: the raw region pointer is only dereferenced through the tiered
// alloc/free protocol; the stack head is CAS-managed and the superblock
// table is all atomics.
unsafe impl Send for CellPool {}
unsafe impl Sync for CellPool {}

impl CellPool {
    /// Create a pool over `[base, base + region_size)`.
    ///
    /// `base` must be superblock-aligned and `region_size` a multiple of
    /// the superblock size; the range must be reserved and uncommitted.
    pub fn new(base: *mut u8, region_size: usize, id: u64) -> Self {
        debug_assert_eq!(base as usize % SUPERBLOCK_SIZE, 0);
        debug_assert_eq!(region_size % SUPERBLOCK_SIZE, 0);
        let count = region_size / SUPERBLOCK_SIZE;
        Self {
            id,
            base,
            region_size,
            committed_end: AtomicUsize::new(0),
            global_head: AtomicPtr::new(ptr::null_mut()),
            superblocks: (0..count)
                .map(|_| Superblock {
                    state: AtomicU8::new(SuperblockState::Uncommitted as u8),
                    free_cells: AtomicU32::new(0),
                })
                .collect(),
            decommit_lock: Mutex::new(()),
        }
    }

    /// Context id this pool's thread caches are keyed by.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether `ptr` falls inside the cell region.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.base as usize && addr < self.base as usize + self.region_size
    }

    /// Allocate one cell-aligned, committed cell.
    ///
    /// Returns null only when the reserved region is exhausted or the OS
    /// refuses to commit pages.
    pub fn alloc_cell(&self) -> *mut u8 {
        // Tier 1: thread cache.
        if let Some(cell) = thread_cache::with_cell_cache(self.id, |c| c.pop()) {
            let cell = cell as *mut u8;
            self.note_alloc(cell);
            return cell;
        }

        // Tier 2: global stack.
        let cell = self.pop_global();
        if !cell.is_null() {
            let cell = cell as *mut u8;
            self.note_alloc(cell);
            return cell;
        }

        // Tier 3: grow.
        self.grow()
    }

    /// Return a cell. Null is a no-op.
    pub fn free_cell(&self, cell: *mut u8) {
        if cell.is_null() {
            return;
        }
        debug_assert!(self.contains(cell));
        debug_assert_eq!(cell as usize % CELL_SIZE, 0);

        #[cfg(debug_assertions)]
        unsafe {
            let header = cell as *mut crate::cell::CellHeader;
            assert_eq!(
                (*header).magic,
                crate::cell::MAGIC_ALLOCATED,
                "double free or corrupted cell header"
            );
            (*header).magic = crate::cell::MAGIC_FREE;
        }

        self.note_free(cell);

        // Tier 1 unless the thread cache is full.
        let cached = thread_cache::with_cell_cache(self.id, |c| {
            if c.is_full() {
                false
            } else {
                c.push(cell as *mut FreeCell);
                true
            }
        });
        if !cached {
            self.push_global(cell as *mut FreeCell);
        }
    }

    /// Drain the calling thread's cell cache into the global stack.
    pub fn flush_thread_cache(&self) {
        while let Some(cell) = thread_cache::with_cell_cache(self.id, |c| c.pop()) {
            self.push_global(cell);
        }
    }

    /// Decommit every superblock whose full complement of cells is sitting
    /// in the global stack. Returns the number of bytes handed back.
    ///
    /// Cells parked in another thread's cache keep their superblock
    /// committed: only superblocks recovered in full are eligible, which
    /// is what guarantees a decommitted address can never still be reachable
    /// through a cache.
    pub fn decommit_unused(&self) -> usize {
        let _guard = self.decommit_lock.lock();

        self.flush_thread_cache();

        // Drain the stack and bucket the cells by superblock.
        let mut drained: Vec<Vec<*mut FreeCell>> =
            (0..self.superblocks.len()).map(|_| Vec::new()).collect();
        loop {
            let cell = self.pop_global();
            if cell.is_null() {
                break;
            }
            drained[self.superblock_index(cell as *mut u8)].push(cell);
        }

        let mut freed = 0usize;
        for (idx, cells) in drained.iter_mut().enumerate() {
            let sb = &self.superblocks[idx];
            if cells.len() == CELLS_PER_SUPERBLOCK
                && sb.state.load(Ordering::SeqCst) == SuperblockState::Free as u8
            {
                let start = unsafe { self.base.add(idx * SUPERBLOCK_SIZE) };
                vm::decommit(start, SUPERBLOCK_SIZE);
                sb.state
                    .store(SuperblockState::Decommitted as u8, Ordering::SeqCst);
                freed += SUPERBLOCK_SIZE;
                cells.clear();
            }
        }

        // Everything not reclaimed goes back on the stack.
        for cells in drained {
            for cell in cells {
                self.push_global(cell);
            }
        }

        if freed > 0 {
            tracing::debug!(bytes = freed, "decommitted free superblocks");
        }
        freed
    }

    /// Bytes of the cell region currently committed.
    pub fn committed_bytes(&self) -> u64 {
        let committed = self
            .superblocks
            .iter()
            .filter(|sb| {
                let s = sb.state.load(Ordering::SeqCst);
                s == SuperblockState::InUse as u8 || s == SuperblockState::Free as u8
            })
            .count();
        (committed * SUPERBLOCK_SIZE) as u64
    }

    /// State of the superblock containing `cell`, for assertions and
    /// introspection.
    pub fn superblock_state(&self, index: usize) -> Option<SuperblockState> {
        self.superblocks
            .get(index)
            .and_then(|sb| SuperblockState::from_u8(sb.state.load(Ordering::SeqCst)))
    }

    // -------------------------------------------------------------------------
    // Occupancy
    // -------------------------------------------------------------------------

    #[inline]
    fn superblock_index(&self, cell: *mut u8) -> usize {
        (cell as usize - self.base as usize) / SUPERBLOCK_SIZE
    }

    fn note_alloc(&self, cell: *mut u8) {
        let sb = &self.superblocks[self.superblock_index(cell)];
        let prev = sb.free_cells.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
        if prev as usize == CELLS_PER_SUPERBLOCK {
            sb.state.store(SuperblockState::InUse as u8, Ordering::SeqCst);
        }

        #[cfg(debug_assertions)]
        unsafe {
            let header = cell as *mut crate::cell::CellHeader;
            (*header).magic = crate::cell::MAGIC_ALLOCATED;
            (*header).generation = (*header).generation.wrapping_add(1);
        }
    }

    fn note_free(&self, cell: *mut u8) {
        let sb = &self.superblocks[self.superblock_index(cell)];
        let prev = sb.free_cells.fetch_add(1, Ordering::SeqCst);
        if prev as usize == CELLS_PER_SUPERBLOCK - 1 {
            sb.state.store(SuperblockState::Free as u8, Ordering::SeqCst);
        }
    }

    // -------------------------------------------------------------------------
    // Global stack
    // -------------------------------------------------------------------------

    fn push_global(&self, cell: *mut FreeCell) {
        let mut head = self.global_head.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*cell).next = head;
            }
            match self.global_head.compare_exchange_weak(
                head,
                cell,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    fn pop_global(&self) -> *mut FreeCell {
        let mut head = self.global_head.load(Ordering::Acquire);
        while !head.is_null() {
            let next = unsafe { (*head).next };
            match self.global_head.compare_exchange_weak(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return head,
                Err(current) => head = current,
            }
        }
        ptr::null_mut()
    }

    // -------------------------------------------------------------------------
    // Growth
    // -------------------------------------------------------------------------

    fn grow(&self) -> *mut u8 {
        // Reuse a decommitted superblock before touching fresh space.
        for (idx, sb) in self.superblocks.iter().enumerate() {
            if sb
                .state
                .compare_exchange(
                    SuperblockState::Decommitted as u8,
                    SuperblockState::InUse as u8,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let start = unsafe { self.base.add(idx * SUPERBLOCK_SIZE) };
                if !vm::commit(start, SUPERBLOCK_SIZE) {
                    sb.state
                        .store(SuperblockState::Decommitted as u8, Ordering::SeqCst);
                    return ptr::null_mut();
                }
                sb.free_cells
                    .store(CELLS_PER_SUPERBLOCK as u32, Ordering::SeqCst);
                return self.carve(start, idx);
            }
        }

        // Claim one superblock of fresh reserved space.
        let mut cursor = self.committed_end.load(Ordering::Relaxed);
        loop {
            let new_end = cursor + SUPERBLOCK_SIZE;
            if new_end > self.region_size {
                return ptr::null_mut();
            }
            match self.committed_end.compare_exchange_weak(
                cursor,
                new_end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => cursor = current,
            }
        }

        let idx = cursor / SUPERBLOCK_SIZE;
        let start = unsafe { self.base.add(cursor) };
        if !vm::commit(start, SUPERBLOCK_SIZE) {
            // The claimed slice is lost for this run; no partial state leaks.
            return ptr::null_mut();
        }

        let sb = &self.superblocks[idx];
        sb.free_cells
            .store(CELLS_PER_SUPERBLOCK as u32, Ordering::SeqCst);
        sb.state.store(SuperblockState::InUse as u8, Ordering::SeqCst);
        self.carve(start, idx)
    }

    /// Push all but the first cell of a fresh superblock onto the stack
    /// and hand the first one to the caller.
    fn carve(&self, start: *mut u8, idx: usize) -> *mut u8 {
        for i in 1..CELLS_PER_SUPERBLOCK {
            let cell = unsafe { start.add(i * CELL_SIZE) } as *mut FreeCell;
            self.push_global(cell);
        }
        let sb = &self.superblocks[idx];
        let prev = sb.free_cells.fetch_sub(1, Ordering::SeqCst);
        debug_assert_eq!(prev as usize, CELLS_PER_SUPERBLOCK);

        #[cfg(debug_assertions)]
        unsafe {
            let header = start as *mut crate::cell::CellHeader;
            (*header).magic = crate::cell::MAGIC_ALLOCATED;
            (*header).generation = (*header).generation.wrapping_add(1);
        }
        start
    }
}

impl Drop for CellPool {
    fn drop(&mut self) {
        // Only the destroying thread's cache can be reclaimed here; other
        // threads must have called flush first (their cells otherwise stay
        // reserved-but-unused until the region is released).
        thread_cache::take_cell_cache(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    static TEST_POOL_ID: AtomicU64 = AtomicU64::new(1 << 40);

    struct TestRegion {
        raw: *mut u8,
        raw_size: usize,
        base: *mut u8,
        size: usize,
    }

    fn reserve_region(superblocks: usize) -> TestRegion {
        let size = superblocks * SUPERBLOCK_SIZE;
        let raw_size = size + SUPERBLOCK_SIZE;
        let raw = vm::reserve(raw_size);
        assert!(!raw.is_null());
        let base = ((raw as usize + SUPERBLOCK_SIZE - 1) & !(SUPERBLOCK_SIZE - 1)) as *mut u8;
        TestRegion {
            raw,
            raw_size,
            base,
            size,
        }
    }

    impl Drop for TestRegion {
        fn drop(&mut self) {
            vm::release(self.raw, self.raw_size);
        }
    }

    fn new_pool(region: &TestRegion) -> CellPool {
        CellPool::new(
            region.base,
            region.size,
            TEST_POOL_ID.fetch_add(1, Ordering::Relaxed),
        )
    }

    #[test]
    fn test_alloc_free_roundtrip() {
        let region = reserve_region(2);
        let pool = new_pool(&region);

        let cell = pool.alloc_cell();
        assert!(!cell.is_null());
        assert_eq!(cell as usize % CELL_SIZE, 0);
        assert!(pool.contains(cell));

        unsafe {
            cell.add(64).write_bytes(0xCD, 128);
        }

        pool.free_cell(cell);
        assert_eq!(pool.committed_bytes(), SUPERBLOCK_SIZE as u64);
    }

    #[test]
    fn test_recycles_cells() {
        let region = reserve_region(4);
        let pool = new_pool(&region);

        // Sequentially churning through N cells should stay inside
        // one superblock.
        for _ in 0..(3 * CELLS_PER_SUPERBLOCK) {
            let cell = pool.alloc_cell();
            assert!(!cell.is_null());
            pool.free_cell(cell);
        }
        assert_eq!(pool.committed_bytes(), SUPERBLOCK_SIZE as u64);
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let region = reserve_region(1);
        let pool = new_pool(&region);

        let mut cells = Vec::new();
        loop {
            let cell = pool.alloc_cell();
            if cell.is_null() {
                break;
            }
            cells.push(cell);
        }
        assert_eq!(cells.len(), CELLS_PER_SUPERBLOCK);

        for cell in cells {
            pool.free_cell(cell);
        }
        pool.flush_thread_cache();
    }

    #[test]
    fn test_decommit_and_recommit() {
        let region = reserve_region(3);
        let pool = new_pool(&region);

        let mut cells = Vec::new();
        for _ in 0..(2 * CELLS_PER_SUPERBLOCK) {
            let cell = pool.alloc_cell();
            assert!(!cell.is_null());
            cells.push(cell);
        }
        for cell in cells {
            pool.free_cell(cell);
        }

        let before = pool.committed_bytes();
        assert_eq!(before, (2 * SUPERBLOCK_SIZE) as u64);

        let freed = pool.decommit_unused();
        assert_eq!(freed, 2 * SUPERBLOCK_SIZE);
        assert_eq!(pool.committed_bytes(), 0);

        // The next allocation recommits a decommitted superblock rather
        // than advancing the cursor.
        let cell = pool.alloc_cell();
        assert!(!cell.is_null());
        assert_eq!(pool.committed_bytes(), SUPERBLOCK_SIZE as u64);
        assert_eq!(pool.committed_end.load(Ordering::Relaxed), 2 * SUPERBLOCK_SIZE);
        pool.free_cell(cell);
    }

    #[test]
    fn test_concurrent_churn() {
        use std::sync::Arc;

        let region = reserve_region(8);
        let pool = Arc::new(new_pool(&region));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                let mut held = Vec::new();
                for round in 0..200 {
                    for _ in 0..8 {
                        let cell = pool.alloc_cell();
                        assert!(!cell.is_null());
                        held.push(cell as usize);
                    }
                    if round % 2 == 0 {
                        for cell in held.drain(..) {
                            pool.free_cell(cell as *mut u8);
                        }
                    }
                }
                for cell in held.drain(..) {
                    pool.free_cell(cell as *mut u8);
                }
                pool.flush_thread_cache();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Every cell came back; all superblocks must read fully free.
        for idx in 0..8 {
            match pool.superblock_state(idx) {
                Some(SuperblockState::Free) | Some(SuperblockState::Uncommitted) => {}
                other => panic!("superblock {idx} in unexpected state {other:?}"),
            }
        }
    }
}
