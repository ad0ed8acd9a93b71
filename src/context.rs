//! The context: owner of both reserved regions and router of every
//! allocation request.
//!
//! A request is classified by size (and alignment) into one of four tiers:
//! sub-cell bins up to 8 KiB, full cells up to the cell payload, buddy
//! blocks up to 2 MiB, and direct OS allocations beyond that. Frees are
//! routed by address: the cell and buddy regions answer an O(1) range
//! test, everything else is looked up in the large registry.
//!
//! The optional observers (stats, leak map, guard bytes, callbacks,
//! budget) hook in here, so the tiers themselves stay oblivious to them.

use std::ptr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[cfg(feature = "budget")]
use std::sync::atomic::AtomicUsize;

#[cfg(any(feature = "callbacks", feature = "budget"))]
use parking_lot::Mutex;

use crate::buddy::{order_for_payload, BuddyAllocator};
use crate::cell::{header_for_ptr, payload, CellHeader, FULL_CELL_PAYLOAD};
use crate::config::{
    CellConfig, BIN_SIZES, BUDDY_HEADER_SIZE, BUDDY_MAX_BLOCK, BUDDY_NATURAL_ALIGNMENT,
    CELL_SIZE, FULL_CELL_SENTINEL, MAX_NATURAL_ALIGNMENT, MAX_ORDER, NUM_SIZE_BINS,
    SUPERBLOCK_SIZE,
};
use crate::error::AllocError;
use crate::large::LargeRegistry;
use crate::pool::CellPool;
use crate::size_class::bin_for;
use crate::sub_cell::SubCellAllocator;
use crate::thread_cache;
use crate::vm;

#[cfg(feature = "stats")]
use crate::stats::{MemoryStats, StatsSnapshot, Tier};

#[cfg(feature = "leak-tracking")]
use crate::debug::LeakMap;

/// Default alignment of [`Context::alloc`].
const DEFAULT_ALIGNMENT: usize = 8;

/// Hook invoked after every allocation and before every free.
#[cfg(feature = "callbacks")]
pub type AllocCallback = fn(ptr: *mut u8, size: usize, tag: u8, is_alloc: bool);

/// Hook invoked when the budget rejects an allocation.
#[cfg(feature = "budget")]
pub type BudgetCallback = fn(requested: usize, budget: usize);

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Tier owning a live allocation, as reported by [`Context::tier_of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocTier {
    /// Sub-cell block in a size-class bin.
    SubCell,
    /// Full-cell allocation.
    FullCell,
    /// Buddy block.
    Buddy,
    /// Direct OS allocation.
    Large,
}

/// Where a request will be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Bin(usize),
    FullCell,
    Buddy(usize),
    Large,
    LargeAligned(usize),
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    route: Route,
    /// Post-rounding size, the quantity charged against budget and stats.
    rounded: usize,
    /// Whether guard bytes surround the user region.
    #[cfg_attr(not(feature = "guards"), allow(dead_code))]
    guarded: bool,
}

/// Tier and location of an existing allocation, recovered from the
/// pointer alone.
enum Owner {
    Bin {
        bin: usize,
        guarded: bool,
        /// Block start (equals the user pointer unless guarded).
        block: *mut u8,
        header: *mut CellHeader,
    },
    FullCell {
        header: *mut CellHeader,
    },
    Buddy {
        order: usize,
        tag: u8,
    },
    Large {
        size: usize,
        tag: u8,
    },
}

/// A memory environment owning a reserved virtual address range.
///
/// Creating a context reserves address space only; physical pages are
/// committed superblock by superblock as allocations demand them.
/// Dropping the context releases both regions and every outstanding
/// large allocation.
pub struct Context {
    id: u64,
    reserve_base: *mut u8,
    reserve_size: usize,

    pool: CellPool,
    sub_cell: SubCellAllocator,
    buddy: BuddyAllocator,
    large: LargeRegistry,

    #[cfg(feature = "stats")]
    stats: MemoryStats,

    #[cfg(feature = "leak-tracking")]
    live: LeakMap,

    #[cfg(feature = "callbacks")]
    alloc_callback: Mutex<Option<AllocCallback>>,

    #[cfg(feature = "budget")]
    budget_limit: usize,
    #[cfg(feature = "budget")]
    budget_used: AtomicUsize,
    #[cfg(feature = "budget")]
    budget_callback: Mutex<Option<BudgetCallback>>,
}

// Safety: every piece of shared state inside is either atomic, mutex
// guarded, or immutable after construction; the raw region pointers are
// only dereferenced under the tier protocols.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    /// Create a context with the given configuration.
    pub fn new(config: CellConfig) -> Result<Self, AllocError> {
        config.validate()?;

        let reserve_size = config.reserve_size;
        let base = vm::reserve(reserve_size);
        if base.is_null() {
            return Err(AllocError::ReserveFailed { size: reserve_size });
        }

        // Split the reservation in half: cells low, buddy high. Each half
        // is aligned up to its natural alignment and trimmed to whole
        // superblocks.
        let half = reserve_size / 2;
        let cell_base = align_up_addr(base as usize, SUPERBLOCK_SIZE);
        let cell_region_size =
            (base as usize + half).saturating_sub(cell_base) & !(SUPERBLOCK_SIZE - 1);
        let buddy_base = align_up_addr(base as usize + half, BUDDY_MAX_BLOCK);
        let buddy_region_size =
            (base as usize + reserve_size).saturating_sub(buddy_base) & !(BUDDY_MAX_BLOCK - 1);

        if cell_region_size == 0 || buddy_region_size == 0 {
            vm::release(base, reserve_size);
            return Err(AllocError::InvalidConfig(
                "reservation too small to split into aligned regions",
            ));
        }

        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            id,
            reserved = reserve_size,
            cell_region = cell_region_size,
            buddy_region = buddy_region_size,
            "context created"
        );

        Ok(Self {
            id,
            reserve_base: base,
            reserve_size,
            pool: CellPool::new(cell_base as *mut u8, cell_region_size, id),
            sub_cell: SubCellAllocator::new(id),
            buddy: BuddyAllocator::new(buddy_base as *mut u8, buddy_region_size),
            large: LargeRegistry::new(),
            #[cfg(feature = "stats")]
            stats: MemoryStats::new(),
            #[cfg(feature = "leak-tracking")]
            live: LeakMap::new(),
            #[cfg(feature = "callbacks")]
            alloc_callback: Mutex::new(None),
            #[cfg(feature = "budget")]
            budget_limit: config.memory_budget,
            #[cfg(feature = "budget")]
            budget_used: AtomicUsize::new(0),
            #[cfg(feature = "budget")]
            budget_callback: Mutex::new(None),
        })
    }

    // -------------------------------------------------------------------------
    // Public byte interface
    // -------------------------------------------------------------------------

    /// Allocate `size` bytes with the default 8-byte alignment.
    /// Returns null on failure; `size == 0` is a failure.
    pub fn alloc(&self, size: usize, tag: u8) -> *mut u8 {
        self.alloc_with_alignment(size, tag, DEFAULT_ALIGNMENT)
    }

    /// Allocate `size` bytes aligned to `alignment` (a power of two).
    ///
    /// Alignments up to 16 are served in place by the cell tiers;
    /// anything larger routes to the aligned OS path.
    pub fn alloc_with_alignment(&self, size: usize, tag: u8, alignment: usize) -> *mut u8 {
        if size == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return ptr::null_mut();
        }
        if alignment > MAX_NATURAL_ALIGNMENT {
            return self.alloc_aligned(size, alignment, tag);
        }
        let placement = self.classify(size, alignment);
        self.alloc_placed(placement, size, tag)
    }

    /// Allocate with a strictly validated explicit alignment.
    ///
    /// The buddy tier is used only for alignments up to 8 bytes (its
    /// header offsets every pointer); larger alignments in the buddy size
    /// range go to the OS instead.
    pub fn alloc_aligned(&self, size: usize, alignment: usize, tag: u8) -> *mut u8 {
        if size == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return ptr::null_mut();
        }
        let placement = if alignment <= MAX_NATURAL_ALIGNMENT {
            self.classify(size, alignment)
        } else {
            Placement {
                route: Route::LargeAligned(alignment),
                rounded: size,
                guarded: false,
            }
        };
        self.alloc_placed(placement, size, tag)
    }

    /// Free a pointer returned by any allocation call on this context.
    /// Null is a no-op; pointers this context does not own are ignored
    /// (asserted in debug builds).
    pub fn free(&self, user_ptr: *mut u8) {
        if user_ptr.is_null() {
            return;
        }

        match self.owner_of(user_ptr) {
            Some(Owner::Bin {
                bin,
                guarded,
                block,
                header,
            }) => {
                #[cfg(feature = "guards")]
                let user_size = if guarded {
                    let intact = unsafe { crate::debug::verify_guards(block) };
                    if !intact {
                        tracing::warn!(ptr = ?user_ptr, bin, "guard bytes corrupted");
                        debug_assert!(intact, "guard bytes corrupted");
                    }
                    unsafe { crate::debug::stored_user_size(block) }
                } else {
                    BIN_SIZES[bin]
                };
                #[cfg(not(feature = "guards"))]
                let user_size = {
                    let _ = guarded;
                    BIN_SIZES[bin]
                };

                let tag = unsafe { (*header).tag };
                self.observe_free(user_ptr, BIN_SIZES[bin], user_size, tag, TierKind::SubCell);
                self.sub_cell.free_to_bin(&self.pool, block, header);
            }
            Some(Owner::FullCell { header }) => {
                let tag = unsafe { (*header).tag };
                self.observe_free(user_ptr, CELL_SIZE, FULL_CELL_PAYLOAD, tag, TierKind::Cell);
                self.pool.free_cell(header as *mut u8);
            }
            Some(Owner::Buddy { order, tag }) => {
                let rounded = 1usize << order;
                self.observe_free(
                    user_ptr,
                    rounded,
                    rounded - BUDDY_HEADER_SIZE,
                    tag,
                    TierKind::Buddy,
                );
                self.buddy.free(user_ptr);
            }
            Some(Owner::Large { size, tag }) => {
                self.observe_free(user_ptr, size, size, tag, TierKind::Large);
                self.large.free(user_ptr);
            }
            None => {
                debug_assert!(false, "free of pointer not owned by this context");
            }
        }
    }

    /// Resize an allocation.
    ///
    /// `realloc(null, n)` behaves like `alloc(n)`; `realloc(p, 0)` frees
    /// and returns null. When the new size stays in the same placement
    /// the pointer is returned unchanged; otherwise the data moves with
    /// `min(old, new)` bytes preserved. On failure the original block is
    /// untouched and null is returned.
    pub fn realloc(&self, user_ptr: *mut u8, new_size: usize, tag: u8) -> *mut u8 {
        if user_ptr.is_null() {
            return self.alloc(new_size, tag);
        }
        if new_size == 0 {
            self.free(user_ptr);
            return ptr::null_mut();
        }

        let owner = match self.owner_of(user_ptr) {
            Some(owner) => owner,
            None => return ptr::null_mut(),
        };

        let placement = self.classify(new_size, DEFAULT_ALIGNMENT);

        // Same-placement fast paths: the existing block already fits.
        match (&owner, placement.route) {
            (
                Owner::Bin {
                    bin,
                    guarded,
                    block,
                    ..
                },
                Route::Bin(new_bin),
            ) if *bin == new_bin && *guarded == placement.guarded => {
                #[cfg(feature = "guards")]
                if *guarded {
                    unsafe { crate::debug::write_guards(*block, new_size) };
                }
                #[cfg(not(feature = "guards"))]
                let _ = block;
                #[cfg(feature = "leak-tracking")]
                self.live.update_size(user_ptr, new_size);
                return user_ptr;
            }
            (Owner::FullCell { .. }, Route::FullCell) => {
                #[cfg(feature = "leak-tracking")]
                self.live.update_size(user_ptr, new_size);
                return user_ptr;
            }
            (Owner::Buddy { order, .. }, Route::Buddy(new_order)) if *order == new_order => {
                #[cfg(feature = "leak-tracking")]
                self.live.update_size(user_ptr, new_size);
                return user_ptr;
            }
            _ => {}
        }

        // Large-to-large resizes delegate to the registry's own realloc.
        if let (Owner::Large { size: old_size, tag: old_tag }, Route::Large) =
            (&owner, placement.route)
        {
            let (old_size, old_tag) = (*old_size, *old_tag);
            let _ = (old_size, old_tag);

            #[cfg(feature = "budget")]
            if !self.budget_try_charge(new_size) {
                return ptr::null_mut();
            }

            let new_ptr = self.large.realloc(user_ptr, new_size, tag);
            if new_ptr.is_null() {
                #[cfg(feature = "budget")]
                self.budget_release(new_size);
                return ptr::null_mut();
            }

            #[cfg(feature = "budget")]
            self.budget_release(old_size);
            #[cfg(feature = "leak-tracking")]
            {
                self.live.remove(user_ptr);
                self.live.insert(new_ptr, new_size, tag);
            }
            #[cfg(feature = "stats")]
            {
                self.stats.record_free(Tier::Large, old_size as u64, old_tag);
                self.stats.record_alloc(Tier::Large, new_size as u64, tag);
            }
            #[cfg(feature = "callbacks")]
            if let Some(cb) = *self.alloc_callback.lock() {
                cb(user_ptr, old_size, old_tag, false);
                cb(new_ptr, new_size, tag, true);
            }
            return new_ptr;
        }

        // Cross-placement: allocate, copy, free.
        let copy_len = match &owner {
            Owner::Bin {
                bin,
                guarded,
                block,
                ..
            } => {
                #[cfg(feature = "guards")]
                {
                    if *guarded {
                        unsafe { crate::debug::stored_user_size(*block) }
                    } else {
                        BIN_SIZES[*bin]
                    }
                }
                #[cfg(not(feature = "guards"))]
                {
                    let _ = (guarded, block);
                    BIN_SIZES[*bin]
                }
            }
            Owner::FullCell { .. } => FULL_CELL_PAYLOAD,
            Owner::Buddy { order, .. } => (1usize << order) - BUDDY_HEADER_SIZE,
            Owner::Large { size, .. } => *size,
        };

        let new_ptr = self.alloc_with_alignment(new_size, tag, DEFAULT_ALIGNMENT);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            ptr::copy_nonoverlapping(user_ptr as *const u8, new_ptr, copy_len.min(new_size));
        }
        self.free(user_ptr);
        new_ptr
    }

    // -------------------------------------------------------------------------
    // Cell-level interface
    // -------------------------------------------------------------------------

    /// Allocate one full cell directly from the pool. The header is
    /// initialized with `tag` and the full-cell marker; the payload
    /// starts at [`crate::cell::BLOCK_START_OFFSET`].
    pub fn alloc_cell(&self, tag: u8) -> *mut CellHeader {
        #[cfg(feature = "budget")]
        if !self.budget_try_charge(CELL_SIZE) {
            return ptr::null_mut();
        }

        let cell = self.pool.alloc_cell();
        if cell.is_null() {
            #[cfg(feature = "budget")]
            self.budget_release(CELL_SIZE);
            return ptr::null_mut();
        }

        let header = cell as *mut CellHeader;
        unsafe {
            (*header).tag = tag;
            (*header).size_class = FULL_CELL_SENTINEL;
            (*header).free_count = 0;
        }

        #[cfg(feature = "leak-tracking")]
        self.live.insert(cell, CELL_SIZE, tag);
        #[cfg(feature = "stats")]
        self.stats.record_alloc(Tier::Cell, CELL_SIZE as u64, tag);
        #[cfg(feature = "callbacks")]
        if let Some(cb) = *self.alloc_callback.lock() {
            cb(cell, CELL_SIZE, tag, true);
        }

        header
    }

    /// Return a cell from [`alloc_cell`](Self::alloc_cell). Null is a
    /// no-op.
    pub fn free_cell(&self, cell: *mut CellHeader) {
        if cell.is_null() {
            return;
        }
        let tag = unsafe { (*cell).tag };
        self.observe_free(cell as *mut u8, CELL_SIZE, CELL_SIZE, tag, TierKind::Cell);
        self.pool.free_cell(cell as *mut u8);
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Drain the calling thread's bin caches and cell cache back into the
    /// shared structures. Call from each thread before destroying the
    /// context from another thread.
    pub fn flush_tls_bin_caches(&self) {
        self.sub_cell.flush_thread_caches(&self.pool);
        self.pool.flush_thread_cache();
    }

    /// Decommit every fully-free superblock of the cell region. Returns
    /// the number of bytes handed back to the OS.
    pub fn decommit_unused(&self) -> usize {
        self.pool.decommit_unused()
    }

    /// Bytes of the cell region currently committed.
    pub fn committed_bytes(&self) -> u64 {
        self.pool.committed_bytes()
    }

    /// Tier owning `ptr`, if this context owns it at all.
    pub fn tier_of(&self, ptr: *const u8) -> Option<AllocTier> {
        match self.owner_of(ptr as *mut u8)? {
            Owner::Bin { .. } => Some(AllocTier::SubCell),
            Owner::FullCell { .. } => Some(AllocTier::FullCell),
            Owner::Buddy { .. } => Some(AllocTier::Buddy),
            Owner::Large { .. } => Some(AllocTier::Large),
        }
    }

    // -------------------------------------------------------------------------
    // Observers
    // -------------------------------------------------------------------------

    /// Snapshot of the allocation statistics.
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Bytes currently allocated under `tag`.
    #[cfg(feature = "stats")]
    pub fn tag_bytes(&self, tag: u8) -> u64 {
        self.stats.tag_bytes(tag)
    }

    /// Zero all statistics counters.
    #[cfg(feature = "stats")]
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Log the statistics counters.
    #[cfg(feature = "stats")]
    pub fn dump_stats(&self) {
        self.stats.dump();
    }

    /// Number of live (unfreed) allocations.
    #[cfg(feature = "leak-tracking")]
    pub fn live_allocation_count(&self) -> usize {
        self.live.len()
    }

    /// Log every live allocation.
    #[cfg(feature = "leak-tracking")]
    pub fn report_leaks(&self) {
        self.live.report();
    }

    /// Verify the guard bytes of a guarded allocation. Unguarded or
    /// unknown pointers report true.
    #[cfg(feature = "guards")]
    pub fn check_guards(&self, ptr: *const u8) -> bool {
        match self.owner_of(ptr as *mut u8) {
            Some(Owner::Bin {
                guarded: true,
                block,
                ..
            }) => unsafe { crate::debug::verify_guards(block) },
            _ => true,
        }
    }

    /// Install (or clear) the allocation callback.
    #[cfg(feature = "callbacks")]
    pub fn set_alloc_callback(&self, callback: Option<AllocCallback>) {
        *self.alloc_callback.lock() = callback;
    }

    /// Install (or clear) the budget-exceeded callback.
    #[cfg(feature = "budget")]
    pub fn set_budget_callback(&self, callback: Option<BudgetCallback>) {
        *self.budget_callback.lock() = callback;
    }

    /// Bytes currently charged against the budget.
    #[cfg(feature = "budget")]
    pub fn budget_used(&self) -> usize {
        self.budget_used.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Routing internals
    // -------------------------------------------------------------------------

    fn classify(&self, size: usize, alignment: usize) -> Placement {
        #[cfg(feature = "guards")]
        {
            use crate::debug::GUARD_SIZE;
            if let Some(bin) = bin_for(size + 2 * GUARD_SIZE, alignment) {
                return Placement {
                    route: Route::Bin(bin),
                    rounded: BIN_SIZES[bin],
                    guarded: true,
                };
            }
        }

        if let Some(bin) = bin_for(size, alignment) {
            return Placement {
                route: Route::Bin(bin),
                rounded: BIN_SIZES[bin],
                guarded: false,
            };
        }
        if size <= FULL_CELL_PAYLOAD {
            return Placement {
                route: Route::FullCell,
                rounded: CELL_SIZE,
                guarded: false,
            };
        }
        if alignment <= BUDDY_NATURAL_ALIGNMENT {
            let order = order_for_payload(size);
            if order <= MAX_ORDER {
                return Placement {
                    route: Route::Buddy(order),
                    rounded: 1usize << order,
                    guarded: false,
                };
            }
        }
        Placement {
            route: Route::Large,
            rounded: size,
            guarded: false,
        }
    }

    fn alloc_placed(&self, placement: Placement, user_size: usize, tag: u8) -> *mut u8 {
        #[cfg(feature = "budget")]
        if !self.budget_try_charge(placement.rounded) {
            return ptr::null_mut();
        }

        let raw = match placement.route {
            Route::Bin(bin) => self.sub_cell.alloc_from_bin(&self.pool, bin, tag),
            Route::FullCell => {
                let cell = self.pool.alloc_cell();
                if cell.is_null() {
                    ptr::null_mut()
                } else {
                    let header = cell as *mut CellHeader;
                    unsafe {
                        (*header).tag = tag;
                        (*header).size_class = FULL_CELL_SENTINEL;
                        (*header).free_count = 0;
                        payload(header)
                    }
                }
            }
            Route::Buddy(_) => self.buddy.alloc(user_size, tag),
            Route::Large => self.large.alloc(user_size, tag, true),
            Route::LargeAligned(alignment) => self.large.alloc_aligned(user_size, alignment, tag),
        };

        if raw.is_null() {
            #[cfg(feature = "budget")]
            self.budget_release(placement.rounded);
            return ptr::null_mut();
        }

        #[cfg(feature = "guards")]
        let user_ptr = if placement.guarded {
            unsafe {
                crate::debug::write_guards(raw, user_size);
                raw.add(crate::debug::GUARD_SIZE)
            }
        } else {
            raw
        };
        #[cfg(not(feature = "guards"))]
        let user_ptr = raw;

        #[cfg(feature = "leak-tracking")]
        self.live.insert(user_ptr, user_size, tag);
        #[cfg(feature = "stats")]
        self.stats
            .record_alloc(tier_for_route(placement.route), placement.rounded as u64, tag);
        #[cfg(feature = "callbacks")]
        if let Some(cb) = *self.alloc_callback.lock() {
            cb(user_ptr, user_size, tag, true);
        }

        user_ptr
    }

    /// Run the free-side observers. `rounded` is the tier-rounded size
    /// (budget and stats), `user_size` the best known user size for the
    /// callback (exact when the leak map is on).
    #[allow(unused_variables, unused_mut)]
    fn observe_free(
        &self,
        user_ptr: *mut u8,
        rounded: usize,
        user_size: usize,
        tag: u8,
        tier: TierKind,
    ) {
        let mut user_size = user_size;
        let mut tag = tag;

        #[cfg(feature = "leak-tracking")]
        if let Some(entry) = self.live.remove(user_ptr) {
            user_size = entry.size;
            tag = entry.tag;
        }

        #[cfg(feature = "callbacks")]
        if let Some(cb) = *self.alloc_callback.lock() {
            cb(user_ptr, user_size, tag, false);
        }

        #[cfg(feature = "stats")]
        self.stats
            .record_free(tier_for_kind(tier), rounded as u64, tag);

        #[cfg(feature = "budget")]
        self.budget_release(rounded);
    }

    fn owner_of(&self, user_ptr: *mut u8) -> Option<Owner> {
        if self.pool.contains(user_ptr) {
            let header = header_for_ptr(user_ptr);
            let size_class = unsafe { (*header).size_class };
            if size_class == FULL_CELL_SENTINEL {
                return Some(Owner::FullCell { header });
            }
            let bin = size_class as usize;
            if bin >= NUM_SIZE_BINS {
                debug_assert!(false, "corrupted size class in cell header");
                return None;
            }

            #[cfg(feature = "guards")]
            {
                use crate::debug::GUARD_SIZE;
                let first_block = header as usize + crate::cell::BLOCK_START_OFFSET;
                let offset = (user_ptr as usize - first_block) % BIN_SIZES[bin];
                if offset == GUARD_SIZE {
                    return Some(Owner::Bin {
                        bin,
                        guarded: true,
                        block: (user_ptr as usize - GUARD_SIZE) as *mut u8,
                        header,
                    });
                }
                debug_assert_eq!(offset, 0, "pointer does not start a block");
            }

            return Some(Owner::Bin {
                bin,
                guarded: false,
                block: user_ptr,
                header,
            });
        }

        if self.buddy.owns(user_ptr) {
            let (order, tag) = unsafe { self.buddy.block_info(user_ptr) };
            return Some(Owner::Buddy { order, tag });
        }

        if let Some((size, tag)) = self.large.get(user_ptr) {
            return Some(Owner::Large { size, tag });
        }

        None
    }

    #[cfg(feature = "budget")]
    fn budget_try_charge(&self, amount: usize) -> bool {
        if self.budget_limit == 0 {
            return true;
        }
        let previous = self.budget_used.fetch_add(amount, Ordering::Relaxed);
        if previous + amount > self.budget_limit {
            self.budget_used.fetch_sub(amount, Ordering::Relaxed);
            if let Some(cb) = *self.budget_callback.lock() {
                cb(amount, self.budget_limit);
            }
            return false;
        }
        true
    }

    #[cfg(feature = "budget")]
    fn budget_release(&self, amount: usize) {
        if self.budget_limit != 0 {
            self.budget_used.fetch_sub(amount, Ordering::Relaxed);
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Only the destroying thread's caches can be drained here. Cells
        // still cached by other threads stay reserved-but-unused and are
        // returned to the OS with the region below.
        self.flush_tls_bin_caches();
        thread_cache::take_cell_cache(self.id);
        thread_cache::take_bin_caches(self.id);

        #[cfg(feature = "leak-tracking")]
        self.live.report();

        tracing::debug!(id = self.id, "context destroyed");

        // Large allocations are released by the registry's own drop.
        vm::release(self.reserve_base, self.reserve_size);
    }
}

/// Tier discriminant used on the free path (kept separate from the
/// feature-gated stats tier so the router compiles without `stats`).
#[derive(Clone, Copy)]
enum TierKind {
    SubCell,
    Cell,
    Buddy,
    Large,
}

#[cfg(feature = "stats")]
fn tier_for_kind(kind: TierKind) -> Tier {
    match kind {
        TierKind::SubCell => Tier::SubCell,
        TierKind::Cell => Tier::Cell,
        TierKind::Buddy => Tier::Buddy,
        TierKind::Large => Tier::Large,
    }
}

#[cfg(feature = "stats")]
fn tier_for_route(route: Route) -> Tier {
    match route {
        Route::Bin(_) => Tier::SubCell,
        Route::FullCell => Tier::Cell,
        Route::Buddy(_) => Tier::Buddy,
        Route::Large | Route::LargeAligned(_) => Tier::Large,
    }
}

#[inline]
fn align_up_addr(addr: usize, alignment: usize) -> usize {
    (addr + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_context() -> Context {
        Context::new(CellConfig::with_reserve_size(64 * 1024 * 1024)).unwrap()
    }

    #[test]
    fn test_invalid_arguments() {
        let ctx = small_context();
        assert!(ctx.alloc(0, 0).is_null());
        assert!(ctx.alloc_with_alignment(64, 0, 3).is_null());
        assert!(ctx.alloc_with_alignment(64, 0, 0).is_null());
        assert!(ctx.alloc_aligned(0, 64, 0).is_null());
        assert!(ctx.alloc_aligned(64, 48, 0).is_null());
        ctx.free(ptr::null_mut());
        assert!(ctx.realloc(ptr::null_mut(), 0, 0).is_null());
    }

    #[test]
    fn test_routing_by_size() {
        let ctx = small_context();

        let small = ctx.alloc(100, 1);
        let cell = ctx.alloc(10_000, 1);
        let buddy = ctx.alloc(64 * 1024, 1);
        let large = ctx.alloc(4 * 1024 * 1024, 1);

        assert_eq!(ctx.tier_of(small), Some(AllocTier::SubCell));
        assert_eq!(ctx.tier_of(cell), Some(AllocTier::FullCell));
        assert_eq!(ctx.tier_of(buddy), Some(AllocTier::Buddy));
        assert_eq!(ctx.tier_of(large), Some(AllocTier::Large));

        ctx.free(small);
        ctx.free(cell);
        ctx.free(buddy);
        ctx.free(large);
    }

    #[test]
    fn test_alignment_routing() {
        let ctx = small_context();

        // 16-byte alignment stays in the cell tiers.
        let p = ctx.alloc_aligned(64, 16, 0);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);
        assert_eq!(ctx.tier_of(p), Some(AllocTier::SubCell));
        ctx.free(p);

        // Large alignments go straight to the OS, regardless of size.
        let q = ctx.alloc_aligned(64, 4096, 0);
        assert!(!q.is_null());
        assert_eq!(q as usize % 4096, 0);
        assert_eq!(ctx.tier_of(q), Some(AllocTier::Large));
        ctx.free(q);

        // A buddy-sized request with 16-byte alignment skips the buddy
        // tier (its header only guarantees 8).
        let r = ctx.alloc_with_alignment(64 * 1024, 0, 16);
        assert!(!r.is_null());
        assert_eq!(r as usize % 16, 0);
        assert_eq!(ctx.tier_of(r), Some(AllocTier::Large));
        ctx.free(r);
    }

    #[test]
    fn test_cell_interface() {
        let ctx = small_context();

        let cell = ctx.alloc_cell(42);
        assert!(!cell.is_null());
        unsafe {
            assert_eq!((*cell).tag, 42);
            assert_eq!((*cell).size_class, FULL_CELL_SENTINEL);
            payload(cell).write_bytes(0x5C, FULL_CELL_PAYLOAD);
        }
        ctx.free_cell(cell);
        ctx.free_cell(ptr::null_mut());
    }

    #[test]
    fn test_realloc_identity_same_bin() {
        let ctx = small_context();

        let p = ctx.alloc(100, 0);
        assert!(!p.is_null());
        // 100 and 120 both round into the 128-byte bin.
        let q = ctx.realloc(p, 120, 0);
        assert_eq!(p, q);
        ctx.free(q);
    }

    #[test]
    fn test_realloc_moves_and_preserves() {
        let ctx = small_context();

        let p = ctx.alloc(64, 0);
        unsafe { p.write_bytes(0xEF, 64) };

        let q = ctx.realloc(p, 100_000, 0);
        assert!(!q.is_null());
        assert_ne!(p, q);
        unsafe {
            for i in 0..64 {
                assert_eq!(q.add(i).read(), 0xEF);
            }
        }
        ctx.free(q);
    }

    #[cfg(feature = "budget")]
    #[test]
    fn test_budget_rejects_over_limit() {
        let config = CellConfig::with_reserve_size(64 * 1024 * 1024).memory_budget(1024 * 1024);
        let ctx = Context::new(config).unwrap();

        // A 4 MiB request exceeds the 1 MiB budget before touching a tier.
        assert!(ctx.alloc(4 * 1024 * 1024, 0).is_null());

        let p = ctx.alloc(512 * 1024, 0);
        assert!(!p.is_null());
        ctx.free(p);
        assert_eq!(ctx.budget_used(), 0);
    }
}
