//! Layout constants and runtime configuration.
//!
//! The compile-time constants fix the geometry of the allocator: cell size,
//! superblock size, the size-class table, and the per-thread cache
//! capacities. Everything that can vary per process lives in [`CellConfig`].

use crate::error::AllocError;

// -----------------------------------------------------------------------------
// Cell geometry
// -----------------------------------------------------------------------------

/// Log2 of the cell size. Cells are 16 KiB.
pub const CELL_SIZE_LOG2: usize = 14;

/// Cell size in bytes. Cells are aligned to their size, so any pointer
/// inside a cell can be masked down to the cell's header.
pub const CELL_SIZE: usize = 1 << CELL_SIZE_LOG2;

/// Bitmask that rounds an address down to its containing cell.
pub const CELL_MASK: usize = !(CELL_SIZE - 1);

/// Log2 of the superblock size. Superblocks are 2 MiB.
pub const SUPERBLOCK_SIZE_LOG2: usize = 21;

/// Superblock size in bytes; the unit of OS commit and decommit.
pub const SUPERBLOCK_SIZE: usize = 1 << SUPERBLOCK_SIZE_LOG2;

/// Number of cells carved from each superblock.
pub const CELLS_PER_SUPERBLOCK: usize = SUPERBLOCK_SIZE / CELL_SIZE;

// -----------------------------------------------------------------------------
// Per-thread cache capacities
// -----------------------------------------------------------------------------

/// Free cells cached per thread.
pub const TLS_CELL_CACHE_CAPACITY: usize = 64;

/// Number of bins with a per-thread block cache (bins 0-8: 16 B to 4 KiB).
pub const HOT_BIN_COUNT: usize = 9;

/// Blocks cached per hot bin per thread.
pub const TLS_BIN_CACHE_CAPACITY: usize = 32;

/// Blocks pulled from a bin in one lock acquisition when a thread cache
/// runs dry.
pub const TLS_BIN_BATCH_REFILL: usize = 16;

// -----------------------------------------------------------------------------
// Sub-cell size classes
// -----------------------------------------------------------------------------

/// Number of size-class bins.
pub const NUM_SIZE_BINS: usize = 10;

/// Minimum block size. Must fit an intrusive free-list pointer.
pub const MIN_BLOCK_SIZE: usize = 16;

/// Largest sub-cell allocation; anything bigger uses a full cell.
pub const MAX_SUB_CELL_SIZE: usize = 8192;

/// Block size per bin. All entries are powers of two.
pub const BIN_SIZES: [usize; NUM_SIZE_BINS] =
    [16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192];

/// Fully-empty cells a bin keeps around instead of returning them to the
/// pool, so alloc/free cycles at a size class don't thrash the pool.
pub const WARM_CELLS_PER_BIN: usize = 2;

/// `size_class` value marking a full-cell allocation.
pub const FULL_CELL_SENTINEL: u8 = 0xFF;

// -----------------------------------------------------------------------------
// Buddy allocator
// -----------------------------------------------------------------------------

/// Smallest buddy order: 2^15 = 32 KiB.
pub const MIN_ORDER: usize = 15;

/// Largest buddy order: 2^21 = 2 MiB, one superblock.
pub const MAX_ORDER: usize = 21;

/// Number of buddy orders.
pub const NUM_ORDERS: usize = MAX_ORDER - MIN_ORDER + 1;

/// Smallest buddy block in bytes.
pub const BUDDY_MIN_BLOCK: usize = 1 << MIN_ORDER;

/// Largest buddy block in bytes.
pub const BUDDY_MAX_BLOCK: usize = 1 << MAX_ORDER;

/// Bytes of header ahead of every buddy allocation.
pub const BUDDY_HEADER_SIZE: usize = 8;

// -----------------------------------------------------------------------------
// Alignment limits of the routing tiers
// -----------------------------------------------------------------------------

/// Largest alignment the cell tiers guarantee naturally.
pub const MAX_NATURAL_ALIGNMENT: usize = 16;

/// Largest user alignment the buddy tier can honor; its 8-byte header
/// offsets every returned pointer.
pub const BUDDY_NATURAL_ALIGNMENT: usize = 8;

const fn bins_are_pow2() -> bool {
    let mut i = 0;
    while i < NUM_SIZE_BINS {
        if !BIN_SIZES[i].is_power_of_two() {
            return false;
        }
        i += 1;
    }
    true
}

const _: () = assert!(CELL_SIZE >= 4096);
const _: () = assert!(CELL_SIZE.is_power_of_two());
const _: () = assert!(SUPERBLOCK_SIZE % CELL_SIZE == 0);
const _: () = assert!(CELLS_PER_SUPERBLOCK >= 1);
const _: () = assert!(TLS_CELL_CACHE_CAPACITY >= 1);
const _: () = assert!(MIN_BLOCK_SIZE >= core::mem::size_of::<*mut u8>());
const _: () = assert!(MAX_SUB_CELL_SIZE < CELL_SIZE);
const _: () = assert!(BIN_SIZES[0] == MIN_BLOCK_SIZE);
const _: () = assert!(BIN_SIZES[NUM_SIZE_BINS - 1] == MAX_SUB_CELL_SIZE);
const _: () = assert!(bins_are_pow2());
const _: () = assert!(HOT_BIN_COUNT <= NUM_SIZE_BINS);
const _: () = assert!(BUDDY_MAX_BLOCK == SUPERBLOCK_SIZE);
const _: () = assert!(TLS_BIN_BATCH_REFILL <= TLS_BIN_CACHE_CAPACITY);

/// Configuration for creating a [`Context`](crate::Context).
///
/// Only virtual address space is reserved up front; physical pages are
/// committed lazily, one superblock at a time.
#[derive(Debug, Clone)]
pub struct CellConfig {
    /// Total address space to reserve, split between the cell region and
    /// the buddy region. Default: 16 GiB.
    pub reserve_size: usize,

    /// Hard cap on bytes this context may have allocated at once.
    /// `0` means unlimited.
    #[cfg(feature = "budget")]
    pub memory_budget: usize,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            reserve_size: 16 * 1024 * 1024 * 1024,
            #[cfg(feature = "budget")]
            memory_budget: 0,
        }
    }
}

impl CellConfig {
    /// Create a config reserving the given amount of address space.
    pub fn with_reserve_size(reserve_size: usize) -> Self {
        Self {
            reserve_size,
            ..Default::default()
        }
    }

    /// Set the reserve size.
    pub fn reserve_size(mut self, size: usize) -> Self {
        self.reserve_size = size;
        self
    }

    /// Set the memory budget in bytes (`0` = unlimited).
    #[cfg(feature = "budget")]
    pub fn memory_budget(mut self, budget: usize) -> Self {
        self.memory_budget = budget;
        self
    }

    /// Validate the configuration.
    ///
    /// The reservation must be large enough that both halves still contain
    /// at least one superblock after alignment.
    pub fn validate(&self) -> Result<(), AllocError> {
        if self.reserve_size < 8 * SUPERBLOCK_SIZE {
            return Err(AllocError::InvalidConfig(
                "reserve_size must be at least 8 superblocks (16 MiB)",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        assert_eq!(CELL_SIZE, 16 * 1024);
        assert_eq!(SUPERBLOCK_SIZE, 2 * 1024 * 1024);
        assert_eq!(CELLS_PER_SUPERBLOCK, 128);
        assert_eq!(NUM_ORDERS, 7);
    }

    #[test]
    fn test_validate() {
        assert!(CellConfig::default().validate().is_ok());
        assert!(CellConfig::with_reserve_size(1024 * 1024).validate().is_err());
        assert!(CellConfig::with_reserve_size(16 * 1024 * 1024)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_mask() {
        let addr = 0x1234_5678usize;
        assert_eq!(addr & CELL_MASK, addr - (addr % CELL_SIZE));
    }
}
