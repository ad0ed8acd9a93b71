//! # cellalloc
//!
//! A multi-tier memory allocator for data-oriented applications (game
//! engines, ECS runtimes, high-throughput services). One [`Context`] owns
//! two reserved virtual-address regions and routes every request through
//! four tiers:
//!
//! - **Sub-cell bins** (16 B – 8 KiB): segregated power-of-two size
//!   classes carved out of cells, with lock-free per-thread caches for the
//!   hot bins.
//! - **Full cells** (up to ~16 KiB): fixed-size, self-aligned blocks from
//!   a lock-free three-tier pool (thread cache, global Treiber stack,
//!   on-demand superblock commit).
//! - **Buddy blocks** (32 KiB – 2 MiB): a power-of-two splitter/merger
//!   over its own region.
//! - **Large allocations** (> 2 MiB): direct OS mappings tracked in a
//!   registry, with an optional huge-page path.
//!
//! Frees need no size argument: the owning tier is identified from the
//! pointer's address, and cell headers are found by masking thanks to
//! cell-aligned placement. Physical memory is committed lazily and can be
//! handed back with [`Context::decommit_unused`] while keeping the
//! address space reserved.
//!
//! # Example
//!
//! ```
//! use cellalloc::{CellConfig, Context};
//!
//! let ctx = Context::new(CellConfig::with_reserve_size(64 * 1024 * 1024)).unwrap();
//!
//! let p = ctx.alloc(240, 1);
//! assert!(!p.is_null());
//! unsafe { p.write_bytes(0xAB, 240) };
//!
//! let p = ctx.realloc(p, 100_000, 1);
//! assert!(!p.is_null());
//! ctx.free(p);
//! ```
//!
//! # Feature flags
//!
//! Observers are compile-time optional and never change functional
//! behavior: `stats` (default), `budget`, `guards`, `leak-tracking`,
//! `stacktrace`, `callbacks`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buddy;
pub mod cell;
pub mod config;
pub mod context;
pub mod error;
pub mod large;
pub mod pool;
pub mod size_class;
pub mod vm;

pub mod debug;
mod sub_cell;
mod thread_cache;

#[cfg(feature = "stats")]
pub mod stats;

// Re-exports for convenient access
pub use cell::{CellHeader, BLOCK_START_OFFSET, FULL_CELL_PAYLOAD};
pub use config::{CellConfig, CELL_SIZE, CELLS_PER_SUPERBLOCK, SUPERBLOCK_SIZE};
pub use context::{AllocTier, Context};
pub use error::AllocError;

#[cfg(feature = "callbacks")]
pub use context::AllocCallback;
#[cfg(feature = "budget")]
pub use context::BudgetCallback;
#[cfg(feature = "stats")]
pub use stats::StatsSnapshot;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reexports_compile() {
        let config = CellConfig::default();
        assert_eq!(config.reserve_size, 16 * 1024 * 1024 * 1024);
        assert_eq!(CELL_SIZE, 16 * 1024);
    }
}
