//! Allocation statistics (feature `stats`).
//!
//! All counters are atomic so updates never take a lock; reads produce a
//! plain [`StatsSnapshot`]. Peak tracking uses a compare-and-set loop, so
//! it is monotonic even under contention.

use std::sync::atomic::{AtomicU64, Ordering};

/// Allocation tier, for the per-tier counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Sub-cell block from a size-class bin.
    SubCell,
    /// Full cell.
    Cell,
    /// Buddy block.
    Buddy,
    /// Direct OS allocation.
    Large,
}

/// Atomic statistics counters.
pub struct MemoryStats {
    total_allocated: AtomicU64,
    total_freed: AtomicU64,
    current_allocated: AtomicU64,
    peak_allocated: AtomicU64,

    cell_allocs: AtomicU64,
    cell_frees: AtomicU64,
    subcell_allocs: AtomicU64,
    subcell_frees: AtomicU64,
    buddy_allocs: AtomicU64,
    buddy_frees: AtomicU64,
    large_allocs: AtomicU64,
    large_frees: AtomicU64,

    per_tag_current: [AtomicU64; 256],
}

/// Plain snapshot of the counters at one instant.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    /// Cumulative bytes allocated.
    pub total_allocated: u64,
    /// Cumulative bytes freed.
    pub total_freed: u64,
    /// Bytes allocated right now.
    pub current_allocated: u64,
    /// High-water mark of `current_allocated`.
    pub peak_allocated: u64,
    /// Full-cell alloc / free counts.
    pub cell_allocs: u64,
    /// Full-cell frees.
    pub cell_frees: u64,
    /// Sub-cell allocs.
    pub subcell_allocs: u64,
    /// Sub-cell frees.
    pub subcell_frees: u64,
    /// Buddy allocs.
    pub buddy_allocs: u64,
    /// Buddy frees.
    pub buddy_frees: u64,
    /// Large allocs.
    pub large_allocs: u64,
    /// Large frees.
    pub large_frees: u64,
}

impl MemoryStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self {
            total_allocated: AtomicU64::new(0),
            total_freed: AtomicU64::new(0),
            current_allocated: AtomicU64::new(0),
            peak_allocated: AtomicU64::new(0),
            cell_allocs: AtomicU64::new(0),
            cell_frees: AtomicU64::new(0),
            subcell_allocs: AtomicU64::new(0),
            subcell_frees: AtomicU64::new(0),
            buddy_allocs: AtomicU64::new(0),
            buddy_frees: AtomicU64::new(0),
            large_allocs: AtomicU64::new(0),
            large_frees: AtomicU64::new(0),
            per_tag_current: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Record an allocation of `size` (post-rounding) bytes.
    pub fn record_alloc(&self, tier: Tier, size: u64, tag: u8) {
        self.total_allocated.fetch_add(size, Ordering::Relaxed);
        let current = self.current_allocated.fetch_add(size, Ordering::Relaxed) + size;

        // Monotonic peak update; losing a race just retries.
        let mut peak = self.peak_allocated.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_allocated.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }

        self.per_tag_current[tag as usize].fetch_add(size, Ordering::Relaxed);
        self.tier_counter(tier, true).fetch_add(1, Ordering::Relaxed);
    }

    /// Record a free of `size` (post-rounding) bytes.
    pub fn record_free(&self, tier: Tier, size: u64, tag: u8) {
        self.total_freed.fetch_add(size, Ordering::Relaxed);
        self.current_allocated.fetch_sub(size, Ordering::Relaxed);
        self.per_tag_current[tag as usize].fetch_sub(size, Ordering::Relaxed);
        self.tier_counter(tier, false).fetch_add(1, Ordering::Relaxed);
    }

    fn tier_counter(&self, tier: Tier, alloc: bool) -> &AtomicU64 {
        match (tier, alloc) {
            (Tier::SubCell, true) => &self.subcell_allocs,
            (Tier::SubCell, false) => &self.subcell_frees,
            (Tier::Cell, true) => &self.cell_allocs,
            (Tier::Cell, false) => &self.cell_frees,
            (Tier::Buddy, true) => &self.buddy_allocs,
            (Tier::Buddy, false) => &self.buddy_frees,
            (Tier::Large, true) => &self.large_allocs,
            (Tier::Large, false) => &self.large_frees,
        }
    }

    /// Bytes currently allocated under `tag`.
    pub fn tag_bytes(&self, tag: u8) -> u64 {
        self.per_tag_current[tag as usize].load(Ordering::Relaxed)
    }

    /// Snapshot every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            total_freed: self.total_freed.load(Ordering::Relaxed),
            current_allocated: self.current_allocated.load(Ordering::Relaxed),
            peak_allocated: self.peak_allocated.load(Ordering::Relaxed),
            cell_allocs: self.cell_allocs.load(Ordering::Relaxed),
            cell_frees: self.cell_frees.load(Ordering::Relaxed),
            subcell_allocs: self.subcell_allocs.load(Ordering::Relaxed),
            subcell_frees: self.subcell_frees.load(Ordering::Relaxed),
            buddy_allocs: self.buddy_allocs.load(Ordering::Relaxed),
            buddy_frees: self.buddy_frees.load(Ordering::Relaxed),
            large_allocs: self.large_allocs.load(Ordering::Relaxed),
            large_frees: self.large_frees.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.total_allocated.store(0, Ordering::Relaxed);
        self.total_freed.store(0, Ordering::Relaxed);
        self.current_allocated.store(0, Ordering::Relaxed);
        self.peak_allocated.store(0, Ordering::Relaxed);
        self.cell_allocs.store(0, Ordering::Relaxed);
        self.cell_frees.store(0, Ordering::Relaxed);
        self.subcell_allocs.store(0, Ordering::Relaxed);
        self.subcell_frees.store(0, Ordering::Relaxed);
        self.buddy_allocs.store(0, Ordering::Relaxed);
        self.buddy_frees.store(0, Ordering::Relaxed);
        self.large_allocs.store(0, Ordering::Relaxed);
        self.large_frees.store(0, Ordering::Relaxed);
        for tag in self.per_tag_current.iter() {
            tag.store(0, Ordering::Relaxed);
        }
    }

    /// Log the current counters.
    pub fn dump(&self) {
        let snap = self.snapshot();
        tracing::info!(
            total_allocated = snap.total_allocated,
            total_freed = snap.total_freed,
            current_allocated = snap.current_allocated,
            peak_allocated = snap.peak_allocated,
            subcell = format_args!("{}/{}", snap.subcell_allocs, snap.subcell_frees),
            cell = format_args!("{}/{}", snap.cell_allocs, snap.cell_frees),
            buddy = format_args!("{}/{}", snap.buddy_allocs, snap.buddy_frees),
            large = format_args!("{}/{}", snap.large_allocs, snap.large_frees),
            "memory stats"
        );
    }
}

impl Default for MemoryStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = MemoryStats::new();

        stats.record_alloc(Tier::SubCell, 64, 1);
        stats.record_alloc(Tier::Buddy, 65536, 2);

        let snap = stats.snapshot();
        assert_eq!(snap.current_allocated, 64 + 65536);
        assert_eq!(snap.peak_allocated, 64 + 65536);
        assert_eq!(snap.subcell_allocs, 1);
        assert_eq!(snap.buddy_allocs, 1);
        assert_eq!(stats.tag_bytes(1), 64);
        assert_eq!(stats.tag_bytes(2), 65536);

        stats.record_free(Tier::SubCell, 64, 1);
        stats.record_free(Tier::Buddy, 65536, 2);

        let snap = stats.snapshot();
        assert_eq!(snap.current_allocated, 0);
        assert_eq!(snap.peak_allocated, 64 + 65536);
        assert_eq!(stats.tag_bytes(1), 0);
    }

    #[test]
    fn test_peak_is_monotonic() {
        let stats = MemoryStats::new();
        stats.record_alloc(Tier::Cell, 1000, 0);
        stats.record_free(Tier::Cell, 1000, 0);
        stats.record_alloc(Tier::Cell, 400, 0);
        assert_eq!(stats.snapshot().peak_allocated, 1000);
    }

    #[test]
    fn test_reset() {
        let stats = MemoryStats::new();
        stats.record_alloc(Tier::Large, 1 << 22, 5);
        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.total_allocated, 0);
        assert_eq!(snap.peak_allocated, 0);
        assert_eq!(stats.tag_bytes(5), 0);
    }
}
