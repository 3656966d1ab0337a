//! Per-instance I/O counters and index statistics.
//!
//! Counters belong to one index instance so concurrent tests never see each
//! other's traffic.

use std::sync::atomic::{AtomicU64, Ordering};

/// Device and cache traffic counters for one index instance.
#[derive(Debug, Default)]
pub struct IoStats {
    page_reads: AtomicU64,
    page_writes: AtomicU64,
    blocks_allocated: AtomicU64,
    metadata_writes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl IoStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_page_read(&self) {
        self.page_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_page_write(&self) {
        self.page_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_allocation(&self, blocks: u64) {
        self.blocks_allocated.fetch_add(blocks, Ordering::Relaxed);
    }

    pub(crate) fn record_metadata_write(&self) {
        self.metadata_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Pages read from the device.
    pub fn page_reads(&self) -> u64 {
        self.page_reads.load(Ordering::Relaxed)
    }

    /// Pages written to the device.
    pub fn page_writes(&self) -> u64 {
        self.page_writes.load(Ordering::Relaxed)
    }

    /// Blocks obtained from the allocator.
    pub fn blocks_allocated(&self) -> u64 {
        self.blocks_allocated.load(Ordering::Relaxed)
    }

    /// Metadata records written.
    pub fn metadata_writes(&self) -> u64 {
        self.metadata_writes.load(Ordering::Relaxed)
    }

    /// Page lookups served from memory.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Page lookups that faulted the page in from the device.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of an index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Slot count (power of two).
    pub size: u64,
    /// Live entries.
    pub nnodes: u64,
    /// Live entries plus tombstones.
    pub noccupied: u64,
    /// Pages in the bucket region.
    pub region_pages: u64,
    /// First block of the bucket region.
    pub data_start: u64,
    /// Pages currently held by the cache.
    pub cached_pages: u64,
    /// Pages waiting for the next flush.
    pub dirty_pages: u64,
    /// Pages read from the device.
    pub page_reads: u64,
    /// Pages written to the device.
    pub page_writes: u64,
    /// Blocks obtained from the allocator.
    pub blocks_allocated: u64,
    /// Metadata records written.
    pub metadata_writes: u64,
    /// Page lookups served from memory.
    pub cache_hits: u64,
    /// Page lookups that went to the device.
    pub cache_misses: u64,
}

impl IndexStats {
    /// Ratio of occupied slots (tombstones included) to slot count.
    pub fn load_factor(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            self.noccupied as f64 / self.size as f64
        }
    }

    /// Share of page lookups served without device I/O.
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
