//! Translation between bucket pages and device blocks.
//!
//! The bucket array occupies a contiguous [`Region`] of blocks. Page `n` of
//! the array is block `region.start + n`. The bridge performs the device
//! transfers and asks the allocator for new regions; it never retries a
//! failed transfer.

use std::sync::Arc;

use tracing::debug;

use crate::device::{BlockAllocator, BlockDevice};
use crate::page::{Page, entries_per_page};
use crate::stats::IoStats;
use crate::{IndexError, Result};

/// A contiguous run of blocks holding bucket pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First block of the run (`data_start`).
    pub start: u64,
    /// Number of pages in the run.
    pub pages: u64,
}

impl Region {
    /// Create a region descriptor.
    pub const fn new(start: u64, pages: u64) -> Self {
        Self { start, pages }
    }

    /// Device address of `page_index`.
    pub fn block_of(&self, page_index: u64) -> Result<u64> {
        if page_index >= self.pages {
            return Err(IndexError::InvalidArgument(format!(
                "page {page_index} outside region of {} pages at block {}",
                self.pages, self.start
            )));
        }
        Ok(self.start + page_index)
    }
}

/// Block I/O bridge shared by the cache and the metadata checkpoint.
pub struct BlockBridge {
    device: Arc<dyn BlockDevice>,
    allocator: Arc<dyn BlockAllocator>,
    block_size: usize,
    stats: IoStats,
}

impl BlockBridge {
    /// Wrap a device and its allocator.
    pub fn new(device: Arc<dyn BlockDevice>, allocator: Arc<dyn BlockAllocator>) -> Self {
        let block_size = device.block_size();
        Self {
            device,
            allocator,
            block_size,
            stats: IoStats::new(),
        }
    }

    /// Page (device block) size in bytes.
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Entries that fit in one page.
    pub const fn entries_per_page(&self) -> usize {
        entries_per_page(self.block_size)
    }

    /// Number of blocks on the device.
    pub fn device_blocks(&self) -> u64 {
        self.device.block_count()
    }

    /// Traffic counters for this bridge.
    pub const fn stats(&self) -> &IoStats {
        &self.stats
    }

    /// Read and decode page `page_index` of `region`.
    pub fn read_page(&self, region: Region, page_index: u64) -> Result<Page> {
        let addr = region.block_of(page_index)?;
        let mut buf = vec![0; self.block_size];
        self.device.read_block(addr, &mut buf)?;
        self.stats.record_page_read();
        Page::from_bytes(&buf)
    }

    /// Encode and write `page` as page `page_index` of `region`.
    pub fn write_page(&self, region: Region, page_index: u64, page: &Page) -> Result<()> {
        let addr = region.block_of(page_index)?;
        if page.block_size() != self.block_size {
            return Err(IndexError::InvalidArgument(format!(
                "page built for {} byte blocks, device uses {}",
                page.block_size(),
                self.block_size
            )));
        }
        self.device.write_block(addr, &page.to_bytes()?)?;
        self.stats.record_page_write();
        Ok(())
    }

    /// Allocate a contiguous region of `count` pages.
    pub fn allocate_pages(&self, count: u64) -> Result<Region> {
        let start = self.allocator.allocate_blocks(count)?;
        self.stats.record_allocation(count);
        debug!("Allocated {} bucket pages at block {}", count, start);
        Ok(Region::new(start, count))
    }

    /// Read one raw block (metadata record).
    pub fn read_block(&self, addr: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0; self.block_size];
        self.device.read_block(addr, &mut buf)?;
        Ok(buf)
    }

    /// Write one raw block (metadata record).
    pub fn write_block(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.device.write_block(addr, data)
    }

    /// Record blocks as used in the allocator's bitmap.
    pub fn mark_allocated(&self, addr: u64, count: u64) -> Result<()> {
        self.allocator.mark_allocated(addr, count)
    }
}

impl std::fmt::Debug for BlockBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBridge")
            .field("block_size", &self.block_size)
            .field("device_blocks", &self.device.block_count())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
