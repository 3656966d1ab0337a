//! Block device and block allocator collaborators.
//!
//! The index never talks to storage directly. It reads and writes whole
//! blocks through a [`BlockDevice`] and obtains contiguous block runs from a
//! [`BlockAllocator`]. Both are expected to be thread-safe for these
//! primitive operations.
//!
//! Three implementations ship with the crate:
//! - [`MemoryDevice`]: RAM-backed, with per-instance counters and failure
//!   injection for tests
//! - [`FileDevice`]: a regular file or block device node (unix only)
//! - [`BitmapAllocator`]: first-fit contiguous allocator over a bitmap

use std::sync::Arc;

use crate::Result;

pub mod bitmap;
#[cfg(unix)]
pub mod file;
pub mod memory;

pub use bitmap::BitmapAllocator;
#[cfg(unix)]
pub use file::FileDevice;
pub use memory::MemoryDevice;

/// Synchronous block-addressed storage.
pub trait BlockDevice: Send + Sync {
    /// Size of one block in bytes.
    fn block_size(&self) -> usize;

    /// Number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Read the first `buf.len()` bytes of block `addr`.
    fn read_block(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` at the start of block `addr`.
    ///
    /// Durability follows the device's own policy; the index does not
    /// issue a separate sync.
    fn write_block(&self, addr: u64, buf: &[u8]) -> Result<()>;
}

/// Space management for the device the index lives on.
pub trait BlockAllocator: Send + Sync {
    /// Allocate `count` contiguous blocks and return the first address.
    fn allocate_blocks(&self, count: u64) -> Result<u64>;

    /// Record `count` blocks starting at `addr` as in use.
    fn mark_allocated(&self, addr: u64, count: u64) -> Result<()>;

    /// Whether block `addr` is in use.
    fn is_allocated(&self, addr: u64) -> bool;

    /// Number of blocks still available.
    fn free_blocks(&self) -> u64;
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn read_block(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_block(addr, buf)
    }

    fn write_block(&self, addr: u64, buf: &[u8]) -> Result<()> {
        (**self).write_block(addr, buf)
    }
}

impl<T: BlockAllocator + ?Sized> BlockAllocator for Arc<T> {
    fn allocate_blocks(&self, count: u64) -> Result<u64> {
        (**self).allocate_blocks(count)
    }

    fn mark_allocated(&self, addr: u64, count: u64) -> Result<()> {
        (**self).mark_allocated(addr, count)
    }

    fn is_allocated(&self, addr: u64) -> bool {
        (**self).is_allocated(addr)
    }

    fn free_blocks(&self) -> u64 {
        (**self).free_blocks()
    }
}

/// Byte offset of `addr` after checking it against the device bounds.
pub(crate) fn block_offset(
    addr: u64,
    len: usize,
    block_size: usize,
    block_count: u64,
) -> Result<u64> {
    if addr >= block_count {
        return Err(crate::IndexError::InvalidArgument(format!(
            "block {addr} beyond device end ({block_count} blocks)"
        )));
    }
    if len > block_size {
        return Err(crate::IndexError::InvalidArgument(format!(
            "transfer of {len} bytes exceeds block size {block_size}"
        )));
    }
    Ok(addr * block_size as u64)
}
