//! RAM-backed block device.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::{BlockDevice, block_offset};
use crate::Result;

/// Block device kept entirely in memory.
///
/// Counts every block read and write so tests can assert on device
/// traffic, and can be told to fail upcoming transfers.
#[derive(Debug)]
pub struct MemoryDevice {
    block_size: usize,
    block_count: u64,
    bytes: RwLock<Vec<u8>>,
    reads: AtomicU64,
    writes: AtomicU64,
    failing_reads: AtomicU64,
    failing_writes: AtomicU64,
}

impl MemoryDevice {
    /// Create a zero-filled device.
    pub fn new(block_size: usize, block_count: u64) -> Self {
        let len = block_size * block_count as usize;
        Self {
            block_size,
            block_count,
            bytes: RwLock::new(vec![0; len]),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            failing_reads: AtomicU64::new(0),
            failing_writes: AtomicU64::new(0),
        }
    }

    /// Block reads served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Block writes accepted so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Zero both transfer counters.
    pub fn reset_counters(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }

    /// Fail the next `count` reads with an I/O error.
    pub fn fail_next_reads(&self, count: u64) {
        self.failing_reads.store(count, Ordering::Relaxed);
    }

    /// Fail the next `count` writes with an I/O error.
    pub fn fail_next_writes(&self, count: u64) {
        self.failing_writes.store(count, Ordering::Relaxed);
    }

    /// Copy of the raw contents of block `addr`.
    pub fn block(&self, addr: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0; self.block_size];
        let offset = block_offset(addr, buf.len(), self.block_size, self.block_count)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.bytes.read()[start..start + self.block_size]);
        Ok(buf)
    }

    fn take_failure(counter: &AtomicU64) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let start = block_offset(addr, buf.len(), self.block_size, self.block_count)? as usize;
        if Self::take_failure(&self.failing_reads) {
            return Err(io::Error::other(format!("injected read failure at block {addr}")).into());
        }

        buf.copy_from_slice(&self.bytes.read()[start..start + buf.len()]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&self, addr: u64, buf: &[u8]) -> Result<()> {
        let start = block_offset(addr, buf.len(), self.block_size, self.block_count)? as usize;
        if Self::take_failure(&self.failing_writes) {
            return Err(io::Error::other(format!("injected write failure at block {addr}")).into());
        }

        self.bytes.write()[start..start + buf.len()].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
