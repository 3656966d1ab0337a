//! Bitmap block allocator.
//!
//! One bit per block, set when the block is in use. Allocation is
//! first-fit over contiguous runs of clear bits.

use parking_lot::Mutex;

use super::BlockAllocator;
use crate::{IndexError, Result};

fn bit_get(bitmap: &[u8], idx: u64) -> bool {
    let byte = (idx / 8) as usize;
    byte < bitmap.len() && (bitmap[byte] >> (idx % 8)) & 1 == 1
}

fn bit_set(bitmap: &mut [u8], idx: u64) {
    let byte = (idx / 8) as usize;
    if byte < bitmap.len() {
        bitmap[byte] |= 1 << (idx % 8);
    }
}

/// Find `n` contiguous clear bits among the first `total` bits.
fn find_contiguous(bitmap: &[u8], total: u64, n: u64) -> Option<u64> {
    let mut run_start = 0;
    let mut run_len = 0;

    for idx in 0..total {
        if bit_get(bitmap, idx) {
            run_start = idx + 1;
            run_len = 0;
        } else {
            run_len += 1;
            if run_len >= n {
                return Some(run_start);
            }
        }
    }
    None
}

#[derive(Debug)]
struct BitmapState {
    bitmap: Vec<u8>,
    used: u64,
}

/// First-fit allocator over an in-memory block bitmap.
#[derive(Debug)]
pub struct BitmapAllocator {
    total: u64,
    state: Mutex<BitmapState>,
}

impl BitmapAllocator {
    /// Allocator over `total` blocks, all free.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            state: Mutex::new(BitmapState {
                bitmap: vec![0; total.div_ceil(8) as usize],
                used: 0,
            }),
        }
    }

    /// Allocator over `total` blocks with `[0, reserved)` already in use,
    /// leaving room for superblock-style metadata at the front.
    pub fn with_reserved(total: u64, reserved: u64) -> Self {
        let alloc = Self::new(total);
        {
            let mut state = alloc.state.lock();
            for idx in 0..reserved.min(total) {
                bit_set(&mut state.bitmap, idx);
            }
            state.used = reserved.min(total);
        }
        alloc
    }

    /// Number of blocks managed.
    pub const fn total_blocks(&self) -> u64 {
        self.total
    }
}

impl BlockAllocator for BitmapAllocator {
    fn allocate_blocks(&self, count: u64) -> Result<u64> {
        if count == 0 {
            return Err(IndexError::InvalidArgument(
                "cannot allocate zero blocks".to_string(),
            ));
        }

        let mut state = self.state.lock();
        let start = find_contiguous(&state.bitmap, self.total, count).ok_or_else(|| {
            IndexError::OutOfSpace(format!(
                "no run of {count} free blocks ({} of {} free)",
                self.total - state.used,
                self.total
            ))
        })?;

        for idx in start..start + count {
            bit_set(&mut state.bitmap, idx);
        }
        state.used += count;
        Ok(start)
    }

    fn mark_allocated(&self, addr: u64, count: u64) -> Result<()> {
        let end = addr.checked_add(count).filter(|&end| end <= self.total);
        let Some(end) = end else {
            return Err(IndexError::InvalidArgument(format!(
                "blocks {addr}+{count} beyond allocator end ({} blocks)",
                self.total
            )));
        };

        let mut state = self.state.lock();
        for idx in addr..end {
            if !bit_get(&state.bitmap, idx) {
                bit_set(&mut state.bitmap, idx);
                state.used += 1;
            }
        }
        Ok(())
    }

    fn is_allocated(&self, addr: u64) -> bool {
        addr < self.total && bit_get(&self.state.lock().bitmap, addr)
    }

    fn free_blocks(&self) -> u64 {
        self.total - self.state.lock().used
    }
}
