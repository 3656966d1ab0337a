//! Persisted metadata record.
//!
//! The scalar state of a table lives in one device block:
//!
//! ```text
//! offset  field
//! 0x00    size        slot count, power of two (0 = never initialized)
//! 0x08    mod         log2(size)
//! 0x10    mask        size - 1
//! 0x18    nnodes      live entries
//! 0x20    noccupied   live entries plus tombstones
//! 0x28    nvram_size  device blocks the table was built for
//! 0x30    range_size  bucket pages per lock range
//! 0x38    data_start  first block of the bucket region
//! ```
//!
//! All fields are little-endian `u64`; the rest of the block is zero.

use std::io::Cursor;

use binrw::{BinRead, BinReaderExt, BinWrite, BinWriterExt};
use tracing::debug;

use crate::bridge::BlockBridge;
use crate::{IndexError, Result};

/// Encoded size of [`MetadataRecord`] in bytes.
pub const RECORD_SIZE: usize = 64;

/// Scalar state of a table as stored on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct MetadataRecord {
    /// Slot count.
    pub size: u64,
    /// `log2(size)`.
    pub mod_shift: u64,
    /// `size - 1`.
    pub mask: u64,
    /// Live entries.
    pub nnodes: u64,
    /// Live entries plus tombstones.
    pub noccupied: u64,
    /// Device size in blocks.
    pub nvram_size: u64,
    /// Bucket pages per lock range.
    pub range_size: u64,
    /// First block of the bucket region.
    pub data_start: u64,
}

impl MetadataRecord {
    /// Whether the record describes an initialized table.
    pub const fn is_initialized(&self) -> bool {
        self.size != 0
    }

    /// Encode into a zero-padded block of `block_size` bytes.
    pub fn to_block(&self, block_size: usize) -> Result<Vec<u8>> {
        if block_size < RECORD_SIZE {
            return Err(IndexError::InvalidArgument(format!(
                "block of {block_size} bytes cannot hold the metadata record"
            )));
        }
        let mut data = Vec::with_capacity(block_size);
        Cursor::new(&mut data).write_le(self)?;
        data.resize(block_size, 0);
        Ok(data)
    }

    /// Decode from the start of a block.
    pub fn from_block(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_SIZE {
            return Err(IndexError::Format(format!(
                "metadata block of {} bytes is shorter than the {RECORD_SIZE} byte record",
                data.len()
            )));
        }
        Ok(Cursor::new(data).read_le::<Self>()?)
    }

    /// Check that the scalar fields agree with each other.
    pub fn validate(&self) -> Result<()> {
        if !self.size.is_power_of_two() {
            return Err(IndexError::CorruptMetadata(format!(
                "size {} is not a power of two",
                self.size
            )));
        }
        if self.mask != self.size - 1 {
            return Err(IndexError::CorruptMetadata(format!(
                "mask {:#x} does not match size {}",
                self.mask, self.size
            )));
        }
        if self.mod_shift != u64::from(self.size.trailing_zeros()) {
            return Err(IndexError::CorruptMetadata(format!(
                "mod {} does not match size {}",
                self.mod_shift, self.size
            )));
        }
        if self.nnodes > self.noccupied || self.noccupied > self.size {
            return Err(IndexError::CorruptMetadata(format!(
                "counters out of range: nnodes {} noccupied {} size {}",
                self.nnodes, self.noccupied, self.size
            )));
        }
        if self.range_size == 0 {
            return Err(IndexError::CorruptMetadata(
                "range_size is zero".to_string(),
            ));
        }
        if self.data_start >= self.nvram_size {
            return Err(IndexError::CorruptMetadata(format!(
                "data_start {} beyond device of {} blocks",
                self.data_start, self.nvram_size
            )));
        }
        Ok(())
    }

    /// Check that the table was built for the caller's device geometry.
    pub fn check_geometry(&self, nvram_size: u64, range_size: u64) -> Result<()> {
        if self.nvram_size != nvram_size || self.range_size != range_size {
            return Err(IndexError::CorruptMetadata(format!(
                "table built for nvram_size {} range_size {}, expected nvram_size {nvram_size} range_size {range_size}",
                self.nvram_size, self.range_size
            )));
        }
        Ok(())
    }
}

/// Read the record at `location`.
///
/// Returns `None` when the stored size is zero, meaning no table was ever
/// initialized there. A non-zero record is validated before it is returned.
pub fn read_metadata(bridge: &BlockBridge, location: u64) -> Result<Option<MetadataRecord>> {
    let block = bridge.read_block(location)?;
    let record = MetadataRecord::from_block(&block)?;
    if !record.is_initialized() {
        debug!("No metadata record at block {}", location);
        return Ok(None);
    }

    record.validate()?;
    debug!(
        "Read metadata at block {}: size={} nnodes={} noccupied={} data_start={}",
        location, record.size, record.nnodes, record.noccupied, record.data_start
    );
    Ok(Some(record))
}

/// Write `record` to `location` and mark that block allocated.
pub fn write_metadata(bridge: &BlockBridge, location: u64, record: &MetadataRecord) -> Result<()> {
    let block = record.to_block(bridge.block_size())?;
    bridge.write_block(location, &block)?;
    bridge.stats().record_metadata_write();
    bridge.mark_allocated(location, 1)?;
    debug!(
        "Wrote metadata at block {}: size={} nnodes={} noccupied={}",
        location, record.size, record.nnodes, record.noccupied
    );
    Ok(())
}
