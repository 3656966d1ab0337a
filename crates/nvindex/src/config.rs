//! Index configuration
//!
//! Geometry and tuning knobs for a [`HashIndex`](crate::HashIndex). The
//! geometry fields (`nvram_size`, `range_size`) are persisted in the
//! metadata record and must match on every reopen.

use serde::{Deserialize, Serialize};

use crate::checkpoint::RECORD_SIZE;
use crate::{IndexError, Result};

/// Smallest slot count a table is created with.
pub const MIN_CAPACITY: u64 = 8;

/// Hash index configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Device block size in bytes; one bucket page per block
    pub block_size: usize,
    /// Requested slot count for a new table (rounded up to a power of two)
    pub initial_capacity: u64,
    /// Bucket pages guarded by one range lock
    pub range_size: u64,
    /// Block address of the metadata record
    pub metadata_location: u64,
    /// Device size in blocks the table is built for (None uses the device's
    /// own block count)
    pub nvram_size: Option<u64>,
    /// Resident pages above which a warning is logged (None for no bound).
    /// The cache never evicts.
    pub max_cached_pages: Option<u64>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            initial_capacity: 1024,
            range_size: 16,
            metadata_location: 0,
            nvram_size: None,
            max_cached_pages: None,
        }
    }
}

impl IndexConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device block size
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the initial slot count
    pub fn with_initial_capacity(mut self, capacity: u64) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Set pages per lock range
    pub fn with_range_size(mut self, range_size: u64) -> Self {
        self.range_size = range_size;
        self
    }

    /// Set the metadata record location
    pub fn with_metadata_location(mut self, location: u64) -> Self {
        self.metadata_location = location;
        self
    }

    /// Pin the expected device size
    pub fn with_nvram_size(mut self, blocks: u64) -> Self {
        self.nvram_size = Some(blocks);
        self
    }

    /// Set the advisory cache bound
    pub fn with_max_cached_pages(mut self, pages: u64) -> Self {
        self.max_cached_pages = Some(pages);
        self
    }

    /// Slot count a new table starts with.
    pub fn initial_slots(&self) -> u64 {
        self.initial_capacity.max(MIN_CAPACITY).next_power_of_two()
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.block_size < RECORD_SIZE {
            return Err(format!(
                "block_size {} cannot hold the {RECORD_SIZE} byte metadata record",
                self.block_size
            ));
        }
        if !self.block_size.is_multiple_of(8) {
            return Err(format!(
                "block_size {} must be a multiple of 8",
                self.block_size
            ));
        }
        if self.range_size == 0 {
            return Err("range_size must be greater than 0".to_string());
        }
        if self.initial_capacity > 1 << 62 {
            return Err(format!(
                "initial_capacity {} is too large",
                self.initial_capacity
            ));
        }
        if self.nvram_size == Some(0) {
            return Err("nvram_size must be greater than 0".to_string());
        }
        if self.max_cached_pages == Some(0) {
            return Err("max_cached_pages must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Parse a configuration from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| IndexError::Format(format!("index config: {e}")))?;
        config.validate().map_err(IndexError::InvalidArgument)?;
        Ok(config)
    }

    /// Serialize the configuration as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| IndexError::Format(format!("index config: {e}")))
    }
}
