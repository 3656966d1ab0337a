//! File block mapping helpers.
//!
//! Typed wrappers over the raw key/value operations for callers that map
//! `(file id, logical block)` to a [`BlockMapping`].

use super::HashIndex;
use crate::Result;
use crate::codec::{BlockMapping, encode_key};

impl HashIndex {
    /// Map logical block `lblk` of `file_id` to `mapping`.
    ///
    /// File 0 block 0 encodes to the unused-slot key and is rejected.
    pub fn insert_mapping(
        &self,
        file_id: u32,
        lblk: u32,
        mapping: BlockMapping,
        size: u64,
    ) -> Result<bool> {
        self.insert(encode_key(file_id, lblk), mapping.encode()?, size)
    }

    /// Mapping and size stored for logical block `lblk` of `file_id`.
    pub fn lookup_mapping(&self, file_id: u32, lblk: u32) -> Result<Option<(BlockMapping, u64)>> {
        Ok(self
            .lookup(encode_key(file_id, lblk))?
            .map(|(value, size)| (BlockMapping::decode(value), size)))
    }

    /// Drop the mapping for logical block `lblk` of `file_id`.
    pub fn remove_mapping(&self, file_id: u32, lblk: u32) -> Result<bool> {
        self.remove(encode_key(file_id, lblk))
    }
}
