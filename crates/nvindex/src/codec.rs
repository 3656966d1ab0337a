//! Key and value packing for block mappings.
//!
//! Keys combine a 32-bit file identifier with a 32-bit logical block:
//!
//! ```text
//! key = (file_id << 32) | logical_block
//! ```
//!
//! Values pack a physical address with a contiguity descriptor:
//!
//! | Bits  | Field |
//! |-------|-------|
//! | 63    | special flag (member of a contiguous run) |
//! | 59-62 | contiguity index (0..=15) |
//! | 0-58  | physical block address |

use crate::{IndexError, Result};

/// Width of the contiguity index field.
pub const CONTINUITY_BITS: u32 = 4;

/// Logical blocks one bucket group can describe through contiguity indices.
pub const MAX_CONTIGUOUS_BLOCKS: u32 = 2 << CONTINUITY_BITS;

/// Width of the physical address field.
pub const ADDR_BITS: u32 = u64::BITS - CONTINUITY_BITS - 1;

/// Mask selecting the physical address bits of a value.
pub const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;

/// Largest contiguity index a value can carry.
pub const MAX_CONTIG_IDX: u8 = (1 << CONTINUITY_BITS) - 1;

/// Logical blocks covered by one chunk key (see [`encode_range_key`]).
pub const CHUNK_BLOCKS: u32 = 1 << 9;

const SPECIAL_BIT: u64 = 1 << 63;
const LOW_32: u64 = (1 << 32) - 1;

/// Build a key from a file identifier and a logical block number.
pub const fn encode_key(file_id: u32, lblk: u32) -> u64 {
    ((file_id as u64) << 32) | lblk as u64
}

/// Split a key into `(file_id, logical_block)`.
pub const fn decode_key(key: u64) -> (u32, u32) {
    ((key >> 32) as u32, (key & LOW_32) as u32)
}

/// Build a chunk key: the logical block is aligned down to a
/// [`CHUNK_BLOCKS`] boundary so every block of a chunk shares one key.
pub const fn encode_range_key(file_id: u32, lblk: u32) -> u64 {
    encode_key(file_id, lblk & !(CHUNK_BLOCKS - 1))
}

/// Pack a value.
///
/// # Errors
///
/// Returns `InvalidArgument` if `contig_idx` does not fit in
/// [`CONTINUITY_BITS`] or `addr` does not fit in [`ADDR_BITS`].
pub fn encode_value(is_special: bool, contig_idx: u8, addr: u64) -> Result<u64> {
    if contig_idx > MAX_CONTIG_IDX {
        return Err(IndexError::InvalidArgument(format!(
            "contiguity index {contig_idx} exceeds {MAX_CONTIG_IDX}"
        )));
    }
    if addr > ADDR_MASK {
        return Err(IndexError::InvalidArgument(format!(
            "physical address {addr:#x} exceeds {ADDR_BITS} bits"
        )));
    }

    let special = if is_special { SPECIAL_BIT } else { 0 };
    Ok(special | (u64::from(contig_idx) << ADDR_BITS) | addr)
}

/// Unpack a value into `(is_special, contig_idx, addr)`.
pub const fn decode_value(value: u64) -> (bool, u8, u64) {
    let special = value & SPECIAL_BIT != 0;
    let contig_idx = ((value >> ADDR_BITS) & MAX_CONTIG_IDX as u64) as u8;
    (special, contig_idx, value & ADDR_MASK)
}

/// Structured form of a packed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockMapping {
    /// Entry describes a member of a contiguous run.
    pub special: bool,
    /// Which sub-range of the run this entry refers to.
    pub contig_idx: u8,
    /// Physical block address.
    pub addr: u64,
}

impl BlockMapping {
    /// Mapping for a bare single block.
    pub const fn single(addr: u64) -> Self {
        Self {
            special: false,
            contig_idx: 0,
            addr,
        }
    }

    /// Mapping for sub-range `contig_idx` of a contiguous run.
    pub const fn run_member(contig_idx: u8, addr: u64) -> Self {
        Self {
            special: true,
            contig_idx,
            addr,
        }
    }

    /// Pack into the on-disk value representation.
    pub fn encode(self) -> Result<u64> {
        encode_value(self.special, self.contig_idx, self.addr)
    }

    /// Unpack from the on-disk value representation.
    pub const fn decode(value: u64) -> Self {
        let (special, contig_idx, addr) = decode_value(value);
        Self {
            special,
            contig_idx,
            addr,
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_key_layout() {
        let key = encode_key(0x1234, 0xABCD);
        assert_eq!(key, 0x0000_1234_0000_ABCD);
        assert_eq!(decode_key(key), (0x1234, 0xABCD));
        assert_eq!(decode_key(encode_key(u32::MAX, u32::MAX)), (u32::MAX, u32::MAX));
    }

    #[test]
    fn test_range_key_aligns_to_chunk() {
        assert_eq!(encode_range_key(3, 0), encode_key(3, 0));
        assert_eq!(encode_range_key(3, 511), encode_key(3, 0));
        assert_eq!(encode_range_key(3, 512), encode_key(3, 512));
        assert_eq!(encode_range_key(3, 1000), encode_key(3, 512));
    }

    #[test]
    fn test_value_layout() {
        let value = encode_value(true, 5, 0x1000).expect("in range");
        assert_eq!(value >> 63, 1);
        assert_eq!((value >> ADDR_BITS) & 0xF, 5);
        assert_eq!(value & ADDR_MASK, 0x1000);
        assert_eq!(decode_value(value), (true, 5, 0x1000));

        let plain = encode_value(false, 0, 42).expect("in range");
        assert_eq!(plain, 42);
    }

    #[test]
    fn test_value_bounds_rejected() {
        assert!(matches!(
            encode_value(false, 16, 1),
            Err(IndexError::InvalidArgument(_))
        ));
        assert!(matches!(
            encode_value(false, 0, ADDR_MASK + 1),
            Err(IndexError::InvalidArgument(_))
        ));
        assert!(encode_value(true, MAX_CONTIG_IDX, ADDR_MASK).is_ok());
    }

    #[test]
    fn test_constants() {
        assert_eq!(ADDR_BITS, 59);
        assert_eq!(MAX_CONTIGUOUS_BLOCKS, 32);
        assert_eq!(MAX_CONTIG_IDX, 15);
    }

    #[test]
    fn test_block_mapping() {
        let mapping = BlockMapping::run_member(3, 900);
        let value = mapping.encode().expect("in range");
        assert_eq!(BlockMapping::decode(value), mapping);
        assert_eq!(BlockMapping::decode(900), BlockMapping::single(900));
    }

    proptest! {
        #[test]
        fn value_fields_survive_packing(
            special in any::<bool>(),
            idx in 0u8..=MAX_CONTIG_IDX,
            addr in 0u64..=ADDR_MASK,
        ) {
            let value = encode_value(special, idx, addr).expect("in range");
            prop_assert_eq!(decode_value(value), (special, idx, addr));
        }
    }
}
