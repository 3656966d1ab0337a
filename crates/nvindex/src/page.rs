//! Bucket entries and the block-sized pages that hold them.
//!
//! Every entry is three little-endian `u64` fields:
//!
//! ```text
//! [0x00] key   (0 = unused, u64::MAX = tombstone)
//! [0x08] value (packed address, see `codec`)
//! [0x10] size
//! ```
//!
//! A page is one device block holding `block_size / 24` consecutive
//! entries. Bytes past the last whole entry are zero on disk.

use std::io::Cursor;

use binrw::{BinRead, BinReaderExt, BinWrite, BinWriterExt};

use crate::{IndexError, Result};

/// Size of a single entry in bytes.
pub const ENTRY_SIZE: usize = 24;

/// Key value marking a slot that was never used.
pub const UNUSED_KEY: u64 = 0;

/// Key value marking a removed entry. Probes continue past it.
pub const TOMBSTONE_KEY: u64 = u64::MAX;

/// Number of entries that fit in a page of `block_size` bytes.
pub const fn entries_per_page(block_size: usize) -> usize {
    block_size / ENTRY_SIZE
}

/// State of a bucket slot, derived from its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never occupied; terminates probe sequences.
    Unused,
    /// Previously occupied, now removed.
    Tombstone,
    /// Holds a live mapping.
    Real,
}

/// One bucket slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct Entry {
    /// Encoded key.
    pub key: u64,
    /// Encoded value.
    pub value: u64,
    /// Size descriptor stored alongside the value.
    pub size: u64,
}

impl Entry {
    /// Create a live entry.
    pub const fn new(key: u64, value: u64, size: u64) -> Self {
        Self { key, value, size }
    }

    /// The marker written over a removed entry.
    pub const fn tombstone() -> Self {
        Self {
            key: TOMBSTONE_KEY,
            value: 0,
            size: 0,
        }
    }

    /// Classify this slot.
    pub const fn state(&self) -> SlotState {
        match self.key {
            UNUSED_KEY => SlotState::Unused,
            TOMBSTONE_KEY => SlotState::Tombstone,
            _ => SlotState::Real,
        }
    }

    /// Whether this slot holds a live mapping.
    pub const fn is_real(&self) -> bool {
        matches!(self.state(), SlotState::Real)
    }
}

/// Whether `key` may be stored (it is neither of the sentinels).
pub const fn is_storable_key(key: u64) -> bool {
    key != UNUSED_KEY && key != TOMBSTONE_KEY
}

/// A fully materialized bucket page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    entries: Vec<Entry>,
    block_size: usize,
}

impl Page {
    /// A page of unused slots.
    pub fn zeroed(block_size: usize) -> Self {
        Self {
            entries: vec![Entry::default(); entries_per_page(block_size)],
            block_size,
        }
    }

    /// Decode a page from one device block.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let count = entries_per_page(data.len());
        if count == 0 {
            return Err(IndexError::Format(format!(
                "page buffer of {} bytes holds no entries",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(cursor.read_le::<Entry>()?);
        }

        Ok(Self {
            entries,
            block_size: data.len(),
        })
    }

    /// Encode this page as one device block.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.block_size);
        let mut cursor = Cursor::new(&mut data);
        for entry in &self.entries {
            cursor.write_le(entry)?;
        }
        data.resize(self.block_size, 0);
        Ok(data)
    }

    /// Read the entry at `idx`.
    pub fn entry(&self, idx: usize) -> Option<Entry> {
        self.entries.get(idx).copied()
    }

    /// Overwrite the entry at `idx`.
    pub fn set(&mut self, idx: usize, entry: Entry) -> Result<()> {
        let len = self.entries.len();
        let slot = self.entries.get_mut(idx).ok_or_else(|| {
            IndexError::InvalidArgument(format!(
                "entry index {idx} outside page of {len} entries"
            ))
        })?;
        *slot = entry;
        Ok(())
    }

    /// All slots in physical order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Device block size this page was built for.
    pub const fn block_size(&self) -> usize {
        self.block_size
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_states() {
        assert_eq!(Entry::default().state(), SlotState::Unused);
        assert_eq!(Entry::tombstone().state(), SlotState::Tombstone);
        assert_eq!(Entry::new(5, 1, 1).state(), SlotState::Real);
        assert!(!is_storable_key(UNUSED_KEY));
        assert!(!is_storable_key(TOMBSTONE_KEY));
        assert!(is_storable_key(1));
    }

    #[test]
    fn test_entry_wire_layout() {
        let mut page = Page::zeroed(64);
        page.set(1, Entry::new(0x0102, 0x0304, 0x0506))
            .expect("slot exists");

        let bytes = page.to_bytes().expect("encode");
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[..24], &[0u8; 24]);
        assert_eq!(&bytes[24..32], &0x0102u64.to_le_bytes());
        assert_eq!(&bytes[32..40], &0x0304u64.to_le_bytes());
        assert_eq!(&bytes[40..48], &0x0506u64.to_le_bytes());
        // 64 / 24 = 2 entries, 16 trailing bytes stay zero
        assert_eq!(&bytes[48..], &[0u8; 16]);

        let decoded = Page::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, page);
    }

    #[test]
    fn test_entries_per_page() {
        assert_eq!(entries_per_page(4096), 170);
        assert_eq!(Page::zeroed(4096).entries().len(), 170);
        assert_eq!(Page::zeroed(512).entries().len(), 21);
    }

    #[test]
    fn test_tiny_buffer_rejected() {
        assert!(matches!(
            Page::from_bytes(&[0u8; 16]),
            Err(IndexError::Format(_))
        ));
    }

    #[test]
    fn test_set_out_of_range() {
        let mut page = Page::zeroed(48);
        match page.set(2, Entry::new(1, 1, 1)) {
            Err(IndexError::InvalidArgument(msg)) => {
                assert!(msg.contains("page of 2 entries"), "{msg}");
            }
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
        assert_eq!(page.entry(2), None);
    }
}
