//! Persistent open-addressing hash index for block-addressed storage.
//!
//! A file system uses this crate to map a `(file id, logical block)` key to
//! a physical block address plus a packed size/contiguity descriptor. The
//! bucket array lives directly on the device, one device block per page of
//! 24-byte entries, and the table is rebuilt after a restart from a single
//! metadata block plus the bucket pages themselves.
//!
//! The layers, leaves first:
//!
//! - **Codec** ([`codec`]): packs and unpacks keys and values.
//! - **Device collaborators** ([`device`]): block I/O and block allocation
//!   traits, with memory, file and bitmap implementations.
//! - **Block bridge** ([`bridge`]): page index to block address translation.
//! - **Page cache** ([`cache`]): write-back cache of decoded pages with a
//!   FIFO dirty queue.
//! - **Hash index** ([`table`]): linear probing, tombstones, growth and the
//!   range/metadata locking discipline.
//! - **Checkpoint** ([`checkpoint`]): the persisted metadata record.
//!
//! # Example
//!
//! ```rust
//! use nvindex::device::{BitmapAllocator, MemoryDevice};
//! use nvindex::{HashIndex, IndexConfig, codec};
//!
//! # fn main() -> nvindex::Result<()> {
//! let device = MemoryDevice::new(4096, 1024);
//! let allocator = BitmapAllocator::with_reserved(1024, 1);
//! let index = HashIndex::open(device, allocator, IndexConfig::default())?;
//!
//! let key = codec::encode_key(7, 0);
//! index.insert(key, codec::encode_value(false, 0, 4242)?, 1)?;
//! assert_eq!(index.lookup(key)?, Some((4242, 1)));
//!
//! index.checkpoint()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use thiserror::Error;

// Key/value packing
pub mod codec;

// On-disk entry and page layout
pub mod page;

// Block device and allocator collaborators
pub mod device;

// Page index to block address translation
pub mod bridge;

// Write-back page cache
pub mod cache;

// Hash index core
pub mod table;

// Metadata record persistence
pub mod checkpoint;

// Configuration
pub mod config;

// Per-instance counters
pub mod stats;

pub use checkpoint::MetadataRecord;
pub use codec::BlockMapping;
pub use config::IndexConfig;
pub use page::{Entry, Page, SlotState};
pub use stats::IndexStats;
pub use table::HashIndex;

/// Result type for index operations.
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors that can occur during index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Device read or write failed. Never retried by the index.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The allocator could not supply the requested blocks.
    #[error("Out of space: {0}")]
    OutOfSpace(String),

    /// The persisted metadata record does not describe a usable table.
    #[error("Corrupt metadata: {0}")]
    CorruptMetadata(String),

    /// A caller passed a value outside the accepted range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A page or record buffer could not be decoded.
    #[error("Invalid format: {0}")]
    Format(String),
}

impl From<binrw::Error> for IndexError {
    fn from(err: binrw::Error) -> Self {
        match err {
            binrw::Error::Io(io) => Self::Io(io),
            other => Self::Format(other.to_string()),
        }
    }
}

/// Version information for the index crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
