//! Slot geometry and linear probing over locked page ranges.

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::cache::{PageCache, RangePages};
use crate::page::{Entry, SlotState};
use crate::{IndexError, Result};

/// 64-bit finalizer of murmur3; spreads sequential keys across buckets.
pub const fn hash_key(key: u64) -> u64 {
    let mut h = key;
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Slot layout of one table size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Slot count, a power of two.
    pub size: u64,
    /// `size - 1`.
    pub mask: u64,
    /// `log2(size)`.
    pub shift: u32,
    /// Entries held by one page.
    pub entries_per_page: u64,
}

impl Geometry {
    /// Layout for `size` slots in pages of `entries_per_page` entries.
    pub fn new(size: u64, entries_per_page: u64) -> Result<Self> {
        if !size.is_power_of_two() {
            return Err(IndexError::InvalidArgument(format!(
                "slot count {size} is not a power of two"
            )));
        }
        if entries_per_page == 0 {
            return Err(IndexError::InvalidArgument(
                "pages hold no entries".to_string(),
            ));
        }
        Ok(Self {
            size,
            mask: size - 1,
            shift: size.trailing_zeros(),
            entries_per_page,
        })
    }

    /// Pages needed to hold every slot.
    pub const fn pages(&self) -> u64 {
        self.size.div_ceil(self.entries_per_page)
    }

    /// Home bucket of `key`.
    pub const fn bucket(&self, key: u64) -> u64 {
        hash_key(key) & self.mask
    }

    /// `(page, index within page)` of `slot`.
    pub const fn locate(&self, slot: u64) -> (u64, usize) {
        (
            slot / self.entries_per_page,
            (slot % self.entries_per_page) as usize,
        )
    }

    /// Slot following `slot`, wrapping at `size`.
    pub const fn next(&self, slot: u64) -> u64 {
        (slot + 1) & self.mask
    }
}

/// Lock mode a probe takes on the ranges it walks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read-only probe (lookup, contains).
    Shared,
    /// Mutating probe (insert, remove).
    Exclusive,
}

/// Why a probe had to stop before reaching an answer.
#[derive(Debug)]
pub enum ProbeError {
    /// The probe wrapped past the last slot into a range that precedes one
    /// already held. Retry with the metadata lock held exclusively.
    Wrapped,
    /// A shared probe reached a page that is not resident yet.
    Fault(u64),
    /// Device or argument failure.
    Index(IndexError),
}

impl From<IndexError> for ProbeError {
    fn from(err: IndexError) -> Self {
        Self::Index(err)
    }
}

impl From<ProbeError> for IndexError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::Index(err) => err,
            ProbeError::Wrapped => {
                Self::InvalidArgument("probe wrapped while holding every range".to_string())
            }
            ProbeError::Fault(page) => {
                Self::InvalidArgument(format!("page {page} missing under an exclusive probe"))
            }
        }
    }
}

enum Held<'a> {
    Read(RwLockReadGuard<'a, RangePages>),
    Write(RwLockWriteGuard<'a, RangePages>),
}

/// Range locks held by one probe.
///
/// In ordered mode ranges may only be taken in ascending order; asking for a
/// lower range than the last one held fails with [`ProbeError::Wrapped`].
/// Unordered mode is only used while the metadata lock is held
/// exclusively, when no other thread can hold a range lock.
pub struct RangeGuards<'a> {
    cache: &'a PageCache,
    access: Access,
    ordered: bool,
    held: Vec<(usize, Held<'a>)>,
}

impl<'a> RangeGuards<'a> {
    /// Start a probe over `cache`.
    pub const fn new(cache: &'a PageCache, access: Access, ordered: bool) -> Self {
        Self {
            cache,
            access,
            ordered,
            held: Vec::new(),
        }
    }

    fn acquire(&mut self, range: usize) -> std::result::Result<usize, ProbeError> {
        if let Some(pos) = self.held.iter().position(|(r, _)| *r == range) {
            return Ok(pos);
        }
        if self.ordered && self.held.last().is_some_and(|(last, _)| *last > range) {
            return Err(ProbeError::Wrapped);
        }

        let guard = match self.access {
            Access::Shared => Held::Read(self.cache.read_range(range)),
            Access::Exclusive => Held::Write(self.cache.write_range(range)),
        };
        self.held.push((range, guard));
        Ok(self.held.len() - 1)
    }

    /// Entry `idx` of `page`.
    pub fn entry(&mut self, page: u64, idx: usize) -> std::result::Result<Entry, ProbeError> {
        let pos = self.acquire(self.cache.range_of(page))?;
        let cache = self.cache;
        let buffer = match &mut self.held[pos].1 {
            Held::Read(pages) => cache
                .get_resident(pages, page)
                .ok_or(ProbeError::Fault(page))?,
            Held::Write(pages) => &*cache.get_or_load(pages, page)?,
        };
        buffer.entry(idx).ok_or_else(|| {
            ProbeError::Index(IndexError::InvalidArgument(format!(
                "entry {idx} beyond page {page}"
            )))
        })
    }

    /// Overwrite entry `idx` of `page` and queue the page for write-back.
    pub fn set(&mut self, page: u64, idx: usize, entry: Entry) -> std::result::Result<(), ProbeError> {
        let pos = self.acquire(self.cache.range_of(page))?;
        let cache = self.cache;
        match &mut self.held[pos].1 {
            Held::Write(pages) => cache.get_or_load(pages, page)?.set(idx, entry)?,
            Held::Read(_) => {
                return Err(ProbeError::Index(IndexError::InvalidArgument(
                    "mutation under a shared probe".to_string(),
                )));
            }
        }
        cache.mark_dirty(page);
        Ok(())
    }
}

/// Where the probe chain of a key ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The key is live at `slot`.
    Found {
        /// Slot holding the key.
        slot: u64,
        /// Its current contents.
        entry: Entry,
    },
    /// The key is absent; `slot` is where an insert would put it.
    Vacant {
        /// First reusable slot on the chain.
        slot: u64,
        /// Whether that slot is a tombstone.
        tombstone: bool,
    },
    /// The key is absent and every slot holds a live entry.
    Full,
}

/// Walk the probe chain of `key` from its home bucket.
///
/// Tombstones do not end the walk, so a key stored past a removed entry is
/// still found. The first tombstone seen is remembered as the insert slot.
pub fn find_slot(
    guards: &mut RangeGuards<'_>,
    geometry: &Geometry,
    key: u64,
) -> std::result::Result<Probe, ProbeError> {
    let mut slot = geometry.bucket(key);
    let mut first_tombstone = None;

    for _ in 0..geometry.size {
        let (page, idx) = geometry.locate(slot);
        let entry = guards.entry(page, idx)?;
        match entry.state() {
            SlotState::Unused => {
                return Ok(match first_tombstone {
                    Some(tomb) => Probe::Vacant {
                        slot: tomb,
                        tombstone: true,
                    },
                    None => Probe::Vacant {
                        slot,
                        tombstone: false,
                    },
                });
            }
            SlotState::Tombstone => {
                first_tombstone.get_or_insert(slot);
            }
            SlotState::Real if entry.key == key => return Ok(Probe::Found { slot, entry }),
            SlotState::Real => {}
        }
        slot = geometry.next(slot);
    }

    Ok(first_tombstone.map_or(Probe::Full, |tomb| Probe::Vacant {
        slot: tomb,
        tombstone: true,
    }))
}

/// Write `entry` into `slot`.
pub fn store(
    guards: &mut RangeGuards<'_>,
    geometry: &Geometry,
    slot: u64,
    entry: Entry,
) -> std::result::Result<(), ProbeError> {
    let (page, idx) = geometry.locate(slot);
    guards.set(page, idx, entry)
}
