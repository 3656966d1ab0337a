//! Persistent hash index.
//!
//! Open addressing with linear probing over a power-of-two slot array that
//! is split into block-sized pages. Removed entries leave tombstones so
//! probe chains that ran through them stay intact; tombstones are dropped
//! when the table grows.
//!
//! # Locking
//!
//! A metadata lock guards the table geometry and the page cache that goes
//! with it. Point operations hold it shared and lock the page ranges they
//! probe, always in ascending order. A probe that wraps from the last slot
//! back to slot 0 gives up its range locks and runs again with the metadata
//! lock held exclusively. Growth, clearing and metadata checkpoints hold it
//! exclusively, which stops every other operation.

mod grow;
mod mapping;
mod probe;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::info;

use crate::bridge::{BlockBridge, Region};
use crate::cache::PageCache;
use crate::checkpoint::{self, MetadataRecord};
use crate::config::IndexConfig;
use crate::device::{BlockAllocator, BlockDevice};
use crate::page::{Entry, is_storable_key};
use crate::stats::IndexStats;
use crate::{IndexError, Result};

pub use probe::{Geometry, hash_key};
use probe::{Access, Probe, ProbeError, RangeGuards, find_slot, store};

/// At most three quarters of the slots may be occupied.
const LOAD_NUMERATOR: u64 = 3;
const LOAD_DENOMINATOR: u64 = 4;

const fn within_load_factor(occupied: u64, size: u64) -> bool {
    occupied * LOAD_DENOMINATOR <= size * LOAD_NUMERATOR
}

/// Outcome of one insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Insert {
    Created,
    Updated,
    /// The key needs an unused slot and taking one would break the load
    /// factor. Nothing was written.
    NeedsGrowth,
}

/// State replaced as a whole when the table grows.
#[derive(Debug)]
struct TableState {
    geometry: Geometry,
    nnodes: AtomicU64,
    noccupied: AtomicU64,
    cache: PageCache,
}

impl TableState {
    fn new(geometry: Geometry, nnodes: u64, noccupied: u64, cache: PageCache) -> Self {
        Self {
            geometry,
            nnodes: AtomicU64::new(nnodes),
            noccupied: AtomicU64::new(noccupied),
            cache,
        }
    }

    fn nnodes(&self) -> u64 {
        self.nnodes.load(Ordering::Acquire)
    }

    fn noccupied(&self) -> u64 {
        self.noccupied.load(Ordering::Acquire)
    }

    fn has_room(&self) -> bool {
        within_load_factor(self.noccupied() + 1, self.geometry.size)
    }

    /// Claim one unused slot in `noccupied`, unless that would break the
    /// load factor.
    fn reserve_unused(&self) -> bool {
        let size = self.geometry.size;
        self.noccupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |occupied| {
                within_load_factor(occupied + 1, size).then_some(occupied + 1)
            })
            .is_ok()
    }

    fn record(&self, nvram_size: u64, range_size: u64) -> MetadataRecord {
        MetadataRecord {
            size: self.geometry.size,
            mod_shift: u64::from(self.geometry.shift),
            mask: self.geometry.mask,
            nnodes: self.nnodes(),
            noccupied: self.noccupied(),
            nvram_size,
            range_size,
            data_start: self.cache.region().start,
        }
    }
}

/// Hash index whose bucket array lives on a block device.
#[derive(Debug)]
pub struct HashIndex {
    config: IndexConfig,
    nvram_size: u64,
    bridge: Arc<BlockBridge>,
    state: RwLock<TableState>,
}

impl HashIndex {
    /// Open the table described by the metadata record at
    /// `config.metadata_location`, creating it if the record is empty.
    ///
    /// Creation allocates and zeroes the initial bucket region and writes
    /// the first metadata record. Reopening trusts the bucket pages on the
    /// device to match the recorded counters; pages are read lazily.
    pub fn open<D, A>(device: D, allocator: A, config: IndexConfig) -> Result<Self>
    where
        D: BlockDevice + 'static,
        A: BlockAllocator + 'static,
    {
        config.validate().map_err(IndexError::InvalidArgument)?;
        if device.block_size() != config.block_size {
            return Err(IndexError::InvalidArgument(format!(
                "device block size {} does not match configured {}",
                device.block_size(),
                config.block_size
            )));
        }

        let nvram_size = config.nvram_size.unwrap_or_else(|| device.block_count());
        if nvram_size > device.block_count() {
            return Err(IndexError::InvalidArgument(format!(
                "nvram_size {nvram_size} exceeds device of {} blocks",
                device.block_count()
            )));
        }

        let bridge = Arc::new(BlockBridge::new(Arc::new(device), Arc::new(allocator)));
        let entries_per_page = bridge.entries_per_page() as u64;
        let location = config.metadata_location;

        let state = match checkpoint::read_metadata(&bridge, location)? {
            Some(record) => {
                record.check_geometry(nvram_size, config.range_size)?;
                let geometry = Geometry::new(record.size, entries_per_page)?;
                let region = Region::new(record.data_start, geometry.pages());
                if region.start + region.pages > nvram_size {
                    return Err(IndexError::CorruptMetadata(format!(
                        "bucket region {}+{} beyond device of {nvram_size} blocks",
                        region.start, region.pages
                    )));
                }

                // A fresh allocator must not hand out blocks the table uses.
                bridge.mark_allocated(location, 1)?;
                bridge.mark_allocated(region.start, region.pages)?;

                info!(
                    "Opened hash index at block {}: {} slots, {} entries, data at block {}",
                    location, geometry.size, record.nnodes, region.start
                );
                let cache = PageCache::new(
                    bridge.clone(),
                    region,
                    config.range_size,
                    config.max_cached_pages,
                );
                TableState::new(geometry, record.nnodes, record.noccupied, cache)
            }
            None => {
                bridge.mark_allocated(location, 1)?;
                let geometry = Geometry::new(config.initial_slots(), entries_per_page)?;
                let region = bridge.allocate_pages(geometry.pages())?;
                let cache = PageCache::zeroed(
                    bridge.clone(),
                    region,
                    config.range_size,
                    config.max_cached_pages,
                );
                let state = TableState::new(geometry, 0, 0, cache);

                state.cache.flush()?;
                checkpoint::write_metadata(
                    &bridge,
                    location,
                    &state.record(nvram_size, config.range_size),
                )?;
                info!(
                    "Created hash index at block {}: {} slots in {} pages at block {}",
                    location,
                    geometry.size,
                    region.pages,
                    region.start
                );
                state
            }
        };

        Ok(Self {
            config,
            nvram_size,
            bridge,
            state: RwLock::new(state),
        })
    }

    /// Run a probe under the shared metadata lock, falling back to the
    /// exclusive lock when it wraps.
    fn run<T, F>(&self, access: Access, op: F) -> Result<T>
    where
        F: Fn(&TableState, &mut RangeGuards<'_>) -> std::result::Result<T, ProbeError>,
    {
        {
            let state = self.state.read();
            loop {
                let mut guards = RangeGuards::new(&state.cache, access, true);
                match op(&state, &mut guards) {
                    Ok(value) => return Ok(value),
                    Err(ProbeError::Index(err)) => return Err(err),
                    Err(ProbeError::Fault(page)) => {
                        drop(guards);
                        state.cache.fault_in(page)?;
                    }
                    Err(ProbeError::Wrapped) => break,
                }
            }
        }

        let state = self.state.write();
        let mut guards = RangeGuards::new(&state.cache, Access::Exclusive, false);
        op(&state, &mut guards).map_err(IndexError::from)
    }

    /// Insert or update `key`.
    ///
    /// Returns `true` when a new entry was created and `false` when an
    /// existing one was overwritten. When taking an unused slot would push
    /// the table past three quarters occupied, it grows first. If the
    /// allocator cannot supply the larger region, `OutOfSpace` is returned
    /// and the table is left unchanged.
    pub fn insert(&self, key: u64, value: u64, size: u64) -> Result<bool> {
        if !is_storable_key(key) {
            return Err(IndexError::InvalidArgument(format!(
                "key {key:#x} is reserved"
            )));
        }

        loop {
            let outcome = self.run(Access::Exclusive, |state, guards| {
                let geometry = &state.geometry;
                let entry = Entry::new(key, value, size);
                match find_slot(guards, geometry, key)? {
                    Probe::Found { slot, .. } => {
                        store(guards, geometry, slot, entry)?;
                        Ok(Insert::Updated)
                    }
                    Probe::Vacant {
                        slot,
                        tombstone: true,
                    } => {
                        store(guards, geometry, slot, entry)?;
                        state.nnodes.fetch_add(1, Ordering::AcqRel);
                        Ok(Insert::Created)
                    }
                    Probe::Vacant {
                        slot,
                        tombstone: false,
                    } => {
                        if !state.reserve_unused() {
                            return Ok(Insert::NeedsGrowth);
                        }
                        if let Err(err) = store(guards, geometry, slot, entry) {
                            state.noccupied.fetch_sub(1, Ordering::AcqRel);
                            return Err(err);
                        }
                        state.nnodes.fetch_add(1, Ordering::AcqRel);
                        Ok(Insert::Created)
                    }
                    Probe::Full => Err(IndexError::OutOfSpace(format!(
                        "all {} slots hold live entries",
                        geometry.size
                    ))
                    .into()),
                }
            })?;

            match outcome {
                Insert::Created => return Ok(true),
                Insert::Updated => return Ok(false),
                Insert::NeedsGrowth => self.grow_for_insert()?,
            }
        }
    }

    /// Value and size stored for `key`.
    pub fn lookup(&self, key: u64) -> Result<Option<(u64, u64)>> {
        if !is_storable_key(key) {
            return Ok(None);
        }
        self.run(Access::Shared, |state, guards| {
            Ok(match find_slot(guards, &state.geometry, key)? {
                Probe::Found { entry, .. } => Some((entry.value, entry.size)),
                Probe::Vacant { .. } | Probe::Full => None,
            })
        })
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: u64) -> Result<bool> {
        Ok(self.lookup(key)?.is_some())
    }

    /// Remove `key`, leaving a tombstone. Returns whether it was present.
    pub fn remove(&self, key: u64) -> Result<bool> {
        if !is_storable_key(key) {
            return Ok(false);
        }
        self.run(Access::Exclusive, |state, guards| {
            match find_slot(guards, &state.geometry, key)? {
                Probe::Found { slot, .. } => {
                    store(guards, &state.geometry, slot, Entry::tombstone())?;
                    state.nnodes.fetch_sub(1, Ordering::AcqRel);
                    Ok(true)
                }
                Probe::Vacant { .. } | Probe::Full => Ok(false),
            }
        })
    }

    /// Visit every live entry in slot order until the visitor breaks.
    ///
    /// Each range is held shared while its entries are visited, so the
    /// visitor must not call back into this index.
    pub fn foreach<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(&Entry) -> ControlFlow<()>,
    {
        let state = self.state.read();
        let geometry = state.geometry;

        for range in 0..state.cache.range_count() {
            let pages = state.cache.load_range(range)?;
            for (page_index, page) in pages.iter() {
                let first_slot = page_index * geometry.entries_per_page;
                let in_table = geometry.size.saturating_sub(first_slot) as usize;
                let live = page
                    .entries()
                    .iter()
                    .take(in_table)
                    .filter(|entry| entry.is_real());
                for entry in live {
                    if visitor(entry).is_break() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// First live entry, in slot order, matching `predicate`.
    pub fn find<P>(&self, mut predicate: P) -> Result<Option<Entry>>
    where
        P: FnMut(&Entry) -> bool,
    {
        let mut found = None;
        self.foreach(|entry| {
            if predicate(entry) {
                found = Some(*entry);
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok(found)
    }

    /// Every live key, in slot order.
    pub fn keys(&self) -> Result<Vec<u64>> {
        let mut keys = Vec::with_capacity(self.len() as usize);
        self.foreach(|entry| {
            keys.push(entry.key);
            ControlFlow::Continue(())
        })?;
        Ok(keys)
    }

    /// Number of live entries.
    pub fn len(&self) -> u64 {
        self.state.read().nnodes()
    }

    /// Whether the table holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot count.
    pub fn capacity(&self) -> u64 {
        self.state.read().geometry.size
    }

    /// Occupied slots (tombstones included) over slot count.
    pub fn load_factor(&self) -> f64 {
        let state = self.state.read();
        state.noccupied() as f64 / state.geometry.size as f64
    }

    /// Write every dirty page back to the device. Returns the number of
    /// pages written.
    pub fn flush(&self) -> Result<usize> {
        self.state.read().cache.flush()
    }

    /// Flush, then persist the scalar state at `location`.
    ///
    /// The record is written only after every bucket page it describes has
    /// reached the device.
    pub fn write_metadata(&self, location: u64) -> Result<()> {
        let state = self.state.write();
        state.cache.flush()?;
        let record = state.record(self.nvram_size, self.config.range_size);
        checkpoint::write_metadata(&self.bridge, location, &record)
    }

    /// Flush and persist the scalar state at the configured location.
    pub fn checkpoint(&self) -> Result<()> {
        self.write_metadata(self.config.metadata_location)
    }

    /// Re-read bucket page `page` from the device.
    ///
    /// For reconciling with another writer of the same device. The
    /// in-memory counters are not adjusted. Fails if the page has
    /// unflushed changes.
    pub fn refresh_page(&self, page: u64) -> Result<()> {
        self.state.read().cache.refresh(page)
    }

    /// Counters and geometry.
    pub fn stats(&self) -> IndexStats {
        let state = self.state.read();
        let io = self.bridge.stats();
        let region = state.cache.region();
        IndexStats {
            size: state.geometry.size,
            nnodes: state.nnodes(),
            noccupied: state.noccupied(),
            region_pages: region.pages,
            data_start: region.start,
            cached_pages: state.cache.resident_pages(),
            dirty_pages: state.cache.dirty_count() as u64,
            page_reads: io.page_reads(),
            page_writes: io.page_writes(),
            blocks_allocated: io.blocks_allocated(),
            metadata_writes: io.metadata_writes(),
            cache_hits: io.cache_hits(),
            cache_misses: io.cache_misses(),
        }
    }

    /// Configuration the index was opened with.
    pub const fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Grow unless another insert already made room.
    fn grow_for_insert(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.has_room() {
            return Ok(());
        }
        grow::grow(&self.bridge, &self.config, &mut state)
    }

    /// Drop every entry, keeping the current size and region. The zeroed
    /// pages reach the device at the next flush.
    pub fn clear(&self) {
        let mut state = self.state.write();
        grow::clear(&self.bridge, &self.config, &mut state);
    }
}
