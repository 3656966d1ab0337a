//! Write-back cache of bucket pages.
//!
//! Pages are faulted in on first touch and then stay resident for the life
//! of the cache; there is no eviction. Mutated pages are queued in a FIFO
//! [`DirtyQueue`] and written back by [`PageCache::flush`] in the order they
//! first became dirty, so repeated updates to one page cost one device
//! write per flush.
//!
//! Pages are grouped into ranges of `range_size` pages. Each range sits
//! behind its own read-write lock and owns the buffers of its pages. The
//! lock order is range lock, then the dirty-queue mutex.

mod dirty;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::bridge::{BlockBridge, Region};
use crate::page::Page;
use crate::{IndexError, Result};

pub use dirty::DirtyQueue;

/// Buffers for one lock range. `None` means the page is not materialized.
#[derive(Debug)]
pub struct RangePages {
    first_page: u64,
    pages: Vec<Option<Page>>,
}

impl RangePages {
    fn slot(&self, page: u64) -> Option<usize> {
        page.checked_sub(self.first_page)
            .map(|offset| offset as usize)
            .filter(|&offset| offset < self.pages.len())
    }

    /// First page index covered by this range.
    pub const fn first_page(&self) -> u64 {
        self.first_page
    }

    /// Number of pages covered by this range.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether the range covers no pages.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Whether `page` is resident.
    pub fn is_materialized(&self, page: u64) -> bool {
        self.get(page).is_some()
    }

    /// Whether every page of the range is resident.
    pub fn is_fully_materialized(&self) -> bool {
        self.pages.iter().all(Option::is_some)
    }

    /// The resident buffer for `page`.
    pub fn get(&self, page: u64) -> Option<&Page> {
        self.slot(page).and_then(|slot| self.pages[slot].as_ref())
    }

    /// The resident buffer for `page`, mutably.
    pub fn get_mut(&mut self, page: u64) -> Option<&mut Page> {
        self.slot(page).and_then(|slot| self.pages[slot].as_mut())
    }

    /// Resident pages in address order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Page)> + '_ {
        self.pages
            .iter()
            .enumerate()
            .filter_map(|(offset, page)| page.as_ref().map(|p| (self.first_page + offset as u64, p)))
    }
}

/// Page cache over one bucket region.
#[derive(Debug)]
pub struct PageCache {
    bridge: Arc<BlockBridge>,
    region: Region,
    range_size: u64,
    ranges: Vec<RwLock<RangePages>>,
    dirty: Mutex<DirtyQueue>,
    resident: AtomicU64,
    max_cached_pages: Option<u64>,
    over_budget: AtomicBool,
}

impl PageCache {
    /// Cache over `region` with nothing resident; pages load on demand.
    pub fn new(
        bridge: Arc<BlockBridge>,
        region: Region,
        range_size: u64,
        max_cached_pages: Option<u64>,
    ) -> Self {
        Self::build(bridge, region, range_size, max_cached_pages)
    }

    /// Cache over a freshly allocated `region`: every page is resident,
    /// zero-filled and queued for write-back.
    pub fn zeroed(
        bridge: Arc<BlockBridge>,
        region: Region,
        range_size: u64,
        max_cached_pages: Option<u64>,
    ) -> Self {
        let pages = vec![Page::zeroed(bridge.block_size()); region.pages as usize];
        Self::with_pages(bridge, region, range_size, max_cached_pages, pages)
    }

    /// Cache over `region` seeded with the contents of every page. All pages
    /// are queued for write-back in address order.
    pub fn with_pages(
        bridge: Arc<BlockBridge>,
        region: Region,
        range_size: u64,
        max_cached_pages: Option<u64>,
        pages: Vec<Page>,
    ) -> Self {
        let mut cache = Self::build(bridge, region, range_size, max_cached_pages);
        let mut dirty = DirtyQueue::new();
        let mut resident = 0;
        for (index, page) in (0..region.pages).zip(pages) {
            let range = cache.range_of(index);
            let held = cache.ranges[range].get_mut();
            if let Some(slot) = held.slot(index) {
                held.pages[slot] = Some(page);
                dirty.push(index);
                resident += 1;
            }
        }
        *cache.dirty.get_mut() = dirty;
        cache.note_resident(resident);
        cache
    }

    fn build(
        bridge: Arc<BlockBridge>,
        region: Region,
        range_size: u64,
        max_cached_pages: Option<u64>,
    ) -> Self {
        let range_size = range_size.max(1);

        let mut ranges = Vec::with_capacity(region.pages.div_ceil(range_size) as usize);
        let mut first_page = 0;
        while first_page < region.pages {
            let count = range_size.min(region.pages - first_page) as usize;
            ranges.push(RwLock::new(RangePages {
                first_page,
                pages: vec![None; count],
            }));
            first_page += range_size;
        }

        Self {
            bridge,
            region,
            range_size,
            ranges,
            dirty: Mutex::new(DirtyQueue::new()),
            resident: AtomicU64::new(0),
            max_cached_pages,
            over_budget: AtomicBool::new(false),
        }
    }

    /// The bucket region this cache covers.
    pub const fn region(&self) -> Region {
        self.region
    }

    /// Number of lock ranges.
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Lock range holding `page`.
    pub const fn range_of(&self, page: u64) -> usize {
        (page / self.range_size) as usize
    }

    /// Take range `range` shared.
    pub fn read_range(&self, range: usize) -> RwLockReadGuard<'_, RangePages> {
        self.ranges[range].read()
    }

    /// Take range `range` exclusively.
    pub fn write_range(&self, range: usize) -> RwLockWriteGuard<'_, RangePages> {
        self.ranges[range].write()
    }

    /// Return the buffer for `page`, reading it from the device if it is
    /// not resident yet. `pages` must be the guarded range holding `page`.
    ///
    /// A resident page is never re-read.
    pub fn get_or_load<'g>(&self, pages: &'g mut RangePages, page: u64) -> Result<&'g mut Page> {
        let slot = pages.slot(page).ok_or_else(|| {
            IndexError::InvalidArgument(format!(
                "page {page} is not in the range starting at page {}",
                pages.first_page
            ))
        })?;

        let cached = &mut pages.pages[slot];
        let buffer = match cached.take() {
            Some(buffer) => {
                self.bridge.stats().record_cache_hit();
                buffer
            }
            None => {
                let buffer = self.bridge.read_page(self.region, page)?;
                self.bridge.stats().record_cache_miss();
                self.note_resident(1);
                buffer
            }
        };
        Ok(cached.insert(buffer))
    }

    /// The resident buffer for `page` in a range held shared, or `None` if
    /// the page still has to be faulted in.
    pub fn get_resident<'g>(&self, pages: &'g RangePages, page: u64) -> Option<&'g Page> {
        let buffer = pages.get(page);
        if buffer.is_some() {
            self.bridge.stats().record_cache_hit();
        }
        buffer
    }

    /// Make `page` resident, taking its range exclusively for the load.
    pub fn fault_in(&self, page: u64) -> Result<()> {
        self.region.block_of(page)?;
        let mut pages = self.write_range(self.range_of(page));
        if !pages.is_materialized(page) {
            self.get_or_load(&mut pages, page)?;
        }
        Ok(())
    }

    /// Take range `range` shared with every one of its pages resident.
    pub fn load_range(&self, range: usize) -> Result<RwLockReadGuard<'_, RangePages>> {
        {
            let pages = self.read_range(range);
            if pages.is_fully_materialized() {
                return Ok(pages);
            }
        }

        let mut pages = self.write_range(range);
        let first = pages.first_page;
        for page in first..first + pages.len() as u64 {
            if !pages.is_materialized(page) {
                self.get_or_load(&mut pages, page)?;
            }
        }
        Ok(RwLockWriteGuard::downgrade(pages))
    }

    /// Re-read `page` from the device, replacing the resident copy.
    ///
    /// Used to pick up changes made by another writer of the device. Fails
    /// if the page has unflushed changes.
    pub fn refresh(&self, page: u64) -> Result<()> {
        self.region.block_of(page)?;
        let mut pages = self.write_range(self.range_of(page));
        if self.is_dirty(page) {
            return Err(IndexError::InvalidArgument(format!(
                "page {page} has unflushed changes"
            )));
        }

        let fresh = self.bridge.read_page(self.region, page)?;
        let slot = pages
            .slot(page)
            .ok_or_else(|| IndexError::InvalidArgument(format!("page {page} not in its range")))?;
        if pages.pages[slot].replace(fresh).is_none() {
            self.note_resident(1);
        }
        Ok(())
    }

    /// Queue `page` for write-back. Returns `false` if already queued.
    ///
    /// Call with the page's range held exclusively, after mutating it.
    pub fn mark_dirty(&self, page: u64) -> bool {
        self.dirty.lock().push(page)
    }

    /// Whether `page` is waiting for write-back.
    pub fn is_dirty(&self, page: u64) -> bool {
        self.dirty.lock().contains(page)
    }

    /// Number of pages waiting for write-back.
    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Number of resident pages.
    pub fn resident_pages(&self) -> u64 {
        self.resident.load(Ordering::Relaxed)
    }

    /// Write every queued page back to the device, oldest first.
    ///
    /// Each page is written under its range lock in shared mode, so the
    /// device sees a consistent copy. Pages dirtied while the flush runs are
    /// left for the next call. On a device error the failing page and all
    /// pages after it stay queued. Returns the number of pages written.
    pub fn flush(&self) -> Result<usize> {
        let pending = self.dirty.lock().snapshot();
        let mut written = 0;

        for page in pending {
            let pages = self.read_range(self.range_of(page));
            if !self.is_dirty(page) {
                continue;
            }

            let Some(buffer) = pages.get(page) else {
                warn!("Dirty page {} is not resident, dropping it from the queue", page);
                self.dirty.lock().remove(page);
                continue;
            };

            self.bridge.write_page(self.region, page, buffer)?;
            self.dirty.lock().remove(page);
            written += 1;
        }

        if written > 0 {
            debug!(
                "Flushed {} pages of region at block {}",
                written, self.region.start
            );
        }
        Ok(written)
    }

    fn note_resident(&self, pages: u64) {
        let resident = self.resident.fetch_add(pages, Ordering::Relaxed) + pages;
        if let Some(limit) = self.max_cached_pages
            && resident > limit
            && !self.over_budget.swap(true, Ordering::Relaxed)
        {
            warn!(
                "Page cache holds {} pages, above the configured bound of {}; pages are never evicted",
                resident, limit
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::device::{BitmapAllocator, BlockDevice, MemoryDevice};
    use crate::page::Entry;

    /// Memory device that remembers the order of written block addresses.
    struct RecordingDevice {
        inner: MemoryDevice,
        written: Mutex<Vec<u64>>,
    }

    impl BlockDevice for RecordingDevice {
        fn block_size(&self) -> usize {
            self.inner.block_size()
        }

        fn block_count(&self) -> u64 {
            self.inner.block_count()
        }

        fn read_block(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
            self.inner.read_block(addr, buf)
        }

        fn write_block(&self, addr: u64, buf: &[u8]) -> Result<()> {
            self.inner.write_block(addr, buf)?;
            self.written.lock().push(addr);
            Ok(())
        }
    }

    fn setup(pages: u64, range_size: u64) -> (Arc<RecordingDevice>, PageCache) {
        let dev = Arc::new(RecordingDevice {
            inner: MemoryDevice::new(512, 64),
            written: Mutex::new(Vec::new()),
        });
        let alloc = Arc::new(BitmapAllocator::with_reserved(64, 1));
        let bridge = Arc::new(BlockBridge::new(dev.clone(), alloc));
        let region = bridge.allocate_pages(pages).expect("allocate");
        let cache = PageCache::new(bridge, region, range_size, None);
        (dev, cache)
    }

    fn put(cache: &PageCache, page: u64, idx: usize, key: u64) {
        let mut pages = cache.write_range(cache.range_of(page));
        cache
            .get_or_load(&mut pages, page)
            .expect("load")
            .set(idx, Entry::new(key, key, 1))
            .expect("slot");
        cache.mark_dirty(page);
    }

    #[test]
    fn test_ranges_cover_region() {
        let (_dev, cache) = setup(10, 4);
        assert_eq!(cache.range_count(), 3);
        assert_eq!(cache.range_of(3), 0);
        assert_eq!(cache.range_of(4), 1);
        assert_eq!(cache.range_of(9), 2);
        assert_eq!(cache.read_range(2).len(), 2);
    }

    #[test]
    fn test_page_read_once() {
        let (dev, cache) = setup(4, 2);
        {
            let mut pages = cache.write_range(0);
            cache.get_or_load(&mut pages, 1).expect("first load");
            cache.get_or_load(&mut pages, 1).expect("second load");
        }
        assert_eq!(dev.inner.reads(), 1);
        assert_eq!(cache.resident_pages(), 1);
        assert_eq!(cache.bridge.stats().cache_misses(), 1);
        assert_eq!(cache.bridge.stats().cache_hits(), 1);
    }

    #[test]
    fn test_flush_in_dirty_order() {
        let (dev, cache) = setup(4, 1);
        put(&cache, 3, 0, 10);
        put(&cache, 0, 0, 11);
        put(&cache, 3, 1, 12);
        put(&cache, 2, 0, 13);
        assert_eq!(cache.dirty_count(), 3);

        assert_eq!(cache.flush().expect("flush"), 3);
        let start = cache.region().start;
        assert_eq!(*dev.written.lock(), vec![start + 3, start, start + 2]);
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn test_second_flush_writes_nothing() {
        let (dev, cache) = setup(2, 1);
        put(&cache, 0, 0, 5);
        put(&cache, 0, 1, 6);
        assert_eq!(cache.flush().expect("flush"), 1);
        let writes = dev.inner.writes();

        assert_eq!(cache.flush().expect("flush"), 0);
        assert_eq!(dev.inner.writes(), writes);
    }

    #[test]
    fn test_failed_flush_keeps_pages_queued() {
        let (dev, cache) = setup(3, 1);
        put(&cache, 0, 0, 1);
        put(&cache, 1, 0, 2);
        put(&cache, 2, 0, 3);

        dev.inner.fail_next_writes(1);
        assert!(matches!(cache.flush(), Err(IndexError::Io(_))));
        assert_eq!(cache.dirty_count(), 3);

        assert_eq!(cache.flush().expect("retry"), 3);
        assert_eq!(cache.dirty_count(), 0);

        let raw = dev.inner.block(cache.region().start + 2).expect("raw");
        assert_eq!(&raw[..8], &3u64.to_le_bytes());
    }

    #[test]
    fn test_dirtied_after_flush_waits_for_next_one() {
        let (dev, cache) = setup(3, 1);
        put(&cache, 0, 0, 1);
        cache.flush().expect("flush");

        put(&cache, 1, 0, 2);
        put(&cache, 2, 0, 3);
        dev.inner.fail_next_writes(1);
        assert!(cache.flush().is_err());
        assert!(!cache.is_dirty(0));
        assert!(cache.is_dirty(1));
        assert!(cache.is_dirty(2));
        assert_eq!(cache.flush().expect("retry"), 2);
        assert_eq!(dev.written.lock().len(), 3);
    }

    #[test]
    fn test_pages_dirtied_during_flush_reach_the_device() {
        let (dev, cache) = setup(4, 1);
        let rounds = 200u64;

        std::thread::scope(|scope| {
            for page in 0..4u64 {
                let cache = &cache;
                scope.spawn(move || {
                    for round in 1..=rounds {
                        put(cache, page, 0, round * 10 + page);
                    }
                });
            }
            let cache = &cache;
            scope.spawn(move || {
                for _ in 0..rounds {
                    cache.flush().expect("concurrent flush");
                }
            });
        });

        cache.flush().expect("final flush");
        assert_eq!(cache.dirty_count(), 0);
        let start = cache.region().start;
        for page in 0..4u64 {
            let raw = dev.inner.block(start + page).expect("raw");
            assert_eq!(&raw[..8], &(rounds * 10 + page).to_le_bytes());
        }
    }

    #[test]
    fn test_zeroed_cache_is_resident_and_dirty() {
        let (dev, cache) = {
            let dev = Arc::new(MemoryDevice::new(512, 16));
            // Pre-fill the device with garbage that must be overwritten.
            for addr in 0..16 {
                dev.write_block(addr, &[0xFF; 512]).expect("fill");
            }
            let alloc = Arc::new(BitmapAllocator::with_reserved(16, 1));
            let bridge = Arc::new(BlockBridge::new(dev.clone(), alloc));
            let region = bridge.allocate_pages(4).expect("allocate");
            (dev, PageCache::zeroed(bridge, region, 2, None))
        };
        dev.reset_counters();

        assert_eq!(cache.resident_pages(), 4);
        assert_eq!(cache.dirty_count(), 4);
        assert_eq!(cache.flush().expect("flush"), 4);
        assert_eq!(dev.reads(), 0);
        assert_eq!(dev.writes(), 4);
        assert_eq!(dev.block(1).expect("raw"), vec![0u8; 512]);
    }

    #[test]
    fn test_load_range_materializes_everything() {
        let (dev, cache) = setup(6, 3);
        {
            let pages = cache.load_range(1).expect("load");
            assert!(pages.is_fully_materialized());
            assert_eq!(pages.iter().count(), 3);
        }
        assert_eq!(dev.inner.reads(), 3);
        let pages = cache.load_range(1).expect("again");
        assert!(pages.is_fully_materialized());
        drop(pages);
        assert_eq!(dev.inner.reads(), 3);
    }

    #[test]
    fn test_refresh() {
        let (dev, cache) = setup(2, 1);
        put(&cache, 0, 0, 7);
        assert!(matches!(
            cache.refresh(0),
            Err(IndexError::InvalidArgument(_))
        ));
        cache.flush().expect("flush");

        // Another writer changes the block behind the cache's back.
        let mut outside = Page::zeroed(512);
        outside.set(0, Entry::new(99, 99, 1)).expect("slot");
        dev.inner
            .write_block(cache.region().start, &outside.to_bytes().expect("encode"))
            .expect("external write");

        cache.refresh(0).expect("refresh");
        let pages = cache.read_range(0);
        assert_eq!(pages.get(0).and_then(|p| p.entry(0)).map(|e| e.key), Some(99));
    }

    #[test]
    fn test_memory_bound_is_advisory() {
        let dev = Arc::new(MemoryDevice::new(512, 16));
        let alloc = Arc::new(BitmapAllocator::new(16));
        let bridge = Arc::new(BlockBridge::new(dev, alloc));
        let region = bridge.allocate_pages(8).expect("allocate");
        let cache = PageCache::new(bridge, region, 8, Some(2));

        let pages = cache.load_range(0).expect("load past the bound");
        assert_eq!(pages.iter().count(), 8);
        drop(pages);
        assert_eq!(cache.resident_pages(), 8);
    }
}
