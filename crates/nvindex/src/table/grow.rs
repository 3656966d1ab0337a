//! Table growth and clearing.
//!
//! Both run with the metadata lock held exclusively and swap in a new page
//! cache. Growth moves the table to a fresh region; the old region is left
//! allocated.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::info;

use super::TableState;
use super::probe::Geometry;
use crate::bridge::BlockBridge;
use crate::cache::PageCache;
use crate::config::IndexConfig;
use crate::page::{Entry, Page, SlotState};
use crate::{IndexError, Result};

/// Double the slot count and rehash every live entry into a new region.
///
/// Nothing is changed unless the old pages can be read and the new region
/// allocated. Afterwards `noccupied == nnodes`.
pub(super) fn grow(bridge: &Arc<BlockBridge>, config: &IndexConfig, state: &mut TableState) -> Result<()> {
    let old = state.geometry;
    let size = old.size.checked_mul(2).ok_or_else(|| {
        IndexError::OutOfSpace(format!("cannot grow past {} slots", old.size))
    })?;
    let geometry = Geometry::new(size, old.entries_per_page)?;

    let live = {
        let mut guards: Vec<_> = (0..state.cache.range_count())
            .map(|range| state.cache.write_range(range))
            .collect();

        let mut live = Vec::new();
        for pages in &mut guards {
            let first = pages.first_page();
            for page in first..first + pages.len() as u64 {
                let buffer = state.cache.get_or_load(pages, page)?;
                let in_table = old.size.saturating_sub(page * old.entries_per_page) as usize;
                live.extend(
                    buffer
                        .entries()
                        .iter()
                        .take(in_table)
                        .filter(|entry| entry.is_real())
                        .copied(),
                );
            }
        }
        live
    };

    let region = bridge.allocate_pages(geometry.pages())?;
    let mut pages = vec![Page::zeroed(bridge.block_size()); geometry.pages() as usize];
    for entry in &live {
        place(&geometry, &mut pages, *entry)?;
    }

    let moved = live.len() as u64;
    state.cache = PageCache::with_pages(
        bridge.clone(),
        region,
        config.range_size,
        config.max_cached_pages,
        pages,
    );
    state.geometry = geometry;
    state.nnodes.store(moved, Ordering::Release);
    state.noccupied.store(moved, Ordering::Release);

    info!(
        "Grew hash index from {} to {} slots: {} entries moved to block {}",
        old.size, geometry.size, moved, region.start
    );
    Ok(())
}

/// Put `entry` in the first unused slot of its chain. The pages hold no
/// tombstones and no copy of the key.
fn place(geometry: &Geometry, pages: &mut [Page], entry: Entry) -> Result<()> {
    let mut slot = geometry.bucket(entry.key);
    for _ in 0..geometry.size {
        let (page, idx) = geometry.locate(slot);
        let target = &mut pages[page as usize];
        if target
            .entry(idx)
            .is_some_and(|existing| existing.state() == SlotState::Unused)
        {
            return target.set(idx, entry);
        }
        slot = geometry.next(slot);
    }
    Err(IndexError::OutOfSpace(format!(
        "no free slot among {} while rehashing",
        geometry.size
    )))
}

/// Reset the table to empty in its current region.
pub(super) fn clear(bridge: &Arc<BlockBridge>, config: &IndexConfig, state: &mut TableState) {
    let region = state.cache.region();
    state.cache = PageCache::zeroed(
        bridge.clone(),
        region,
        config.range_size,
        config.max_cached_pages,
    );
    state.nnodes.store(0, Ordering::Release);
    state.noccupied.store(0, Ordering::Release);
    info!("Cleared hash index of {} slots at block {}", state.geometry.size, region.start);
}
