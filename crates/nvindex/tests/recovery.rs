//! Restart scenarios against a file-backed device image.

#![allow(clippy::expect_used)]
#![cfg(unix)]

use std::path::Path;

use nvindex::codec::encode_key;
use nvindex::device::{BitmapAllocator, FileDevice};
use nvindex::{BlockMapping, HashIndex, IndexConfig, IndexError};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const BLOCK_SIZE: usize = 512;
const BLOCKS: u64 = 256;

fn config() -> IndexConfig {
    IndexConfig::new()
        .with_block_size(BLOCK_SIZE)
        .with_initial_capacity(32)
        .with_range_size(4)
}

fn create(path: &Path) -> HashIndex {
    let device = FileDevice::create(path, BLOCK_SIZE, BLOCKS).expect("create image");
    HashIndex::open(device, BitmapAllocator::new(BLOCKS), config()).expect("create index")
}

fn reopen(path: &Path, config: IndexConfig) -> nvindex::Result<HashIndex> {
    let device = FileDevice::open(path, BLOCK_SIZE).expect("open image");
    HashIndex::open(device, BitmapAllocator::new(BLOCKS), config)
}

#[test]
fn entries_survive_restart() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("nvm.img");

    {
        let index = create(&path);
        index.insert(encode_key(1, 0), 100, 1).expect("insert");
        index.insert(encode_key(1, 1), 101, 1).expect("insert");
        index.write_metadata(0).expect("write metadata");
    }

    let index = reopen(&path, config()).expect("reopen");
    assert_eq!(index.lookup(encode_key(1, 0)).expect("lookup"), Some((100, 1)));
    assert_eq!(index.lookup(encode_key(1, 1)).expect("lookup"), Some((101, 1)));
    assert_eq!(index.len(), 2);
}

#[test]
fn grown_table_survives_restart() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("nvm.img");

    let data_start = {
        let index = create(&path);
        for lblk in 0..300u32 {
            let mapping = BlockMapping::single(10_000 + u64::from(lblk));
            index.insert_mapping(7, lblk, mapping, 1).expect("insert");
        }
        for lblk in (0..300u32).step_by(3) {
            index.remove_mapping(7, lblk).expect("remove");
        }
        index.checkpoint().expect("checkpoint");
        index.stats().data_start
    };

    let index = reopen(&path, config()).expect("reopen");
    let stats = index.stats();
    assert_eq!(stats.data_start, data_start);
    assert_eq!(stats.nnodes, 200);
    assert!(stats.size >= 512);

    for lblk in 0..300u32 {
        let expected = if lblk.is_multiple_of(3) {
            None
        } else {
            Some((BlockMapping::single(10_000 + u64::from(lblk)), 1))
        };
        assert_eq!(index.lookup_mapping(7, lblk).expect("lookup"), expected);
    }

    // The reopened table keeps growing into space the old regions don't use.
    for lblk in 300..700u32 {
        index
            .insert_mapping(7, lblk, BlockMapping::single(u64::from(lblk)), 1)
            .expect("insert after restart");
    }
    index.checkpoint().expect("checkpoint");
    drop(index);

    let index = reopen(&path, config()).expect("second reopen");
    assert_eq!(index.len(), 600);
    assert_eq!(
        index.lookup_mapping(7, 1).expect("lookup"),
        Some((BlockMapping::single(10_001), 1))
    );
}

#[test]
fn uncheckpointed_changes_are_not_visible() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("nvm.img");

    {
        let index = create(&path);
        index.insert(encode_key(2, 0), 1, 1).expect("insert");
        index.checkpoint().expect("checkpoint");
        index.insert(encode_key(2, 1), 2, 1).expect("insert");
    }

    let index = reopen(&path, config()).expect("reopen");
    assert_eq!(index.lookup(encode_key(2, 0)).expect("lookup"), Some((1, 1)));
    assert_eq!(index.lookup(encode_key(2, 1)).expect("lookup"), None);
    assert_eq!(index.len(), 1);
}

#[test]
fn geometry_mismatch_is_fatal() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("nvm.img");
    create(&path).checkpoint().expect("checkpoint");

    let other_ranges = reopen(&path, config().with_range_size(8));
    assert!(matches!(other_ranges, Err(IndexError::CorruptMetadata(_))));

    let other_device = reopen(&path, config().with_nvram_size(128));
    assert!(matches!(other_device, Err(IndexError::CorruptMetadata(_))));

    assert!(reopen(&path, config()).is_ok());
}

#[test]
fn metadata_at_custom_location() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("nvm.img");
    let config = config().with_metadata_location(100);

    {
        let device = FileDevice::create(&path, BLOCK_SIZE, BLOCKS).expect("create image");
        let index = HashIndex::open(device, BitmapAllocator::new(BLOCKS), config.clone())
            .expect("create index");
        index.insert(encode_key(3, 3), 33, 1).expect("insert");
        index.checkpoint().expect("checkpoint");
    }

    let index = reopen(&path, config).expect("reopen");
    assert_eq!(index.lookup(encode_key(3, 3)).expect("lookup"), Some((33, 1)));
}

#[test]
fn config_round_trips_through_json() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("index.json");
    std::fs::write(&path, config().to_json().expect("json")).expect("write config");

    let loaded = IndexConfig::from_json(&std::fs::read_to_string(&path).expect("read config"))
        .expect("parse config");
    assert_eq!(loaded, config());
}
