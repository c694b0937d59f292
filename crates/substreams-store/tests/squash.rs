//! Squashing partial snapshots on an object store.

use std::sync::Arc;

use substreams_core::{BlockRange, UpdatePolicy, ValueType};
use substreams_storage::{LocalStore, ObjectStore, RedbStore, SharedStore};
use substreams_store::{KvStore, SnapshotListing, StoreConfig, StoreSquasher, squash};

fn add_int64() -> StoreConfig {
    StoreConfig::new("totals", "0123456789abcdef0123456789abcdef01234567", 1000, UpdatePolicy::Add, ValueType::Int64)
}

fn write_partial(objstore: &dyn ObjectStore, config: &StoreConfig, lo: u64, hi: u64, k: i64) {
    let mut partial = KvStore::new_partial(config.clone(), lo);
    partial.add_int64(0, "k", k).unwrap();
    partial.reset();
    partial.save(hi).write(objstore).unwrap();
}

fn int(store: &KvStore, key: &str) -> i64 {
    std::str::from_utf8(store.get_last(key).unwrap())
        .unwrap()
        .parse()
        .unwrap()
}

#[test]
fn two_partials_squash_into_full() {
    let dir = tempfile::tempdir().unwrap();
    let objstore: SharedStore = Arc::new(LocalStore::open(dir.path()).unwrap());
    let config = add_int64();

    write_partial(objstore.as_ref(), &config, 1000, 2000, 5);
    write_partial(objstore.as_ref(), &config, 2000, 3000, 7);

    let mut squasher = StoreSquasher::new(config.clone(), objstore.clone(), 1000);
    // Out-of-order arrival parks the later partial.
    assert_eq!(squasher.add_partial(BlockRange::new(2000, 3000)).unwrap(), 1000);
    assert_eq!(squasher.pending(), 1);
    assert_eq!(squasher.add_partial(BlockRange::new(1000, 2000)).unwrap(), 3000);

    let listing = SnapshotListing::fetch(objstore.as_ref(), &config).unwrap();
    assert!(listing.has_full(1000, 2000));
    assert!(listing.has_full(1000, 3000));
    assert!(listing.live_partials(1000).is_empty());

    let full = substreams_store::load_full_at(objstore.as_ref(), &config, 3000).unwrap();
    assert_eq!(int(&full, "k"), 12);
}

#[test]
fn squash_is_associative() {
    let config = add_int64();
    let objstore = RedbStore::open_in_memory().unwrap();
    write_partial(&objstore, &config, 1000, 2000, 5);
    write_partial(&objstore, &config, 2000, 3000, -7);
    write_partial(&objstore, &config, 3000, 4000, 11);

    let listing = SnapshotListing::fetch(&objstore, &config).unwrap();
    let parts: Vec<KvStore> = listing
        .files()
        .iter()
        .map(|f| KvStore::load(config.clone(), &objstore, f).unwrap())
        .collect();

    let left = squash(&squash(&parts[0], &parts[1]).unwrap(), &parts[2]).unwrap();
    let right = squash(&parts[0], &squash(&parts[1], &parts[2]).unwrap()).unwrap();
    assert_eq!(left.encode(), right.encode());
    assert_eq!(int(&left, "k"), 9);
}

#[test]
fn squasher_resumes_from_existing_full() {
    let config = add_int64();
    let objstore: SharedStore = Arc::new(RedbStore::open_in_memory().unwrap());
    write_partial(objstore.as_ref(), &config, 1000, 2000, 1);
    write_partial(objstore.as_ref(), &config, 2000, 3000, 2);

    let mut first = StoreSquasher::new(config.clone(), objstore.clone(), 1000);
    first.add_partial(BlockRange::new(1000, 2000)).unwrap();

    // A new run picks up from the full end it finds on storage.
    let listing = SnapshotListing::fetch(objstore.as_ref(), &config).unwrap();
    let full_until = listing.full_until(config.module_start);
    assert_eq!(full_until, 2000);
    let mut second = StoreSquasher::new(config.clone(), objstore.clone(), full_until);
    assert_eq!(second.add_partial(BlockRange::new(1000, 2000)).unwrap(), 2000);
    assert_eq!(second.add_partial(BlockRange::new(2000, 3000)).unwrap(), 3000);

    let full = substreams_store::load_full_at(objstore.as_ref(), &config, 3000).unwrap();
    assert_eq!(int(&full, "k"), 3);
}

#[test]
fn full_written_by_a_job_unblocks_parked_partials() {
    let config = add_int64();
    let objstore: SharedStore = Arc::new(RedbStore::open_in_memory().unwrap());
    let mut first = KvStore::new_full(config.clone());
    first.add_int64(0, "k", 4).unwrap();
    first.reset();
    first.save(2000).write(objstore.as_ref()).unwrap();
    write_partial(objstore.as_ref(), &config, 2000, 3000, 6);

    let mut squasher = StoreSquasher::new(config.clone(), objstore.clone(), 1000);
    assert_eq!(squasher.add_partial(BlockRange::new(2000, 3000)).unwrap(), 1000);
    assert_eq!(squasher.add_full(2000).unwrap(), 3000);
    assert_eq!(squasher.pending(), 0);

    let full = substreams_store::load_full_at(objstore.as_ref(), &config, 3000).unwrap();
    assert_eq!(int(&full, "k"), 10);
}
