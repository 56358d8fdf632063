//! Randomized checks that secondary indexes mirror the live rows
//!
//! Every round applies a random batch of puts and deletes, then compares each
//! index lookup against a model computed from the rows themselves. The
//! environment is reopened halfway through to make sure markers and index rows
//! survive a restart.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vsync_core::store::{BatchOp, IndexedPartition, Store};

const KEYS: u8 = 40;
const ROUNDS: usize = 60;

/// First byte of the value, odd values only.
fn odd_head(_key: &[u8], value: &[u8]) -> Option<Vec<u8>> {
    value.first().filter(|b| *b % 2 == 1).map(|b| vec![*b])
}

/// Value length as a big-endian u64.
fn length(_key: &[u8], value: &[u8]) -> Option<Vec<u8>> {
    Some((value.len() as u64).to_be_bytes().to_vec())
}

fn open(store: &Store) -> IndexedPartition {
    let rows = IndexedPartition::new(store.partition("random"));
    rows.prepare().unwrap();
    rows.index("odd_head", Arc::new(odd_head)).unwrap();
    rows.index("length", Arc::new(length)).unwrap();
    rows
}

fn random_batch(rng: &mut StdRng, model: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<BatchOp> {
    let mut ops = Vec::new();
    let mut touched = BTreeSet::new();
    for _ in 0..rng.gen_range(1..12) {
        let key = vec![b'k', rng.gen_range(0..KEYS)];
        if !touched.insert(key.clone()) {
            continue;
        }
        if rng.gen_bool(0.3) {
            model.remove(&key);
            ops.push(BatchOp::Del { key });
        } else {
            let len = rng.gen_range(1..6);
            let value: Vec<u8> = (0..len).map(|_| rng.gen_range(0..8)).collect();
            model.insert(key.clone(), value.clone());
            ops.push(BatchOp::Put { key, value });
        }
    }
    ops
}

fn assert_consistent(rows: &IndexedPartition, model: &BTreeMap<Vec<u8>, Vec<u8>>) {
    assert_eq!(rows.count().unwrap(), model.len());
    for (key, value) in model {
        assert_eq!(&rows.get(key).unwrap(), value);
    }

    for (name, reduce) in [
        ("odd_head", odd_head as fn(&[u8], &[u8]) -> Option<Vec<u8>>),
        ("length", length),
    ] {
        let mut expected: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>> = BTreeMap::new();
        for (key, value) in model {
            if let Some(indexed) = reduce(key, value) {
                expected.entry(indexed).or_default().insert(key.clone());
            }
        }

        for (indexed, keys) in &expected {
            let found: BTreeSet<Vec<u8>> = rows
                .get_by(name, indexed)
                .unwrap()
                .into_iter()
                .map(|(key, _)| key)
                .collect();
            assert_eq!(&found, keys, "index {name} value {indexed:?}");
        }

        let total: usize = expected.values().map(BTreeSet::len).sum();
        let all = rows.get_by_range(name, &[], None).unwrap();
        assert_eq!(all.len(), total, "index {name} has stale rows");
    }
}

#[test]
fn test_indexes_match_rows_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model = BTreeMap::new();

    {
        let store = Store::open_with_map_size(dir.path(), 16 * 1024 * 1024).unwrap();
        let rows = open(&store);
        for _ in 0..ROUNDS / 2 {
            let ops = random_batch(&mut rng, &mut model);
            rows.batch(ops).unwrap();
            assert_consistent(&rows, &model);
        }
    }

    let store = Store::open_with_map_size(dir.path(), 16 * 1024 * 1024).unwrap();
    let rows = open(&store);
    assert_consistent(&rows, &model);
    for _ in ROUNDS / 2..ROUNDS {
        let ops = random_batch(&mut rng, &mut model);
        rows.batch(ops).unwrap();
        assert_consistent(&rows, &model);
    }

    let deleted = rows.del_range(b"k", None).unwrap();
    assert_eq!(deleted, model.len());
    model.clear();
    assert_consistent(&rows, &model);
}

#[test]
fn test_concurrent_prepare_converges() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_map_size(dir.path(), 16 * 1024 * 1024).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let partition = store.partition("shared");
            std::thread::spawn(move || partition.prepare())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let partition = store.partition("shared");
    partition.prepare().unwrap();
    partition.put(b"k", b"v").unwrap();
    assert_eq!(partition.get(b"k").unwrap(), b"v");
}
