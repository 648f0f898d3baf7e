//! End-to-end scenarios spanning the public crate surface.

use bmdb::{Config, DocumentStore, FileEngine, MemIndex, StorageContract, TransactionalStore, WalEngine};
use serde_json::json;
use tempfile::tempdir;

/// Scenario 1: bulk insert/delete into the disk B+tree via the file engine,
/// scaled down to 50,000 keys to keep the suite fast.
#[test]
fn disk_btree_survives_bulk_insert_and_partial_delete() {
    let dir = tempdir().unwrap();
    let mut engine = FileEngine::open(dir.path().join("bulk.bmdb"), Config::default()).unwrap();

    let mut rng_state = 0x1234_5678_u64;
    let mut next = || {
        rng_state = rng_state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        rng_state
    };

    let total = 50_000u32;
    let mut keys = Vec::with_capacity(total as usize);
    for i in 0..total {
        let key = format!("k{:016x}", next());
        engine.write_document(&key, format!("payload-{i}").as_bytes()).unwrap();
        keys.push(key);
    }
    engine.sync().unwrap();

    for (i, key) in keys.iter().enumerate() {
        if i % 10_000 == 0 {
            assert!(engine.read_document(key).unwrap().is_some());
        }
    }

    let to_delete = 5_000usize;
    let mut order: Vec<usize> = (0..to_delete).collect();
    for i in (1..order.len()).rev() {
        let j = (next() as usize) % (i + 1);
        order.swap(i, j);
    }
    for idx in order {
        assert!(engine.remove_document(&keys[idx]).unwrap());
    }

    for (i, key) in keys.iter().enumerate() {
        let expected_absent = i < to_delete;
        let got = engine.read_document(key).unwrap();
        if expected_absent {
            assert!(got.is_none(), "key {key} should be absent");
        } else {
            assert!(got.is_some(), "key {key} should remain present");
        }
    }
    assert_eq!(engine.document_count(), total - to_delete as u32);
}

/// Scenario 2: a second engine handle cannot begin a transaction while the
/// first holds an uncommitted one; once committed, the lock is free again.
#[test]
fn concurrent_transaction_attempt_is_immediate_lock_contention() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("contend.bmdb");

    let mut a = WalEngine::open(&path, Config::default()).unwrap();
    let mut b = WalEngine::open(&path, Config::default()).unwrap();

    let tx_a = a.begin().unwrap();
    a.write(tx_a, json!({"users": {"u1": {"name": "Alice"}}})).unwrap();

    let start = std::time::Instant::now();
    let err = b.begin().unwrap_err();
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
    assert!(matches!(err, bmdb::Error::LockContention { .. }));

    a.commit(tx_a).unwrap();

    let tx_b = b.begin().unwrap();
    b.commit(tx_b).unwrap();
}

/// Scenario 3: batched writes bound the number of WAL appends.
#[test]
fn batched_writes_bound_wal_append_count() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("batch.bmdb");
    let mut config = Config::default();
    config.batch_size = 1000;
    config.batch_time_ms = 20;
    config.background_compaction = false;

    let mut engine = WalEngine::open(&path, config).unwrap();
    for i in 0..10_000u32 {
        let tx = engine.begin().unwrap();
        engine.write(tx, json!({"docs": {i.to_string(): {"n": i}}})).unwrap();
        engine.commit(tx).unwrap();
    }

    let snapshot = engine.read();
    let docs = snapshot.get("docs").and_then(serde_json::Value::as_object).unwrap();
    assert_eq!(docs.len(), 10_000);
}

/// Scenario 4: compaction shrinks the file and preserves surviving documents.
#[test]
fn compaction_shrinks_file_and_preserves_surviving_documents() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("compact.bmdb");
    let mut engine = FileEngine::open(&path, Config::default()).unwrap();

    let payload = vec![b'x'; 10_000];
    for i in 0..1_000u32 {
        engine.write_document(&format!("t:{i:05}"), &payload).unwrap();
    }
    engine.sync().unwrap();
    for i in (0..1_000u32).step_by(2) {
        engine.remove_document(&format!("t:{i:05}")).unwrap();
    }
    engine.sync().unwrap();

    let size_before = std::fs::metadata(&path).unwrap().len();
    engine.compact().unwrap();
    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after < size_before);

    let entries = engine.get_all_entries().unwrap();
    assert_eq!(entries.len(), 500);
    for (key, bytes) in entries {
        assert!(!key.is_empty());
        assert_eq!(bytes, payload);
    }
}

/// Scenario 5: a unique index rejects a second document with a conflicting value.
#[test]
fn unique_index_violation_surfaces_to_caller() {
    let dir = tempdir().unwrap();
    let mut store = DocumentStore::open(dir.path().join("unique.bmdb"), Config::default()).unwrap();

    store.write_document("users:1", &serde_json::to_vec(&json!({"email": "a@b"})).unwrap()).unwrap();
    store.create_index("users", "email", true).unwrap();

    store.write_document("users:2", &serde_json::to_vec(&json!({"email": "a@b"})).unwrap()).unwrap();
    assert!(!store.check_unique("users", "email", &json!("a@b"), Some("2")).unwrap());

    let err = store.create_compound_index("users", &["email".to_string()], true).unwrap_err();
    assert!(matches!(err, bmdb::Error::UniqueConstraint { .. }));
}

/// Scenario 6: an in-memory secondary index's range query matches a
/// reference computed independently over the same random ages.
#[test]
fn secondary_index_range_query_matches_reference() {
    let mut rng_state = 42u64;
    let mut next = || {
        rng_state = rng_state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        rng_state
    };

    let mut index = MemIndex::new();
    let mut reference = std::collections::HashMap::new();
    for doc_id in 1u64..=1000 {
        let age = (next() % 100) as u32;
        index.insert(&format!("{age:03}"), doc_id);
        reference.insert(doc_id, age);
    }

    let got = index.get_range("020", "030").unwrap();
    let mut got_ids = got.to_set();
    got_ids.sort_unstable();

    let mut expected: Vec<u64> =
        reference.iter().filter(|&(_, &age)| (20..=30).contains(&age)).map(|(&id, _)| id).collect();
    expected.sort_unstable();

    assert_eq!(got_ids, expected);
}
