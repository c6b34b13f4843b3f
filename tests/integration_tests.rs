//! End-to-end tests over the public interface, exercising both backings.

use indexer_core::{
    CancelToken, IndexConfig, Indexer, IndexerError, PersistentIndex, ProviderId, ShardedCache,
    Value,
};
use multihash::Multihash;
use multihash_codetable::{Code, MultihashDigest};
use std::time::Duration;

fn mh(data: &[u8]) -> Multihash<64> {
    Code::Sha2_256.digest(data)
}

fn mh_range(count: usize) -> Vec<Multihash<64>> {
    (0..count as u64).map(|i| mh(&i.to_le_bytes())).collect()
}

fn value(provider: &str, context: &[u8], metadata: &[u8]) -> Value {
    Value::new(provider, context.to_vec(), metadata.to_vec())
}

fn test_config() -> IndexConfig {
    IndexConfig::new()
        .with_index_bit_size(8)
        .with_sync_interval(Duration::from_millis(100))
}

// ============================================================================
// END-TO-END SCENARIOS
// ============================================================================

#[test]
fn test_put_get_across_many_multihashes() {
    let dir = tempfile::tempdir().unwrap();
    let index = PersistentIndex::open(dir.path(), test_config()).unwrap();

    let v = value("peer-1", b"ctx", &[0x01]);
    let mhs = mh_range(10);
    index.put(v.clone(), &mhs).unwrap();

    let got = index.get(&mhs[5]).unwrap().unwrap();
    assert_eq!(got, vec![v]);
}

#[test]
fn test_metadata_update_replaces_value() {
    let dir = tempfile::tempdir().unwrap();
    let index = PersistentIndex::open(dir.path(), test_config()).unwrap();
    let m = mh(b"content");

    index.put(value("peer-1", b"ctx", &[0x01]), &[m]).unwrap();
    index.put(value("peer-1", b"ctx", &[0x02]), &[m]).unwrap();

    let got = index.get(&m).unwrap().unwrap();
    assert_eq!(got.len(), 1, "update must not duplicate the value");
    assert_eq!(got[0].metadata, vec![0x02]);
}

#[test]
fn test_multiple_providers_for_one_multihash() {
    let dir = tempfile::tempdir().unwrap();
    let index = PersistentIndex::open(dir.path(), test_config()).unwrap();
    let m = mh(b"popular content");

    let v1 = value("p1", b"a", &[1]);
    let v2 = value("p2", b"b", &[2]);
    index.put(v1.clone(), &[m]).unwrap();
    index.put(v2.clone(), &[m]).unwrap();

    let got = index.get(&m).unwrap().unwrap();
    assert_eq!(got.len(), 2);
    assert!(got.contains(&v1));
    assert!(got.contains(&v2));
}

#[test]
fn test_periodic_flush_visible_to_second_instance() {
    let dir = tempfile::tempdir().unwrap();
    let sync_interval = Duration::from_millis(100);
    let config = test_config().with_sync_interval(sync_interval);

    let writer = PersistentIndex::open(dir.path(), config.clone()).unwrap();
    let v = value("peer-1", b"ctx", &[0x01]);
    let mhs = mh_range(150);
    writer.put(v.clone(), &mhs).unwrap();

    // Let the background sync run; do not flush explicitly.
    std::thread::sleep(sync_interval * 2);

    let reader = PersistentIndex::open(dir.path(), config).unwrap();
    for m in &mhs {
        assert_eq!(reader.get(m).unwrap().unwrap(), vec![v.clone()]);
    }
}

#[test]
fn test_remove_many() {
    let dir = tempfile::tempdir().unwrap();
    let index = PersistentIndex::open(dir.path(), test_config()).unwrap();

    let v = value("peer-1", b"ctx", &[0x01]);
    let mhs = mh_range(1000);
    index.put(v.clone(), &mhs).unwrap();
    let populated = index.size().unwrap();

    index.remove(&v, &mhs).unwrap();
    for m in mhs.iter().step_by(97) {
        assert_eq!(index.get(m).unwrap(), None);
    }

    // The log grows by tombstones but stays within a small multiple of
    // the populated size rather than exploding.
    let after = index.size().unwrap();
    assert!(after < populated * 3);
}

#[test]
fn test_size_monotonic_under_puts() {
    let dir = tempfile::tempdir().unwrap();
    let index = PersistentIndex::open(dir.path(), test_config()).unwrap();

    let before = index.size().unwrap();
    index
        .put(value("peer-1", b"ctx", &[0x01]), &mh_range(100))
        .unwrap();
    let after = index.size().unwrap();
    assert!(after > before, "size: {} -> {}", before, after);
}

#[test]
fn test_close_reopen_preserves_flushed_data() {
    let dir = tempfile::tempdir().unwrap();
    let v = value("peer-1", b"ctx", &[0x01]);
    let mhs = mh_range(25);
    {
        let index = PersistentIndex::open(dir.path(), test_config()).unwrap();
        index.put(v.clone(), &mhs).unwrap();
        index.flush().unwrap();
        index.close().unwrap();
    }
    let index = PersistentIndex::open(dir.path(), test_config()).unwrap();
    for m in &mhs {
        assert_eq!(index.get(m).unwrap().unwrap(), vec![v.clone()]);
    }
}

// ============================================================================
// PROVIDER REMOVAL
// ============================================================================

#[test]
fn test_remove_provider_context_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let index = PersistentIndex::open(dir.path(), test_config()).unwrap();

    let only = mh(b"only ctx-a");
    let shared = mh(b"shared");
    index.put(value("p", b"ctx-a", &[1]), &[only, shared]).unwrap();
    index.put(value("p", b"ctx-b", &[2]), &[shared]).unwrap();

    index
        .remove_provider_context(&ProviderId::from("p"), b"ctx-a")
        .unwrap();

    assert_eq!(index.get(&only).unwrap(), None);
    let got = index.get(&shared).unwrap().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].context_id, b"ctx-b".to_vec());
}

#[test]
fn test_remove_provider_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let index = PersistentIndex::open(dir.path(), test_config()).unwrap();

    let mhs = mh_range(50);
    index.put(value("doomed", b"a", &[1]), &mhs).unwrap();
    index.put(value("doomed", b"b", &[2]), &mhs[..10]).unwrap();
    index.put(value("kept", b"c", &[3]), &mhs[..20]).unwrap();

    index
        .remove_provider(&CancelToken::new(), &ProviderId::from("doomed"))
        .unwrap();

    for (i, m) in mhs.iter().enumerate() {
        match index.get(m).unwrap() {
            Some(values) => {
                assert!(i < 20);
                assert!(values
                    .iter()
                    .all(|v| v.provider_id == ProviderId::from("kept")));
            }
            None => assert!(i >= 20),
        }
    }
}

// ============================================================================
// ITERATION
// ============================================================================

#[test]
fn test_iter_complete_and_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let index = PersistentIndex::open(dir.path(), test_config()).unwrap();

    let mhs = mh_range(40);
    index.put(value("p1", b"a", &[1]), &mhs).unwrap();
    // Rewrite a slice of entries so the primary scan repeats their keys.
    index.put(value("p2", b"b", &[2]), &mhs[..15]).unwrap();

    let mut seen = std::collections::HashSet::new();
    for entry in index.iter().unwrap() {
        let (m, values) = entry.unwrap();
        assert!(!values.is_empty());
        assert!(seen.insert(m.to_bytes()), "multihash yielded twice");
    }
    assert_eq!(seen.len(), 40);
}

// ============================================================================
// SHARED SEMANTICS ACROSS BACKINGS
// ============================================================================

fn check_core_semantics(index: &dyn Indexer) {
    let m = mh(b"shared semantics");
    let v1 = value("p1", b"a", &[1]);
    let v2 = value("p2", b"b", &[2]);

    index.put(v1.clone(), &[m]).unwrap();
    index.put(v1.clone(), &[m]).unwrap();
    index.put(v2.clone(), &[m]).unwrap();
    let got = index.get(&m).unwrap().unwrap();
    assert_eq!(got.len(), 2);

    index.remove(&v1, &[m]).unwrap();
    let got = index.get(&m).unwrap().unwrap();
    assert_eq!(got, vec![v2.clone()]);

    index
        .remove_provider(&CancelToken::new(), &v2.provider_id)
        .unwrap();
    assert_eq!(index.get(&m).unwrap(), None);

    let err = index.put(value("p", b"c", &[]), &[m]).unwrap_err();
    assert!(matches!(err, IndexerError::EmptyMetadata));
}

#[test]
fn test_cache_and_persistent_agree() {
    let dir = tempfile::tempdir().unwrap();
    let persistent = PersistentIndex::open(dir.path(), test_config()).unwrap();
    check_core_semantics(&persistent);

    let cache = ShardedCache::new(4096);
    check_core_semantics(&cache);
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[test]
fn test_concurrent_puts_and_gets() {
    let dir = tempfile::tempdir().unwrap();
    let index = PersistentIndex::open(dir.path(), test_config()).unwrap();

    std::thread::scope(|scope| {
        for worker in 0..4u32 {
            let index = &index;
            scope.spawn(move || {
                let v = value(&format!("peer-{}", worker), b"ctx", &[worker as u8 + 1]);
                for i in 0..100u32 {
                    let m = mh(&(worker * 1000 + i).to_le_bytes());
                    index.put(v.clone(), &[m]).unwrap();
                    assert!(index.get(&m).unwrap().is_some());
                }
            });
        }
    });

    // Every write landed.
    for worker in 0..4u32 {
        for i in (0..100u32).step_by(13) {
            let m = mh(&(worker * 1000 + i).to_le_bytes());
            assert!(index.get(&m).unwrap().is_some());
        }
    }
}

#[test]
fn test_concurrent_writers_same_multihash() {
    let dir = tempfile::tempdir().unwrap();
    let index = PersistentIndex::open(dir.path(), test_config()).unwrap();
    let m = mh(b"contended");

    std::thread::scope(|scope| {
        for worker in 0..8u32 {
            let index = &index;
            scope.spawn(move || {
                let v = value(&format!("peer-{}", worker), b"ctx", &[1]);
                index.put(v, &[m]).unwrap();
            });
        }
    });

    let got = index.get(&m).unwrap().unwrap();
    assert_eq!(got.len(), 8, "no list update may be lost");
}
