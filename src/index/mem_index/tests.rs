use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use uuid::Uuid;

use crate::address::Address;
use crate::device::MemoryDevice;
use crate::error::KvError;
use crate::index::{HashBucket, KeyHash, MemHashIndex, TracedRecord};

/// Hash with a chosen bucket (low bits) and tag (bits 48..62).
fn hash_for(bucket: u64, tag: u64) -> KeyHash {
    KeyHash::new((tag << 48) | bucket)
}

fn insert(index: &MemHashIndex, hash: KeyHash, address: u64) {
    let slot = index
        .try_insert_tentative(hash, Address::new(address))
        .expect("insert");
    assert!(index.confirm_entry(hash, slot));
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .build()
        .unwrap()
}

#[test]
fn test_find_missing() {
    let index = MemHashIndex::new(128);
    assert!(!index.find_entry(hash_for(3, 9)).found());
}

#[test]
fn test_tentative_invisible_until_confirmed() {
    let index = MemHashIndex::new(128);
    let hash = hash_for(3, 9);

    let slot = index.try_insert_tentative(hash, Address::new(4096)).unwrap();
    assert!(!index.find_entry(hash).found());
    assert_eq!(index.dump_distribution().tentative_entries, 1);

    assert!(index.confirm_entry(hash, slot));
    let found = index.find_entry(hash);
    assert!(found.found());
    assert_eq!(found.entry.address(), Address::new(4096));
    assert_eq!(found.entry.tag(), 9);
}

#[test]
fn test_insert_fails_when_tag_committed() {
    let index = MemHashIndex::new(128);
    let hash = hash_for(5, 1);
    insert(&index, hash, 64);
    assert!(index.try_insert_tentative(hash, Address::new(128)).is_none());
}

#[test]
fn test_insert_backs_off_on_tentative_conflict() {
    let index = MemHashIndex::new(128);
    let hash = hash_for(5, 1);
    let first = index.try_insert_tentative(hash, Address::new(64)).unwrap();
    assert!(index.try_insert_tentative(hash, Address::new(128)).is_none());

    index.abandon_entry(first);
    assert_eq!(index.dump_distribution().used_entries, 0);
    insert(&index, hash, 128);
}

#[test]
fn test_update_entry_is_cas() {
    let index = MemHashIndex::new(128);
    let hash = hash_for(7, 2);
    insert(&index, hash, 64);

    assert!(!index.update_entry(hash, Address::new(100), Address::new(200)));
    assert!(index.update_entry(hash, Address::new(64), Address::new(200)));
    assert_eq!(index.find_entry(hash).entry.address(), Address::new(200));

    let stale = index.find_entry(hash);
    assert!(index.update_entry(hash, Address::new(200), Address::new(300)));
    assert!(!index.try_update(&stale, Address::new(400)));
    assert_eq!(index.find_entry(hash).entry.address(), Address::new(300));
}

#[test]
fn test_overflow_chain() {
    let index = MemHashIndex::new(128);
    for tag in 0..20u64 {
        insert(&index, hash_for(11, tag), 64 + tag * 8);
    }
    for tag in 0..20u64 {
        let found = index.find_entry(hash_for(11, tag));
        assert_eq!(found.entry.address(), Address::new(64 + tag * 8));
    }

    let stats = index.dump_distribution();
    assert_eq!(stats.used_entries, 20);
    assert_eq!(stats.buckets_with_entries, 1);
    assert_eq!(stats.buckets_with_overflow, 1);
    assert_eq!(stats.overflow_buckets, 2);
}

#[test]
fn test_garbage_collect_below_begin() {
    let index = MemHashIndex::new(128);
    insert(&index, hash_for(1, 1), 64);
    insert(&index, hash_for(2, 1), 1000);
    insert(&index, hash_for(3, 1), 5000);

    assert_eq!(index.garbage_collect(Address::new(2000)), 2);
    assert!(!index.find_entry(hash_for(1, 1)).found());
    assert!(!index.find_entry(hash_for(2, 1)).found());
    assert!(index.find_entry(hash_for(3, 1)).found());
}

#[test]
fn test_clear_tentative_entries_in_overflow() {
    let index = MemHashIndex::new(128);
    for tag in 0..7u64 {
        insert(&index, hash_for(4, tag), 64);
    }
    index
        .try_insert_tentative(hash_for(4, 100), Address::new(128))
        .unwrap();
    index
        .try_insert_tentative(hash_for(9, 100), Address::new(128))
        .unwrap();

    assert_eq!(index.clear_tentative_entries(), 2);
    let stats = index.dump_distribution();
    assert_eq!(stats.tentative_entries, 0);
    assert_eq!(stats.used_entries, 7);
}

#[test]
fn test_concurrent_inserts_distinct_tags() {
    let index = Arc::new(MemHashIndex::new(16));
    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for i in 0..50u64 {
                    let hash = hash_for(i % 16, t * 1000 + i);
                    loop {
                        if let Some(slot) = index.try_insert_tentative(hash, Address::new(64 + i)) {
                            assert!(index.confirm_entry(hash, slot));
                            break;
                        }
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..4u64 {
        for i in 0..50u64 {
            assert!(index.find_entry(hash_for(i % 16, t * 1000 + i)).found());
        }
    }
    assert_eq!(index.dump_distribution().used_entries, 200);
}

#[test]
fn test_grow_splits_chains() {
    let index = MemHashIndex::new(4);
    // Chain in bucket 1, tag 3: 300 (high half) -> 200 (low half) -> 100 (on disk)
    let records: HashMap<u64, TracedRecord> = [
        (
            300,
            TracedRecord {
                hash: hash_for(1 | 4, 3),
                previous: Address::new(200),
            },
        ),
        (
            200,
            TracedRecord {
                hash: hash_for(1, 3),
                previous: Address::new(100),
            },
        ),
    ]
    .into_iter()
    .collect();
    insert(&index, hash_for(1, 3), 300);
    // Chain fully on disk.
    insert(&index, hash_for(2, 8), 90);

    let (result, retired) = index.grow(|address| records.get(&address.control()).copied());
    assert_eq!(result.old_size, 4);
    assert_eq!(result.new_size, 8);
    assert_eq!(result.entries_migrated, 4);
    assert_eq!(retired.table.size(), 4);
    assert_eq!(index.size(), 8);

    assert_eq!(
        index.find_entry(hash_for(1, 3)).entry.address(),
        Address::new(200)
    );
    assert_eq!(
        index.find_entry(hash_for(5, 3)).entry.address(),
        Address::new(300)
    );
    assert_eq!(
        index.find_entry(hash_for(2, 8)).entry.address(),
        Address::new(90)
    );
    assert_eq!(
        index.find_entry(hash_for(6, 8)).entry.address(),
        Address::new(90)
    );
}

#[test]
fn test_grow_hands_retired_version_to_caller() {
    let index = MemHashIndex::new(4);
    insert(&index, hash_for(1, 3), 64);
    let before: *const super::TableVersion = index.active();

    let (_, retired) = index.grow(|_| None);
    // The index keeps no reference; the caller decides when it is released.
    assert_eq!(Arc::strong_count(&retired), 1);
    assert!(std::ptr::eq(Arc::as_ptr(&retired), before));
    assert_eq!(index.active().table.size(), 8);
    assert!(index.find_entry(hash_for(5, 3)).found());
}

#[test]
fn test_grow_drops_tentative_entries() {
    let index = MemHashIndex::new(4);
    index
        .try_insert_tentative(hash_for(0, 1), Address::new(64))
        .unwrap();
    let (result, _) = index.grow(|_| None);
    assert_eq!(result.entries_migrated, 0);
    assert_eq!(index.dump_distribution().used_entries, 0);
}

#[test]
fn test_snapshot_recover_roundtrip() {
    let rt = runtime();
    let index = MemHashIndex::new(64);
    for tag in 0..12u64 {
        insert(&index, hash_for(7, tag), 64 + tag * 64);
    }
    insert(&index, hash_for(30, 5), 8192);
    // In flight at "crash" time.
    index
        .try_insert_tentative(hash_for(40, 6), Address::new(9000))
        .unwrap();

    let snapshot = index.snapshot();
    let device = Arc::new(MemoryDevice::new());
    let token = Uuid::new_v4();
    let meta = rt.block_on(snapshot.write_to(&*device, token)).unwrap();
    assert_eq!(meta.table_size, 64);
    assert_eq!(meta.num_ht_bytes, 64 * 64);
    assert_eq!(meta.overflow_offset % 512, 0);
    assert_eq!(meta.num_overflow_buckets, 1);

    let restored = MemHashIndex::new(64);
    let chunks = restored
        .recover(&meta, Arc::clone(&device), rt.handle(), 8)
        .unwrap();
    assert_eq!(chunks, 8);

    for tag in 0..12u64 {
        assert_eq!(
            restored.find_entry(hash_for(7, tag)).entry.address(),
            Address::new(64 + tag * 64)
        );
    }
    assert!(restored.find_entry(hash_for(30, 5)).found());
    let stats = restored.dump_distribution();
    assert_eq!(stats.tentative_entries, 0);
    assert_eq!(stats.used_entries, 13);
}

#[test]
fn test_recover_rejects_table_size_mismatch() {
    let rt = runtime();
    let index = MemHashIndex::new(64);
    insert(&index, hash_for(1, 1), 64);
    let device = Arc::new(MemoryDevice::new());
    let meta = rt
        .block_on(index.snapshot().write_to(&*device, Uuid::new_v4()))
        .unwrap();

    let wrong = MemHashIndex::new(128);
    let err = wrong.recover(&meta, device, rt.handle(), 4).unwrap_err();
    assert!(matches!(
        err,
        KvError::TableSizeMismatch {
            expected: 128,
            found: 64
        }
    ));
}

#[test]
fn test_recovery_chunk_count() {
    use crate::index::recovery_chunk_count;

    assert_eq!(recovery_chunk_count(64 * 1024, 1024, 1), 1);
    assert_eq!(recovery_chunk_count(64 * 1024, 1024, 5), 8);
    assert_eq!(recovery_chunk_count(64 * 4, 4, 16), 4);
    // 16 GiB of buckets needs at least 8 chunks to stay under 32-bit transfers.
    let total = 1u64 << 34;
    let chunks = recovery_chunk_count(total, total / 64, 1);
    assert_eq!(chunks, 8);
    assert!(total / chunks <= u64::from(u32::MAX));
}

#[test]
fn test_bucket_words_survive_snapshot() {
    let index = MemHashIndex::new(2);
    insert(&index, hash_for(1, 77), 4096);
    let snapshot = index.snapshot();
    let word = u64::from_le_bytes(snapshot.main[64..72].try_into().unwrap());
    let version = index.current();
    assert_eq!(
        word,
        version.table.bucket_at(1).entries[0]
            .load(Ordering::Acquire)
            .control()
    );
    assert_eq!(snapshot.main.len(), 2 * HashBucket::SERIALIZED_SIZE);
}
