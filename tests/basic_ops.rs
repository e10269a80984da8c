//! Basic operation tests for hybridkv
//!
//! Upsert, read, RMW and delete through a session, both on resident records
//! and on records that were paged out to the device.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use hybridkv::{FasterKv, Functions, KvConfig, MemoryDevice, Session, Status};

use common::{as_u64, Counters};

type Store = FasterKv<Counters, MemoryDevice>;

fn create_store(config: KvConfig) -> Arc<Store> {
    FasterKv::new(config, Counters::default(), MemoryDevice::new()).unwrap()
}

/// Read `key`, draining a pending read; the value comes from the completion callback.
fn read(store: &Store, session: &mut Session<Counters, MemoryDevice>, key: u64) -> (Status, Option<u64>) {
    let mut output = None;
    let status = session.read(&key, 0, &mut output, ());
    if status != Status::Pending {
        return (status, output);
    }
    assert!(session.complete_pending(true));
    let completion = store.functions().last_read().unwrap();
    assert_eq!(completion.key, key);
    (completion.status, completion.output.as_deref().map(as_u64))
}

// ============ Two-byte keys ============

/// Plain values over two-byte keys, remembering pending read results.
#[derive(Default)]
struct PairFunctions {
    completed: Mutex<Vec<([u8; 2], Option<[u8; 2]>, Status)>>,
}

impl Functions for PairFunctions {
    type Key = [u8; 2];
    type Value = [u8; 2];
    type Input = ();
    type Output = Option<[u8; 2]>;
    type Context = ();

    fn single_reader(&self, _key: &[u8; 2], _input: &(), value: &[u8; 2], output: &mut Option<[u8; 2]>, _ctx: &()) {
        *output = Some(*value);
    }

    fn initial_updater(&self, _key: &[u8; 2], _input: &(), _value: &mut [u8; 2], _ctx: &()) -> bool {
        false
    }

    fn copy_updater(&self, _key: &[u8; 2], _input: &(), old: &[u8; 2], new_value: &mut [u8; 2], _ctx: &()) -> bool {
        *new_value = *old;
        true
    }

    fn in_place_updater(&self, _key: &[u8; 2], _input: &(), _value: &mut [u8; 2], _ctx: &()) -> bool {
        true
    }

    fn read_completion_callback(
        &self,
        key: &[u8; 2],
        _input: &(),
        output: &Option<[u8; 2]>,
        _ctx: (),
        status: Status,
    ) {
        self.completed.lock().push((*key, *output, status));
    }
}

fn read_pair(
    store: &FasterKv<PairFunctions, MemoryDevice>,
    session: &mut Session<PairFunctions, MemoryDevice>,
    key: [u8; 2],
) -> (Status, Option<[u8; 2]>) {
    let mut output = None;
    match session.read(&key, (), &mut output, ()) {
        Status::Pending => {
            assert!(session.complete_pending(true));
            let (_, output, status) = *store.functions().completed.lock().last().unwrap();
            (status, output)
        }
        status => (status, output),
    }
}

fn run_pair_scenario(evict: bool) {
    let store = FasterKv::new(
        KvConfig::new(128, 1 << 16).with_page_size_bits(12),
        PairFunctions::default(),
        MemoryDevice::new(),
    )
    .unwrap();
    let mut session = store.start_session().unwrap();

    assert_eq!(session.upsert(&[13, 14], &[23, 24], ()), Status::Ok);
    if evict {
        store.flush_and_evict_all().unwrap();
    }
    assert_eq!(read_pair(&store, &mut session, [13, 14]), (Status::Ok, Some([23, 24])));

    assert_eq!(session.delete(&[13, 14], ()), Status::Ok);
    if evict {
        store.flush_and_evict_all().unwrap();
    }
    assert_eq!(read_pair(&store, &mut session, [13, 14]), (Status::NotFound, None));

    assert_eq!(session.upsert(&[14, 15], &[24, 25], ()), Status::Ok);
    if evict {
        store.flush_and_evict_all().unwrap();
    }
    assert_eq!(read_pair(&store, &mut session, [14, 15]), (Status::Ok, Some([24, 25])));
    assert_eq!(read_pair(&store, &mut session, [13, 14]), (Status::NotFound, None));
}

#[test]
fn test_pair_keys_in_memory() {
    run_pair_scenario(false);
}

#[test]
fn test_pair_keys_paged_out() {
    run_pair_scenario(true);
}

#[test]
fn test_rmw_without_initial_value_is_not_found() {
    let store = FasterKv::new(
        KvConfig::new(128, 1 << 16).with_page_size_bits(12),
        PairFunctions::default(),
        MemoryDevice::new(),
    )
    .unwrap();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.rmw(&[1, 1], (), ()), Status::NotFound);
    assert_eq!(read_pair(&store, &mut session, [1, 1]), (Status::NotFound, None));
}

// ============ u64 keys ============

#[test]
fn test_basic_upsert_read() {
    let store = create_store(KvConfig::new(1024, 1 << 20).with_page_size_bits(14));
    let mut session = store.start_session().unwrap();

    assert_eq!(session.upsert(&42, &100, ()), Status::Ok);
    assert_eq!(read(&store, &mut session, 42), (Status::Ok, Some(100)));
    assert_eq!(read(&store, &mut session, 999), (Status::NotFound, None));
}

#[test]
fn test_idempotent_upsert() {
    let store = create_store(KvConfig::new(1024, 1 << 20).with_page_size_bits(14));
    let mut session = store.start_session().unwrap();

    for _ in 0..3 {
        assert_eq!(session.upsert(&7, &70, ()), Status::Ok);
        assert_eq!(read(&store, &mut session, 7), (Status::Ok, Some(70)));
    }
}

#[test]
fn test_callbacks_fire_once_per_operation() {
    let store = create_store(KvConfig::new(1024, 1 << 20).with_page_size_bits(14));
    let mut session = store.start_session().unwrap();

    session.upsert(&1, &1, ());
    session.rmw(&1, 1, ());
    session.rmw(&2, 5, ());
    session.delete(&1, ());
    session.delete(&1, ());
    store.flush_and_evict_all().unwrap();
    session.rmw(&2, 5, ());
    session.complete_pending(true);

    let functions = store.functions();
    assert_eq!(functions.upserts.lock().len(), 1);
    assert_eq!(
        *functions.rmws.lock(),
        vec![(1, Status::Ok), (2, Status::Ok), (2, Status::Ok)]
    );
    assert_eq!(
        *functions.deletes.lock(),
        vec![(1, Status::Ok), (1, Status::NotFound)]
    );
    assert_eq!(read(&store, &mut session, 2), (Status::Ok, Some(10)));
}

fn run_delete_reinsert(config: KvConfig, n: u64) {
    let store = create_store(config);
    let mut session = store.start_session().unwrap();
    let keys = 10 * n;

    for key in 0..keys {
        assert_eq!(session.upsert(&key, &key, ()), Status::Ok);
    }
    for key in 0..keys {
        assert_eq!(session.delete(&key, ()), Status::Ok);
    }
    for key in 0..keys {
        assert_eq!(session.upsert(&key, &(key + 1_000_000), ()), Status::Ok);
    }
    for key in 0..keys {
        assert_eq!(
            read(&store, &mut session, key),
            (Status::Ok, Some(key + 1_000_000)),
            "key {key}"
        );
    }
}

#[test]
fn test_delete_and_reinsert_in_memory() {
    run_delete_reinsert(KvConfig::new(128, 1 << 22).with_page_size_bits(16), 1000);
}

#[test]
fn test_delete_and_reinsert_across_pages() {
    // 16 frames of 4 KiB: most of the log ends up on the device.
    run_delete_reinsert(KvConfig::new(128, 1 << 16).with_page_size_bits(12), 300);
}

#[test]
fn test_never_written_keys_are_not_found() {
    let store = create_store(KvConfig::new(256, 1 << 16).with_page_size_bits(12));
    let mut session = store.start_session().unwrap();
    for key in (0..2000u64).step_by(2) {
        session.upsert(&key, &key, ());
    }
    for key in (1..2000u64).step_by(2) {
        assert_eq!(read(&store, &mut session, key), (Status::NotFound, None));
    }
}
