use super::*;
use crate::codec::RawBytes;
use crate::device::MemoryDevice;
use crate::status::Status;
use crate::store::SimpleFunctions;

/// Counter semantics: RMW adds the input to the stored value.
#[derive(Default)]
struct Counter {
    reads: Mutex<Vec<(u64, Option<u64>, Status)>>,
    rmws: Mutex<Vec<(u64, Status)>>,
    commits: Mutex<Vec<(Uuid, CommitPoint)>>,
}

impl Functions for Counter {
    type Key = u64;
    type Value = u64;
    type Input = u64;
    type Output = Option<u64>;
    type Context = ();

    fn single_reader(&self, _key: &u64, _input: &u64, value: &u64, output: &mut Option<u64>, _ctx: &()) {
        *output = Some(*value);
    }

    fn initial_updater(&self, _key: &u64, input: &u64, value: &mut u64, _ctx: &()) -> bool {
        *value = *input;
        true
    }

    fn copy_updater(&self, _key: &u64, input: &u64, old: &u64, new_value: &mut u64, _ctx: &()) -> bool {
        *new_value = old + input;
        true
    }

    fn in_place_updater(&self, _key: &u64, input: &u64, value: &mut u64, _ctx: &()) -> bool {
        *value += input;
        true
    }

    fn read_completion_callback(
        &self,
        key: &u64,
        _input: &u64,
        output: &Option<u64>,
        _ctx: (),
        status: Status,
    ) {
        self.reads.lock().push((*key, *output, status));
    }

    fn rmw_completion_callback(&self, key: &u64, _input: &u64, _ctx: (), status: Status) {
        self.rmws.lock().push((*key, status));
    }

    fn checkpoint_completion_callback(&self, session_id: Uuid, commit_point: &CommitPoint) {
        self.commits.lock().push((session_id, commit_point.clone()));
    }
}

fn small_config() -> KvConfig {
    KvConfig::new(128, 1 << 16).with_page_size_bits(12)
}

fn counter_store() -> Arc<FasterKv<Counter, MemoryDevice>> {
    FasterKv::new(small_config(), Counter::default(), MemoryDevice::new()).unwrap()
}

fn read_now(session: &mut Session<Counter, MemoryDevice>, key: u64) -> (Status, Option<u64>) {
    let mut output = None;
    let status = session.read(&key, 0, &mut output, ());
    (status, output)
}

/// Read and drain; the result comes from the completion callback.
fn read_drained(
    store: &FasterKv<Counter, MemoryDevice>,
    session: &mut Session<Counter, MemoryDevice>,
    key: u64,
) -> (Status, Option<u64>) {
    let (status, output) = read_now(session, key);
    if status != Status::Pending {
        return (status, output);
    }
    assert!(session.complete_pending(true));
    let (_, output, status) = *store.functions().reads.lock().last().unwrap();
    (status, output)
}

#[test]
fn test_upsert_read_delete() {
    let store = counter_store();
    let mut session = store.start_session().unwrap();

    assert_eq!(read_now(&mut session, 1), (Status::NotFound, None));
    assert_eq!(session.upsert(&1, &10, ()), Status::Ok);
    assert_eq!(read_now(&mut session, 1), (Status::Ok, Some(10)));
    assert_eq!(session.delete(&1, ()), Status::Ok);
    assert_eq!(read_now(&mut session, 1), (Status::NotFound, None));
    assert_eq!(session.delete(&1, ()), Status::NotFound);

    assert_eq!(session.upsert(&1, &11, ()), Status::Ok);
    assert_eq!(read_now(&mut session, 1), (Status::Ok, Some(11)));
    assert_eq!(session.serial_num(), 8);
}

#[test]
fn test_mutable_update_is_in_place() {
    let store = counter_store();
    let mut session = store.start_session().unwrap();

    session.upsert(&3, &1, ());
    let tail = store.log_stats().tail_address;
    session.upsert(&3, &2, ());
    assert_eq!(session.rmw(&3, 5, ()), Status::Ok);
    assert_eq!(store.log_stats().tail_address, tail);
    assert_eq!(read_now(&mut session, 3), (Status::Ok, Some(7)));
}

#[test]
fn test_rmw_in_fuzzy_region_waits_for_in_place_writer() {
    let store = counter_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.rmw(&7, 1, ()), Status::Ok);

    let worker = store.epoch().register().unwrap();
    let guard = worker.guard();
    let parts = FasterKv::<Counter, MemoryDevice>::key_parts(&7).unwrap();
    let address = store.index.find_entry(parts.hash).entry.address();
    let lock = store.hlog().lock_record(address).unwrap();
    let header = store.hlog().record_header(address).unwrap();

    // The worker holding the lock has not observed this shift.
    store.hlog().shift_read_only_address(store.hlog().tail_address());
    assert!(store.hlog().is_fuzzy(address));
    assert!(!store.hlog().is_mutable(address));

    // A copy taken now would miss the lagging worker's write.
    let attempt = store.internal_rmw(&parts, &1, &()).unwrap();
    assert_eq!(attempt.status, OperationStatus::RetryLater);

    let bytes = FasterKv::<Counter, MemoryDevice>::encode_value(&2).unwrap();
    store.write_in_place(address, &header, &bytes).unwrap();
    drop(lock);
    drop(guard);

    assert_eq!(session.rmw(&7, 1, ()), Status::Ok);
    assert!(!store.hlog().is_fuzzy(address));
    assert_eq!(read_now(&mut session, 7), (Status::Ok, Some(3)));
}

#[test]
fn test_read_in_fuzzy_region_waits_for_record_lock() {
    let store = counter_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.upsert(&4, &10, ()), Status::Ok);

    let worker = store.epoch().register().unwrap();
    let guard = worker.guard();
    let parts = FasterKv::<Counter, MemoryDevice>::key_parts(&4).unwrap();
    let address = store.index.find_entry(parts.hash).entry.address();
    let lock = store.hlog().lock_record(address).unwrap();
    let header = store.hlog().record_header(address).unwrap();
    store.hlog().shift_read_only_address(store.hlog().tail_address());
    assert!(store.hlog().is_fuzzy(address));

    let reader = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let ctx = store.epoch().register().unwrap();
            let _guard = ctx.guard();
            let parts = FasterKv::<Counter, MemoryDevice>::key_parts(&4).unwrap();
            loop {
                let mut output = None;
                let attempt = store.internal_read(&parts, &0, &mut output, &()).unwrap();
                if attempt.status != OperationStatus::RetryNow {
                    return (attempt.status, output);
                }
            }
        })
    };

    thread::sleep(std::time::Duration::from_millis(20));
    let bytes = FasterKv::<Counter, MemoryDevice>::encode_value(&11).unwrap();
    store.write_in_place(address, &header, &bytes).unwrap();
    drop(lock);
    drop(guard);

    assert_eq!(reader.join().unwrap(), (OperationStatus::Success, Some(11)));
}

#[test]
fn test_length_change_appends_new_version() {
    let store = FasterKv::new(
        small_config(),
        SimpleFunctions::<RawBytes, RawBytes>::new(),
        MemoryDevice::new(),
    )
    .unwrap();
    let mut session = store.start_session().unwrap();
    let key = RawBytes::from(b"key".to_vec());

    session.upsert(&key, &RawBytes::from(b"ab".to_vec()), ());
    let tail = store.log_stats().tail_address;
    session.upsert(&key, &RawBytes::from(b"abcdefghijkl".to_vec()), ());
    assert!(store.log_stats().tail_address > tail);

    let mut output = None;
    assert_eq!(session.read(&key, RawBytes::default(), &mut output, ()), Status::Ok);
    assert_eq!(output, Some(RawBytes::from(b"abcdefghijkl".to_vec())));
}

#[test]
fn test_rmw_creates_then_updates() {
    let store = counter_store();
    let mut session = store.start_session().unwrap();

    assert_eq!(session.rmw(&9, 4, ()), Status::Ok);
    assert_eq!(session.rmw(&9, 4, ()), Status::Ok);
    assert_eq!(read_now(&mut session, 9), (Status::Ok, Some(8)));
    assert_eq!(store.functions().rmws.lock().len(), 2);
}

#[test]
fn test_read_goes_pending_after_eviction() {
    let store = counter_store();
    let mut session = store.start_session().unwrap();
    for key in 0..50u64 {
        session.upsert(&key, &(key * 10), ());
    }
    store.flush_and_evict_all().unwrap();

    let (status, output) = read_now(&mut session, 17);
    assert_eq!(status, Status::Pending);
    assert_eq!(output, None);
    assert_eq!(session.pending_count(), 1);
    assert!(session.complete_pending(true));
    assert_eq!(
        store.functions().reads.lock().last().copied(),
        Some((17, Some(170), Status::Ok))
    );

    assert_eq!(read_drained(&store, &mut session, 1000), (Status::NotFound, None));
}

#[test]
fn test_rmw_on_disk_record() {
    let store = counter_store();
    let mut session = store.start_session().unwrap();
    session.upsert(&5, &100, ());
    store.flush_and_evict_all().unwrap();

    assert_eq!(session.rmw(&5, 1, ()), Status::Pending);
    assert!(session.complete_pending(true));
    assert_eq!(store.functions().rmws.lock().last().copied(), Some((5, Status::Ok)));
    // The new version is resident again.
    assert_eq!(read_now(&mut session, 5), (Status::Ok, Some(101)));
}

#[test]
fn test_tombstones_survive_eviction() {
    let store = counter_store();
    let mut session = store.start_session().unwrap();
    session.upsert(&8, &1, ());
    session.delete(&8, ());
    session.upsert(&9, &2, ());
    store.flush_and_evict_all().unwrap();

    assert_eq!(read_drained(&store, &mut session, 8), (Status::NotFound, None));
    assert_eq!(read_drained(&store, &mut session, 9), (Status::Ok, Some(2)));

    // Deleting an on-disk key appends a resident tombstone.
    assert_eq!(session.delete(&9, ()), Status::Ok);
    assert_eq!(read_now(&mut session, 9), (Status::NotFound, None));
}

#[test]
fn test_grow_index_keeps_every_key() {
    let store = counter_store();
    let mut session = store.start_session().unwrap();
    for key in 0..200u64 {
        session.upsert(&key, &key, ());
    }
    store.flush_and_evict(Address::new(2048)).unwrap();

    let result = store.grow_index().unwrap();
    assert_eq!(result.old_size, 128);
    assert_eq!(result.new_size, 256);
    assert_eq!(store.index_size(), 256);

    for key in 0..200u64 {
        assert_eq!(read_drained(&store, &mut session, key), (Status::Ok, Some(key)));
    }
}

#[test]
fn test_shift_begin_address_drops_old_records() {
    let store = counter_store();
    let mut session = store.start_session().unwrap();
    session.upsert(&1, &1, ());
    let cut = store.log_stats().tail_address;
    session.upsert(&2, &2, ());

    store.shift_begin_address(cut).unwrap();
    assert_eq!(store.log_stats().begin_address, cut);
    assert_eq!(read_drained(&store, &mut session, 1), (Status::NotFound, None));
    assert_eq!(read_drained(&store, &mut session, 2), (Status::Ok, Some(2)));
}

#[test]
fn test_compact_keeps_live_keys_and_drops_dead_ones() {
    let store = counter_store();
    let mut session = store.start_session().unwrap();
    for key in 0..100u64 {
        session.upsert(&key, &key, ());
    }
    for key in 0..10u64 {
        assert_eq!(session.delete(&key, ()), Status::Ok);
    }
    for key in 10..20u64 {
        session.upsert(&key, &(key + 1000), ());
    }
    let cut = store.log_stats().tail_address;
    store.flush_and_evict(cut).unwrap();
    for key in 20..30u64 {
        session.upsert(&key, &(key + 2000), ());
    }

    let stats = store.compact(cut).unwrap();
    assert_eq!(stats.begin_address, cut);
    assert_eq!(stats.records_scanned, 100);
    assert_eq!(stats.tombstones_dropped, 10);
    assert_eq!(stats.records_superseded, 10);
    assert_eq!(stats.records_copied, 80);
    assert_eq!(store.log_stats().begin_address, cut);

    for key in 0..10u64 {
        assert_eq!(read_drained(&store, &mut session, key), (Status::NotFound, None));
    }
    for key in 10..20u64 {
        assert_eq!(read_drained(&store, &mut session, key), (Status::Ok, Some(key + 1000)));
    }
    for key in 20..30u64 {
        assert_eq!(read_drained(&store, &mut session, key), (Status::Ok, Some(key + 2000)));
    }
    for key in 30..100u64 {
        assert_eq!(read_drained(&store, &mut session, key), (Status::Ok, Some(key)));
    }
    assert_eq!(session.rmw(&50, 1, ()), Status::Ok);
    assert_eq!(read_drained(&store, &mut session, 50), (Status::Ok, Some(51)));
}

#[test]
fn test_compact_cut_moves_down_to_record_boundary() {
    let store = counter_store();
    let mut session = store.start_session().unwrap();
    for key in 1..=3u64 {
        session.upsert(&key, &(key * 10), ());
    }
    let parts = FasterKv::<Counter, MemoryDevice>::key_parts(&2).unwrap();
    let second = store.index.find_entry(parts.hash).entry.address();
    store.flush_and_evict_all().unwrap();

    let stats = store.compact(second + 8).unwrap();
    assert_eq!(stats.begin_address, second);
    assert_eq!(stats.records_scanned, 1);
    assert_eq!(stats.records_copied, 1);
    for key in 1..=3u64 {
        assert_eq!(read_drained(&store, &mut session, key), (Status::Ok, Some(key * 10)));
    }
}

#[test]
fn test_compact_stays_below_read_only_region() {
    let store = counter_store();
    let mut session = store.start_session().unwrap();
    session.upsert(&1, &1, ());
    let begin = store.log_stats().begin_address;

    // Nothing is read-only yet, so there is nothing to compact.
    let stats = store.compact(store.log_stats().tail_address).unwrap();
    assert_eq!(stats.begin_address, begin);
    assert_eq!(stats.records_scanned, 0);
    assert_eq!(read_now(&mut session, 1), (Status::Ok, Some(1)));
}

#[test]
fn test_record_larger_than_page_is_an_error() {
    let store = FasterKv::new(
        small_config(),
        SimpleFunctions::<u64, RawBytes>::new(),
        MemoryDevice::new(),
    )
    .unwrap();
    let mut session = store.start_session().unwrap();

    let status = session.upsert(&1, &RawBytes::from(vec![7u8; 5000]), ());
    assert_eq!(status, Status::Error);
    assert!(matches!(
        session.take_last_error(),
        Some(KvError::RecordTooLarge { page_size: 4096, .. })
    ));
    assert!(session.take_last_error().is_none());
}

#[test]
fn test_checkpoint_notifies_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let store = FasterKv::new(
        small_config().with_checkpoint_dir(dir.path()),
        Counter::default(),
        MemoryDevice::new(),
    )
    .unwrap();
    let mut session = store.start_session().unwrap();
    session.upsert(&1, &1, ());
    session.upsert(&2, &2, ());

    assert_eq!(store.version(), 0);
    store.checkpoint().unwrap();
    assert_eq!(store.version(), 1);

    session.refresh();
    let commits = store.functions().commits.lock().clone();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].0, session.id());
    assert_eq!(commits[0].1.until_serial, 2);

    // Records of the closed version are no longer updated in place.
    let tail = store.log_stats().tail_address;
    session.upsert(&1, &10, ());
    assert!(store.log_stats().tail_address > tail);
    assert_eq!(read_drained(&store, &mut session, 1), (Status::Ok, Some(10)));
}

#[test]
fn test_continue_unknown_session() {
    let store = counter_store();
    let id = Uuid::new_v4();
    assert!(matches!(
        store.continue_session(id),
        Err(KvError::UnknownSession(missing)) if missing == id
    ));
}

#[test]
fn test_object_log_requires_device() {
    let result = FasterKv::new(
        small_config().with_object_log(true),
        Counter::default(),
        MemoryDevice::new(),
    );
    assert!(matches!(result, Err(KvError::Config(ConfigError::MissingField(_)))));

    let result = FasterKv::new(
        KvConfig::new(100, 1 << 16),
        Counter::default(),
        MemoryDevice::new(),
    );
    assert!(matches!(result, Err(KvError::Config(ConfigError::InvalidValue { .. }))));
}
