//! Device failure tests
//!
//! Failed reads of pending operations are retried according to the store's
//! `ReadRetryPolicy`; failed log flushes surface as I/O errors and can be
//! retried.

mod common;

use std::sync::Arc;

use hybridkv::{FasterKv, KvConfig, KvError, MemoryDevice, ReadRetryPolicy, Status};

use common::{as_u64, Counters, FaultInjectionDevice, SharedDevice};

type Faulty = SharedDevice<FaultInjectionDevice<MemoryDevice>>;

fn faulty_store(policy: ReadRetryPolicy) -> (Arc<FasterKv<Counters, Faulty>>, Arc<FaultInjectionDevice<MemoryDevice>>) {
    let device = Arc::new(FaultInjectionDevice::new(MemoryDevice::new()));
    let store = FasterKv::new(
        KvConfig::new(128, 1 << 16)
            .with_page_size_bits(12)
            .with_read_retry(policy),
        Counters::default(),
        SharedDevice(Arc::clone(&device)),
    )
    .unwrap();
    (store, device)
}

#[test]
fn test_read_succeeds_after_transient_failures() {
    let (store, device) = faulty_store(ReadRetryPolicy::with_attempts(4));
    let mut session = store.start_session().unwrap();
    session.upsert(&1, &11, ());
    store.flush_and_evict_all().unwrap();

    device.fail_next_reads(2);
    let reads_before = device.read_count();
    let mut output = None;
    assert_eq!(session.read(&1, 0, &mut output, ()), Status::Pending);
    assert!(session.complete_pending(true));

    let completion = store.functions().last_read().unwrap();
    assert_eq!(completion.status, Status::Ok);
    assert_eq!(completion.output.as_deref().map(as_u64), Some(11));
    assert!(device.read_count() - reads_before >= 3);
    assert!(session.take_last_error().is_none());
}

#[test]
fn test_read_fails_without_retry() {
    let (store, device) = faulty_store(ReadRetryPolicy::no_retry());
    let mut session = store.start_session().unwrap();
    session.upsert(&1, &11, ());
    store.flush_and_evict_all().unwrap();

    device.fail_next_reads(1);
    let mut output = None;
    assert_eq!(session.read(&1, 0, &mut output, ()), Status::Pending);
    assert!(session.complete_pending(true));

    let completion = store.functions().last_read().unwrap();
    assert_eq!(completion.status, Status::Error);
    assert_eq!(completion.output, None);
    assert!(matches!(
        session.take_last_error(),
        Some(KvError::ReadFailed { attempts: 1, .. })
    ));

    // The record itself is intact.
    assert_eq!(session.read(&1, 0, &mut output, ()), Status::Pending);
    assert!(session.complete_pending(true));
    let completion = store.functions().last_read().unwrap();
    assert_eq!(completion.status, Status::Ok);
}

#[test]
fn test_rmw_reports_exhausted_retries() {
    let (store, device) = faulty_store(ReadRetryPolicy::with_attempts(2));
    let mut session = store.start_session().unwrap();
    session.upsert(&5, &1, ());
    store.flush_and_evict_all().unwrap();

    device.fail_next_reads(2);
    assert_eq!(session.rmw(&5, 1, ()), Status::Pending);
    assert!(session.complete_pending(true));
    assert_eq!(
        store.functions().rmws.lock().last().copied(),
        Some((5, Status::Error))
    );
    assert!(matches!(
        session.take_last_error(),
        Some(KvError::ReadFailed { attempts: 2, .. })
    ));
}

#[test]
fn test_failed_flush_can_be_retried() {
    let (store, device) = faulty_store(ReadRetryPolicy::no_retry());
    let mut session = store.start_session().unwrap();
    for key in 0..100u64 {
        session.upsert(&key, &key, ());
    }

    device.inject_write_error_at(device.write_count() + 1);
    assert!(matches!(store.flush_and_evict_all(), Err(KvError::Io(_))));

    store.flush_and_evict_all().unwrap();
    for key in [0u64, 42, 99] {
        let mut output = None;
        assert_eq!(session.read(&key, 0, &mut output, ()), Status::Pending);
        assert!(session.complete_pending(true));
        let completion = store.functions().last_read().unwrap();
        assert_eq!(completion.output.as_deref().map(as_u64), Some(key));
    }
}
