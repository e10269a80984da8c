//! Shared test utilities: fault injection, shared devices and record logic.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use hybridkv::device::SyncStorageDevice;
use hybridkv::{CommitPoint, Functions, Status};

/// A fault-injection wrapper around any `SyncStorageDevice`.
///
/// Allows deterministic injection of:
/// - read errors for the next N reads
/// - a write error at a specific operation count
pub struct FaultInjectionDevice<D> {
    inner: D,
    /// Total number of read_sync calls observed so far.
    read_count: AtomicU64,
    /// Remaining reads that fail before reads succeed again.
    failing_reads: AtomicU64,
    /// Total number of write_sync calls observed so far.
    write_count: AtomicU64,
    /// When non-zero, the Nth write (1-based) will return an I/O error.
    fail_write_at: AtomicU64,
}

impl<D: SyncStorageDevice> FaultInjectionDevice<D> {
    /// Wrap an existing device for fault injection.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            read_count: AtomicU64::new(0),
            failing_reads: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            fail_write_at: AtomicU64::new(0),
        }
    }

    /// Make the next `n` reads return `io::ErrorKind::Other`.
    pub fn fail_next_reads(&self, n: u64) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Make the Nth write (1-based) return `io::ErrorKind::Other`.
    pub fn inject_write_error_at(&self, operation_n: u64) {
        self.fail_write_at.store(operation_n, Ordering::SeqCst);
    }

    /// Return the total number of read_sync calls observed.
    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::SeqCst)
    }

    /// Return the total number of write_sync calls observed.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }
}

impl<D: SyncStorageDevice> SyncStorageDevice for FaultInjectionDevice<D> {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_count.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if failing.is_ok() {
            return Err(io::Error::other(format!("injected read error at operation {n}")));
        }
        self.inner.read_sync(offset, buf)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let n = self.write_count.fetch_add(1, Ordering::SeqCst) + 1;
        let target = self.fail_write_at.load(Ordering::SeqCst);
        if target != 0 && n == target {
            return Err(io::Error::other(format!(
                "injected write error at operation {n}"
            )));
        }
        self.inner.write_sync(offset, buf)
    }

    fn flush_sync(&self) -> io::Result<()> {
        self.inner.flush_sync()
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.inner.truncate_sync(size)
    }

    fn size_sync(&self) -> io::Result<u64> {
        self.inner.size_sync()
    }

    fn sector_size(&self) -> usize {
        self.inner.sector_size()
    }
}

/// A device handle that several stores (or the test itself) can share.
pub struct SharedDevice<D>(pub Arc<D>);

impl<D> Clone for SharedDevice<D> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<D: SyncStorageDevice> SyncStorageDevice for SharedDevice<D> {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read_sync(offset, buf)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        self.0.write_sync(offset, buf)
    }

    fn flush_sync(&self) -> io::Result<()> {
        self.0.flush_sync()
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.0.truncate_sync(size)
    }

    fn size_sync(&self) -> io::Result<u64> {
        self.0.size_sync()
    }

    fn sector_size(&self) -> usize {
        self.0.sector_size()
    }
}

/// Completion record kept by [`Recorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion<K, V> {
    pub key: K,
    pub output: Option<V>,
    pub status: Status,
}

/// Last-writer-wins values with additive RMW, recording every completion.
pub struct Recorder<K> {
    pub reads: Mutex<Vec<Completion<K, Vec<u8>>>>,
    pub rmws: Mutex<Vec<(K, Status)>>,
    pub upserts: Mutex<Vec<(K, Status)>>,
    pub deletes: Mutex<Vec<(K, Status)>>,
    pub commits: Mutex<Vec<(Uuid, CommitPoint)>>,
}

impl<K> Default for Recorder<K> {
    fn default() -> Self {
        Self {
            reads: Mutex::new(Vec::new()),
            rmws: Mutex::new(Vec::new()),
            upserts: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
        }
    }
}

impl<K> Recorder<K> {
    /// Last completed read.
    pub fn last_read(&self) -> Option<Completion<K, Vec<u8>>>
    where
        K: Clone,
    {
        self.reads.lock().last().cloned()
    }
}

/// Recorder over `u64` keys and `u64` values; RMW adds the input.
pub type Counters = Recorder<u64>;

impl Functions for Recorder<u64> {
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
        *new_value = old.wrapping_add(*input);
        true
    }

    fn in_place_updater(&self, _key: &u64, input: &u64, value: &mut u64, _ctx: &()) -> bool {
        *value = value.wrapping_add(*input);
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
        self.reads.lock().push(Completion {
            key: *key,
            output: output.map(|v| v.to_le_bytes().to_vec()),
            status,
        });
    }

    fn upsert_completion_callback(&self, key: &u64, _value: &u64, _ctx: (), status: Status) {
        self.upserts.lock().push((*key, status));
    }

    fn rmw_completion_callback(&self, key: &u64, _input: &u64, _ctx: (), status: Status) {
        self.rmws.lock().push((*key, status));
    }

    fn delete_completion_callback(&self, key: &u64, _ctx: (), status: Status) {
        self.deletes.lock().push((*key, status));
    }

    fn checkpoint_completion_callback(&self, session_id: Uuid, commit_point: &CommitPoint) {
        self.commits.lock().push((session_id, commit_point.clone()));
    }
}

/// Decode a value recorded by [`Recorder<u64>`].
pub fn as_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}
