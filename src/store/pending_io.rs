//! Pending I/O manager
//!
//! Reads for records below the head address run on a dedicated Tokio runtime
//! owned by a background thread. Sessions submit an [`AsyncIoContext`] together
//! with their own completion sender; the resolved outcome comes back on that
//! channel and is consumed by `complete_pending`.
//!
//! The number of reads in flight is capped. A session over the cap spins,
//! refreshing its epoch between attempts so it never stalls epoch actions.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::config::ReadRetryPolicy;
use crate::device::StorageDevice;
use crate::epoch::EpochContext;
use crate::error::KvError;

use super::resolver::{resolve, AsyncIoContext, ReadOutcome};

/// A finished pending read.
#[derive(Debug)]
pub(crate) struct IoCompletion {
    pub(crate) request_id: u64,
    pub(crate) outcome: ReadOutcome,
}

enum IoRequest {
    Read {
        ctx: AsyncIoContext,
        reply: Sender<IoCompletion>,
    },
    Shutdown,
}

/// Pending I/O manager (runs async I/O in a background thread and reports completions via channels).
pub(crate) struct PendingIoManager<D: StorageDevice> {
    tx: Sender<IoRequest>,
    inflight: Arc<AtomicUsize>,
    max_inflight: usize,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    _marker: std::marker::PhantomData<D>,
}

impl<D: StorageDevice> PendingIoManager<D> {
    pub(crate) fn new(
        device: Arc<D>,
        objects: Option<Arc<dyn StorageDevice>>,
        max_inflight: usize,
        policy: ReadRetryPolicy,
    ) -> Result<Self, KvError> {
        // Dedicated runtime: do not depend on the caller being inside a Tokio runtime.
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("hybridkv-io")
            .enable_all()
            .build()?;
        let (tx, rx) = unbounded::<IoRequest>();
        let inflight = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&inflight);

        let worker = thread::Builder::new()
            .name("hybridkv-io-dispatch".into())
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    match request {
                        IoRequest::Read { ctx, reply } => {
                            let device = Arc::clone(&device);
                            let objects = objects.clone();
                            let counter = Arc::clone(&counter);
                            runtime.spawn(async move {
                                let request_id = ctx.request_id;
                                let outcome =
                                    resolve(ctx, &*device, objects.as_deref(), &policy).await;
                                counter.fetch_sub(1, Ordering::AcqRel);
                                // The session may be gone; its operations died with it.
                                let _ = reply.send(IoCompletion {
                                    request_id,
                                    outcome,
                                });
                            });
                        }
                        IoRequest::Shutdown => break,
                    }
                }
                runtime.shutdown_background();
            })?;

        Ok(Self {
            tx,
            inflight,
            max_inflight: max_inflight.max(1),
            worker: Mutex::new(Some(worker)),
            _marker: std::marker::PhantomData,
        })
    }

    /// Reads currently in flight.
    pub(crate) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> bool {
        let mut current = self.inflight.load(Ordering::Acquire);
        loop {
            if current >= self.max_inflight {
                return false;
            }
            match self.inflight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Submit a pending read, waiting for a free slot under the in-flight cap.
    ///
    /// `epoch` must not be protected on entry; it is refreshed while waiting.
    pub(crate) fn submit(
        &self,
        ctx: AsyncIoContext,
        reply: Sender<IoCompletion>,
        epoch: &EpochContext,
    ) -> Result<(), KvError> {
        while !self.try_acquire() {
            epoch.protect_and_drain();
            epoch.unprotect();
            thread::yield_now();
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                request_id = ctx.request_id,
                inflight = self.inflight(),
                "pending read submitted"
            );
        }
        if self.tx.send(IoRequest::Read { ctx, reply }).is_err() {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            return Err(KvError::Io(io::Error::other("pending I/O worker has stopped")));
        }
        Ok(())
    }
}

impl<D: StorageDevice> Drop for PendingIoManager<D> {
    fn drop(&mut self) {
        let _ = self.tx.send(IoRequest::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::device::{MemoryDevice, SyncStorageDevice};
    use crate::epoch::LightEpoch;
    use crate::record::{encode_record, RecordInfo};
    use std::time::Duration;

    #[test]
    fn test_read_round_trip_through_worker() {
        let device = Arc::new(MemoryDevice::new());
        let record = encode_record(RecordInfo::new(Address::INVALID, 0, false), b"k", b"v1");
        device.write_sync(64, &record).unwrap();

        let manager =
            PendingIoManager::new(device, None, 4, ReadRetryPolicy::no_retry()).unwrap();
        let epoch = Arc::new(LightEpoch::new());
        let ctx = epoch.register().unwrap();
        let (tx, rx) = unbounded();

        let io = AsyncIoContext::new(7, b"k".to_vec(), Address::new(64), Address::new(64), 512, 4096, false);
        manager.submit(io, tx, &ctx).unwrap();

        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(completion.request_id, 7);
        match completion.outcome {
            ReadOutcome::Found(found) => assert_eq!(found.value, b"v1"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(manager.inflight(), 0);
    }

    #[test]
    fn test_cap_is_enforced() {
        let device = Arc::new(MemoryDevice::new());
        let manager =
            PendingIoManager::new(device, None, 2, ReadRetryPolicy::no_retry()).unwrap();
        assert!(manager.try_acquire());
        assert!(manager.try_acquire());
        assert!(!manager.try_acquire());
        manager.inflight.fetch_sub(1, Ordering::AcqRel);
        assert!(manager.try_acquire());
    }
}
