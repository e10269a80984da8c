//! Session management
//!
//! A [`Session`] is one worker's handle on the store. It owns an epoch slot,
//! assigns serial numbers to operations for concurrent prefix recovery, parks
//! operations that need a device read and finishes them in
//! [`Session::complete_pending`].
//!
//! Epoch protection is taken per operation, never across calls, so an idle
//! session does not hold back epoch actions. Operations wait outside
//! protection while a checkpoint or index growth has the store paused.
//!
//! Every operation reports its final status through the matching completion
//! callback exactly once: immediately when it finishes synchronously, or from
//! `complete_pending` when it went pending.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use uuid::Uuid;

use crate::address::Address;
use crate::device::StorageDevice;
use crate::epoch::EpochContext;
use crate::error::KvError;
use crate::status::{OperationStatus, Status};
use crate::store::contexts::{Attempt, KeyParts, PendingOperation, SessionShared};
use crate::store::pending_io::IoCompletion;
use crate::store::resolver::{AsyncIoContext, ReadOutcome};
use crate::store::{FasterKv, Functions};

/// How long `complete_pending(true)` blocks on the completion channel per round.
const COMPLETION_POLL: Duration = Duration::from_millis(1);

/// A worker's session on a [`FasterKv`] store.
pub struct Session<F: Functions, D: StorageDevice> {
    store: Arc<FasterKv<F, D>>,
    epoch: EpochContext,
    id: Uuid,
    shared: Arc<SessionShared>,
    /// Parked operations by request id
    pending: HashMap<u64, PendingOperation<F>>,
    next_request_id: u64,
    completions_tx: Sender<IoCompletion>,
    completions_rx: Receiver<IoCompletion>,
    last_error: Option<KvError>,
    /// Checkpoint generation whose completion callback already ran
    seen_generation: u64,
}

impl<F: Functions, D: StorageDevice> Session<F, D> {
    pub(crate) fn new(store: Arc<FasterKv<F, D>>, id: Uuid, serial: u64) -> Result<Self, KvError> {
        let epoch = store
            .epoch()
            .register()
            .ok_or(KvError::Busy("no free epoch slot for a new session"))?;
        let shared = Arc::new(SessionShared::starting_at(serial));
        store.register_session(id, Arc::clone(&shared));
        let (completions_tx, completions_rx) = unbounded();
        let seen_generation = store.commit_generation();
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(session = %id, serial, slot = epoch.slot(), "session started");
        }
        Ok(Self {
            store,
            epoch,
            id,
            shared,
            pending: HashMap::new(),
            next_request_id: 1,
            completions_tx,
            completions_rx,
            last_error: None,
            seen_generation,
        })
    }

    /// Session id; pass it to `continue_session` after recovery.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Serial number of the last operation issued.
    pub fn serial_num(&self) -> u64 {
        self.shared.serial()
    }

    /// Operations waiting for a device read.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Store this session operates on.
    pub fn store(&self) -> &Arc<FasterKv<F, D>> {
        &self.store
    }

    /// Take the error behind the most recent [`Status::Error`].
    pub fn take_last_error(&mut self) -> Option<KvError> {
        self.last_error.take()
    }

    // ============ Operations ============

    /// Insert or overwrite `key`.
    pub fn upsert(&mut self, key: &F::Key, value: &F::Value, ctx: F::Context) -> Status {
        let status = match FasterKv::<F, D>::key_parts(key) {
            Ok(parts) => {
                let (result, _) = self.run(None, |store| store.internal_upsert(&parts, value, &ctx));
                self.settle(result)
            }
            Err(err) => self.fail_unissued(err),
        };
        self.store
            .functions()
            .upsert_completion_callback(key, value, ctx, status);
        self.check_commits();
        status
    }

    /// Read `key` into `output`.
    ///
    /// Returns [`Status::Pending`] when the record is on the device; the output
    /// is then delivered to `read_completion_callback` by `complete_pending`.
    pub fn read(
        &mut self,
        key: &F::Key,
        input: F::Input,
        output: &mut F::Output,
        ctx: F::Context,
    ) -> Status {
        let parts = match FasterKv::<F, D>::key_parts(key) {
            Ok(parts) => parts,
            Err(err) => {
                let status = self.fail_unissued(err);
                self.store
                    .functions()
                    .read_completion_callback(key, &input, output, ctx, status);
                return status;
            }
        };

        let (result, serial) = self.run(None, |store| {
            store.internal_read(&parts, &input, &mut *output, &ctx)
        });
        let status = match result {
            Ok(attempt) if attempt.status == OperationStatus::RecordOnDisk => {
                match self.go_pending(&parts, attempt.disk_address) {
                    Ok(request_id) => {
                        self.pending.insert(
                            request_id,
                            PendingOperation::Read {
                                key: parts,
                                input,
                                ctx,
                                serial,
                            },
                        );
                        return Status::Pending;
                    }
                    Err(err) => {
                        self.shared.mark_done(serial);
                        self.record_error(err)
                    }
                }
            }
            other => self.settle(other),
        };
        self.store
            .functions()
            .read_completion_callback(key, &input, output, ctx, status);
        self.check_commits();
        status
    }

    /// Read-modify-write `key` with `input`.
    pub fn rmw(&mut self, key: &F::Key, input: F::Input, ctx: F::Context) -> Status {
        let parts = match FasterKv::<F, D>::key_parts(key) {
            Ok(parts) => parts,
            Err(err) => {
                let status = self.fail_unissued(err);
                self.store
                    .functions()
                    .rmw_completion_callback(key, &input, ctx, status);
                return status;
            }
        };

        let (result, serial) = self.run(None, |store| store.internal_rmw(&parts, &input, &ctx));
        self.finish_rmw(parts, input, ctx, serial, result)
    }

    /// Delete `key`.
    pub fn delete(&mut self, key: &F::Key, ctx: F::Context) -> Status {
        let status = match FasterKv::<F, D>::key_parts(key) {
            Ok(parts) => {
                let (result, _) = self.run(None, |store| store.internal_delete(&parts));
                self.settle(result)
            }
            Err(err) => self.fail_unissued(err),
        };
        self.store
            .functions()
            .delete_completion_callback(key, ctx, status);
        self.check_commits();
        status
    }

    /// Finish pending operations whose reads have completed.
    ///
    /// With `wait`, blocks until every pending operation is done. Returns
    /// whether nothing is left pending.
    pub fn complete_pending(&mut self, wait: bool) -> bool {
        loop {
            self.epoch.protect_and_drain();
            self.epoch.unprotect();
            while let Ok(completion) = self.completions_rx.try_recv() {
                self.handle_completion(completion);
            }
            self.check_commits();
            if self.pending.is_empty() {
                return true;
            }
            if !wait {
                return false;
            }
            if let Ok(completion) = self.completions_rx.recv_timeout(COMPLETION_POLL) {
                self.handle_completion(completion);
            }
        }
    }

    /// Let deferred epoch actions run and deliver checkpoint completions.
    pub fn refresh(&mut self) {
        self.epoch.protect_and_drain();
        self.epoch.unprotect();
        self.check_commits();
    }

    // ============ Internals ============

    /// Run one operation under epoch protection until it no longer needs a retry.
    ///
    /// The serial number is taken while still protected, so a checkpoint's
    /// commit point covers exactly the operations that ran in its version.
    /// An operation that goes pending is excluded until it completes.
    fn run<A>(&self, existing: Option<u64>, mut attempt: A) -> (Result<Attempt, KvError>, u64)
    where
        A: FnMut(&FasterKv<F, D>) -> Result<Attempt, KvError>,
    {
        loop {
            while self.store.is_paused() {
                thread::yield_now();
            }
            let guard = self.epoch.guard();
            if self.store.is_paused() {
                drop(guard);
                continue;
            }

            let result = loop {
                match attempt(&self.store) {
                    Ok(a) if a.status == OperationStatus::RetryNow => continue,
                    other => break other,
                }
            };
            if matches!(&result, Ok(a) if a.status == OperationStatus::RetryLater) {
                drop(guard);
                thread::yield_now();
                continue;
            }

            let serial = existing.unwrap_or_else(|| self.shared.next_serial());
            if matches!(&result, Ok(a) if a.status == OperationStatus::RecordOnDisk) {
                self.shared.mark_pending(serial);
            }
            drop(guard);
            return (result, serial);
        }
    }

    fn settle(&mut self, result: Result<Attempt, KvError>) -> Status {
        match result {
            Ok(attempt) => attempt.status.to_status(),
            Err(err) => self.record_error(err),
        }
    }

    fn record_error(&mut self, err: KvError) -> Status {
        tracing::warn!(session = %self.id, error = %err, "operation failed");
        self.last_error = Some(err);
        Status::Error
    }

    /// An operation that failed before reaching the store still consumes a serial.
    fn fail_unissued(&mut self, err: KvError) -> Status {
        self.shared.next_serial();
        self.record_error(err)
    }

    fn go_pending(&mut self, key: &KeyParts<F::Key>, address: Address) -> Result<u64, KvError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let config = self.store.config();
        let io = AsyncIoContext::new(
            request_id,
            key.bytes.clone(),
            address,
            self.store.hlog().begin_address(),
            config.initial_read_size,
            self.store.hlog().page_size() as usize,
            config.object_log,
        );
        self.store
            .pending_io()
            .submit(io, self.completions_tx.clone(), &self.epoch)?;
        Ok(request_id)
    }

    fn finish_rmw(
        &mut self,
        parts: KeyParts<F::Key>,
        input: F::Input,
        ctx: F::Context,
        serial: u64,
        result: Result<Attempt, KvError>,
    ) -> Status {
        let status = match result {
            Ok(attempt) if attempt.status == OperationStatus::RecordOnDisk => {
                match self.go_pending(&parts, attempt.disk_address) {
                    Ok(request_id) => {
                        self.pending.insert(
                            request_id,
                            PendingOperation::Rmw {
                                key: parts,
                                input,
                                ctx,
                                serial,
                                entry: attempt.entry_address,
                            },
                        );
                        return Status::Pending;
                    }
                    Err(err) => {
                        self.shared.mark_done(serial);
                        self.record_error(err)
                    }
                }
            }
            other => {
                self.shared.mark_done(serial);
                self.settle(other)
            }
        };
        self.store
            .functions()
            .rmw_completion_callback(&parts.key, &input, ctx, status);
        self.check_commits();
        status
    }

    fn handle_completion(&mut self, completion: IoCompletion) {
        let Some(operation) = self.pending.remove(&completion.request_id) else {
            return;
        };
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                session = %self.id,
                request_id = completion.request_id,
                operation = %operation.operation_type(),
                serial = operation.serial(),
                "pending read completed"
            );
        }

        match operation {
            PendingOperation::Read {
                key,
                input,
                ctx,
                serial,
            } => {
                let mut output = F::Output::default();
                let status = match completion.outcome {
                    ReadOutcome::Found(record) if record.header.info.is_tombstone() => {
                        Status::NotFound
                    }
                    ReadOutcome::Found(record) => {
                        match FasterKv::<F, D>::decode_value(&record.value) {
                            Ok(value) => {
                                self.store.functions().single_reader(
                                    &key.key,
                                    &input,
                                    &value,
                                    &mut output,
                                    &ctx,
                                );
                                Status::Ok
                            }
                            Err(err) => self.record_error(err),
                        }
                    }
                    ReadOutcome::NotFound => Status::NotFound,
                    ReadOutcome::Failed(err) => self.record_error(err),
                };
                self.shared.mark_done(serial);
                self.store
                    .functions()
                    .read_completion_callback(&key.key, &input, &output, ctx, status);
            }
            PendingOperation::Rmw {
                key,
                input,
                ctx,
                serial,
                entry,
            } => {
                let old = match completion.outcome {
                    ReadOutcome::Found(record) if !record.header.info.is_tombstone() => {
                        FasterKv::<F, D>::decode_value(&record.value).map(Some)
                    }
                    ReadOutcome::Found(_) | ReadOutcome::NotFound => Ok(None),
                    ReadOutcome::Failed(err) => Err(err),
                };
                let result = match old {
                    Ok(old) => {
                        let (result, _) = self.run(Some(serial), |store| {
                            store.continue_rmw(&key, &input, &ctx, old.as_ref(), entry)
                        });
                        result
                    }
                    Err(err) => Err(err),
                };
                self.finish_rmw(key, input, ctx, serial, result);
            }
        }
    }

    /// Deliver the completion callback once per finished checkpoint.
    fn check_commits(&mut self) {
        let generation = self.store.commit_generation();
        if generation == self.seen_generation {
            return;
        }
        self.seen_generation = generation;
        if let Some(point) = self.store.commit_point_for(self.id) {
            self.store
                .functions()
                .checkpoint_completion_callback(self.id, &point);
        }
    }
}

impl<F: Functions, D: StorageDevice> Drop for Session<F, D> {
    fn drop(&mut self) {
        self.complete_pending(true);
        self.store.unregister_session(self.id);
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(session = %self.id, serial = self.serial_num(), "session ended");
        }
    }
}

impl<F: Functions, D: StorageDevice> std::fmt::Debug for Session<F, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("serial", &self.serial_num())
            .field("pending", &self.pending.len())
            .finish()
    }
}
