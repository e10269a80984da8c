//! FasterKv - core key-value store
//!
//! Operations locate the newest record of a key through the hash index, then
//! read or update it in the hybrid log:
//!
//! - records in the mutable region written by the current version are updated
//!   in place under the record lock, as long as the value keeps its length;
//! - everything else is a read-copy-update: a new record is appended with the
//!   old chain head as its previous address and the index entry is swung to it;
//! - a chain that leaves memory turns a read or RMW into a pending operation.
//!
//! Every internal operation runs while the calling session is epoch protected
//! and reports an [`Attempt`]; the session loop retries, parks or finishes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::Address;
use crate::allocator::{HybridLog, LogStats, RecordLock};
use crate::checkpoint::CommitPoint;
use crate::codec::{self, encode_key, key_hash};
use crate::config::{ConfigError, KvConfig};
use crate::device::StorageDevice;
use crate::epoch::LightEpoch;
use crate::error::{KvError, MAX_OBJECT_SIZE};
use crate::index::{FindResult, IndexStats, KeyHash, MemHashIndex};
use crate::record::{record_size, RecordHeader, RecordInfo};
use crate::status::OperationStatus;
use crate::store::contexts::{Attempt, KeyParts, SessionShared};
use crate::store::pending_io::PendingIoManager;
use crate::store::state_transitions::{AtomicSystemState, Phase};
use crate::store::{Functions, Session};

mod checkpoint;
mod compaction;
mod index_grow;

#[cfg(test)]
mod tests;

pub use compaction::CompactionStats;

/// Concurrent hybrid-log key-value store.
///
/// Shared through an `Arc`; each worker thread drives it through its own
/// [`Session`].
pub struct FasterKv<F: Functions, D: StorageDevice> {
    config: KvConfig,
    functions: F,
    epoch: Arc<LightEpoch>,
    system_state: AtomicSystemState,
    index: MemHashIndex,
    hlog: Arc<HybridLog<D>>,
    pending_io: PendingIoManager<D>,
    /// Live sessions by id
    sessions: Mutex<HashMap<Uuid, Arc<SessionShared>>>,
    /// Commit points of the newest durable checkpoint
    commits: Mutex<HashMap<Uuid, CommitPoint>>,
    /// Number of checkpoints completed since the store opened
    commit_generation: AtomicU64,
    /// Sessions restored by recovery, waiting for `continue_session`
    recovered_sessions: Mutex<HashMap<Uuid, CommitPoint>>,
}

impl<F: Functions, D: StorageDevice> FasterKv<F, D> {
    /// Create an empty store on `device`.
    pub fn new(config: KvConfig, functions: F, device: D) -> Result<Arc<Self>, KvError> {
        Self::open(config, functions, Arc::new(device), None).map(Arc::new)
    }

    /// Create an empty store whose flushed records keep their payload in `objects`.
    ///
    /// `config.object_log` must be set.
    pub fn with_object_log(
        config: KvConfig,
        functions: F,
        device: D,
        objects: Arc<dyn StorageDevice>,
    ) -> Result<Arc<Self>, KvError> {
        Self::open(config, functions, Arc::new(device), Some(objects)).map(Arc::new)
    }

    fn open(
        config: KvConfig,
        functions: F,
        device: Arc<D>,
        objects: Option<Arc<dyn StorageDevice>>,
    ) -> Result<Self, KvError> {
        config.validate()?;
        let objects = match (config.object_log, objects) {
            (true, Some(objects)) => Some(objects),
            (true, None) => return Err(ConfigError::MissingField("object log device".into()).into()),
            (false, Some(_)) => {
                return Err(ConfigError::InvalidValue {
                    key: "log.object_log".into(),
                    value: "false".into(),
                }
                .into())
            }
            (false, None) => None,
        };

        let epoch = Arc::new(LightEpoch::new());
        let hlog = HybridLog::new(
            config.hybrid_log_config(),
            Arc::clone(&device),
            objects.clone(),
            Arc::clone(&epoch),
        )?;
        let pending_io =
            PendingIoManager::new(device, objects, config.max_inflight_reads, config.read_retry)?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                table_size = config.table_size,
                page_size = hlog.page_size(),
                memory_pages = hlog.config().memory_pages,
                mutable_pages = hlog.config().mutable_pages,
                object_log = config.object_log,
                "store opened"
            );
        }

        Ok(Self {
            index: MemHashIndex::new(config.table_size),
            config,
            functions,
            epoch,
            system_state: AtomicSystemState::new(0),
            hlog,
            pending_io,
            sessions: Mutex::new(HashMap::new()),
            commits: Mutex::new(HashMap::new()),
            commit_generation: AtomicU64::new(0),
            recovered_sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Start a new session with a fresh id.
    pub fn start_session(self: &Arc<Self>) -> Result<Session<F, D>, KvError> {
        Session::new(Arc::clone(self), Uuid::new_v4(), 0)
    }

    /// Resume a session that took part in the recovered checkpoint.
    ///
    /// Returns the session, whose serials continue after the commit point,
    /// together with the commit point itself.
    pub fn continue_session(
        self: &Arc<Self>,
        session_id: Uuid,
    ) -> Result<(Session<F, D>, CommitPoint), KvError> {
        let commit_point = self
            .recovered_sessions
            .lock()
            .remove(&session_id)
            .ok_or(KvError::UnknownSession(session_id))?;
        let session = Session::new(Arc::clone(self), session_id, commit_point.until_serial)?;
        Ok((session, commit_point))
    }

    /// Ids of recovered sessions not yet continued.
    pub fn recovered_sessions(&self) -> Vec<Uuid> {
        self.recovered_sessions.lock().keys().copied().collect()
    }

    /// Store configuration.
    pub fn config(&self) -> &KvConfig {
        &self.config
    }

    /// Record logic.
    pub fn functions(&self) -> &F {
        &self.functions
    }

    /// Current store version.
    pub fn version(&self) -> u32 {
        self.system_state.version()
    }

    /// Number of main index buckets.
    pub fn index_size(&self) -> u64 {
        self.index.size()
    }

    /// Index occupancy.
    pub fn index_stats(&self) -> IndexStats {
        self.index.dump_distribution()
    }

    /// Log boundaries.
    pub fn log_stats(&self) -> LogStats {
        self.hlog.stats()
    }

    /// Flush the log below `until` and evict it from memory.
    ///
    /// Must not be called from inside a session operation.
    pub fn flush_and_evict(&self, until: Address) -> Result<(), KvError> {
        self.hlog.flush_and_evict(until)
    }

    /// Flush and evict the whole log; every record is read from the device afterwards.
    pub fn flush_and_evict_all(&self) -> Result<(), KvError> {
        self.hlog.flush_and_evict(self.hlog.tail_address())
    }

    /// Discard every record below `target`.
    ///
    /// Index entries whose chains start below the new begin address are
    /// removed. Must not be called from inside a session operation.
    pub fn shift_begin_address(&self, target: Address) -> Result<(), KvError> {
        if self.hlog.shift_begin_address(target)?.is_none() {
            return Ok(());
        }
        let begin = self.hlog.begin_address();
        let removed = self.index.garbage_collect(begin);
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(begin = %begin, entries_removed = removed, "index entries below begin removed");
        }
        Ok(())
    }

    pub(crate) fn epoch(&self) -> &Arc<LightEpoch> {
        &self.epoch
    }

    pub(crate) fn pending_io(&self) -> &PendingIoManager<D> {
        &self.pending_io
    }

    pub(crate) fn hlog(&self) -> &HybridLog<D> {
        &self.hlog
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.system_state.is_paused()
    }

    // ============ Sessions and commit points ============

    pub(crate) fn register_session(&self, id: Uuid, shared: Arc<SessionShared>) {
        self.sessions.lock().insert(id, shared);
    }

    pub(crate) fn unregister_session(&self, id: Uuid) {
        self.sessions.lock().remove(&id);
    }

    pub(crate) fn commit_generation(&self) -> u64 {
        self.commit_generation.load(Ordering::Acquire)
    }

    pub(crate) fn commit_point_for(&self, id: Uuid) -> Option<CommitPoint> {
        self.commits.lock().get(&id).cloned()
    }

    fn collect_commit_points(&self) -> HashMap<Uuid, CommitPoint> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, shared)| (*id, shared.commit_point()))
            .collect()
    }

    fn publish_commit_points(&self, points: HashMap<Uuid, CommitPoint>) {
        *self.commits.lock() = points;
        self.commit_generation.fetch_add(1, Ordering::AcqRel);
    }

    // ============ Quiesced phases ============

    /// Pause operations and wait until no session is inside one.
    fn quiesce(&self) {
        self.system_state.set_phase(Phase::Paused);
        let drained = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&drained);
        self.epoch
            .bump_current_epoch_with_action(move || flag.store(true, Ordering::Release));
        while !drained.load(Ordering::Acquire) {
            self.epoch.drain(self.epoch.current_epoch());
            thread::yield_now();
        }
    }

    // ============ Key and value plumbing ============

    pub(crate) fn key_parts(key: &F::Key) -> Result<KeyParts<F::Key>, KvError> {
        let bytes = encode_key(key)?;
        let hash = KeyHash::new(key_hash::<F::Key>(&bytes));
        Ok(KeyParts {
            key: key.clone(),
            bytes,
            hash,
        })
    }

    pub(crate) fn decode_value(bytes: &[u8]) -> Result<F::Value, KvError> {
        codec::decode_value(bytes)
    }

    fn encode_value(value: &F::Value) -> Result<Vec<u8>, KvError> {
        codec::encode_value(value)
    }

    fn resident_value(&self, address: Address, header: &RecordHeader) -> Result<F::Value, KvError> {
        let bytes = self
            .hlog
            .read_value(address, header)
            .ok_or_else(|| KvError::Corruption(format!("record at {address} is not resident")))?;
        Self::decode_value(&bytes)
    }

    // ============ Chain traversal ============

    /// Chain entries below the begin address are dead.
    #[inline]
    fn is_dead(&self, address: Address) -> bool {
        address < Address::FIRST_VALID || address < self.hlog.begin_address()
    }

    #[inline]
    fn is_current(&self, info: RecordInfo) -> bool {
        u64::from(info.version()) == u64::from(self.version()) & RecordInfo::VERSION_MASK
    }

    /// Newest resident record of `key` reachable from `address`, or the first
    /// chain address that is not resident.
    fn find_latest(&self, key: &[u8], mut address: Address) -> Address {
        let head = self.hlog.head_address();
        while address >= head && address >= Address::FIRST_VALID {
            let Some(header) = self.hlog.record_header(address) else {
                break;
            };
            if !header.info.is_invalid()
                && self.hlog.read_key(address, &header).as_deref() == Some(key)
            {
                return address;
            }
            address = header.info.previous_address();
        }
        address
    }

    /// Lock a resident record, provided the index entry has not moved since the lookup.
    fn lock_current(&self, address: Address, hash: KeyHash, entry: Address) -> Option<RecordLock<'_>> {
        let lock = self.hlog.lock_record(address)?;
        if self.index.find_entry(hash).entry.address() != entry {
            return None;
        }
        Some(lock)
    }

    // ============ Operations ============

    pub(crate) fn internal_read(
        &self,
        key: &KeyParts<F::Key>,
        input: &F::Input,
        output: &mut F::Output,
        ctx: &F::Context,
    ) -> Result<Attempt, KvError> {
        let found = self.index.find_entry(key.hash);
        if !found.found() {
            return Ok(OperationStatus::NotFound.into());
        }
        let entry = found.entry.address();
        let address = self.find_latest(&key.bytes, entry);
        if self.is_dead(address) {
            return Ok(OperationStatus::NotFound.into());
        }
        if self.hlog.is_on_disk(address) {
            return Ok(Attempt::on_disk(address, entry));
        }

        // Fuzzy records may still take an in-place write from a lagging worker.
        let shared = self.hlog.is_mutable(address) || self.hlog.is_fuzzy(address);
        let _lock = if shared {
            match self.hlog.lock_record(address) {
                Some(lock) => Some(lock),
                None => return Ok(OperationStatus::RetryNow.into()),
            }
        } else {
            None
        };
        let Some(header) = self.hlog.record_header(address) else {
            return Ok(OperationStatus::RetryNow.into());
        };
        if header.info.is_tombstone() {
            return Ok(OperationStatus::NotFound.into());
        }
        let value = self.resident_value(address, &header)?;
        if shared {
            self.functions
                .concurrent_reader(&key.key, input, &value, output, ctx);
        } else {
            self.functions.single_reader(&key.key, input, &value, output, ctx);
        }
        Ok(OperationStatus::Success.into())
    }

    pub(crate) fn internal_upsert(
        &self,
        key: &KeyParts<F::Key>,
        value: &F::Value,
        ctx: &F::Context,
    ) -> Result<Attempt, KvError> {
        let found = self.index.find_entry(key.hash);
        let mut _lock = None;
        if found.found() {
            let entry = found.entry.address();
            let address = self.find_latest(&key.bytes, entry);
            if !self.is_dead(address) && self.hlog.is_mutable(address) {
                let Some(lock) = self.lock_current(address, key.hash, entry) else {
                    return Ok(OperationStatus::RetryNow.into());
                };
                let Some(header) = self.hlog.record_header(address) else {
                    return Ok(OperationStatus::RetryNow.into());
                };
                if !header.info.is_tombstone() && self.is_current(header.info) {
                    let mut current = self.resident_value(address, &header)?;
                    if self
                        .functions
                        .concurrent_writer(&key.key, value, &mut current, ctx)
                    {
                        let bytes = Self::encode_value(&current)?;
                        if bytes.len() == header.value_len as usize {
                            self.write_in_place(address, &header, &bytes)?;
                            return Ok(OperationStatus::Success.into());
                        }
                        return self.append_and_publish(key, &found, &bytes, false);
                    }
                }
                // Held until the new version is published.
                _lock = Some(lock);
            }
        }

        let mut fresh = F::Value::default();
        if !self.functions.single_writer(&key.key, value, &mut fresh, ctx) {
            return Ok(OperationStatus::Success.into());
        }
        let bytes = Self::encode_value(&fresh)?;
        self.append_and_publish(key, &found, &bytes, false)
    }

    pub(crate) fn internal_rmw(
        &self,
        key: &KeyParts<F::Key>,
        input: &F::Input,
        ctx: &F::Context,
    ) -> Result<Attempt, KvError> {
        let found = self.index.find_entry(key.hash);
        let mut _lock = None;
        if found.found() {
            let entry = found.entry.address();
            let address = self.find_latest(&key.bytes, entry);
            if !self.is_dead(address) {
                if self.hlog.is_on_disk(address) {
                    return Ok(Attempt::on_disk(address, entry));
                }
                let mutable = self.hlog.is_mutable(address);
                if !mutable && self.hlog.is_fuzzy(address) {
                    // Copying now could lose an in-place update still in flight.
                    return Ok(OperationStatus::RetryLater.into());
                }
                if mutable {
                    match self.lock_current(address, key.hash, entry) {
                        Some(lock) => _lock = Some(lock),
                        None => return Ok(OperationStatus::RetryNow.into()),
                    }
                }
                let Some(header) = self.hlog.record_header(address) else {
                    return Ok(OperationStatus::RetryNow.into());
                };
                if !header.info.is_tombstone() {
                    let old = self.resident_value(address, &header)?;
                    if mutable && self.is_current(header.info) {
                        let mut updated = old.clone();
                        if self
                            .functions
                            .in_place_updater(&key.key, input, &mut updated, ctx)
                        {
                            let bytes = Self::encode_value(&updated)?;
                            if bytes.len() == header.value_len as usize {
                                self.write_in_place(address, &header, &bytes)?;
                                return Ok(OperationStatus::Success.into());
                            }
                            return self.append_and_publish(key, &found, &bytes, false);
                        }
                    }
                    return self.copy_update(key, input, &old, &found, ctx);
                }
            }
        }
        self.initial_update(key, input, &found, ctx)
    }

    /// Finish an RMW whose old version was fetched from the device.
    ///
    /// If the index entry moved while the read was in flight, the RMW starts
    /// over from a fresh lookup.
    pub(crate) fn continue_rmw(
        &self,
        key: &KeyParts<F::Key>,
        input: &F::Input,
        ctx: &F::Context,
        old: Option<&F::Value>,
        entry: Address,
    ) -> Result<Attempt, KvError> {
        let found = self.index.find_entry(key.hash);
        if !found.found() || found.entry.address() != entry {
            return self.internal_rmw(key, input, ctx);
        }
        match old {
            Some(old) => self.copy_update(key, input, old, &found, ctx),
            None => self.initial_update(key, input, &found, ctx),
        }
    }

    pub(crate) fn internal_delete(&self, key: &KeyParts<F::Key>) -> Result<Attempt, KvError> {
        let found = self.index.find_entry(key.hash);
        if !found.found() {
            return Ok(OperationStatus::NotFound.into());
        }
        let entry = found.entry.address();
        let address = self.find_latest(&key.bytes, entry);
        if self.is_dead(address) {
            return Ok(OperationStatus::NotFound.into());
        }

        if !self.hlog.is_on_disk(address) {
            let lock = if self.hlog.is_mutable(address) {
                match self.lock_current(address, key.hash, entry) {
                    Some(lock) => Some(lock),
                    None => return Ok(OperationStatus::RetryNow.into()),
                }
            } else {
                None
            };
            let Some(header) = self.hlog.record_header(address) else {
                return Ok(OperationStatus::RetryNow.into());
            };
            if header.info.is_tombstone() {
                return Ok(OperationStatus::NotFound.into());
            }
            if let Some(lock) = &lock {
                if self.is_current(header.info) {
                    lock.set_tombstone(true);
                    return Ok(OperationStatus::Success.into());
                }
            }
            return self.append_and_publish(key, &found, &[], true);
        }
        self.append_and_publish(key, &found, &[], true)
    }

    fn copy_update(
        &self,
        key: &KeyParts<F::Key>,
        input: &F::Input,
        old: &F::Value,
        found: &FindResult,
        ctx: &F::Context,
    ) -> Result<Attempt, KvError> {
        let mut updated = F::Value::default();
        if !self
            .functions
            .copy_updater(&key.key, input, old, &mut updated, ctx)
        {
            return Ok(OperationStatus::Success.into());
        }
        let bytes = Self::encode_value(&updated)?;
        self.append_and_publish(key, found, &bytes, false)
    }

    fn initial_update(
        &self,
        key: &KeyParts<F::Key>,
        input: &F::Input,
        found: &FindResult,
        ctx: &F::Context,
    ) -> Result<Attempt, KvError> {
        let mut value = F::Value::default();
        if !self
            .functions
            .initial_updater(&key.key, input, &mut value, ctx)
        {
            return Ok(OperationStatus::NotFound.into());
        }
        let bytes = Self::encode_value(&value)?;
        self.append_and_publish(key, found, &bytes, false)
    }

    fn write_in_place(&self, address: Address, header: &RecordHeader, bytes: &[u8]) -> Result<(), KvError> {
        self.hlog
            .write_value(address, header, bytes)
            .ok_or_else(|| KvError::Corruption(format!("in-place write at {address} out of bounds")))
    }

    /// Log footprint of a record, rejecting payloads the log cannot hold.
    fn checked_record_size(&self, key_len: usize, value_len: usize) -> Result<u32, KvError> {
        let payload = (key_len + value_len) as u64;
        if payload > MAX_OBJECT_SIZE {
            tracing::error!(size = payload, limit = MAX_OBJECT_SIZE, "key-value payload too large");
            return Err(KvError::ObjectTooLarge {
                size: payload,
                limit: MAX_OBJECT_SIZE,
            });
        }
        let size = record_size(key_len, value_len) as u64;
        let page_size = self.hlog.page_size();
        if size > page_size {
            return Err(KvError::RecordTooLarge { size, page_size });
        }
        Ok(size as u32)
    }

    /// Append a new version and make it the chain head.
    ///
    /// A key without an index entry goes through a tentative insert; an
    /// existing entry is swung with a CAS. Losing either race invalidates the
    /// appended record and asks for a retry.
    fn append_and_publish(
        &self,
        key: &KeyParts<F::Key>,
        found: &FindResult,
        value: &[u8],
        tombstone: bool,
    ) -> Result<Attempt, KvError> {
        self.publish_record(&key.bytes, key.hash, found, value, tombstone)
    }

    /// [`Self::append_and_publish`] on raw key bytes.
    fn publish_record(
        &self,
        key: &[u8],
        hash: KeyHash,
        found: &FindResult,
        value: &[u8],
        tombstone: bool,
    ) -> Result<Attempt, KvError> {
        let size = self.checked_record_size(key.len(), value.len())?;
        let previous = if found.found() {
            found.entry.address()
        } else {
            Address::INVALID
        };
        let address = match self.hlog.allocate(size) {
            Ok(address) => address,
            Err(OperationStatus::RetryLater) => return Ok(OperationStatus::RetryLater.into()),
            Err(_) => {
                return Err(KvError::RecordTooLarge {
                    size: u64::from(size),
                    page_size: self.hlog.page_size(),
                })
            }
        };
        let info = RecordInfo::new(previous, self.version(), tombstone);
        self.hlog
            .write_record(address, info, key, value)
            .ok_or_else(|| KvError::Corruption(format!("record at {address} left its page")))?;

        let published = if found.found() {
            self.index.try_update(found, address)
        } else {
            match self.index.try_insert_tentative(hash, address) {
                Some(slot) => self.index.confirm_entry(hash, slot),
                None => false,
            }
        };
        if published {
            Ok(OperationStatus::Success.into())
        } else {
            self.hlog.invalidate(address);
            Ok(OperationStatus::RetryNow.into())
        }
    }
}

impl<F: Functions, D: StorageDevice> std::fmt::Debug for FasterKv<F, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FasterKv")
            .field("version", &self.version())
            .field("index_size", &self.index_size())
            .field("tail", &self.hlog.tail_address())
            .finish()
    }
}
