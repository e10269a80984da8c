use crate::address::Address;
use crate::codec::key_hash;
use crate::device::StorageDevice;
use crate::error::KvError;
use crate::index::{GrowResult, KeyHash, TracedRecord};
use crate::store::state_transitions::Action;
use crate::store::Functions;

use super::FasterKv;

impl<F: Functions, D: StorageDevice> FasterKv<F, D> {
    // ============ Index Growth API ============

    /// Double the hash index.
    ///
    /// Workers are paused while entries migrate; each chain is split by
    /// re-hashing the resident records it starts with. The old table is
    /// released once no worker can still hold a reference to it.
    pub fn grow_index(&self) -> Result<GrowResult, KvError> {
        if let Err(state) = self.system_state.try_start(Action::GrowIndex) {
            tracing::warn!(action = ?state.action, "index growth refused, store busy");
            return Err(KvError::Busy("another maintenance action is running"));
        }
        self.quiesce();

        let (result, retired) = self.index.grow(|address| self.trace_record(address));
        self.system_state.finish();
        self.epoch
            .bump_current_epoch_with_action(move || drop(retired));

        tracing::info!(
            old_size = result.old_size,
            new_size = result.new_size,
            entries = result.entries_migrated,
            "index grown"
        );
        Ok(result)
    }

    /// Grow the index when its load factor reaches `grow_load_factor`.
    ///
    /// Returns `None` when no growth was needed.
    pub fn grow_if_needed(&self) -> Result<Option<GrowResult>, KvError> {
        let load = self.index.load_factor();
        if load < self.config.grow_load_factor {
            return Ok(None);
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(load_factor = load, "index load factor over threshold");
        }
        self.grow_index().map(Some)
    }

    /// Key hash and predecessor of the resident record at `address`.
    fn trace_record(&self, address: Address) -> Option<TracedRecord> {
        if address < self.hlog.head_address() {
            return None;
        }
        let header = self.hlog.record_header(address)?;
        let key = self.hlog.read_key(address, &header)?;
        Some(TracedRecord {
            hash: KeyHash::new(key_hash::<F::Key>(&key)),
            previous: header.info.previous_address(),
        })
    }
}
