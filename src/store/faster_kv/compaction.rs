//! Log compaction.
//!
//! Compaction reclaims the oldest part of the log. The range `[begin, cut)` is
//! scanned from the main device while workers keep running, keeping the
//! newest version of every key seen there. Workers are then paused while each
//! surviving key is checked against the chain above the cut and, if nothing
//! newer exists, appended at the tail. Finally the begin address moves to the
//! cut.

use std::collections::HashMap;
use std::thread;

use crate::address::Address;
use crate::codec::key_hash;
use crate::device::StorageDevice;
use crate::error::KvError;
use crate::index::KeyHash;
use crate::record::{decode_object_address, RecordHeader, RecordInfo, MIN_RECORD_SIZE};
use crate::status::OperationStatus;
use crate::store::state_transitions::{Action, Phase};
use crate::store::Functions;

use super::FasterKv;

/// Outcome of one compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Begin address once compaction finished
    pub begin_address: Address,
    /// Valid records read from the compacted range
    pub records_scanned: u64,
    /// Live keys copied to the tail
    pub records_copied: u64,
    /// Keys whose newest version in the range was a tombstone
    pub tombstones_dropped: u64,
    /// Keys with a newer version at or above the cut
    pub records_superseded: u64,
}

/// Key and value of a record read back from the device.
struct DurableRecord {
    info: RecordInfo,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl<F: Functions, D: StorageDevice> FasterKv<F, D> {
    // ============ Compaction API ============

    /// Copy the live records below `until` to the tail and discard the rest.
    ///
    /// The cut is clamped to the read-only region and moved down to a record
    /// boundary; the returned begin address is where it landed. Must not be
    /// called from inside a session operation.
    pub fn compact(&self, until: Address) -> Result<CompactionStats, KvError> {
        if let Err(state) = self.system_state.try_start(Action::Compact) {
            tracing::warn!(action = ?state.action, "compaction refused, store busy");
            return Err(KvError::Busy("another maintenance action is running"));
        }
        let result = self.run_compaction(until);
        self.system_state.finish();
        if let Err(err) = &result {
            tracing::error!(error = %err, "compaction failed");
        }
        result
    }

    fn run_compaction(&self, until: Address) -> Result<CompactionStats, KvError> {
        let begin = self.hlog.begin_address();
        let until = until.min(self.hlog.safe_read_only_address());
        let mut stats = CompactionStats {
            begin_address: begin,
            ..CompactionStats::default()
        };
        if until <= begin {
            return Ok(stats);
        }
        self.hlog.flush_to(until)?;

        let mut newest: HashMap<Vec<u8>, Option<Vec<u8>>> = HashMap::new();
        let cut = self.scan_durable(begin, until, |record| {
            stats.records_scanned += 1;
            let value = (!record.info.is_tombstone()).then_some(record.value);
            newest.insert(record.key, value);
        })?;

        self.quiesce();
        for (key, value) in newest {
            let Some(value) = value else {
                stats.tombstones_dropped += 1;
                continue;
            };
            let hash = KeyHash::new(key_hash::<F::Key>(&key));
            if self.copy_if_newest(&key, hash, &value, cut)? {
                stats.records_copied += 1;
            } else {
                stats.records_superseded += 1;
            }
        }
        self.system_state.set_phase(Phase::Rest);

        self.shift_begin_address(cut)?;
        stats.begin_address = self.hlog.begin_address();
        tracing::info!(
            begin = %stats.begin_address,
            scanned = stats.records_scanned,
            copied = stats.records_copied,
            tombstones = stats.tombstones_dropped,
            "log compacted"
        );
        Ok(stats)
    }

    /// Visit each valid record lying wholly in `[from, until)` on the main
    /// device, in address order.
    ///
    /// Returns the record boundary the scan stopped at; a record that
    /// straddles `until` is left for a later compaction.
    fn scan_durable(
        &self,
        from: Address,
        until: Address,
        mut visit: impl FnMut(DurableRecord),
    ) -> Result<Address, KvError> {
        let geometry = *self.hlog.geometry();
        // Pages start at a record boundary (page 0 at the first valid
        // address); `from` may not.
        let mut address = geometry
            .page_start(geometry.page(from))
            .max(Address::FIRST_VALID);
        while address < until {
            let page_end = geometry.page_start(geometry.page(address) + 1);
            let end = page_end.min(until);
            let bytes = self
                .hlog
                .read_durable(address, (end.control() - address.control()) as usize)?;

            let mut pos = 0usize;
            while pos < bytes.len() {
                let at = address + pos as u64;
                let header = match RecordHeader::decode(&bytes[pos..]) {
                    Some(header) if header.info.is_null() => {
                        // Nothing was allocated past this point of the page.
                        if end < page_end {
                            return Ok(until);
                        }
                        break;
                    }
                    Some(header) => header,
                    None if end < page_end => return Ok(at),
                    None => break,
                };
                let size = header.record_size();
                if pos + size > bytes.len() {
                    if end < page_end {
                        return Ok(at);
                    }
                    return Err(KvError::Corruption(format!("record at {at} crosses its page")));
                }
                if at >= from && !header.info.is_invalid() {
                    visit(self.durable_payload(at, &header, &bytes[pos..pos + size])?);
                }
                pos += size;
            }
            address = end;
        }
        Ok(address)
    }

    /// Key and value of a flushed record, fetched from the object log if needed.
    fn durable_payload(
        &self,
        address: Address,
        header: &RecordHeader,
        record: &[u8],
    ) -> Result<DurableRecord, KvError> {
        let key_len = header.key_len as usize;
        let value_len = header.value_len as usize;
        if self.hlog.object_device().is_none() {
            return Ok(DurableRecord {
                info: header.info,
                key: record[header.key_range()].to_vec(),
                value: record[header.value_range()].to_vec(),
            });
        }

        let offset = decode_object_address(record)
            .ok_or_else(|| KvError::Corruption(format!("missing object log address at {address}")))?;
        let mut payload = self.hlog.read_object(offset, key_len + value_len)?;
        let value = payload.split_off(key_len);
        Ok(DurableRecord {
            info: header.info,
            key: payload,
            value,
        })
    }

    /// Append `value` as the newest version of `key` unless the chain already
    /// holds a version at or above `cut`. Runs while workers are paused.
    fn copy_if_newest(&self, key: &[u8], hash: KeyHash, value: &[u8], cut: Address) -> Result<bool, KvError> {
        loop {
            let found = self.index.find_entry(hash);
            if found.found() && self.has_version_from(key, found.entry.address(), cut)? {
                return Ok(false);
            }
            match self.publish_record(key, hash, &found, value, false)?.status {
                OperationStatus::Success => return Ok(true),
                OperationStatus::RetryLater => {
                    // The tail waits for a free frame; let flush and eviction run.
                    self.epoch.drain(self.epoch.current_epoch());
                    thread::yield_now();
                }
                _ => {}
            }
        }
    }

    /// Whether the chain starting at `address` holds a record of `key` at or above `cut`.
    fn has_version_from(&self, key: &[u8], mut address: Address, cut: Address) -> Result<bool, KvError> {
        while address >= cut && address >= Address::FIRST_VALID {
            let (header, record_key) = self.chain_record(address)?;
            if !header.info.is_invalid() && record_key == key {
                return Ok(true);
            }
            let previous = header.info.previous_address();
            if previous >= address {
                return Err(KvError::Corruption(format!(
                    "chain at {address} points forward to {previous}"
                )));
            }
            address = previous;
        }
        Ok(false)
    }

    /// Header and key of the record at `address`, from memory or the device.
    fn chain_record(&self, address: Address) -> Result<(RecordHeader, Vec<u8>), KvError> {
        if let Some(header) = self.hlog.record_header(address) {
            if let Some(key) = self.hlog.read_key(address, &header) {
                return Ok((header, key));
            }
        }

        let head = self.hlog.read_durable(address, MIN_RECORD_SIZE)?;
        let header = RecordHeader::decode(&head)
            .filter(|header| !header.info.is_null())
            .ok_or_else(|| KvError::Corruption(format!("no record at {address}")))?;
        if header.record_size() as u64 > self.hlog.page_size() {
            return Err(KvError::Corruption(format!("oversized record at {address}")));
        }
        if self.hlog.object_device().is_some() {
            let offset = decode_object_address(&head)
                .ok_or_else(|| KvError::Corruption(format!("missing object log address at {address}")))?;
            let key = self.hlog.read_object(offset, header.key_len as usize)?;
            return Ok((header, key));
        }
        let record = self.hlog.read_durable(address, header.record_size())?;
        Ok((header, record[header.key_range()].to_vec()))
    }
}
