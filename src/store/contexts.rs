//! Operation contexts
//!
//! Per-operation state that outlives the call which created it: operations
//! parked behind a pending read, and the per-session bookkeeping a checkpoint
//! needs to compute commit points.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::address::Address;
use crate::checkpoint::CommitPoint;
use crate::index::KeyHash;
use crate::status::{OperationStatus, OperationType};

use super::Functions;

/// Key in the forms every operation stage needs.
#[derive(Debug, Clone)]
pub(crate) struct KeyParts<K> {
    pub(crate) key: K,
    pub(crate) bytes: Vec<u8>,
    pub(crate) hash: KeyHash,
}

/// An operation waiting for a device read.
pub(crate) enum PendingOperation<F: Functions> {
    Read {
        key: KeyParts<F::Key>,
        input: F::Input,
        ctx: F::Context,
        serial: u64,
    },
    Rmw {
        key: KeyParts<F::Key>,
        input: F::Input,
        ctx: F::Context,
        serial: u64,
        /// Index entry address observed when the RMW went pending
        entry: Address,
    },
}

impl<F: Functions> PendingOperation<F> {
    pub(crate) fn operation_type(&self) -> OperationType {
        match self {
            PendingOperation::Read { .. } => OperationType::Read,
            PendingOperation::Rmw { .. } => OperationType::Rmw,
        }
    }

    pub(crate) fn serial(&self) -> u64 {
        match self {
            PendingOperation::Read { serial, .. } | PendingOperation::Rmw { serial, .. } => *serial,
        }
    }
}

/// Result of one attempt at an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Attempt {
    pub(crate) status: OperationStatus,
    /// Record to fetch when `status` is `RecordOnDisk`
    pub(crate) disk_address: Address,
    /// Index entry the chain started from
    pub(crate) entry_address: Address,
}

impl Attempt {
    pub(crate) const fn done(status: OperationStatus) -> Self {
        Self {
            status,
            disk_address: Address::INVALID,
            entry_address: Address::INVALID,
        }
    }

    pub(crate) const fn on_disk(disk_address: Address, entry_address: Address) -> Self {
        Self {
            status: OperationStatus::RecordOnDisk,
            disk_address,
            entry_address,
        }
    }
}

impl From<OperationStatus> for Attempt {
    fn from(status: OperationStatus) -> Self {
        Self::done(status)
    }
}

/// Session state visible to checkpoints.
#[derive(Debug, Default)]
pub(crate) struct SessionShared {
    serial: AtomicU64,
    pending: Mutex<BTreeSet<u64>>,
}

impl SessionShared {
    pub(crate) fn starting_at(serial: u64) -> Self {
        Self {
            serial: AtomicU64::new(serial),
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn mark_pending(&self, serial: u64) {
        self.pending.lock().insert(serial);
    }

    pub(crate) fn mark_done(&self, serial: u64) {
        self.pending.lock().remove(&serial);
    }

    /// Everything up to the current serial, minus operations still pending.
    pub(crate) fn commit_point(&self) -> CommitPoint {
        let pending = self.pending.lock();
        CommitPoint {
            until_serial: self.serial(),
            excluded_serials: pending.iter().copied().collect(),
        }
    }
}
