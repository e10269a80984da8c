//! Status codes and operation results
//!
//! Every client operation reports one of four [`Status`] values. Internally each
//! attempt produces an [`OperationStatus`] that the session loop maps to a `Status`
//! (retrying, going pending, or finishing).

use std::fmt;

/// Status code returned by every client operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// Key was not found (or the newest version is a tombstone)
    NotFound = 1,
    /// Operation needs disk I/O; drain with `complete_pending`
    Pending = 2,
    /// Operation failed; the session keeps the detailed error
    Error = 3,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the operation is pending
    #[inline]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Status::Pending)
    }

    /// Check if the key was not found
    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// Check if the status indicates an error
    #[inline]
    pub const fn is_error(&self) -> bool {
        matches!(self, Status::Error)
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NotFound => "NOTFOUND",
            Status::Pending => "PENDING",
            Status::Error => "ERROR",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one attempt at an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub(crate) enum OperationStatus {
    /// Operation succeeded
    #[default]
    Success,
    /// Key not found
    NotFound,
    /// Lost a race (index CAS, tentative conflict); retry immediately
    RetryNow,
    /// Log allocation must wait for flush/eviction; refresh the epoch and retry
    RetryLater,
    /// Record is below the head address, needs async I/O
    RecordOnDisk,
    /// Fatal caller error
    Failed,
}

impl OperationStatus {
    /// Convert to external Status
    pub(crate) const fn to_status(self) -> Status {
        match self {
            OperationStatus::Success => Status::Ok,
            OperationStatus::NotFound => Status::NotFound,
            OperationStatus::RetryNow
            | OperationStatus::RetryLater
            | OperationStatus::RecordOnDisk => Status::Pending,
            OperationStatus::Failed => Status::Error,
        }
    }
}

/// Type of client operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationType {
    /// Read operation
    Read,
    /// Read-Modify-Write operation
    Rmw,
    /// Upsert (blind write) operation
    Upsert,
    /// Delete operation
    Delete,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Read => write!(f, "Read"),
            OperationType::Rmw => write!(f, "RMW"),
            OperationType::Upsert => write!(f, "Upsert"),
            OperationType::Delete => write!(f, "Delete"),
        }
    }
}
