//! Error type for administrative calls and fatal operation failures.

use std::io;

use crate::config::ConfigError;

/// Largest key+value payload a single record may carry through the object log.
pub const MAX_OBJECT_SIZE: u64 = 1 << 31;

/// Errors returned by store construction, checkpoint, recovery and maintenance calls.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// Device or filesystem error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    /// Checkpoint metadata (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Index checkpoint was taken with a different table size.
    #[error("index table size mismatch: expected {expected} buckets, checkpoint has {found}")]
    TableSizeMismatch {
        /// Table size allocated for recovery.
        expected: u64,
        /// Table size recorded in the checkpoint.
        found: u64,
    },
    /// A key-value payload exceeds the object size limit.
    #[error("object of {size} bytes exceeds the {limit} byte limit")]
    ObjectTooLarge {
        /// Payload size in bytes.
        size: u64,
        /// Maximum payload size in bytes.
        limit: u64,
    },
    /// A record does not fit in one log page.
    #[error("record of {size} bytes does not fit in a {page_size} byte page")]
    RecordTooLarge {
        /// Record size in bytes.
        size: u64,
        /// Page size in bytes.
        page_size: u64,
    },
    /// No checkpoint exists for the token.
    #[error("checkpoint {0} not found")]
    CheckpointNotFound(uuid::Uuid),
    /// No recovered session carries this id.
    #[error("session {0} is not part of the recovered checkpoint")]
    UnknownSession(uuid::Uuid),
    /// On-disk data failed validation.
    #[error("corruption: {0}")]
    Corruption(String),
    /// A key or value could not be encoded or decoded by its codec.
    #[error("codec error: {0}")]
    Codec(&'static str),
    /// A conflicting maintenance task holds the system phase.
    #[error("store busy: {0}")]
    Busy(&'static str),
    /// A disk read failed after exhausting its retry policy.
    #[error("read of {address:#x} failed after {attempts} attempt(s): {message}")]
    ReadFailed {
        /// Logical address being read.
        address: u64,
        /// Number of attempts made.
        attempts: u32,
        /// Last device error.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = KvError::TableSizeMismatch {
            expected: 128,
            found: 256,
        };
        assert_eq!(
            err.to_string(),
            "index table size mismatch: expected 128 buckets, checkpoint has 256"
        );

        let err = KvError::ObjectTooLarge {
            size: MAX_OBJECT_SIZE + 1,
            limit: MAX_OBJECT_SIZE,
        };
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_io_conversion() {
        let err: KvError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, KvError::Io(_)));
    }
}
