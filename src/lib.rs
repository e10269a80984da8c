//! hybridkv - a concurrent key-value store on a hybrid log
//!
//! Records live in a log that spans memory and a storage device. Recent
//! records are updated in place, older ones are copied forward on update,
//! and records that left memory are fetched with asynchronous reads that the
//! caller drains with `complete_pending`.
//!
//! # Features
//!
//! - Epoch-based protection for page eviction and index table retirement
//! - Lock-free hash index with tentative two-phase insertion and online doubling
//! - Fold-over and snapshot checkpoints with per-session commit points
//! - Log compaction that copies live records forward before truncating
//! - Optional object log for variable-length payloads of flushed records
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use hybridkv::{FasterKv, KvConfig, MemoryDevice, SimpleFunctions, Status};
//!
//! let store = FasterKv::new(
//!     KvConfig::new(1 << 10, 1 << 24),
//!     SimpleFunctions::<u64, u64>::new(),
//!     MemoryDevice::new(),
//! )?;
//! let mut session = store.start_session()?;
//!
//! session.upsert(&1, &42, ());
//! let mut output = None;
//! if session.read(&1, 0, &mut output, ()) == Status::Pending {
//!     session.complete_pending(true);
//! }
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod allocator;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod device;
pub mod epoch;
pub mod error;
pub mod index;
pub mod record;
pub mod status;
pub mod store;
mod utility;

// Re-exports for convenience
pub use address::{Address, AtomicAddress};
pub use checkpoint::{CheckpointToken, CheckpointType, CommitPoint};
pub use codec::{PersistKey, PersistValue, RawBytes, Utf8};
pub use config::{ConfigError, HybridKvConfig, KvConfig, ReadRetryPolicy};
pub use device::{FileSystemDisk, MemoryDevice, StorageDevice};
pub use error::KvError;
pub use record::RecordInfo;
pub use status::Status;
pub use store::{CompactionStats, FasterKv, Functions, Session, SimpleFunctions};

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Maximum number of threads supported
    pub const MAX_THREADS: usize = 96;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::config::KvConfig;
    pub use crate::status::Status;
    pub use crate::store::{FasterKv, Functions, Session, SimpleFunctions};
}
