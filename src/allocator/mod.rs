//! Hybrid log allocator
//!
//! The hybrid log spans memory and disk. Records are appended at the tail,
//! updated in place only while they sit in the mutable region, and reach the
//! device once the read-only boundary passes them.
//!
//! # Memory Regions
//!
//! ```text
//! ┌─────────┬──────────────┬────────────────────┐
//! │ On-Disk │  Read-Only   │     Mutable        │
//! │ Region  │    Region    │      Region        │
//! └─────────┴──────────────┴────────────────────┘
//!   ↑          ↑              ↑                  ↑
//! begin      head         read_only            tail
//! ```
//!
//! - **Mutable Region**: most recent pages, supports in-place updates
//! - **Read-Only Region**: older pages in memory, being flushed
//! - **On-Disk Region**: only reachable through device reads
//!
//! # Key Types
//!
//! - [`HybridLog`]: the allocator
//! - [`HybridLogConfig`]: page sizing
//! - [`LogStats`]: boundary snapshot

mod hybrid_log;
mod page_allocator;

pub use hybrid_log::{HybridLog, HybridLogConfig, LogStats};
pub(crate) use hybrid_log::RecordLock;
