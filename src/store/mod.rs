//! Key-value store
//!
//! [`FasterKv`] holds the index, the hybrid log and the pending I/O pipeline;
//! workers operate on it through [`Session`]s, and record semantics come from
//! a [`Functions`] implementation.

mod contexts;
mod faster_kv;
mod functions;
mod pending_io;
mod resolver;
mod session;
mod state_transitions;

pub use faster_kv::{CompactionStats, FasterKv};
pub use functions::{Functions, SimpleFunctions};
pub use session::Session;
pub use state_transitions::{Action, AtomicSystemState, Phase, SystemState};
