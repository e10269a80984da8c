//! Epoch-based memory reclamation
//!
//! Workers register with a shared [`LightEpoch`] table and hold the returned
//! [`EpochContext`]. Deferred actions (page eviction, overflow bucket recycling,
//! retired index tables) run only once every protected worker has moved past the
//! epoch in which they were scheduled.

mod light_epoch;

pub use light_epoch::{EpochContext, EpochGuard, LightEpoch, UNPROTECTED};
