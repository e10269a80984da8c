//! Checkpoint metadata
//!
//! Checkpoints are taken and restored by [`crate::store::FasterKv`]; this
//! module owns what they leave on disk and how to find them again.

mod serialization;

pub use serialization::{
    checkpoint_path, find_latest_checkpoint, list_checkpoints, read_json, read_metadata,
    write_json, CheckpointInfo, CheckpointToken, CheckpointType, CommitPoint, IndexMetadata,
    LogMetadata, SessionCommit, INDEX_DATA_FILE, INDEX_META_FILE, LOG_META_FILE, SNAPSHOT_FILE,
};
