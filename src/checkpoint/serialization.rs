//! Checkpoint metadata and its on-disk JSON form
//!
//! Each checkpoint lives in `<checkpoint_dir>/<token>/` and holds:
//! - `index.dat`: main buckets, then overflow buckets at a sector-aligned offset
//! - `index.meta.json`: [`IndexMetadata`]
//! - `log.meta.json`: [`LogMetadata`]
//! - `snapshot.dat`: log bytes `[flushed_until, final)` for snapshot checkpoints

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::error::KvError;

/// Token identifying a checkpoint
pub type CheckpointToken = Uuid;

/// Index data file name
pub const INDEX_DATA_FILE: &str = "index.dat";
/// Index metadata file name
pub const INDEX_META_FILE: &str = "index.meta.json";
/// Log metadata file name
pub const LOG_META_FILE: &str = "log.meta.json";
/// Log snapshot file name
pub const SNAPSHOT_FILE: &str = "snapshot.dat";

/// How the log part of a checkpoint is captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    /// Flush the mutable region to the log device and make it read-only
    #[default]
    FoldOver,
    /// Copy the unflushed tail into a separate snapshot file
    Snapshot,
}

impl std::fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointType::FoldOver => write!(f, "fold-over"),
            CheckpointType::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Prefix of a session's operations covered by a checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPoint {
    /// Every serial up to and including this one is covered, except those excluded
    pub until_serial: u64,
    /// Serials at or below `until_serial` whose operations were still pending
    pub excluded_serials: Vec<u64>,
}

impl CommitPoint {
    /// Whether the operation with `serial` is durable under this commit point.
    pub fn covers(&self, serial: u64) -> bool {
        serial <= self.until_serial && !self.excluded_serials.contains(&serial)
    }
}

/// Commit point of one session at checkpoint time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCommit {
    /// Session id
    pub session_id: Uuid,
    /// What the checkpoint covers for this session
    pub commit_point: CommitPoint,
}

/// Index checkpoint metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Checkpoint token
    pub token: CheckpointToken,
    /// Number of main buckets
    pub table_size: u64,
    /// Main buckets holding at least one entry
    pub num_buckets: u64,
    /// Used entries, overflow included
    pub num_entries: u64,
    /// Bytes of main bucket data at offset 0 of `index.dat`
    pub num_ht_bytes: u64,
    /// Offset of the overflow region in `index.dat`
    pub overflow_offset: u64,
    /// Overflow buckets stored
    pub num_overflow_buckets: u64,
    /// Bytes of overflow bucket data
    pub num_ofb_bytes: u64,
    /// Overflow pool free list (1-based indices)
    #[serde(default)]
    pub free_list: Vec<u64>,
}

/// Log checkpoint metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMetadata {
    /// Checkpoint token
    pub token: CheckpointToken,
    /// Log checkpoint mode
    pub checkpoint_type: CheckpointType,
    /// Store version that the checkpoint closed
    pub version: u32,
    /// Log begin address
    pub begin_address: Address,
    /// Tail at the version bump; recovery discards anything later
    pub final_address: Address,
    /// Log durable on the main device up to here when the checkpoint started
    pub flushed_until_address: Address,
    /// Whether records carry object-log payloads
    pub use_object_log: bool,
    /// Object log end at checkpoint time
    #[serde(default)]
    pub object_log_tail: u64,
    /// Per-session commit points
    #[serde(default)]
    pub sessions: Vec<SessionCommit>,
    /// Wall-clock creation time, seconds since the epoch
    #[serde(default)]
    pub created_at: u64,
}

/// Checkpoint directory for `token` under `base`.
pub fn checkpoint_path(base: &Path, token: CheckpointToken) -> PathBuf {
    base.join(token.to_string())
}

/// Write `value` as pretty JSON, syncing before returning.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), KvError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Read a JSON document.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, KvError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Read both metadata files of a checkpoint.
pub fn read_metadata(
    base: &Path,
    token: CheckpointToken,
) -> Result<(IndexMetadata, LogMetadata), KvError> {
    let dir = checkpoint_path(base, token);
    if !dir.join(LOG_META_FILE).exists() || !dir.join(INDEX_META_FILE).exists() {
        return Err(KvError::CheckpointNotFound(token));
    }
    let index: IndexMetadata = read_json(&dir.join(INDEX_META_FILE))?;
    let log: LogMetadata = read_json(&dir.join(LOG_META_FILE))?;
    if index.token != token || log.token != token {
        return Err(KvError::Corruption(format!(
            "checkpoint {token} metadata carries a different token"
        )));
    }
    Ok((index, log))
}

/// Summary of a checkpoint found on disk
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    /// Checkpoint token
    pub token: CheckpointToken,
    /// Store version the checkpoint closed
    pub version: u32,
    /// Log mode
    pub checkpoint_type: CheckpointType,
    /// Recovered tail
    pub final_address: Address,
    /// Creation time, seconds since the epoch
    pub created_at: u64,
}

/// List complete checkpoints under `base`, oldest version first.
///
/// Directories that are not checkpoints, or lack metadata, are skipped.
pub fn list_checkpoints(base: &Path) -> Result<Vec<CheckpointInfo>, KvError> {
    let mut found = Vec::new();
    let entries = match fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(token) = entry
            .file_name()
            .to_str()
            .and_then(|name| Uuid::parse_str(name).ok())
        else {
            continue;
        };
        match read_metadata(base, token) {
            Ok((_, log)) => found.push(CheckpointInfo {
                token,
                version: log.version,
                checkpoint_type: log.checkpoint_type,
                final_address: log.final_address,
                created_at: log.created_at,
            }),
            Err(err) => {
                if tracing::enabled!(tracing::Level::DEBUG) {
                    tracing::debug!(%token, error = %err, "skipping incomplete checkpoint");
                }
            }
        }
    }

    found.sort_by_key(|c| (c.version, c.final_address));
    Ok(found)
}

/// Newest complete checkpoint under `base`.
pub fn find_latest_checkpoint(base: &Path) -> Result<Option<CheckpointInfo>, KvError> {
    Ok(list_checkpoints(base)?.pop())
}
