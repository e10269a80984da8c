//! Checkpoint and recovery.
//!
//! A checkpoint quiesces the store just long enough to copy the index, close
//! the current version and collect session commit points. The log part is
//! persisted while workers run again:
//!
//! - fold-over flushes the log up to the final address on the main device;
//! - snapshot copies the unflushed range `[flushed_until, final)` into
//!   `snapshot.dat` inside the checkpoint directory.
//!
//! `log.meta.json` is written last; a directory without it is not a checkpoint.

use std::fs;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::checkpoint::{
    checkpoint_path, find_latest_checkpoint, read_metadata, write_json, CheckpointToken,
    CheckpointType, LogMetadata, SessionCommit, INDEX_DATA_FILE, INDEX_META_FILE, LOG_META_FILE,
    SNAPSHOT_FILE,
};
use crate::config::KvConfig;
use crate::device::{read_exact, write_all, FileSystemDisk, StorageDevice};
use crate::error::KvError;
use crate::store::state_transitions::{Action, Phase};
use crate::store::Functions;

use super::FasterKv;

impl<F: Functions, D: StorageDevice> FasterKv<F, D> {
    /// Take a checkpoint of the index and the log.
    ///
    /// Blocks until the checkpoint is durable and returns its token. Must not
    /// be called from inside a session operation. Sessions learn about the
    /// checkpoint through `checkpoint_completion_callback` on their next
    /// refresh.
    pub fn checkpoint(&self) -> Result<CheckpointToken, KvError> {
        if let Err(state) = self.system_state.try_start(Action::Checkpoint) {
            tracing::warn!(action = ?state.action, "checkpoint refused, store busy");
            return Err(KvError::Busy("another maintenance action is running"));
        }
        let result = self.run_checkpoint();
        self.system_state.finish();
        if let Err(err) = &result {
            tracing::error!(error = %err, "checkpoint failed");
        }
        result
    }

    fn run_checkpoint(&self) -> Result<CheckpointToken, KvError> {
        let token = Uuid::new_v4();
        let dir = checkpoint_path(&self.config.checkpoint_dir, token);
        fs::create_dir_all(&dir)?;
        let checkpoint_type = self.config.checkpoint_type;

        self.quiesce();
        let snapshot = self.index.snapshot();
        let final_address = self.hlog.tail_address();
        let begin_address = self.hlog.begin_address();
        let commit_points = self.collect_commit_points();
        let version = self.system_state.bump_version();
        self.system_state.set_phase(Phase::Persisting);

        let flushed_until_address = match checkpoint_type {
            CheckpointType::FoldOver => {
                self.hlog.flush_to(final_address)?;
                final_address
            }
            CheckpointType::Snapshot => {
                self.hlog.pin_head(self.hlog.head_address());
                let from = self.hlog.flushed_until_address().min(final_address);
                let written = FileSystemDisk::single_file(dir.join(SNAPSHOT_FILE))
                    .and_then(|dst| self.hlog.write_snapshot(from, final_address, &dst));
                self.hlog.unpin_head();
                let written = written?;
                if tracing::enabled!(tracing::Level::DEBUG) {
                    tracing::debug!(from = %from, until = %final_address, bytes = written, "log snapshot written");
                }
                from
            }
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let index_device = FileSystemDisk::single_file(dir.join(INDEX_DATA_FILE))?;
        let index_meta = runtime.block_on(snapshot.write_to(&index_device, token))?;
        write_json(&dir.join(INDEX_META_FILE), &index_meta)?;

        let sessions = commit_points
            .iter()
            .map(|(id, point)| SessionCommit {
                session_id: *id,
                commit_point: point.clone(),
            })
            .collect();
        let log_meta = LogMetadata {
            token,
            checkpoint_type,
            version,
            begin_address,
            final_address,
            flushed_until_address,
            use_object_log: self.config.object_log,
            object_log_tail: self.hlog.object_log_tail(),
            sessions,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };
        write_json(&dir.join(LOG_META_FILE), &log_meta)?;

        let session_count = commit_points.len();
        self.publish_commit_points(commit_points);
        tracing::info!(
            %token,
            %checkpoint_type,
            version,
            final_address = %final_address,
            index_entries = index_meta.num_entries,
            sessions = session_count,
            "checkpoint complete"
        );
        Ok(token)
    }

    /// Open a store on `device` and restore the checkpoint `token` from
    /// `config.checkpoint_dir`.
    ///
    /// `config.table_size` must match the checkpointed index. Sessions that
    /// took part in the checkpoint resume through `continue_session`.
    pub fn recover(
        config: KvConfig,
        functions: F,
        device: D,
        token: CheckpointToken,
    ) -> Result<Arc<Self>, KvError> {
        let store = Self::open(config, functions, Arc::new(device), None)?;
        store.restore_checkpoint(token)?;
        Ok(Arc::new(store))
    }

    /// Like [`FasterKv::recover`], for a store with an object log.
    pub fn recover_with_object_log(
        config: KvConfig,
        functions: F,
        device: D,
        objects: Arc<dyn StorageDevice>,
        token: CheckpointToken,
    ) -> Result<Arc<Self>, KvError> {
        let store = Self::open(config, functions, Arc::new(device), Some(objects))?;
        store.restore_checkpoint(token)?;
        Ok(Arc::new(store))
    }

    /// Recover the newest complete checkpoint under `config.checkpoint_dir`.
    pub fn recover_latest(config: KvConfig, functions: F, device: D) -> Result<Arc<Self>, KvError> {
        let latest = find_latest_checkpoint(&config.checkpoint_dir)?.ok_or_else(|| {
            KvError::Corruption(format!(
                "no checkpoint under {}",
                config.checkpoint_dir.display()
            ))
        })?;
        Self::recover(config, functions, device, latest.token)
    }

    fn restore_checkpoint(&self, token: CheckpointToken) -> Result<(), KvError> {
        let (index_meta, log_meta) = read_metadata(&self.config.checkpoint_dir, token)?;
        if log_meta.use_object_log != self.config.object_log {
            return Err(KvError::Corruption(format!(
                "checkpoint {token} object log setting does not match the store"
            )));
        }
        let dir = checkpoint_path(&self.config.checkpoint_dir, token);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("hybridkv-recovery")
            .enable_all()
            .build()?;
        let index_device = Arc::new(FileSystemDisk::single_file(dir.join(INDEX_DATA_FILE))?);
        let chunks = self.index.recover(
            &index_meta,
            index_device,
            runtime.handle(),
            self.config.recovery_chunks,
        )?;

        if log_meta.checkpoint_type == CheckpointType::Snapshot {
            let len = log_meta
                .final_address
                .control()
                .saturating_sub(log_meta.flushed_until_address.control());
            if len > 0 {
                let snapshot = FileSystemDisk::single_file(dir.join(SNAPSHOT_FILE))?;
                let mut buf = vec![0u8; len as usize];
                let device = self.hlog.device();
                runtime.block_on(async {
                    read_exact(&snapshot, 0, &mut buf).await?;
                    write_all(&**device, log_meta.flushed_until_address.control(), &buf).await?;
                    device.flush().await
                })?;
            }
        }

        self.hlog.restore(
            log_meta.begin_address,
            log_meta.final_address,
            log_meta.object_log_tail,
        );
        self.system_state.set_version(log_meta.version.wrapping_add(1));

        let mut recovered = self.recovered_sessions.lock();
        for session in &log_meta.sessions {
            recovered.insert(session.session_id, session.commit_point.clone());
        }
        tracing::info!(
            %token,
            checkpoint_type = %log_meta.checkpoint_type,
            version = log_meta.version,
            final_address = %log_meta.final_address,
            index_chunks = chunks,
            sessions = recovered.len(),
            "store recovered"
        );
        Ok(())
    }
}
