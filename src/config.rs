//! Store configuration and loading helpers.
//!
//! [`KvConfig`] is what the store consumes. [`HybridKvConfig`] is the TOML
//! schema: every field is optional and is merged onto `KvConfig::default()`.
//! Environment variables of the form `HYBRIDKV__section__field` override the
//! file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::allocator::HybridLogConfig;
use crate::checkpoint::CheckpointType;
use crate::device::FileSystemDisk;
use crate::record::MIN_RECORD_SIZE;
use crate::utility::is_power_of_two;

const ENV_CONFIG_PATH: &str = "HYBRIDKV_CONFIG";
const ENV_PREFIX: &str = "HYBRIDKV__";

/// Errors returned by configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// Missing required configuration field.
    #[error("missing required field: {0}")]
    MissingField(String),
}

fn invalid(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// How failed device reads of pending operations are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRetryPolicy {
    /// Total attempts per read, the first one included. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling delay.
    pub max_backoff: Duration,
}

impl ReadRetryPolicy {
    /// Never reissue a failed read.
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(100),
        }
    }

    /// Retry up to `max_attempts` times with exponential backoff.
    pub const fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::no_retry()
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff)
    }
}

impl Default for ReadRetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct KvConfig {
    /// Number of main hash buckets (power of two)
    pub table_size: u64,
    /// Bytes of resident log memory
    pub log_memory_size: u64,
    /// log2 of the log page size
    pub page_size_bits: u32,
    /// log2 of the device segment size
    pub segment_size_bits: u32,
    /// Fraction of resident pages that stay mutable
    pub mutable_fraction: f64,
    /// Move key and value bytes to an object log on flush
    pub object_log: bool,
    /// Log checkpoint mode
    pub checkpoint_type: CheckpointType,
    /// Directory holding checkpoint folders
    pub checkpoint_dir: PathBuf,
    /// Cap on concurrently outstanding device reads
    pub max_inflight_reads: usize,
    /// First read size when fetching a record from disk
    pub initial_read_size: usize,
    /// Retry policy for failed pending reads
    pub read_retry: ReadRetryPolicy,
    /// Requested parallel chunks for index recovery
    pub recovery_chunks: u32,
    /// Index load factor at which [`crate::store::FasterKv::grow_if_needed`] doubles the table
    pub grow_load_factor: f64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            table_size: 1 << 20,
            log_memory_size: 1 << 30,
            page_size_bits: 25,
            segment_size_bits: 30,
            mutable_fraction: 0.9,
            object_log: false,
            checkpoint_type: CheckpointType::FoldOver,
            checkpoint_dir: PathBuf::from("checkpoints"),
            max_inflight_reads: 120,
            initial_read_size: 512,
            read_retry: ReadRetryPolicy::default(),
            recovery_chunks: 16,
            grow_load_factor: 0.9,
        }
    }
}

impl KvConfig {
    /// Small configuration: `table_size` buckets and `log_memory_size` bytes of log.
    pub fn new(table_size: u64, log_memory_size: u64) -> Self {
        Self {
            table_size,
            log_memory_size,
            ..Self::default()
        }
    }

    /// Set the page size bits.
    pub fn with_page_size_bits(mut self, bits: u32) -> Self {
        self.page_size_bits = bits;
        self
    }

    /// Set the checkpoint directory.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    /// Set the log checkpoint mode.
    pub fn with_checkpoint_type(mut self, checkpoint_type: CheckpointType) -> Self {
        self.checkpoint_type = checkpoint_type;
        self
    }

    /// Enable or disable the object log.
    pub fn with_object_log(mut self, enabled: bool) -> Self {
        self.object_log = enabled;
        self
    }

    /// Set the pending read retry policy.
    pub fn with_read_retry(mut self, policy: ReadRetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    /// Page sizing for the hybrid log.
    pub fn hybrid_log_config(&self) -> HybridLogConfig {
        HybridLogConfig::new(
            self.log_memory_size,
            self.page_size_bits,
            self.segment_size_bits,
            self.mutable_fraction,
        )
    }

    /// Check ranges and power-of-two constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_power_of_two(self.table_size) {
            return Err(invalid("store.table_size", self.table_size));
        }
        if !(9..=30).contains(&self.page_size_bits) {
            return Err(invalid("log.page_size_bits", self.page_size_bits));
        }
        if self.segment_size_bits < self.page_size_bits || self.segment_size_bits > 40 {
            return Err(invalid("log.segment_size_bits", self.segment_size_bits));
        }
        if self.log_memory_size >> self.page_size_bits < 2 {
            return Err(invalid("log.log_memory_size", self.log_memory_size));
        }
        if !(0.0..=1.0).contains(&self.mutable_fraction) {
            return Err(invalid("log.mutable_fraction", self.mutable_fraction));
        }
        if self.max_inflight_reads == 0 {
            return Err(invalid("pending.max_inflight_reads", self.max_inflight_reads));
        }
        if self.initial_read_size < MIN_RECORD_SIZE {
            return Err(invalid("pending.initial_read_size", self.initial_read_size));
        }
        if self.read_retry.max_attempts == 0 {
            return Err(invalid(
                "pending.retry_max_attempts",
                self.read_retry.max_attempts,
            ));
        }
        if self.recovery_chunks == 0 {
            return Err(invalid("checkpoint.recovery_chunks", self.recovery_chunks));
        }
        if !(self.grow_load_factor > 0.0 && self.grow_load_factor <= 8.0) {
            return Err(invalid("store.grow_load_factor", self.grow_load_factor));
        }
        Ok(())
    }
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HybridKvConfig {
    /// Index settings.
    pub store: Option<StoreSection>,
    /// Log settings.
    pub log: Option<LogSection>,
    /// Pending read settings.
    pub pending: Option<PendingSection>,
    /// Checkpoint settings.
    pub checkpoint: Option<CheckpointSection>,
    /// Main log device.
    pub device: Option<DeviceConfigSpec>,
}

impl HybridKvConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `HYBRIDKV_CONFIG` env var (if set),
    /// then apply `HYBRIDKV__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var(ENV_CONFIG_PATH).ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            let Some(path) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path = path.to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim();

            match parts.as_slice() {
                ["store", "table_size"] => {
                    self.store_mut().table_size = Some(parse_value(&key, value)?);
                }
                ["store", "grow_load_factor"] => {
                    self.store_mut().grow_load_factor = Some(parse_value(&key, value)?);
                }
                ["log", "log_memory_size"] => {
                    self.log_mut().log_memory_size = Some(parse_value(&key, value)?);
                }
                ["log", "page_size_bits"] => {
                    self.log_mut().page_size_bits = Some(parse_value(&key, value)?);
                }
                ["log", "segment_size_bits"] => {
                    self.log_mut().segment_size_bits = Some(parse_value(&key, value)?);
                }
                ["log", "mutable_fraction"] => {
                    self.log_mut().mutable_fraction = Some(parse_value(&key, value)?);
                }
                ["log", "object_log"] => {
                    self.log_mut().object_log = Some(parse_value(&key, value)?);
                }
                ["pending", "max_inflight_reads"] => {
                    self.pending_mut().max_inflight_reads = Some(parse_value(&key, value)?);
                }
                ["pending", "initial_read_size"] => {
                    self.pending_mut().initial_read_size = Some(parse_value(&key, value)?);
                }
                ["pending", "retry_max_attempts"] => {
                    self.pending_mut().retry_max_attempts = Some(parse_value(&key, value)?);
                }
                ["pending", "retry_initial_backoff_ms"] => {
                    self.pending_mut().retry_initial_backoff_ms = Some(parse_value(&key, value)?);
                }
                ["pending", "retry_max_backoff_ms"] => {
                    self.pending_mut().retry_max_backoff_ms = Some(parse_value(&key, value)?);
                }
                ["checkpoint", "checkpoint_type"] => {
                    self.checkpoint_mut().checkpoint_type = Some(parse_checkpoint_type(&key, value)?);
                }
                ["checkpoint", "dir"] => {
                    self.checkpoint_mut().dir = Some(PathBuf::from(value));
                }
                ["checkpoint", "recovery_chunks"] => {
                    self.checkpoint_mut().recovery_chunks = Some(parse_value(&key, value)?);
                }
                ["device", "kind"] => {
                    self.device_mut().kind = Some(value.to_string());
                }
                ["device", "path"] => {
                    self.device_mut().path = Some(PathBuf::from(value));
                }
                ["device", "base_dir"] => {
                    self.device_mut().base_dir = Some(PathBuf::from(value));
                }
                ["device", "prefix"] => {
                    self.device_mut().prefix = Some(value.to_string());
                }
                ["device", "segment_size"] => {
                    self.device_mut().segment_size = Some(parse_value(&key, value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Merge onto `KvConfig::default()` and validate.
    pub fn to_kv_config(&self) -> Result<KvConfig, ConfigError> {
        let mut config = KvConfig::default();
        if let Some(store) = &self.store {
            store.apply_to(&mut config);
        }
        if let Some(log) = &self.log {
            log.apply_to(&mut config);
        }
        if let Some(pending) = &self.pending {
            pending.apply_to(&mut config);
        }
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.apply_to(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    /// Resolve a device configuration, if present.
    pub fn device_config(&self) -> Result<Option<DeviceConfig>, ConfigError> {
        match self.device.as_ref() {
            Some(spec) => Ok(Some(spec.resolve()?)),
            None => Ok(None),
        }
    }

    /// Open a file-based device from the configuration, if present.
    pub fn open_device(&self) -> Result<Option<FileSystemDisk>, ConfigError> {
        match self.device_config()? {
            Some(device) => Ok(Some(device.open()?)),
            None => Ok(None),
        }
    }

    fn store_mut(&mut self) -> &mut StoreSection {
        self.store.get_or_insert_with(StoreSection::default)
    }

    fn log_mut(&mut self) -> &mut LogSection {
        self.log.get_or_insert_with(LogSection::default)
    }

    fn pending_mut(&mut self) -> &mut PendingSection {
        self.pending.get_or_insert_with(PendingSection::default)
    }

    fn checkpoint_mut(&mut self) -> &mut CheckpointSection {
        self.checkpoint.get_or_insert_with(CheckpointSection::default)
    }

    fn device_mut(&mut self) -> &mut DeviceConfigSpec {
        self.device.get_or_insert_with(DeviceConfigSpec::default)
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSection {
    /// Number of main hash buckets.
    pub table_size: Option<u64>,
    /// Load factor that triggers index growth.
    pub grow_load_factor: Option<f64>,
}

impl StoreSection {
    fn apply_to(&self, config: &mut KvConfig) {
        if let Some(value) = self.table_size {
            config.table_size = value;
        }
        if let Some(value) = self.grow_load_factor {
            config.grow_load_factor = value;
        }
    }
}

/// `[log]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSection {
    /// Resident log memory in bytes.
    pub log_memory_size: Option<u64>,
    /// Log page size bits.
    pub page_size_bits: Option<u32>,
    /// Device segment size bits.
    pub segment_size_bits: Option<u32>,
    /// Mutable fraction of log memory.
    pub mutable_fraction: Option<f64>,
    /// Whether payloads move to an object log on flush.
    pub object_log: Option<bool>,
}

impl LogSection {
    fn apply_to(&self, config: &mut KvConfig) {
        if let Some(value) = self.log_memory_size {
            config.log_memory_size = value;
        }
        if let Some(value) = self.page_size_bits {
            config.page_size_bits = value;
        }
        if let Some(value) = self.segment_size_bits {
            config.segment_size_bits = value;
        }
        if let Some(value) = self.mutable_fraction {
            config.mutable_fraction = value.clamp(0.0, 1.0);
        }
        if let Some(value) = self.object_log {
            config.object_log = value;
        }
    }
}

/// `[pending]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PendingSection {
    /// Cap on concurrent device reads.
    pub max_inflight_reads: Option<usize>,
    /// First read size for a record on disk.
    pub initial_read_size: Option<usize>,
    /// Attempts per failed read.
    pub retry_max_attempts: Option<u32>,
    /// First retry delay in milliseconds.
    pub retry_initial_backoff_ms: Option<u64>,
    /// Largest retry delay in milliseconds.
    pub retry_max_backoff_ms: Option<u64>,
}

impl PendingSection {
    fn apply_to(&self, config: &mut KvConfig) {
        if let Some(value) = self.max_inflight_reads {
            config.max_inflight_reads = value;
        }
        if let Some(value) = self.initial_read_size {
            config.initial_read_size = value;
        }
        if let Some(value) = self.retry_max_attempts {
            config.read_retry.max_attempts = value;
        }
        if let Some(value) = self.retry_initial_backoff_ms {
            config.read_retry.initial_backoff = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_max_backoff_ms {
            config.read_retry.max_backoff = Duration::from_millis(value);
        }
    }
}

/// `[checkpoint]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointSection {
    /// `fold_over` or `snapshot`.
    pub checkpoint_type: Option<CheckpointType>,
    /// Checkpoint directory.
    pub dir: Option<PathBuf>,
    /// Parallel chunks for index recovery.
    pub recovery_chunks: Option<u32>,
}

impl CheckpointSection {
    fn apply_to(&self, config: &mut KvConfig) {
        if let Some(value) = self.checkpoint_type {
            config.checkpoint_type = value;
        }
        if let Some(value) = &self.dir {
            config.checkpoint_dir = value.clone();
        }
        if let Some(value) = self.recovery_chunks {
            config.recovery_chunks = value;
        }
    }
}

/// Device configuration from TOML/env.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfigSpec {
    /// Device kind: "single_file" or "segmented".
    pub kind: Option<String>,
    /// Path for single-file device.
    pub path: Option<PathBuf>,
    /// Base directory for segmented device.
    pub base_dir: Option<PathBuf>,
    /// File prefix for segmented device.
    pub prefix: Option<String>,
    /// Segment size for segmented device.
    pub segment_size: Option<u64>,
}

impl DeviceConfigSpec {
    fn resolve(&self) -> Result<DeviceConfig, ConfigError> {
        let kind = self.kind.as_deref().map(|v| v.to_ascii_lowercase());
        match kind.as_deref() {
            Some("single_file") => self.single_file(),
            Some("segmented") => self.segmented(),
            None if self.path.is_some() => self.single_file(),
            None if self.base_dir.is_some()
                || self.prefix.is_some()
                || self.segment_size.is_some() =>
            {
                self.segmented()
            }
            None => Err(ConfigError::MissingField("device.kind".into())),
            Some(other) => Err(invalid("device.kind", other)),
        }
    }

    fn single_file(&self) -> Result<DeviceConfig, ConfigError> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| ConfigError::MissingField("device.path".into()))?;
        Ok(DeviceConfig::SingleFile { path })
    }

    fn segmented(&self) -> Result<DeviceConfig, ConfigError> {
        let base_dir = self
            .base_dir
            .clone()
            .ok_or_else(|| ConfigError::MissingField("device.base_dir".into()))?;
        let prefix = self
            .prefix
            .clone()
            .ok_or_else(|| ConfigError::MissingField("device.prefix".into()))?;
        let segment_size = self
            .segment_size
            .ok_or_else(|| ConfigError::MissingField("device.segment_size".into()))?;
        if !is_power_of_two(segment_size) {
            return Err(invalid("device.segment_size", segment_size));
        }
        Ok(DeviceConfig::Segmented {
            base_dir,
            prefix,
            segment_size,
        })
    }
}

/// Resolved device configuration.
#[derive(Debug, Clone)]
pub enum DeviceConfig {
    /// Single file device.
    SingleFile {
        /// Path to the device file.
        path: PathBuf,
    },
    /// Segmented device.
    Segmented {
        /// Base directory for segments.
        base_dir: PathBuf,
        /// Segment filename prefix.
        prefix: String,
        /// Segment size in bytes.
        segment_size: u64,
    },
}

impl DeviceConfig {
    /// Open the file-based device described by this config.
    pub fn open(&self) -> Result<FileSystemDisk, ConfigError> {
        match self {
            DeviceConfig::SingleFile { path } => Ok(FileSystemDisk::single_file(path)?),
            DeviceConfig::Segmented {
                base_dir,
                prefix,
                segment_size,
            } => Ok(FileSystemDisk::segmented(base_dir, prefix, *segment_size)?),
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn parse_checkpoint_type(key: &str, value: &str) -> Result<CheckpointType, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "fold_over" | "foldover" => Ok(CheckpointType::FoldOver),
        "snapshot" => Ok(CheckpointType::Snapshot),
        _ => Err(invalid(key, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults_are_valid() {
        let config = KvConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_inflight_reads, 120);
        assert_eq!(config.read_retry.max_attempts, 1);
        assert_eq!(config.checkpoint_type, CheckpointType::FoldOver);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = KvConfig::new(100, 1 << 20);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "store.table_size"
        ));

        let config = KvConfig::new(128, 1 << 12).with_page_size_bits(12);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "log.log_memory_size"
        ));

        let config = KvConfig::new(128, 1 << 20).with_read_retry(ReadRetryPolicy::with_attempts(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = ReadRetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(35),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(35));
        assert_eq!(policy.backoff(40), Duration::from_millis(35));
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hybridkv.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[store]
table_size = 4096

[log]
log_memory_size = 1048576
page_size_bits = 16
object_log = true

[pending]
retry_max_attempts = 3
retry_initial_backoff_ms = 5

[checkpoint]
checkpoint_type = "snapshot"
recovery_chunks = 4

[device]
kind = "segmented"
base_dir = "/tmp/hybridkv"
prefix = "log"
segment_size = 1073741824
"#
        )
        .unwrap();

        let loaded = HybridKvConfig::load_from_path(&path).unwrap();
        let config = loaded.to_kv_config().unwrap();
        assert_eq!(config.table_size, 4096);
        assert_eq!(config.page_size_bits, 16);
        assert!(config.object_log);
        assert_eq!(config.read_retry.max_attempts, 3);
        assert_eq!(config.read_retry.initial_backoff, Duration::from_millis(5));
        assert_eq!(config.checkpoint_type, CheckpointType::Snapshot);
        assert_eq!(config.recovery_chunks, 4);
        assert!(matches!(
            loaded.device_config().unwrap(),
            Some(DeviceConfig::Segmented { segment_size: 1073741824, .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("HYBRIDKV__store__table_size", "2048");
        env::set_var("HYBRIDKV__pending__max_inflight_reads", "16");
        env::set_var("HYBRIDKV__checkpoint__checkpoint_type", "snapshot");

        let mut config = HybridKvConfig::default();
        let result = config.apply_env_overrides();

        env::remove_var("HYBRIDKV__store__table_size");
        env::remove_var("HYBRIDKV__pending__max_inflight_reads");
        env::remove_var("HYBRIDKV__checkpoint__checkpoint_type");
        result.unwrap();

        let kv = config.to_kv_config().unwrap();
        assert_eq!(kv.table_size, 2048);
        assert_eq!(kv.max_inflight_reads, 16);
        assert_eq!(kv.checkpoint_type, CheckpointType::Snapshot);
    }

    #[test]
    fn test_unknown_env_key() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("HYBRIDKV__log__bogus", "1");
        let mut config = HybridKvConfig::default();
        let result = config.apply_env_overrides();
        env::remove_var("HYBRIDKV__log__bogus");

        assert!(matches!(result, Err(ConfigError::UnknownKey(key)) if key == "HYBRIDKV__log__bogus"));
    }

    #[test]
    fn test_device_config_resolve_single_file() {
        let spec = DeviceConfigSpec {
            path: Some(PathBuf::from("/tmp/hybridkv.log")),
            ..DeviceConfigSpec::default()
        };
        match spec.resolve().unwrap() {
            DeviceConfig::SingleFile { path } => assert!(path.ends_with("hybridkv.log")),
            DeviceConfig::Segmented { .. } => panic!("expected single file config"),
        }

        let spec = DeviceConfigSpec {
            kind: Some("tape".into()),
            ..DeviceConfigSpec::default()
        };
        assert!(spec.resolve().is_err());
    }
}
