//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

/// Errors returned by configuration loading.
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
}

/// Top-level configuration schema as read from TOML / env.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EbbstoreConfig {
    /// Checkpoint subsystem settings.
    pub checkpoint: Option<CheckpointConfigSpec>,
    /// Flusher settings.
    pub flusher: Option<FlusherConfigSpec>,
    /// Durability settings.
    pub durability: Option<DurabilityConfigSpec>,
    /// Bucket-wide settings.
    pub bucket: Option<BucketConfigSpec>,
}

/// Checkpoint section of the schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointConfigSpec {
    /// Item count at which the open checkpoint is closed.
    pub max_items: Option<usize>,
    /// Memory budget across all checkpoints, in bytes.
    pub memory_quota: Option<usize>,
    /// Remove unreferenced checkpoints as soon as a cursor leaves them.
    pub eager_removal: Option<bool>,
    /// Remover task period in milliseconds (lazy mode).
    pub remover_interval_ms: Option<u64>,
}

/// Flusher section of the schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlusherConfigSpec {
    /// Batch item count above which Disk-checkpoint batches are split.
    pub batch_split_trigger: Option<usize>,
    /// Initial retry backoff after a failed commit, in milliseconds.
    pub backoff_base_ms: Option<u64>,
    /// Retry backoff ceiling, in milliseconds.
    pub backoff_max_ms: Option<u64>,
    /// Number of flusher shards.
    pub num_shards: Option<usize>,
}

/// Durability section of the schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DurabilityConfigSpec {
    /// Default SyncWrite timeout in milliseconds.
    pub default_timeout_ms: Option<u64>,
    /// Timeout task period in milliseconds.
    pub timeout_task_interval_ms: Option<u64>,
}

/// Bucket section of the schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketConfigSpec {
    /// Hash-table stripe count per vBucket.
    pub hash_table_stripes: Option<usize>,
    /// Maximum document size in bytes.
    pub max_item_size: Option<usize>,
}

impl EbbstoreConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `EBBSTORE_CONFIG` env var (if set),
    /// then apply `EBBSTORE__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("EBBSTORE_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("EBBSTORE__") {
                continue;
            }
            let path = key["EBBSTORE__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["checkpoint", "max_items"] => {
                    self.checkpoint_mut().max_items = Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "memory_quota"] => {
                    self.checkpoint_mut().memory_quota = Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "eager_removal"] => {
                    self.checkpoint_mut().eager_removal = Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "remover_interval_ms"] => {
                    self.checkpoint_mut().remover_interval_ms = Some(parse_value(&key, &value)?);
                }
                ["flusher", "batch_split_trigger"] => {
                    self.flusher_mut().batch_split_trigger = Some(parse_value(&key, &value)?);
                }
                ["flusher", "backoff_base_ms"] => {
                    self.flusher_mut().backoff_base_ms = Some(parse_value(&key, &value)?);
                }
                ["flusher", "backoff_max_ms"] => {
                    self.flusher_mut().backoff_max_ms = Some(parse_value(&key, &value)?);
                }
                ["flusher", "num_shards"] => {
                    self.flusher_mut().num_shards = Some(parse_value(&key, &value)?);
                }
                ["durability", "default_timeout_ms"] => {
                    self.durability_mut().default_timeout_ms = Some(parse_value(&key, &value)?);
                }
                ["durability", "timeout_task_interval_ms"] => {
                    self.durability_mut().timeout_task_interval_ms =
                        Some(parse_value(&key, &value)?);
                }
                ["bucket", "hash_table_stripes"] => {
                    self.bucket_mut().hash_table_stripes = Some(parse_value(&key, &value)?);
                }
                ["bucket", "max_item_size"] => {
                    self.bucket_mut().max_item_size = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }

    /// Resolve the schema into a concrete runtime configuration.
    pub fn build(&self) -> EngineConfig {
        let ckpt = self.checkpoint.clone().unwrap_or_default();
        let flusher = self.flusher.clone().unwrap_or_default();
        let durability = self.durability.clone().unwrap_or_default();
        let bucket = self.bucket.clone().unwrap_or_default();
        EngineConfig {
            checkpoint_max_items: ckpt.max_items.unwrap_or(10_000),
            checkpoint_memory_quota: ckpt.memory_quota.unwrap_or(100 * 1024 * 1024),
            eager_checkpoint_removal: ckpt.eager_removal.unwrap_or(true),
            remover_interval_ms: ckpt.remover_interval_ms.unwrap_or(200),
            flusher_batch_split_trigger: flusher.batch_split_trigger.unwrap_or(10_000),
            flusher_backoff_base_ms: flusher.backoff_base_ms.unwrap_or(50),
            flusher_backoff_max_ms: flusher.backoff_max_ms.unwrap_or(10_000),
            num_shards: flusher.num_shards.unwrap_or(4).max(1),
            durability_default_timeout_ms: durability.default_timeout_ms.unwrap_or(30_000),
            durability_timeout_task_interval_ms: durability
                .timeout_task_interval_ms
                .unwrap_or(25),
            hash_table_stripes: bucket.hash_table_stripes.unwrap_or(64).max(1),
            max_item_size: bucket.max_item_size.unwrap_or(20 * 1024 * 1024),
        }
    }

    fn checkpoint_mut(&mut self) -> &mut CheckpointConfigSpec {
        self.checkpoint.get_or_insert_with(Default::default)
    }

    fn flusher_mut(&mut self) -> &mut FlusherConfigSpec {
        self.flusher.get_or_insert_with(Default::default)
    }

    fn durability_mut(&mut self) -> &mut DurabilityConfigSpec {
        self.durability.get_or_insert_with(Default::default)
    }

    fn bucket_mut(&mut self) -> &mut BucketConfigSpec {
        self.bucket.get_or_insert_with(Default::default)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Concrete runtime configuration with all defaults applied.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Item count at which the open checkpoint is closed.
    pub checkpoint_max_items: usize,
    /// Memory budget across all checkpoints, in bytes.
    pub checkpoint_memory_quota: usize,
    /// Remove unreferenced checkpoints as soon as a cursor leaves them.
    pub eager_checkpoint_removal: bool,
    /// Remover task period in milliseconds.
    pub remover_interval_ms: u64,
    /// Batch item count above which Disk-checkpoint batches are split.
    pub flusher_batch_split_trigger: usize,
    /// Initial retry backoff after a failed commit, in milliseconds.
    pub flusher_backoff_base_ms: u64,
    /// Retry backoff ceiling, in milliseconds.
    pub flusher_backoff_max_ms: u64,
    /// Number of flusher shards.
    pub num_shards: usize,
    /// Default SyncWrite timeout in milliseconds.
    pub durability_default_timeout_ms: u64,
    /// Timeout task period in milliseconds.
    pub durability_timeout_task_interval_ms: u64,
    /// Hash-table stripe count per vBucket.
    pub hash_table_stripes: usize,
    /// Maximum document size in bytes.
    pub max_item_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EbbstoreConfig::default().build()
    }
}
