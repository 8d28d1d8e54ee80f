// Engine configuration
// Enumerated options loaded from TOML; unknown keys are rejected at load.
// Every component receives its section by injection, never via globals.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Invalid(#[from] toml::de::Error),

    #[error("invalid config value for {key}: {message}")]
    Value { key: String, message: String },
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub retention: Retention,
    pub lease: LeaseConfig,
    pub heartbeat: Heartbeat,
    pub queue: QueueConfig,
    pub limits: Limits,
    pub secrets: SecretsConfig,
    pub storage: StorageConfig,
    pub workflows: WorkflowsConfig,
}

impl Config {
    /// Load from a TOML file and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease.ttl_secs == 0 {
            return Err(ConfigError::Value {
                key: "lease.ttl_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::Value {
                key: "heartbeat.interval_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.heartbeat.grace_multiplier == 0 {
            return Err(ConfigError::Value {
                key: "heartbeat.grace_multiplier".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Value {
                key: "queue.max_attempts".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Retention windows for artifacts and archived logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Retention {
    /// Default expires-at horizon for uploaded artifacts.
    pub artifact_default_days: u32,
    /// Retention for archived step logs.
    pub log_days: u32,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            artifact_default_days: 90,
            log_days: 30,
        }
    }
}

/// Claim lease duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaseConfig {
    pub ttl_secs: u64,
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self { ttl_secs: 60 }
    }
}

/// Runner heartbeat cadence and offline grace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Heartbeat {
    pub interval_secs: u64,
    /// A runner is offline after interval * multiplier without a beat.
    pub grace_multiplier: u32,
}

impl Heartbeat {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.interval_secs * u64::from(self.grace_multiplier))
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            grace_multiplier: 3,
        }
    }
}

/// Queue behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Retry ceiling for lease-loss requeues; jobs are non-idempotent by
    /// default, so this stays at one unless operators opt in.
    pub max_attempts: u32,
    /// How long a job may wait for a capable runner before failing with
    /// `no_matching_runner`.
    pub dispatch_wait_secs: u64,
}

impl QueueConfig {
    pub fn dispatch_wait(&self) -> Duration {
        Duration::from_secs(self.dispatch_wait_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            dispatch_wait_secs: 1800,
        }
    }
}

/// Hard resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    pub max_jobs_per_run: usize,
    pub max_steps_per_job: usize,
    pub max_matrix_axes: usize,
    pub max_workflow_source_bytes: usize,
    pub artifact_size_bytes: u64,
    pub run_artifact_total_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_jobs_per_run: 256,
            max_steps_per_job: 256,
            max_matrix_axes: 32,
            max_workflow_source_bytes: 1024 * 1024,
            artifact_size_bytes: 1024 * 1024 * 1024,
            run_artifact_total_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

/// Secret masking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecretsConfig {
    /// Literal substituted for masked values in logs.
    pub mask_token: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            mask_token: "***".to_string(),
        }
    }
}

/// Artifact storage backend selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    pub filesystem: FilesystemStorage,
    pub object_store: ObjectStoreStorage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackendKind {
    #[default]
    Filesystem,
    ObjectStore,
    /// In-process blob store, for tests and single-node setups.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilesystemStorage {
    pub root: PathBuf,
}

impl Default for FilesystemStorage {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/artifacts"),
        }
    }
}

/// Generic S3-compatible gateway reached over HTTP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObjectStoreStorage {
    pub endpoint: String,
    pub bucket: String,
    /// Static bearer credential presented to the gateway.
    pub access_token: String,
}

/// Where workflow sources live inside a repository.
///
/// The path is configuration on purpose; the engine never assumes one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkflowsConfig {
    pub dir: PathBuf,
}

impl Default for WorkflowsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".kiln/workflows"),
        }
    }
}
