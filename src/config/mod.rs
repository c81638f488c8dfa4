//! Sync service configuration

pub mod duration;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SyncError;

/// Configuration of the sync watcher and service
///
/// Every field has a default, so a YAML file only needs to list overrides:
///
/// ```yaml
/// slot_name: etcd_sync
/// root_path: /contrail
/// status_interval: 5s
/// retry:
///   max_attempts: 10
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Logical replication slot (default: "etcd_sync")
    pub slot_name: String,

    /// Publication covering all tables (default: "etcd_sync")
    pub publication_name: String,

    /// Root of the key layout `/<root_path>/<kind>/<primary key>`
    pub root_path: String,

    /// Interval between status updates; also the longest wait for a message
    #[serde(with = "duration")]
    pub status_interval: Duration,

    /// Replay the full current state before streaming
    pub dump: bool,

    /// Rows written per store transaction during the dump
    pub dump_batch_size: usize,

    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            slot_name: "etcd_sync".to_string(),
            publication_name: "etcd_sync".to_string(),
            root_path: "/etcd-sync".to_string(),
            status_interval: Duration::from_secs(10),
            dump: true,
            dump_batch_size: 100,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SyncError> {
        let config: SyncConfig =
            serde_yaml::from_str(yaml).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.slot_name.is_empty() {
            return Err(SyncError::Config("slot_name must not be empty".into()));
        }
        if self.publication_name.is_empty() {
            return Err(SyncError::Config("publication_name must not be empty".into()));
        }
        if self.status_interval.is_zero() {
            return Err(SyncError::Config("status_interval must be positive".into()));
        }
        if self.dump_batch_size == 0 {
            return Err(SyncError::Config("dump_batch_size must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be positive".into()));
        }
        Ok(())
    }
}

/// Bounded exponential backoff for temporary failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
    #[serde(with = "duration")]
    pub initial_backoff: Duration,
    #[serde(with = "duration")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}
