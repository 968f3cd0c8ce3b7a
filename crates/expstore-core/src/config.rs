use crate::errors::{ExpStoreError, Result};
use crate::retry::RetryPolicy;
use crate::shard::{CHANGE_LIST_PARTITION_SHARDS, MASTER_PARTITION_SHARDS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Whether a store may write to the backing database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub access_mode: AccessMode,
    pub master_shards: usize,
    pub change_list_shards: usize,
    /// Retries for loads and batch writes.
    pub max_retries: u32,
    pub max_operation_time_secs: u64,
    /// Retries for flipping a record to committed.
    pub commit_retries: u32,
    /// Watch restarts a shard worker attempts after transient stream errors.
    pub max_stream_restarts: u32,
    pub log_level: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("expstore.db"),
            access_mode: AccessMode::ReadWrite,
            master_shards: MASTER_PARTITION_SHARDS,
            change_list_shards: CHANGE_LIST_PARTITION_SHARDS,
            max_retries: 3,
            max_operation_time_secs: 120,
            commit_retries: 10,
            max_stream_restarts: 3,
            log_level: "info".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.master_shards == 0 || self.change_list_shards == 0 {
            return Err(ExpStoreError::Config(format!(
                "shard counts must be at least 1 (master_shards={}, change_list_shards={})",
                self.master_shards, self.change_list_shards
            )));
        }
        if self.max_operation_time_secs == 0 {
            return Err(ExpStoreError::Config(
                "max_operation_time_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            max_operation_time: Duration::from_secs(self.max_operation_time_secs),
            ..RetryPolicy::default()
        }
    }

    pub fn commit_policy(&self) -> RetryPolicy {
        self.retry_policy().with_retries(self.commit_retries)
    }

    /// Applies `EXPSTORE_*` environment overrides.
    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("EXPSTORE_DB") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("EXPSTORE_ACCESS_MODE") {
            match v.as_str() {
                "read_only" | "readonly" => self.access_mode = AccessMode::ReadOnly,
                "read_write" | "readwrite" => self.access_mode = AccessMode::ReadWrite,
                other => tracing::warn!(value = %other, "ignoring unknown EXPSTORE_ACCESS_MODE"),
            }
        }
        if let Some(n) = lookup("EXPSTORE_MASTER_SHARDS").and_then(|v| v.parse().ok()) {
            self.master_shards = n;
        }
        if let Some(n) = lookup("EXPSTORE_CL_SHARDS").and_then(|v| v.parse().ok()) {
            self.change_list_shards = n;
        }
        if let Some(n) = lookup("EXPSTORE_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.max_retries = n;
        }
        if let Some(v) = lookup("EXPSTORE_LOG") {
            self.log_level = v;
        }
        self
    }
}

/// Loads a YAML config. Unknown keys fail in strict mode and warn otherwise.
pub fn load_config(path: &Path, strict: bool) -> Result<StoreConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ExpStoreError::Config(format!("failed to read config {}: {}", path.display(), e))
    })?;

    let mut ignored_keys = std::collections::BTreeSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(&raw);
    let cfg: StoreConfig = serde_ignored::deserialize(deserializer, |p| {
        ignored_keys.insert(p.to_string());
    })
    .map_err(|e| ExpStoreError::Config(format!("failed to parse YAML: {}", e)))?;

    if !ignored_keys.is_empty() {
        if strict {
            return Err(ExpStoreError::Config(format!(
                "unknown fields in strict mode: {:?} (file: {})",
                ignored_keys,
                path.display()
            )));
        }
        tracing::warn!(keys = ?ignored_keys, "ignored unknown config fields");
    }

    cfg.validate()?;
    Ok(cfg)
}
