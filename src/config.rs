//! Configuration for catalyst-content

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CatalystError, Result};
use crate::snapshots::SnapshotSettings;
use crate::synchronizer::SyncSettings;
use crate::types::EntityType;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("catalyst-content")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of blobs and database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// This node's own address, never synced from
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Static directory of content servers
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default)]
    pub disable_synchronization: bool,

    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    #[serde(default = "default_directory_refresh_interval")]
    pub directory_refresh_interval_secs: u64,

    #[serde(default = "default_sync_stream_timeout")]
    pub sync_stream_timeout_secs: u64,

    #[serde(default = "default_fetch_request_timeout")]
    pub fetch_request_timeout_secs: u64,

    /// Maximum concurrent deployment jobs
    #[serde(default = "default_job_queue_concurrency")]
    pub job_queue_concurrency: usize,

    /// Entity types skipped during sync, e.g. `["profile"]`
    #[serde(default)]
    pub sync_ignored_entity_types: Vec<String>,

    #[serde(default = "default_bloom_expected_items")]
    pub bloom_expected_items: usize,

    #[serde(default = "default_bloom_false_positive_rate")]
    pub bloom_false_positive_rate: f64,

    #[serde(default = "default_snapshot_frequency")]
    pub snapshot_frequency_secs: u64,

    #[serde(default = "default_snapshot_genesis_timestamp")]
    pub snapshot_genesis_timestamp: u64,

    #[serde(default = "default_snapshot_range_ms")]
    pub snapshot_range_ms: u64,

    #[serde(default = "default_snapshot_min_range_ms")]
    pub snapshot_min_range_ms: u64,

    #[serde(default = "default_snapshot_split_threshold")]
    pub snapshot_split_threshold: u64,

    #[serde(default = "default_snapshot_merge_threshold")]
    pub snapshot_merge_threshold: u64,

    /// Delete blobs no active entity references
    #[serde(default)]
    pub garbage_collection: bool,

    #[serde(default = "default_gc_interval")]
    pub garbage_collection_interval_secs: u64,

    /// Blobs younger than this are never collected
    #[serde(default = "default_gc_grace_period")]
    pub garbage_collection_grace_period_secs: u64,

    #[serde(default = "default_retry_delay")]
    pub retry_failed_deployments_delay_secs: u64,

    #[serde(default)]
    pub retry_validation_failures: bool,
}

fn default_server_address() -> String {
    "http://localhost:6969".to_string()
}

fn default_sync_interval_ms() -> u64 {
    60_000
}

fn default_directory_refresh_interval() -> u64 {
    30 * 60
}

fn default_sync_stream_timeout() -> u64 {
    10 * 60
}

fn default_fetch_request_timeout() -> u64 {
    2 * 60
}

fn default_job_queue_concurrency() -> usize {
    10
}

fn default_bloom_expected_items() -> usize {
    5_000_000
}

fn default_bloom_false_positive_rate() -> f64 {
    0.001
}

fn default_snapshot_frequency() -> u64 {
    6 * 60 * 60
}

fn default_snapshot_genesis_timestamp() -> u64 {
    1_577_836_800_000
}

fn default_snapshot_range_ms() -> u64 {
    28 * 24 * 60 * 60 * 1000
}

fn default_snapshot_min_range_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_snapshot_split_threshold() -> u64 {
    10_000
}

fn default_snapshot_merge_threshold() -> u64 {
    2_500
}

fn default_gc_interval() -> u64 {
    6 * 60 * 60
}

fn default_gc_grace_period() -> u64 {
    60 * 60
}

fn default_retry_delay() -> u64 {
    15 * 60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            server_address: default_server_address(),
            peers: Vec::new(),
            disable_synchronization: false,
            sync_interval_ms: default_sync_interval_ms(),
            directory_refresh_interval_secs: default_directory_refresh_interval(),
            sync_stream_timeout_secs: default_sync_stream_timeout(),
            fetch_request_timeout_secs: default_fetch_request_timeout(),
            job_queue_concurrency: default_job_queue_concurrency(),
            sync_ignored_entity_types: Vec::new(),
            bloom_expected_items: default_bloom_expected_items(),
            bloom_false_positive_rate: default_bloom_false_positive_rate(),
            snapshot_frequency_secs: default_snapshot_frequency(),
            snapshot_genesis_timestamp: default_snapshot_genesis_timestamp(),
            snapshot_range_ms: default_snapshot_range_ms(),
            snapshot_min_range_ms: default_snapshot_min_range_ms(),
            snapshot_split_threshold: default_snapshot_split_threshold(),
            snapshot_merge_threshold: default_snapshot_merge_threshold(),
            garbage_collection: false,
            garbage_collection_interval_secs: default_gc_interval(),
            garbage_collection_grace_period_secs: default_gc_grace_period(),
            retry_failed_deployments_delay_secs: default_retry_delay(),
            retry_validation_failures: false,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CatalystError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| CatalystError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get blobs directory
    pub fn blobs_dir(&self) -> PathBuf {
        self.storage_dir.join("blobs")
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join("content.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    /// Parsed `sync_ignored_entity_types`
    pub fn ignored_entity_types(&self) -> Result<HashSet<EntityType>> {
        self.sync_ignored_entity_types
            .iter()
            .map(|name| {
                name.parse::<EntityType>()
                    .map_err(|_| CatalystError::Config(format!("Unknown entity type: {}", name)))
            })
            .collect()
    }

    pub fn sync_settings(&self) -> Result<SyncSettings> {
        Ok(SyncSettings {
            job_queue_concurrency: self.job_queue_concurrency,
            ignored_entity_types: self.ignored_entity_types()?,
            bootstrap_from_snapshots: true,
        })
    }

    pub fn snapshot_settings(&self) -> SnapshotSettings {
        SnapshotSettings {
            genesis_timestamp: self.snapshot_genesis_timestamp,
            range_ms: self.snapshot_range_ms,
            min_range_ms: self.snapshot_min_range_ms,
            split_threshold: self.snapshot_split_threshold,
            merge_threshold: self.snapshot_merge_threshold,
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn directory_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.directory_refresh_interval_secs)
    }

    pub fn snapshot_frequency(&self) -> Duration {
        Duration::from_secs(self.snapshot_frequency_secs)
    }

    pub fn garbage_collection_interval(&self) -> Duration {
        Duration::from_secs(self.garbage_collection_interval_secs)
    }

    pub fn garbage_collection_grace_period(&self) -> Duration {
        Duration::from_secs(self.garbage_collection_grace_period_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_failed_deployments_delay_secs)
    }

    pub fn fetch_request_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_request_timeout_secs)
    }

    pub fn sync_stream_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_stream_timeout_secs)
    }
}
