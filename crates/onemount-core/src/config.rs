//! Configuration for OneMount.
//!
//! Typed configuration structs that map to the YAML configuration file, with
//! loading, range validation and defaults. Out-of-range values for worker
//! pools, queue bounds and chunk sizes are rejected at load rather than at
//! first use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::session::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::errors::CoreError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration for OneMount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mount: MountConfig,
    pub cache: CacheConfig,
    pub downloads: DownloadConfig,
    pub uploads: UploadConfig,
    pub delta: DeltaConfig,
    pub conflicts: ConflictsConfig,
    pub timeouts: TimeoutConfig,
    pub logging: LoggingConfig,
}

/// Mount point settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Directory where the FUSE filesystem is mounted.
    pub mount_point: PathBuf,
    /// Volume label exposed through the virtual volume-info node.
    pub volume_label: String,
}

/// On-disk cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root; holds content bodies, thumbnails and the metadata database.
    pub root: PathBuf,
    /// Capacity figure reported by statfs when no quota probe has succeeded (GiB).
    pub capacity_gb: u32,
    /// Age in days after which unused cached bodies are expired.
    pub expiry_days: u32,
    /// Hours between cleanup sweeps.
    pub cleanup_interval_hours: u32,
}

/// Download (hydration) pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Worker pool size, range [1, 10].
    pub workers: u32,
    /// Bounded queue size, range [100, 5000].
    pub queue_size: u32,
}

/// Upload manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Bodies at or above this size use resumable chunked sessions (bytes).
    pub small_threshold: u64,
    /// Chunk size for resumable sessions (bytes), range [1 MiB, 100 MiB].
    pub chunk_size: u64,
    /// Maximum concurrent in-flight uploads.
    pub max_in_flight: u32,
    /// Bounded queue size, range [100, 5000].
    pub queue_size: u32,
    /// Retry cap for errored sessions.
    pub max_retries: u32,
    /// Seconds to wait for in-flight sessions on shutdown.
    pub stop_grace_secs: u64,
}

/// Delta loop and realtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// Fast interval while foreground metadata activity is recent (seconds).
    pub active_interval_secs: u64,
    /// Baseline polling interval (seconds).
    pub default_interval_secs: u64,
    /// Interval while the realtime notifier is healthy (seconds).
    pub realtime_fallback_secs: u64,
    /// Short recovery interval while the notifier has failed (seconds).
    pub recovery_interval_secs: u64,
    /// How long after a foreground request the loop stays on the fast
    /// interval (seconds).
    pub activity_window_secs: u64,
    /// Realtime subscription endpoint; empty disables the socket transport.
    pub notification_url: String,
}

/// Conflict resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictsConfig {
    /// Default strategy: `last_writer_wins`, `keep_both`, `prefer_local`,
    /// `prefer_remote`.
    pub default_strategy: String,
    /// Per-path overrides, first match wins.
    pub rules: Vec<ConflictRuleConfig>,
}

/// One glob-pattern conflict rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRuleConfig {
    /// Glob pattern matched against the drive-relative path.
    pub pattern: String,
    /// Strategy applied when the pattern matches.
    pub strategy: String,
}

/// Operation deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Individual Graph API call (seconds).
    pub api_secs: u64,
    /// Token refresh (seconds).
    pub token_refresh_secs: u64,
    /// Root-item fetch during init (seconds).
    pub init_root_secs: u64,
    /// Metadata request completion (seconds).
    pub metadata_request_secs: u64,
    /// Per-subsystem stop grace (seconds); uploads use their own window.
    pub stop_grace_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log filter: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount_point: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("OneDrive"),
            volume_label: "OneDrive".to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("~/.cache"))
                .join("onemount"),
            capacity_gb: 64,
            expiry_days: 30,
            cleanup_interval_hours: 24,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_size: 500,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            small_threshold: 4 * 1024 * 1024,
            chunk_size: 10 * 1024 * 1024,
            max_in_flight: 5,
            queue_size: 500,
            max_retries: 5,
            stop_grace_secs: 30,
        }
    }
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            active_interval_secs: 5,
            default_interval_secs: 30,
            realtime_fallback_secs: 300,
            recovery_interval_secs: 10,
            activity_window_secs: 60,
            notification_url: String::new(),
        }
    }
}

impl Default for ConflictsConfig {
    fn default() -> Self {
        Self {
            default_strategy: "last_writer_wins".to_string(),
            rules: Vec::new(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            api_secs: 10,
            token_refresh_secs: 30,
            init_root_secs: 15,
            metadata_request_secs: 30,
            stop_grace_secs: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

/// Valid worker pool range.
const WORKER_RANGE: std::ops::RangeInclusive<u32> = 1..=10;
/// Valid queue bound range.
const QUEUE_RANGE: std::ops::RangeInclusive<u32> = 100..=5000;

impl Config {
    /// Load configuration from a YAML file at `path` and validate it.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to defaults on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("onemount")
            .join("config.yaml")
    }

    /// Checks all range constraints.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !WORKER_RANGE.contains(&self.downloads.workers) {
            return Err(CoreError::InvalidArgument(format!(
                "downloads.workers {} outside [1, 10]",
                self.downloads.workers
            )));
        }
        for (label, size) in [
            ("downloads.queue_size", self.downloads.queue_size),
            ("uploads.queue_size", self.uploads.queue_size),
        ] {
            if !QUEUE_RANGE.contains(&size) {
                return Err(CoreError::InvalidArgument(format!(
                    "{label} {size} outside [100, 5000]"
                )));
            }
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.uploads.chunk_size) {
            return Err(CoreError::InvalidArgument(format!(
                "uploads.chunk_size {} outside [1 MiB, 100 MiB]",
                self.uploads.chunk_size
            )));
        }
        if self.uploads.max_in_flight == 0 {
            return Err(CoreError::InvalidArgument(
                "uploads.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.delta.active_interval_secs == 0 || self.delta.default_interval_secs == 0 {
            return Err(CoreError::InvalidArgument(
                "delta intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the metadata database inside the cache root.
    pub fn database_path(&self) -> PathBuf {
        self.cache.root.join("onemount.db")
    }
}

impl TimeoutConfig {
    pub fn api(&self) -> Duration {
        Duration::from_secs(self.api_secs)
    }

    pub fn metadata_request(&self) -> Duration {
        Duration::from_secs(self.metadata_request_secs)
    }

    pub fn init_root(&self) -> Duration {
        Duration::from_secs(self.init_root_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.downloads.workers, 3);
        assert_eq!(config.uploads.max_in_flight, 5);
        assert_eq!(config.uploads.chunk_size, 10 * 1024 * 1024);
    }

    #[test]
    fn test_worker_pool_bounds() {
        let mut config = Config::default();
        config.downloads.workers = 0;
        assert!(config.validate().is_err());
        config.downloads.workers = 11;
        assert!(config.validate().is_err());
        config.downloads.workers = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_queue_bounds() {
        let mut config = Config::default();
        config.uploads.queue_size = 99;
        assert!(config.validate().is_err());
        config.uploads.queue_size = 5001;
        assert!(config.validate().is_err());
        config.uploads.queue_size = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chunk_size_bounds() {
        let mut config = Config::default();
        config.uploads.chunk_size = 1024;
        assert!(config.validate().is_err());
        config.uploads.chunk_size = 200 * 1024 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "downloads:\n  workers: 5\nuploads:\n  max_in_flight: 2\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.downloads.workers, 5);
        assert_eq!(config.uploads.max_in_flight, 2);
        // untouched sections keep defaults
        assert_eq!(config.delta.default_interval_secs, 30);
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(config.downloads.workers, 3);
    }

    #[test]
    fn test_invalid_yaml_rejected_by_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "downloads:\n  workers: 0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
