//! Installer configuration.
//!
//! Configuration is read from an explicit path or from
//! `$XDG_CONFIG_HOME/buildpatch/config.toml`. Every field has a
//! default, and out-of-range values are clamped after loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use xdg::BaseDirectories;

use crate::error::{BuildPatchError, BuildPatchResult};

/// Application prefix in XDG base directories.
///
/// This will be concatenated into `$XDG_CONFIG_HOME/buildpatch`.
const XDG_PREFIX: &str = "buildpatch";

/// Configuration for the installer services.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildPatchConfig {
    /// Download service.
    #[serde(default = "Default::default")]
    pub download: DownloadConfig,

    /// Chunk database writer.
    #[serde(default = "Default::default")]
    pub writer: WriterConfig,

    /// Download-backed chunk source.
    #[serde(rename = "cloud-source")]
    #[serde(default = "Default::default")]
    pub cloud_source: CloudSourceConfig,

    /// Chunk database backed chunk source.
    #[serde(rename = "chunkdb-source")]
    #[serde(default = "Default::default")]
    pub chunkdb_source: ChunkDbSourceConfig,
}

/// Download service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadConfig {
    /// How long a request may stay outstanding before it is failed.
    #[serde(rename = "request-timeout")]
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Number of bytes read per step when "downloading" a local file.
    #[serde(rename = "file-read-size")]
    #[serde(default = "default_file_read_size")]
    pub file_read_size: usize,
}

/// Chunk database writer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriterConfig {
    /// How long the output thread waits for a message before
    /// re-checking for cancellation.
    #[serde(rename = "queue-timeout")]
    #[serde(with = "humantime_serde", default = "default_queue_timeout")]
    pub queue_timeout: Duration,
}

/// Cloud chunk source configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudSourceConfig {
    /// Maximum number of chunks downloading at once.
    #[serde(rename = "num-simultaneous-downloads")]
    #[serde(default = "default_num_simultaneous_downloads")]
    pub num_simultaneous_downloads: usize,

    /// Retries per chunk. -1 retries forever.
    #[serde(rename = "max-retry-count")]
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: i32,

    /// Delay before each retry, in seconds.
    ///
    /// The last value is reused for any further retries.
    #[serde(rename = "retry-delay-times")]
    #[serde(default = "default_retry_delay_times")]
    pub retry_delay_times: Vec<f64>,
}

/// Chunk database source configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkDbSourceConfig {
    /// Minimum number of upcoming chunks to load ahead.
    #[serde(rename = "prefetch-minimum")]
    #[serde(default = "default_prefetch_minimum")]
    pub prefetch_minimum: usize,

    /// Maximum number of upcoming chunks to load ahead.
    #[serde(rename = "prefetch-maximum")]
    #[serde(default = "default_prefetch_maximum")]
    pub prefetch_maximum: usize,
}

impl BuildPatchConfig {
    /// Clamps every value into its supported range.
    pub fn normalize(mut self) -> Self {
        let cloud = &mut self.cloud_source;
        cloud.num_simultaneous_downloads = cloud.num_simultaneous_downloads.clamp(1, 100);
        cloud.max_retry_count = cloud.max_retry_count.clamp(-1, 1000);
        if cloud.retry_delay_times.iter().any(|t| t.is_nan() || *t <= 0.0) {
            tracing::warn!("Ignoring invalid retry-delay-times {:?}", cloud.retry_delay_times);
            cloud.retry_delay_times = default_retry_delay_times();
        }
        for time in cloud.retry_delay_times.iter_mut() {
            *time = time.clamp(0.5, 300.0);
        }

        let chunkdb = &mut self.chunkdb_source;
        chunkdb.prefetch_minimum = chunkdb.prefetch_minimum.clamp(1, 1000);
        chunkdb.prefetch_maximum = chunkdb
            .prefetch_maximum
            .clamp(chunkdb.prefetch_minimum, 1000);

        self.download.file_read_size = self.download.file_read_size.max(4096);

        self
    }
}

impl CloudSourceConfig {
    /// Returns the delay before retry number `retry` (starting at 1).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let idx = (retry.max(1) as usize - 1).min(self.retry_delay_times.len().saturating_sub(1));
        self.retry_delay_times
            .get(idx)
            .map(|secs| Duration::from_secs_f64(*secs))
            .unwrap_or(Duration::ZERO)
    }

    /// Returns whether another attempt is allowed after `retries` retries.
    pub fn can_retry(&self, retries: u32) -> bool {
        self.max_retry_count < 0 || (retries as i64) < self.max_retry_count as i64
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            file_read_size: default_file_read_size(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_timeout: default_queue_timeout(),
        }
    }
}

impl Default for CloudSourceConfig {
    fn default() -> Self {
        Self {
            num_simultaneous_downloads: default_num_simultaneous_downloads(),
            max_retry_count: default_max_retry_count(),
            retry_delay_times: default_retry_delay_times(),
        }
    }
}

impl Default for ChunkDbSourceConfig {
    fn default() -> Self {
        Self {
            prefetch_minimum: default_prefetch_minimum(),
            prefetch_maximum: default_prefetch_maximum(),
        }
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_file_read_size() -> usize {
    4 * 1024 * 1024
}

fn default_queue_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_num_simultaneous_downloads() -> usize {
    8
}

fn default_max_retry_count() -> i32 {
    6
}

fn default_retry_delay_times() -> Vec<f64> {
    vec![0.5, 1.0, 1.0, 3.0, 3.0, 10.0, 10.0, 20.0, 20.0, 30.0]
}

fn default_prefetch_minimum() -> usize {
    10
}

fn default_prefetch_maximum() -> usize {
    100
}

/// Loads the configuration.
///
/// Without an explicit path, the XDG config file is used if it exists,
/// otherwise the defaults.
pub fn load_config(path: Option<&Path>) -> BuildPatchResult<BuildPatchConfig> {
    let path = match path {
        Some(path) => Some(path.to_owned()),
        None => get_xdg_config_path(),
    };

    match path {
        Some(path) => load_config_from_path(&path),
        None => {
            tracing::debug!("No configuration file, using defaults");
            Ok(BuildPatchConfig::default())
        }
    }
}

pub fn load_config_from_path(path: &Path) -> BuildPatchResult<BuildPatchConfig> {
    tracing::info!("Using configurations: {:?}", path);

    let config = std::fs::read_to_string(path)?;
    load_config_from_str(&config).map_err(|e| match e {
        BuildPatchError::InvalidConfig { reason, .. } => BuildPatchError::InvalidConfig {
            path: path.to_owned(),
            reason,
        },
        e => e,
    })
}

pub fn load_config_from_str(s: &str) -> BuildPatchResult<BuildPatchConfig> {
    let config: BuildPatchConfig =
        toml::from_str(s).map_err(|e| BuildPatchError::InvalidConfig {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;

    Ok(config.normalize())
}

fn get_xdg_config_path() -> Option<PathBuf> {
    let xdg_dirs = BaseDirectories::with_prefix(XDG_PREFIX).ok()?;
    xdg_dirs.find_config_file("config.toml")
}
