//! Downloader Configuration
//!
//! Settings for the cache directories, capacity and transport. Loaded from an
//! optional JSON file, then overridden from the environment.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::errors::{DownloadError, Result};

/// Default cache capacity: 1 GiB
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 1024 * 1024 * 1024;

/// Default per-request timeout
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on simultaneous transfers
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 5;

const ENV_CACHE_DIR: &str = "CACHED_DOWNLOADER_CACHE_DIR";
const ENV_TMP_DIR: &str = "CACHED_DOWNLOADER_TMP_DIR";
const ENV_MAX_SIZE: &str = "CACHED_DOWNLOADER_MAX_SIZE";
const ENV_TIMEOUT_SECS: &str = "CACHED_DOWNLOADER_TIMEOUT_SECS";
const ENV_MAX_CONCURRENT: &str = "CACHED_DOWNLOADER_MAX_CONCURRENT";
const ENV_SKIP_SSL_VERIFICATION: &str = "CACHED_DOWNLOADER_SKIP_SSL_VERIFICATION";

/// Accept a number of seconds as a JSON number or a numeric string
fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct SecondsVisitor;

    impl<'de> de::Visitor<'de> for SecondsVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a number of seconds, or a string containing one")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<Duration, E> {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<Duration, E> {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| de::Error::custom("negative timeout"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Duration, E> {
            value
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(de::Error::custom)
        }
    }

    deserializer.deserialize_any(SecondsVisitor)
}

/// Base directory for everything the downloader writes by default
fn default_base_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("cached-downloader")
}

/// Cached downloader settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Directory holding stored artifacts; wiped on startup
    pub cached_dir: PathBuf,
    /// Scratch directory for in-progress downloads and uncached artifacts
    pub uncached_dir: PathBuf,
    /// Cache capacity in bytes
    pub max_size_bytes: u64,
    /// Per-request timeout
    #[serde(rename = "download_timeout_secs", deserialize_with = "deserialize_secs")]
    pub download_timeout: Duration,
    /// Bound on simultaneous transfers
    pub max_concurrent_downloads: usize,
    /// Accept invalid TLS certificates
    pub skip_ssl_verification: bool,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        let base = default_base_dir();
        Self {
            cached_dir: base.join("cache"),
            uncached_dir: base.join("tmp"),
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            skip_ssl_verification: false,
        }
    }
}

impl DownloaderConfig {
    /// Default settings rooted at the given directories
    pub fn new(cached_dir: impl Into<PathBuf>, uncached_dir: impl Into<PathBuf>) -> Self {
        Self {
            cached_dir: cached_dir.into(),
            uncached_dir: uncached_dir.into(),
            ..Self::default()
        }
    }

    /// Load settings from a JSON file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| DownloadError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Apply `CACHED_DOWNLOADER_*` environment variables on top of these settings
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| env::var(name).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            self.cached_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_TMP_DIR) {
            self.uncached_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup(ENV_MAX_SIZE) {
            self.max_size_bytes = parse_env(ENV_MAX_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_TIMEOUT_SECS) {
            self.download_timeout = Duration::from_secs(parse_env(ENV_TIMEOUT_SECS, &value)?);
        }
        if let Some(value) = lookup(ENV_MAX_CONCURRENT) {
            self.max_concurrent_downloads = parse_env(ENV_MAX_CONCURRENT, &value)?;
        }
        if let Some(value) = lookup(ENV_SKIP_SSL_VERIFICATION) {
            self.skip_ssl_verification = matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            );
        }
        Ok(self)
    }

    /// Reject settings the downloader cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(DownloadError::Config(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.download_timeout.is_zero() {
            return Err(DownloadError::Config(
                "download_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.cached_dir == self.uncached_dir {
            return Err(DownloadError::Config(format!(
                "cached_dir and uncached_dir must differ (both {})",
                self.cached_dir.display()
            )));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| DownloadError::Config(format!("{}={:?}: {}", name, value, e)))
}
