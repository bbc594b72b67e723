//! Cached Downloader
//!
//! Facade composing the downloader, the transformers and the file cache.
//! Fetches for the same cache key run one at a time; fetches for different
//! keys run in parallel up to the downloader's concurrency bound.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sha1::{Digest, Sha1};
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CachedFile, FileCache};
use crate::config::DownloaderConfig;
use crate::download::{CachingInfo, DownloadOutcome, Downloader};
use crate::errors::{DownloadError, Result};
use crate::transform::CacheTransformer;

/// Result of a successful fetch
#[derive(Debug)]
pub enum FetchOutcome {
    /// A new artifact was downloaded and transformed
    Fresh {
        file: CachedFile,
        /// Size of the artifact after transformation
        size: u64,
    },
    /// The origin reported the stored artifact unchanged; it is returned as-is
    Reused { file: CachedFile },
}

impl FetchOutcome {
    /// Whether the previously stored artifact was reused
    pub fn is_reused(&self) -> bool {
        matches!(self, FetchOutcome::Reused { .. })
    }

    /// Get the handle to the artifact
    pub fn file(&self) -> &CachedFile {
        match self {
            FetchOutcome::Fresh { file, .. } | FetchOutcome::Reused { file } => file,
        }
    }

    /// Take the handle to the artifact
    pub fn into_file(self) -> CachedFile {
        match self {
            FetchOutcome::Fresh { file, .. } | FetchOutcome::Reused { file } => file,
        }
    }

    /// Handle and byte count, reporting 0 for a reused artifact
    pub fn into_parts(self) -> (CachedFile, u64) {
        match self {
            FetchOutcome::Fresh { file, size } => (file, size),
            FetchOutcome::Reused { file } => (file, 0),
        }
    }
}

/// A downloaded and transformed artifact not yet handed to the cache
struct Artifact {
    path: TempPath,
    size: u64,
    caching_info: CachingInfo,
}

/// Claim on a cache key; released on drop, waking every waiter
struct InFlight<'a> {
    in_progress: &'a Mutex<HashMap<String, CancellationToken>>,
    key: String,
    released: CancellationToken,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        self.released.cancel();
    }
}

/// HTTP download cache
pub struct CachedDownloader {
    /// Transport for all downloads
    downloader: Downloader,
    /// Scratch directory for downloads and uncached artifacts
    uncached_dir: PathBuf,
    /// Stored artifacts
    cache: FileCache,
    /// Release signal per cache key currently being fetched
    in_progress: Mutex<HashMap<String, CancellationToken>>,
}

impl CachedDownloader {
    /// Create a cached downloader
    ///
    /// Creates the scratch directory and wipes the cache directory.
    pub fn new(config: &DownloaderConfig) -> Result<Self> {
        config.validate()?;

        fs::create_dir_all(&config.uncached_dir)?;
        let cache = FileCache::new(&config.cached_dir, config.max_size_bytes)?;
        let downloader = Downloader::new(
            config.download_timeout,
            config.max_concurrent_downloads,
            config.skip_ssl_verification,
        )?;

        info!(
            uncached_dir = %config.uncached_dir.display(),
            max_concurrent_downloads = config.max_concurrent_downloads,
            timeout_secs = config.download_timeout.as_secs(),
            "Cached downloader ready"
        );

        Ok(Self {
            downloader,
            uncached_dir: config.uncached_dir.clone(),
            cache,
            in_progress: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch an artifact, serving it from the cache when the origin allows
    ///
    /// # Arguments
    /// * `url` - Artifact location
    /// * `cache_key` - Logical identity of the artifact; empty disables caching
    /// * `transformer` - Post-processing applied to newly downloaded bytes
    /// * `cancel` - Aborts waiting and transferring with [`DownloadError::Cancelled`]
    pub async fn fetch(
        &self,
        url: &Url,
        cache_key: &str,
        transformer: Arc<dyn CacheTransformer>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        if cache_key.is_empty() {
            return self.fetch_uncached(url, transformer, cancel).await;
        }

        let key = derive_cache_key(cache_key);
        self.fetch_cached(url, &key, transformer, cancel).await
    }

    /// Get the underlying file cache
    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Get the scratch directory path
    pub fn uncached_dir(&self) -> &Path {
        &self.uncached_dir
    }

    async fn fetch_uncached(
        &self,
        url: &Url,
        transformer: Arc<dyn CacheTransformer>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let artifact = self
            .populate(url, "uncached", &CachingInfo::default(), transformer, cancel)
            .await?
            .ok_or(DownloadError::EntryNotFound)?;

        Ok(FetchOutcome::Fresh {
            file: CachedFile::temporary(artifact.path)?,
            size: artifact.size,
        })
    }

    async fn fetch_cached(
        &self,
        url: &Url,
        key: &str,
        transformer: Arc<dyn CacheTransformer>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let _in_flight = self.acquire(key, cancel).await?;

        let current = match self.cache.get(key) {
            Ok(found) => Some(found),
            Err(DownloadError::EntryNotFound) => None,
            Err(e) => {
                warn!(key = key, error = %e, "Failed to open cached artifact, refetching");
                None
            }
        };
        let prior = current
            .as_ref()
            .map(|(_, caching_info)| caching_info.clone())
            .unwrap_or_default();

        let Some(artifact) = self
            .populate(url, key, &prior, transformer, cancel)
            .await?
        else {
            return match current {
                Some((file, _)) => {
                    debug!(key = key, "Cached artifact still fresh");
                    Ok(FetchOutcome::Reused { file })
                }
                None => Err(DownloadError::EntryNotFound),
            };
        };

        // The stored copy is stale
        drop(current);

        let Artifact {
            path,
            size,
            caching_info,
        } = artifact;

        if !caching_info.is_cacheable() {
            debug!(key = key, "Artifact has no validators, not caching");
            self.cache.remove(key);
            return Ok(FetchOutcome::Fresh {
                file: CachedFile::temporary(path)?,
                size,
            });
        }

        match self.cache.add(key, &path, size, caching_info) {
            Ok(file) => {
                // Moved into the cache; disarm the scratch path
                if let Err(e) = path.keep() {
                    debug!(key = key, error = %e, "Scratch path already released");
                }
                Ok(FetchOutcome::Fresh { file, size })
            }
            Err(DownloadError::NotEnoughSpace { .. }) => {
                debug!(key = key, size = size, "Artifact exceeds cache capacity, serving uncached");
                Ok(FetchOutcome::Fresh {
                    file: CachedFile::temporary(path)?,
                    size,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Claim `key`, waiting for any fetch already in flight for it
    async fn acquire(&self, key: &str, cancel: &CancellationToken) -> Result<InFlight<'_>> {
        loop {
            let released = {
                let mut in_progress = self.lock_in_progress();
                match in_progress.get(key) {
                    Some(released) => released.clone(),
                    None => {
                        let released = CancellationToken::new();
                        in_progress.insert(key.to_string(), released.clone());
                        return Ok(InFlight {
                            in_progress: &self.in_progress,
                            key: key.to_string(),
                            released,
                        });
                    }
                }
            };

            debug!(key = key, "Waiting for in-flight fetch");

            // Another waiter may claim the key first, so loop and retry
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = released.cancelled() => {}
            }
        }
    }

    /// Download and transform into a scratch file
    ///
    /// # Returns
    /// `None` when the origin reports the artifact not modified
    async fn populate(
        &self,
        url: &Url,
        name: &str,
        caching_info: &CachingInfo,
        transformer: Arc<dyn CacheTransformer>,
        cancel: &CancellationToken,
    ) -> Result<Option<Artifact>> {
        let prefix = format!("{}-", name);
        let outcome = self
            .downloader
            .download(
                url,
                || {
                    tempfile::Builder::new()
                        .prefix(&prefix)
                        .tempfile_in(&self.uncached_dir)
                },
                caching_info,
                cancel,
            )
            .await?;

        let (download, caching_info) = match outcome {
            DownloadOutcome::NotModified => return Ok(None),
            DownloadOutcome::Downloaded { path, caching_info } => (path, caching_info),
        };

        let transformed = tempfile::Builder::new()
            .prefix("transformed-")
            .tempfile_in(&self.uncached_dir)?
            .into_temp_path();

        // Both scratch files move into the task so they are cleaned up even if
        // this future is dropped mid-transform
        let (path, size) = tokio::task::spawn_blocking(move || -> Result<(TempPath, u64)> {
            let size = transformer.transform(&download, &transformed)?;
            Ok((transformed, size))
        })
        .await??;

        Ok(Some(Artifact {
            path,
            size,
            caching_info,
        }))
    }

    fn lock_in_progress(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Derive a fixed-length, filesystem-safe store key from a caller's cache key
fn derive_cache_key(cache_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(cache_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_key_is_stable_hex() {
        let key = derive_cache_key("buildpacks/ruby?version=1/2");
        assert_eq!(key.len(), 40);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, derive_cache_key("buildpacks/ruby?version=1/2"));
        assert_ne!(key, derive_cache_key("buildpacks/ruby?version=1/3"));
    }

    #[test]
    fn test_in_flight_release_removes_claim_and_wakes_waiters() {
        let in_progress = Mutex::new(HashMap::new());
        let released = CancellationToken::new();
        in_progress
            .lock()
            .unwrap()
            .insert("k".to_string(), released.clone());

        drop(InFlight {
            in_progress: &in_progress,
            key: "k".to_string(),
            released: released.clone(),
        });

        assert!(in_progress.lock().unwrap().is_empty());
        assert!(released.is_cancelled());
    }
}
