//! Cached Downloader - content-keyed HTTP download cache
//!
//! Fetches remote artifacts, revalidates them against the origin with
//! conditional requests, and keeps transformed copies in a size-bounded
//! directory with least-recently-used eviction.

pub mod cache;
pub mod cached_downloader;
pub mod config;
pub mod download;
pub mod errors;
mod files;
pub mod transform;

pub use cache::{CacheStats, CachedFile, FileCache};
pub use cached_downloader::{CachedDownloader, FetchOutcome};
pub use config::DownloaderConfig;
pub use download::{CachingInfo, Downloader};
pub use errors::{DownloadError, Result};
pub use transform::{CacheTransformer, NoopTransformer, TarTransformer};
