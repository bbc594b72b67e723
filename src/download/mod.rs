//! HTTP transport for artifact downloads
//!
//! Conditional GETs with retry, MD5 ETag verification and a process-wide
//! bound on concurrent transfers. Knows nothing about caching.

pub mod client;
pub mod types;

pub use client::{Downloader, MAX_DOWNLOAD_ATTEMPTS};
pub use types::{CachingInfo, DownloadOutcome};
