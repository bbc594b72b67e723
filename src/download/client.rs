//! HTTP Download Client
//!
//! Streams artifacts into temporary files using conditional GETs.
//! Verifies MD5 checksums advertised through the ETag header and bounds the
//! number of transfers running at once across the whole process.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use md5::{Digest, Md5};
use reqwest::header::{IF_MODIFIED_SINCE, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::types::{CachingInfo, DownloadOutcome};
use crate::errors::{DownloadError, Result};

/// Maximum number of attempts for a single download
pub const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;

/// TCP connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP keep-alive interval for pooled connections
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// HTTP downloader shared by every fetch in the process
#[derive(Clone)]
pub struct Downloader {
    /// HTTP client for making requests
    http_client: Client,
    /// Admission slots bounding concurrent transfers
    download_slots: Arc<Semaphore>,
}

impl Downloader {
    /// Create a downloader
    ///
    /// # Arguments
    /// * `timeout` - Per-request timeout, covering headers and body
    /// * `max_concurrent_downloads` - Number of transfers allowed in flight at once
    /// * `skip_ssl_verification` - Accept invalid TLS certificates
    pub fn new(
        timeout: Duration,
        max_concurrent_downloads: usize,
        skip_ssl_verification: bool,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            .danger_accept_invalid_certs(skip_ssl_verification)
            .build()?;

        if skip_ssl_verification {
            warn!("TLS certificate verification is disabled for downloads");
        }

        Ok(Self {
            http_client,
            download_slots: Arc::new(Semaphore::new(max_concurrent_downloads)),
        })
    }

    /// Number of admission slots currently free
    pub fn available_slots(&self) -> usize {
        self.download_slots.available_permits()
    }

    /// Download `url` into a file produced by `create_destination`
    ///
    /// Validators in `caching_info` are sent as `If-None-Match` and
    /// `If-Modified-Since`. Failed attempts are retried up to
    /// [`MAX_DOWNLOAD_ATTEMPTS`] times; cancellation stops immediately.
    ///
    /// # Arguments
    /// * `url` - Artifact location
    /// * `create_destination` - Called once per attempt for a fresh destination file
    /// * `caching_info` - Validators of the copy the caller already holds
    /// * `cancel` - Aborts waiting for a slot, waiting for headers, or reading the body
    ///
    /// # Returns
    /// `NotModified` on a 304, otherwise the downloaded file and its validators
    pub async fn download<F>(
        &self,
        url: &Url,
        create_destination: F,
        caching_info: &CachingInfo,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome>
    where
        F: Fn() -> io::Result<NamedTempFile>,
    {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            permit = self.download_slots.acquire() => {
                permit.map_err(|_| DownloadError::Cancelled)?
            }
        };

        let mut attempt = 1;
        loop {
            match self
                .fetch_to_file(url, &create_destination, caching_info, cancel)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(e) if !e.is_retryable() || attempt == MAX_DOWNLOAD_ATTEMPTS => {
                    debug!(url = %url, attempt = attempt, error = %e, "Download failed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        url = %url,
                        attempt = attempt,
                        max = MAX_DOWNLOAD_ATTEMPTS,
                        error = %e,
                        "Retrying download"
                    );
                    attempt += 1;
                }
            }
        }
    }

    /// Perform a single download attempt
    async fn fetch_to_file<F>(
        &self,
        url: &Url,
        create_destination: &F,
        caching_info: &CachingInfo,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome>
    where
        F: Fn() -> io::Result<NamedTempFile>,
    {
        let mut request = self.http_client.get(url.clone());
        if !caching_info.etag.is_empty() {
            request = request.header(IF_NONE_MATCH, &caching_info.etag);
        }
        if !caching_info.last_modified.is_empty() {
            request = request.header(IF_MODIFIED_SINCE, &caching_info.last_modified);
        }

        debug!(url = %url, validators = ?caching_info, "Sending download request");

        // Dropping the pending future closes the connection
        let mut response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = request.send() => response?,
        };

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                debug!(url = %url, "Origin reports artifact not modified");
                return Ok(DownloadOutcome::NotModified);
            }
            StatusCode::OK => {}
            status => return Err(DownloadError::Status(status.as_u16())),
        }

        let expected_length = response.content_length();
        let caching_info = CachingInfo::from_headers(response.headers());

        // Removed on drop, so every early return below discards the partial file
        let destination = create_destination()?;
        let mut file = tokio::fs::File::from_std(destination.as_file().try_clone()?);

        let mut hasher = Md5::new();
        let mut received: u64 = 0;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = response.chunk() => match (chunk, expected_length) {
                    // Connection closed before the declared length arrived
                    (Err(e), Some(expected)) if !e.is_timeout() && received < expected => {
                        debug!(url = %url, error = %e, "Response body ended early");
                        return Err(DownloadError::ContentLength { expected, received });
                    }
                    (chunk, _) => chunk?,
                },
            };
            let Some(chunk) = chunk else {
                break;
            };

            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
        }
        file.flush().await?;

        if let Some(expected) = expected_length {
            if expected != received {
                return Err(DownloadError::ContentLength { expected, received });
            }
        }

        if let Some(expected) = etag_checksum(&caching_info.etag) {
            let actual = hasher.finalize();
            if actual.as_slice() != expected.as_slice() {
                return Err(DownloadError::ChecksumMismatch {
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                });
            }
        }

        info!(url = %url, size = received, "Downloaded artifact");

        Ok(DownloadOutcome::Downloaded {
            path: destination.into_temp_path(),
            caching_info,
        })
    }
}

/// Interpret an ETag as an MD5 checksum commitment.
///
/// Object stores such as S3 advertise the MD5 of the body as the ETag. Only an
/// ETag that is exactly 32 hex digits once unquoted counts.
fn etag_checksum(etag: &str) -> Option<Vec<u8>> {
    let etag = etag.trim_matches('"');
    if etag.len() != 32 {
        return None;
    }
    hex::decode(etag).ok()
}
