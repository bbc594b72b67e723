//! Download types
//!
//! Validators exchanged with the origin server and the result of a single
//! conditional download.

use reqwest::header::{HeaderMap, HeaderName, ETAG, LAST_MODIFIED};
use serde::{Deserialize, Serialize};
use tempfile::TempPath;

/// HTTP validators describing a stored artifact.
///
/// Both fields are empty when no validators are known. An artifact without
/// any validator can never be revalidated, so it is streamed through instead
/// of being stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachingInfo {
    /// Raw `ETag` response header, quotes included
    #[serde(default)]
    pub etag: String,
    /// Raw `Last-Modified` response header
    #[serde(default)]
    pub last_modified: String,
}

impl CachingInfo {
    /// Build caching info from explicit validator values
    pub fn new(etag: impl Into<String>, last_modified: impl Into<String>) -> Self {
        Self {
            etag: etag.into(),
            last_modified: last_modified.into(),
        }
    }

    /// Read validators from response headers.
    ///
    /// Missing or non-UTF-8 headers are treated as absent.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };

        Self {
            etag: read(ETAG),
            last_modified: read(LAST_MODIFIED),
        }
    }

    /// Whether at least one validator is present
    pub fn is_cacheable(&self) -> bool {
        !self.etag.is_empty() || !self.last_modified.is_empty()
    }
}

/// Result of a successful download attempt
#[derive(Debug)]
pub enum DownloadOutcome {
    /// The origin answered `304 Not Modified`; the caller should reuse what it has
    NotModified,
    /// New bytes were written to `path`.
    ///
    /// The file is removed when `path` is dropped unless the caller keeps or
    /// moves it.
    Downloaded {
        path: TempPath,
        caching_info: CachingInfo,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_cacheable_requires_a_validator() {
        assert!(!CachingInfo::default().is_cacheable());
        assert!(CachingInfo::new("\"abc\"", "").is_cacheable());
        assert!(CachingInfo::new("", "Tue, 15 Nov 1994 12:45:26 GMT").is_cacheable());
    }

    #[test]
    fn test_equality_compares_both_fields() {
        let a = CachingInfo::new("\"abc\"", "yesterday");
        assert_eq!(a, CachingInfo::new("\"abc\"", "yesterday"));
        assert_ne!(a, CachingInfo::new("\"abc\"", "today"));
        assert_ne!(a, CachingInfo::new("\"abd\"", "yesterday"));
    }

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_static("\"v1\""));

        let info = CachingInfo::from_headers(&headers);
        assert_eq!(info.etag, "\"v1\"");
        assert!(info.last_modified.is_empty());

        headers.insert(
            LAST_MODIFIED,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        let info = CachingInfo::from_headers(&headers);
        assert_eq!(info.last_modified, "Wed, 21 Oct 2015 07:28:00 GMT");
    }
}
