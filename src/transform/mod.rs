//! Artifact transformers
//!
//! A transformer turns a freshly downloaded file into the artifact that is
//! actually stored and served. It knows nothing about caching: it receives a
//! source path and a destination path and reports the final size.

pub mod archive;

use std::fs;
use std::path::Path;

use crate::errors::Result;
use crate::files;

pub use archive::{detect_archive_kind, ArchiveKind, TarTransformer};

/// Post-processing applied to every downloaded artifact
///
/// On success the transformer has removed `source` and written the artifact
/// to `destination`. On failure `destination` holds no partial data.
pub trait CacheTransformer: Send + Sync {
    /// Transform `source` into `destination`, returning the size of `destination` in bytes
    fn transform(&self, source: &Path, destination: &Path) -> Result<u64>;
}

/// Identity transform: moves the download into place unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransformer;

impl CacheTransformer for NoopTransformer {
    fn transform(&self, source: &Path, destination: &Path) -> Result<u64> {
        files::replace(source, destination)?;
        Ok(fs::metadata(destination)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_noop_moves_source_and_reports_size() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        let destination = dir.path().join("destination");
        fs::write(&source, b"twelve bytes").unwrap();
        fs::write(&destination, b"").unwrap();

        let size = NoopTransformer.transform(&source, &destination).unwrap();

        assert_eq!(size, 12);
        assert!(!source.exists());
        assert_eq!(fs::read(&destination).unwrap(), b"twelve bytes");
    }

    #[test]
    fn test_noop_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let result = NoopTransformer.transform(&dir.path().join("missing"), &dir.path().join("out"));
        assert!(result.is_err());
    }
}
