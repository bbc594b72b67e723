//! Download Cache Error Types
//!
//! Structured error handling for fetching, storing and transforming artifacts.
//! Callers match on the variant to decide between falling back to an uncached
//! path and failing the whole operation.

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, DownloadError>;

/// Download cache error types
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Download cancelled")]
    Cancelled,

    #[error("Entry not found")]
    EntryNotFound,

    #[error("No space available: artifact of {size} bytes exceeds cache capacity of {capacity} bytes")]
    NotEnoughSpace { size: u64, capacity: u64 },

    #[error("Download failed: checksum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Unknown archive format")]
    UnknownArchiveFormat,

    #[error("Download failed: status code {0}")]
    Status(u16),

    #[error("Download failed: expected {expected} bytes, received {received}")]
    ContentLength { expected: u64, received: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Handle already closed")]
    AlreadyClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Join(String),
}

impl DownloadError {
    /// Whether this error came from the transport and may succeed on another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::Status(_)
                | DownloadError::ContentLength { .. }
                | DownloadError::ChecksumMismatch { .. }
                | DownloadError::Http(_)
                | DownloadError::Io(_)
        )
    }

    /// Whether the operation was aborted by the caller's cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}

impl From<tokio::task::JoinError> for DownloadError {
    fn from(err: tokio::task::JoinError) -> Self {
        DownloadError::Join(err.to_string())
    }
}
