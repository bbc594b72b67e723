//! Cached File Handles
//!
//! Readers handed out to callers. Each handle keeps the file it reads alive:
//! a stored entry through a shared reference, an uncached download through
//! ownership of its temporary path. Closing the handle releases that hold.

use std::fs::File as StdFile;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

use super::file_cache::EntryFile;
use crate::errors::{DownloadError, Result};

/// What keeps the underlying file on disk while the handle is open
#[derive(Debug)]
enum Lease {
    /// Reference to a stored cache entry
    Entry(Arc<EntryFile>),
    /// Uncached file, deleted when released
    Temporary(TempPath),
}

/// Readable handle to a fetched artifact
#[derive(Debug)]
pub struct CachedFile {
    /// Open descriptor; dropped before the lease so the file is closed first
    file: Option<File>,
    /// Path of the file being read
    path: PathBuf,
    /// Released exactly once, by `close()` or on drop
    lease: Option<Lease>,
}

impl CachedFile {
    /// Open a reader over a stored entry, taking a reference to it
    pub(crate) fn for_entry(entry: Arc<EntryFile>) -> io::Result<Self> {
        let file = StdFile::open(entry.path())?;
        Ok(Self {
            file: Some(File::from_std(file)),
            path: entry.path().to_path_buf(),
            lease: Some(Lease::Entry(entry)),
        })
    }

    /// Open a reader over an uncached file that is deleted on close
    pub fn temporary(path: TempPath) -> io::Result<Self> {
        let file = StdFile::open(&path)?;
        Ok(Self {
            file: Some(File::from_std(file)),
            path: path.to_path_buf(),
            lease: Some(Lease::Temporary(path)),
        })
    }

    /// Path of the file behind this handle
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this handle reads an uncached temporary file
    pub fn is_temporary(&self) -> bool {
        matches!(self.lease, Some(Lease::Temporary(_)))
    }

    /// Whether `close()` has already been called
    pub fn is_closed(&self) -> bool {
        self.lease.is_none()
    }

    /// Close the handle and release the file it holds
    ///
    /// A stored entry loses one reference; a temporary file is deleted.
    /// Closing twice fails with [`DownloadError::AlreadyClosed`].
    pub fn close(&mut self) -> Result<()> {
        let lease = self.lease.take().ok_or(DownloadError::AlreadyClosed)?;
        self.file = None;

        match lease {
            Lease::Entry(entry) => drop(entry),
            Lease::Temporary(path) => path.close()?,
        }

        debug!(path = %self.path.display(), "Closed cached file handle");
        Ok(())
    }
}

impl AsyncRead for CachedFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_read(cx, buf),
            None => Poll::Ready(Err(io::Error::other("cached file handle is closed"))),
        }
    }
}
