//! File system helpers shared by the store and the transformers

use std::fs;
use std::io;
use std::path::Path;

/// Move `source` to `destination`, replacing any file already there.
///
/// Falls back to copy and remove when a rename is impossible, e.g. when the
/// two paths live on different filesystems.
pub(crate) fn replace(source: &Path, destination: &Path) -> io::Result<()> {
    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if fs::copy(source, destination).is_err() {
                let _ = fs::remove_file(destination);
                return Err(rename_err);
            }
            fs::remove_file(source)
        }
    }
}

/// Remove a file, treating an already missing file as success
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_replace_moves_and_overwrites() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        let destination = dir.path().join("destination");
        fs::write(&source, b"new").unwrap();
        fs::write(&destination, b"old").unwrap();

        replace(&source, &destination).unwrap();

        assert!(!source.exists());
        assert_eq!(fs::read(&destination).unwrap(), b"new");
    }

    #[test]
    fn test_replace_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let result = replace(&dir.path().join("missing"), &dir.path().join("destination"));
        assert!(result.is_err());
        assert!(!dir.path().join("destination").exists());
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"x").unwrap();

        remove_if_exists(&path).unwrap();
        assert!(!path.exists());
        remove_if_exists(&path).unwrap();
    }
}
