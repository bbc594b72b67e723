//! Archive normalization
//!
//! Normalizes downloaded archives into a plain tar file. Tarballs pass through
//! untouched, gzip streams are decompressed and zip archives are re-encoded
//! entry by entry.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use tar::{Builder, EntryType, Header};
use tracing::{debug, warn};
use zip::ZipArchive;

use super::{CacheTransformer, NoopTransformer};
use crate::errors::{DownloadError, Result};
use crate::files;

/// Number of leading bytes inspected to classify a file
const SNIFF_LEN: u64 = 512;

/// Offset of the `ustar` magic inside a tar header block
const TAR_MAGIC_OFFSET: usize = 257;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Container format of a downloaded artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// Already a tar archive
    Tar,
    /// Gzip-compressed stream, expected to wrap a tar archive
    Gzip,
    /// Zip archive
    Zip,
}

/// Classify a file by its magic bytes
///
/// # Returns
/// `None` if the content is not a recognized archive
pub fn detect_archive_kind(path: &Path) -> Result<Option<ArchiveKind>> {
    let mut head = Vec::with_capacity(SNIFF_LEN as usize);
    File::open(path)?.take(SNIFF_LEN).read_to_end(&mut head)?;

    let kind = if head.get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5) == Some(&b"ustar"[..]) {
        Some(ArchiveKind::Tar)
    } else if head.starts_with(&[0x1f, 0x8b]) {
        Some(ArchiveKind::Gzip)
    } else if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
        Some(ArchiveKind::Zip)
    } else {
        None
    };

    Ok(kind)
}

/// Transformer producing a canonical tar archive
#[derive(Debug, Clone, Copy, Default)]
pub struct TarTransformer;

impl CacheTransformer for TarTransformer {
    fn transform(&self, source: &Path, destination: &Path) -> Result<u64> {
        let kind = detect_archive_kind(source)?.ok_or(DownloadError::UnknownArchiveFormat)?;
        debug!(source = %source.display(), kind = ?kind, "Normalizing archive");

        let size = match kind {
            ArchiveKind::Tar => return NoopTransformer.transform(source, destination),
            ArchiveKind::Gzip => write_atomically(destination, |out| gunzip(source, out))?,
            ArchiveKind::Zip => write_atomically(destination, |out| zip_to_tar(source, out))?,
        };

        fs::remove_file(source)?;
        Ok(size)
    }
}

/// Write `destination` with `write`, removing it again if writing fails
fn write_atomically<F>(destination: &Path, write: F) -> Result<u64>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let result = (|| -> Result<u64> {
        let mut out = BufWriter::new(File::create(destination)?);
        write(&mut out)?;
        out.flush()?;
        Ok(fs::metadata(destination)?.len())
    })();

    if result.is_err() {
        if let Err(e) = files::remove_if_exists(destination) {
            warn!(path = %destination.display(), error = %e, "Failed to remove partial artifact");
        }
    }
    result
}

/// Decompress every member of a gzip stream, so concatenated members yield one tar
fn gunzip(source: &Path, out: &mut impl Write) -> Result<()> {
    let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(source)?));
    io::copy(&mut decoder, out)?;
    Ok(())
}

/// Re-encode a zip archive as tar, entry by entry
///
/// Entry names that are absolute or contain `..` cannot be written to a tar
/// header; such archives fail with an I/O error instead of being normalized.
fn zip_to_tar(source: &Path, out: &mut impl Write) -> Result<()> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(source)?))?;
    let mut builder = Builder::new(out);

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        // Full path inside the archive, not just the base name
        let name = entry.name().to_string();
        let mode = entry.unix_mode();

        let mut header = Header::new_gnu();
        header.set_size(0);

        if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            let mut target = String::new();
            entry.read_to_string(&mut target)?;
            header.set_entry_type(EntryType::Symlink);
            header.set_mode(permissions(mode, 0o777));
            builder.append_link(&mut header, &name, &target)?;
        } else if entry.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_mode(permissions(mode, 0o755));
            builder.append_data(&mut header, &name, io::empty())?;
        } else {
            header.set_entry_type(EntryType::Regular);
            header.set_mode(permissions(mode, 0o644));
            header.set_size(entry.size());
            builder.append_data(&mut header, &name, &mut entry)?;
        }
    }

    builder.finish()?;
    Ok(())
}

fn permissions(mode: Option<u32>, default: u32) -> u32 {
    mode.map(|m| m & 0o7777).filter(|m| *m != 0).unwrap_or(default)
}
