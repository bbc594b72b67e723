//! Local File Cache
//!
//! Stores downloaded artifacts on local disk under a strict byte budget.
//! Uses LRU eviction when an incoming artifact would exceed the budget.
//!
//! Every stored file is owned by an [`EntryFile`] shared between the index and
//! all open readers. Removing an entry from the index only drops the index's
//! reference; the file itself disappears once the last reader is closed.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use super::handles::CachedFile;
use crate::download::CachingInfo;
use crate::errors::{DownloadError, Result};
use crate::files;

/// A stored file, deleted from disk when the last reference is dropped
#[derive(Debug)]
pub(crate) struct EntryFile {
    path: PathBuf,
}

impl EntryFile {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EntryFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed cached file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove cached file")
            }
        }
    }
}

/// Tracks a cached file's metadata for LRU eviction
#[derive(Debug)]
struct CacheEntry {
    /// The index's reference to the file on disk
    file: Arc<EntryFile>,
    /// Size of the cached file in bytes
    size: u64,
    /// Access tick of the last add or read
    last_accessed: u64,
    /// Validators the artifact was stored with
    caching_info: CachingInfo,
}

/// Index state guarded by the cache lock
#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Sequence number making stored file names unique across replacements
    seq: u64,
    /// Logical clock ordering accesses
    clock: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub used_bytes: u64,
}

/// Local disk cache for downloaded artifacts
#[derive(Debug)]
pub struct FileCache {
    /// Directory holding one file per live entry
    cache_dir: PathBuf,
    /// Maximum total cache size in bytes
    max_size: u64,
    /// Index of stored entries
    state: Mutex<CacheState>,
    /// Lookup hit counter
    hits: AtomicU64,
    /// Lookup miss counter
    misses: AtomicU64,
    /// Entries removed to make room
    evictions: AtomicU64,
}

impl FileCache {
    /// Create a file cache, wiping anything left in `cache_dir`
    ///
    /// # Arguments
    /// * `cache_dir` - Directory to store cached files; fully owned by the cache
    /// * `max_size` - Maximum total cache size in bytes
    pub fn new(cache_dir: impl Into<PathBuf>, max_size: u64) -> Result<Self> {
        let cache_dir = cache_dir.into();

        match fs::remove_dir_all(&cache_dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        fs::create_dir_all(&cache_dir)?;

        info!(
            cache_dir = %cache_dir.display(),
            max_size_bytes = max_size,
            "File cache initialized"
        );

        Ok(Self {
            cache_dir,
            max_size,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Store an artifact and return a reader over the stored copy
    ///
    /// If `key` already holds an artifact with the same size and validators,
    /// `source` is discarded and the existing entry is reused. Otherwise
    /// `source` is moved into the cache, least recently used entries are
    /// evicted as needed, and the previous entry for `key` (if any) is
    /// released.
    ///
    /// # Arguments
    /// * `key` - Cache key
    /// * `source` - Artifact to store; moved into the cache on success
    /// * `size` - Artifact size in bytes
    /// * `caching_info` - Validators for later revalidation
    ///
    /// # Errors
    /// [`DownloadError::NotEnoughSpace`] if `size` exceeds the cache capacity.
    /// The cache and `source` are left untouched in that case.
    pub fn add(
        &self,
        key: &str,
        source: &Path,
        size: u64,
        caching_info: CachingInfo,
    ) -> Result<CachedFile> {
        let mut state = self.lock();
        let tick = state.next_tick();

        if let Some(existing) = state.entries.get_mut(key) {
            if existing.size == size && existing.caching_info == caching_info {
                fs::remove_file(source)?;
                existing.last_accessed = tick;
                debug!(key = key, size = size, "Artifact unchanged, keeping cached entry");
                return Ok(CachedFile::for_entry(Arc::clone(&existing.file))?);
            }
        }

        self.make_room(&mut state, key, size)?;

        state.seq += 1;
        let local_path = self.path_to_local(key, state.seq);
        files::replace(source, &local_path)?;

        // An unreadable file is deleted again when this reference drops
        let file = Arc::new(EntryFile { path: local_path });
        let reader = CachedFile::for_entry(Arc::clone(&file))?;

        let previous = state.entries.insert(
            key.to_string(),
            CacheEntry {
                file,
                size,
                last_accessed: tick,
                caching_info,
            },
        );

        debug!(
            key = key,
            size = size,
            replaced = previous.is_some(),
            "Stored artifact in cache"
        );

        Ok(reader)
    }

    /// Get a reader over a cached artifact along with its validators
    ///
    /// Refreshes the entry's recency.
    pub fn get(&self, key: &str) -> Result<(CachedFile, CachingInfo)> {
        let mut state = self.lock();
        let tick = state.next_tick();

        let Some(entry) = state.entries.get_mut(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = key, "File cache MISS");
            return Err(DownloadError::EntryNotFound);
        };

        entry.last_accessed = tick;
        let reader = CachedFile::for_entry(Arc::clone(&entry.file))?;

        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = key, "File cache HIT");

        Ok((reader, entry.caching_info.clone()))
    }

    /// Drop a cached entry
    ///
    /// The file is deleted once every outstanding reader has been closed.
    pub fn remove(&self, key: &str) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.remove(key) {
            debug!(key = key, size = entry.size, "Removed cache entry");
        }
    }

    /// Whether `key` currently has an entry
    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Number of entries in the index
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check if the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of all indexed entries in bytes
    pub fn used_space(&self) -> u64 {
        Self::used_space_of(&self.lock())
    }

    /// Maximum total size in bytes
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Get the cache directory path
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: state.entries.len(),
            used_bytes: Self::used_space_of(&state),
        }
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let stats = self.stats();
        debug!(
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            entries = stats.entries,
            used_bytes = stats.used_bytes,
            max_bytes = self.max_size,
            "Cache metrics"
        );
    }

    /// Evict least recently used entries until `size` more bytes fit
    ///
    /// The entry stored under `key` is about to be replaced, so it neither
    /// counts towards used space nor is a candidate for eviction.
    fn make_room(&self, state: &mut CacheState, key: &str, size: u64) -> Result<()> {
        if size > self.max_size {
            return Err(DownloadError::NotEnoughSpace {
                size,
                capacity: self.max_size,
            });
        }

        let mut used: u64 = state
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(_, e)| e.size)
            .sum();

        while used.checked_add(size).map_or(true, |total| total > self.max_size) {
            let oldest = state
                .entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone());

            let Some(oldest) = oldest else {
                break;
            };

            if let Some(evicted) = state.entries.remove(&oldest) {
                used -= evicted.size;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %oldest, size = evicted.size, "Evicted cache entry");
            }
        }

        Ok(())
    }

    fn used_space_of(state: &CacheState) -> u64 {
        state.entries.values().map(|e| e.size).sum()
    }

    /// Unique on-disk path for a new entry under `key`
    fn path_to_local(&self, key: &str, seq: u64) -> PathBuf {
        // Replace any problematic characters for the filesystem
        let safe_key: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        self.cache_dir.join(format!("{}-{}-{}", safe_key, nanos, seq))
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    struct Fixture {
        _dir: TempDir,
        source_dir: PathBuf,
        cache: FileCache,
    }

    fn fixture(max_size: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let source_dir = dir.path().join("sources");
        fs::create_dir_all(&source_dir).unwrap();
        let cache = FileCache::new(dir.path().join("cache"), max_size).unwrap();
        Fixture {
            _dir: dir,
            source_dir,
            cache,
        }
    }

    impl Fixture {
        fn source(&self, name: &str, content: &[u8]) -> PathBuf {
            let path = self.source_dir.join(name);
            fs::write(&path, content).unwrap();
            path
        }

        fn add(&self, key: &str, content: &[u8], etag: &str) -> Result<CachedFile> {
            let source = self.source(key, content);
            self.cache.add(
                key,
                &source,
                content.len() as u64,
                CachingInfo::new(etag, ""),
            )
        }

        fn files_on_disk(&self) -> usize {
            fs::read_dir(self.cache.cache_dir()).unwrap().count()
        }
    }

    async fn read_all(file: &mut CachedFile) -> Vec<u8> {
        let mut content = Vec::new();
        file.read_to_end(&mut content).await.unwrap();
        content
    }

    #[test]
    fn test_new_wipes_existing_directory() {
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join("cache");
        fs::create_dir_all(&cache_dir).unwrap();
        fs::write(cache_dir.join("stale"), b"old").unwrap();

        let cache = FileCache::new(&cache_dir, 1024).unwrap();

        assert!(cache_dir.exists());
        assert_eq!(fs::read_dir(&cache_dir).unwrap().count(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_add_returns_reader_and_moves_source() {
        let f = fixture(1024);
        let source = f.source("a", b"hello");

        let mut reader = f
            .cache
            .add("a", &source, 5, CachingInfo::new("\"v1\"", ""))
            .unwrap();

        assert!(!source.exists());
        assert!(reader.path().starts_with(f.cache.cache_dir()));
        assert_eq!(read_all(&mut reader).await, b"hello");
        assert_eq!(f.cache.len(), 1);
        assert_eq!(f.cache.used_space(), 5);
    }

    #[test]
    fn test_add_too_large_fails_and_leaves_cache_unchanged() {
        let f = fixture(10);
        f.add("a", b"12345", "\"v1\"").unwrap().close().unwrap();

        let source = f.source("big", &[0u8; 11]);
        let result = f.cache.add("big", &source, 11, CachingInfo::new("\"v1\"", ""));

        assert!(matches!(
            result,
            Err(DownloadError::NotEnoughSpace {
                size: 11,
                capacity: 10
            })
        ));
        assert!(source.exists());
        assert_eq!(f.cache.len(), 1);
        assert!(f.cache.contains("a"));
    }

    #[test]
    fn test_close_keeps_entry_and_double_close_fails() {
        let f = fixture(1024);
        let mut reader = f.add("a", b"hello", "\"v1\"").unwrap();

        reader.close().unwrap();
        assert_eq!(f.files_on_disk(), 1);
        assert!(matches!(reader.close(), Err(DownloadError::AlreadyClosed)));
    }

    #[test]
    fn test_add_identical_artifact_is_ignored() {
        let f = fixture(1024);
        let first = f.add("a", b"hello", "\"v1\"").unwrap();
        let first_path = first.path().to_path_buf();

        let source = f.source("again", b"hello");
        let second = f
            .cache
            .add("a", &source, 5, CachingInfo::new("\"v1\"", ""))
            .unwrap();

        assert!(!source.exists());
        assert_eq!(second.path(), first_path);
        assert_eq!(f.files_on_disk(), 1);
    }

    #[tokio::test]
    async fn test_replace_keeps_old_file_until_reader_closes() {
        let f = fixture(1024);
        f.add("a", b"old", "\"v1\"").unwrap().close().unwrap();

        let (mut old_reader, info) = f.cache.get("a").unwrap();
        assert_eq!(info.etag, "\"v1\"");
        let old_path = old_reader.path().to_path_buf();

        let mut new_reader = f.add("a", b"newer", "\"v2\"").unwrap();
        assert_ne!(new_reader.path(), old_path);
        assert_eq!(f.files_on_disk(), 2);
        assert_eq!(f.cache.len(), 1);

        // The replaced file is still readable through the earlier handle
        assert_eq!(read_all(&mut old_reader).await, b"old");
        assert_eq!(read_all(&mut new_reader).await, b"newer");

        old_reader.close().unwrap();
        assert!(!old_path.exists());
        assert_eq!(f.files_on_disk(), 1);

        let (_, info) = f.cache.get("a").unwrap();
        assert_eq!(info.etag, "\"v2\"");
    }

    #[test]
    fn test_get_missing_entry() {
        let f = fixture(1024);
        assert!(matches!(f.cache.get("nope"), Err(DownloadError::EntryNotFound)));
        assert_eq!(f.cache.stats().misses, 1);
    }

    #[test]
    fn test_remove_deletes_file_after_last_reader_closes() {
        let f = fixture(1024);
        f.add("a", b"hello", "\"v1\"").unwrap().close().unwrap();
        let (mut reader, _) = f.cache.get("a").unwrap();
        let path = reader.path().to_path_buf();

        f.cache.remove("a");
        assert!(!f.cache.contains("a"));
        assert!(path.exists());

        reader.close().unwrap();
        assert!(!path.exists());

        // Removing a missing key is a no-op
        f.cache.remove("a");
    }

    #[test]
    fn test_remove_without_readers_deletes_immediately() {
        let f = fixture(1024);
        f.add("a", b"hello", "\"v1\"").unwrap().close().unwrap();

        f.cache.remove("a");
        assert_eq!(f.files_on_disk(), 0);
    }

    #[test]
    fn test_eviction_removes_least_recently_used() {
        let f = fixture(10);
        f.add("a", b"aaa", "\"a\"").unwrap().close().unwrap();
        f.add("b", b"bbb", "\"b\"").unwrap().close().unwrap();
        f.add("c", b"ccc", "\"c\"").unwrap().close().unwrap();

        // Reading "a" makes "b" the oldest
        f.cache.get("a").unwrap().0.close().unwrap();

        f.add("d", b"ddd", "\"d\"").unwrap().close().unwrap();

        assert!(f.cache.contains("a"));
        assert!(!f.cache.contains("b"));
        assert!(f.cache.contains("c"));
        assert!(f.cache.contains("d"));
        assert_eq!(f.cache.used_space(), 9);
        assert_eq!(f.files_on_disk(), 3);
        assert_eq!(f.cache.stats().evictions, 1);
    }

    #[test]
    fn test_eviction_near_u64_max_capacity() {
        let f = fixture(u64::MAX);
        f.add("a", b"aaaa", "\"a\"").unwrap().close().unwrap();

        let source = f.source("b", b"x");
        f.cache
            .add("b", &source, u64::MAX - 1, CachingInfo::new("\"b\"", ""))
            .unwrap()
            .close()
            .unwrap();

        assert!(!f.cache.contains("a"));
        assert!(f.cache.contains("b"));
        assert_eq!(f.cache.used_space(), u64::MAX - 1);
        assert_eq!(f.cache.stats().evictions, 1);
    }

    #[test]
    fn test_eviction_only_as_much_as_needed() {
        let f = fixture(1024);
        f.add("a", &[1u8; 256], "\"a\"").unwrap().close().unwrap();
        f.add("b", &[2u8; 256], "\"b\"").unwrap().close().unwrap();
        f.add("c", &[3u8; 256], "\"c\"").unwrap().close().unwrap();

        f.add("d", &[4u8; 513], "\"d\"").unwrap().close().unwrap();

        assert_eq!(f.cache.len(), 2);
        assert!(f.cache.contains("c"));
        assert!(f.cache.contains("d"));
        assert!(f.cache.used_space() <= f.cache.max_size());
    }

    #[test]
    fn test_replacing_entry_does_not_evict_others_needlessly() {
        let f = fixture(10);
        f.add("a", b"aaaa", "\"a\"").unwrap().close().unwrap();
        f.add("b", b"bbbb", "\"b\"").unwrap().close().unwrap();

        // "a" grows from 4 to 6 bytes; dropping its old copy is enough
        f.add("a", b"aaaaaa", "\"a2\"").unwrap().close().unwrap();

        assert!(f.cache.contains("b"));
        assert_eq!(f.cache.used_space(), 10);
        assert_eq!(f.cache.stats().evictions, 0);
    }

    #[test]
    fn test_capacity_invariant_holds_after_every_add() {
        let f = fixture(100);
        for i in 0..40u64 {
            let size = (i * 7) % 60 + 1;
            let key = format!("k{}", i % 9);
            let content = vec![b'x'; size as usize];
            f.add(&key, &content, &format!("\"{}\"", i))
                .unwrap()
                .close()
                .unwrap();
            assert!(f.cache.used_space() <= f.cache.max_size());
            assert_eq!(f.files_on_disk(), f.cache.len());
        }
    }

    #[test]
    fn test_evicted_file_survives_while_open() {
        let f = fixture(5);
        let reader = f.add("a", b"aaaaa", "\"a\"").unwrap();
        let path = reader.path().to_path_buf();

        f.add("b", b"bbbbb", "\"b\"").unwrap().close().unwrap();
        assert!(!f.cache.contains("a"));
        assert!(path.exists());

        drop(reader);
        assert!(!path.exists());
    }

    #[test]
    fn test_keys_with_path_separators_stay_in_cache_dir() {
        let f = fixture(1024);
        let source = f.source("escape", b"x");
        let reader = f
            .cache
            .add("../escape/key", &source, 1, CachingInfo::new("\"v\"", ""))
            .unwrap();
        assert_eq!(reader.path().parent().unwrap(), f.cache.cache_dir());
    }
}
