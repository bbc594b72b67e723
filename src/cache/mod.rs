//! Disk store for downloaded artifacts
//!
//! An in-memory index over a flat directory of files, kept under a byte
//! budget with least-recently-used eviction. Files are reference counted so
//! readers never see them vanish mid-read.

pub mod file_cache;
pub mod handles;

pub use file_cache::{CacheStats, FileCache};
pub use handles::CachedFile;
