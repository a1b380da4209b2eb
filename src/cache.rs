// src/cache.rs

//! Content-addressed layer cache
//!
//! Caches built layer tars keyed by a fingerprint of their input files so
//! unchanged projects skip re-tarring. Blobs live under
//! `<cache_dir>/blobs/sha256`; the index is one JSON document at
//! `<cache_dir>/index.json`. Eviction is LRU by last-use time with a 20%
//! hysteresis below the size limit. Index writes are best-effort, not
//! crash-atomic; concurrent builds on the same cache directory are
//! last-writer-wins.

use crate::digest;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Eviction drains the cache to this fraction of the size limit
const EVICTION_WATERMARK: f64 = 0.8;

/// One cached layer, keyed in the index by its input fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Digest of the cached layer tar
    pub digest: String,
    /// Blob size in bytes
    pub size: u64,
    /// Unix timestamp of creation
    pub created: i64,
    /// Unix timestamp of last hit, drives LRU ordering
    pub last_used: i64,
    /// Context-relative source paths, kept for inspection
    pub source_files: Vec<String>,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Number of cached layers
    pub entries: usize,
    /// Total size of all cached blobs in bytes
    pub total_bytes: u64,
    /// Maximum allowed size in bytes
    pub max_bytes: u64,
    /// Percentage of the budget in use
    pub usage_percent: f64,
}

/// Content-addressed layer cache with LRU eviction
pub struct LayerCache {
    blobs_dir: PathBuf,
    index_file: PathBuf,
    max_size_bytes: u64,
    index: HashMap<String, CacheEntry>,
}

impl LayerCache {
    /// Open (or create) a cache rooted at `cache_dir`
    pub fn open(cache_dir: &Path, max_size_mb: u64) -> Result<Self> {
        let blobs_dir = cache_dir.join("blobs").join("sha256");
        fs::create_dir_all(&blobs_dir).map_err(|e| {
            Error::IoError(format!("failed to create cache dir {}: {e}", blobs_dir.display()))
        })?;

        let index_file = cache_dir.join("index.json");
        let index = load_index(&index_file);

        Ok(Self {
            blobs_dir,
            index_file,
            max_size_bytes: max_size_mb * 1024 * 1024,
            index,
        })
    }

    /// Fingerprint an input file list
    ///
    /// SHA-256 over, for each pair sorted by relative path: the relative
    /// path bytes, the decimal file size, and the truncated-second mtime.
    /// Cheap to compute; a rebuild hits when nothing changed and misses
    /// when any input file was touched.
    pub fn fingerprint(files: &[(PathBuf, PathBuf)]) -> String {
        let mut sorted: Vec<&(PathBuf, PathBuf)> = files.iter().collect();
        sorted.sort_by(|a, b| a.1.cmp(&b.1));

        let mut hasher = Sha256::new();
        for (abs, rel) in sorted {
            hasher.update(rel.to_string_lossy().as_bytes());
            if let Ok(metadata) = abs.metadata() {
                hasher.update(metadata.len().to_string().as_bytes());
                let mtime = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                hasher.update(mtime.to_string().as_bytes());
            }
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    /// Look up a cached layer for an input file list
    ///
    /// Returns `(digest, blob_path)` on a hit and touches the entry. A
    /// stale index entry whose blob vanished is repaired by deletion.
    pub fn lookup(&mut self, files: &[(PathBuf, PathBuf)]) -> Option<(String, PathBuf)> {
        let fingerprint = Self::fingerprint(files);
        let digest = self.index.get(&fingerprint)?.digest.clone();

        let blob_path = match digest::hex_part(&digest) {
            Ok(hex) => self.blobs_dir.join(hex),
            Err(_) => {
                self.index.remove(&fingerprint);
                self.save_index();
                return None;
            }
        };
        if !blob_path.exists() {
            debug!("cache entry {} lost its blob, dropping", fingerprint);
            self.index.remove(&fingerprint);
            self.save_index();
            return None;
        }

        if let Some(entry) = self.index.get_mut(&fingerprint) {
            entry.last_used = chrono::Utc::now().timestamp();
        }
        self.save_index();
        debug!("cache hit for {} -> {}", fingerprint, digest);
        Some((digest, blob_path))
    }

    /// Store a built layer tar under the input file list's fingerprint
    pub fn store(
        &mut self,
        files: &[(PathBuf, PathBuf)],
        digest: &str,
        tar_path: &Path,
    ) -> Result<PathBuf> {
        let fingerprint = Self::fingerprint(files);
        let blob_path = self.blobs_dir.join(digest::hex_part(digest)?);

        if !blob_path.exists() {
            fs::copy(tar_path, &blob_path).map_err(|e| {
                Error::IoError(format!("failed to copy layer into cache: {e}"))
            })?;
        }
        let size = blob_path
            .metadata()
            .map_err(|e| Error::IoError(format!("failed to stat {}: {e}", blob_path.display())))?
            .len();

        let now = chrono::Utc::now().timestamp();
        self.index.insert(
            fingerprint,
            CacheEntry {
                digest: digest.to_string(),
                size,
                created: now,
                last_used: now,
                source_files: files
                    .iter()
                    .map(|(_, rel)| rel.to_string_lossy().into_owned())
                    .collect(),
            },
        );
        self.save_index();
        self.evict_if_needed();

        Ok(blob_path)
    }

    /// Drop least-recently-used entries until total size is back under
    /// the watermark
    fn evict_if_needed(&mut self) {
        let mut total: u64 = self.index.values().map(|e| e.size).sum();
        if total <= self.max_size_bytes {
            return;
        }

        let watermark = (self.max_size_bytes as f64 * EVICTION_WATERMARK) as u64;
        let mut entries: Vec<(String, u64, i64, String)> = self
            .index
            .iter()
            .map(|(k, e)| (k.clone(), e.size, e.last_used, e.digest.clone()))
            .collect();
        entries.sort_by_key(|(_, _, last_used, _)| *last_used);

        for (fingerprint, size, _, digest) in entries {
            if total <= watermark {
                break;
            }
            if let Ok(hex) = digest::hex_part(&digest) {
                let blob_path = self.blobs_dir.join(hex);
                if blob_path.exists() {
                    if let Err(e) = fs::remove_file(&blob_path) {
                        warn!("failed to evict {}: {e}", blob_path.display());
                    }
                }
            }
            self.index.remove(&fingerprint);
            total = total.saturating_sub(size);
            debug!("evicted cache entry {} ({} bytes)", fingerprint, size);
        }

        self.save_index();
    }

    /// Remove every cached blob and reset the index
    pub fn clear(&mut self) -> Result<()> {
        if self.blobs_dir.exists() {
            fs::remove_dir_all(&self.blobs_dir).map_err(|e| {
                Error::IoError(format!("failed to clear {}: {e}", self.blobs_dir.display()))
            })?;
        }
        fs::create_dir_all(&self.blobs_dir).map_err(|e| {
            Error::IoError(format!("failed to recreate {}: {e}", self.blobs_dir.display()))
        })?;
        if self.index_file.exists() {
            fs::remove_file(&self.index_file).map_err(|e| {
                Error::IoError(format!("failed to remove {}: {e}", self.index_file.display()))
            })?;
        }
        self.index.clear();
        Ok(())
    }

    /// Current cache statistics
    pub fn stats(&self) -> CacheStats {
        let total_bytes: u64 = self.index.values().map(|e| e.size).sum();
        CacheStats {
            entries: self.index.len(),
            total_bytes,
            max_bytes: self.max_size_bytes,
            usage_percent: if self.max_size_bytes > 0 {
                total_bytes as f64 / self.max_size_bytes as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// Persist the index; failures only log because a lost index entry
    /// degrades to a cache miss on the next build
    fn save_index(&self) {
        let result = serde_json::to_vec_pretty(&self.index)
            .map_err(|e| Error::IoError(format!("failed to serialize cache index: {e}")))
            .and_then(|data| {
                fs::write(&self.index_file, data).map_err(|e| {
                    Error::IoError(format!("failed to write {}: {e}", self.index_file.display()))
                })
            });
        if let Err(e) = result {
            warn!("cache index not persisted: {e}");
        }
    }
}

/// Load the index, treating a missing or corrupt file as empty
fn load_index(index_file: &Path) -> HashMap<String, CacheEntry> {
    match fs::read(index_file) {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
            warn!("corrupt cache index {}, starting fresh: {e}", index_file.display());
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_input(dir: &Path, name: &str, content: &[u8]) -> (PathBuf, PathBuf) {
        let abs = dir.join(name);
        fs::write(&abs, content).unwrap();
        (abs, PathBuf::from(name))
    }

    fn store_layer(
        cache: &mut LayerCache,
        work: &Path,
        files: &[(PathBuf, PathBuf)],
        content: &[u8],
    ) -> String {
        let tar_path = work.join(format!("{}.tar", content.len()));
        fs::write(&tar_path, content).unwrap();
        let digest = digest::sha256_digest(content);
        cache.store(files, &digest, &tar_path).unwrap();
        digest
    }

    #[test]
    fn test_store_then_lookup_hits() {
        let work = tempfile::tempdir().unwrap();
        let cache_dir = work.path().join("cache");
        let mut cache = LayerCache::open(&cache_dir, 100).unwrap();

        let files = vec![write_input(work.path(), "a.py", b"a")];
        let digest = store_layer(&mut cache, work.path(), &files, b"layer bytes");

        let (hit_digest, hit_path) = cache.lookup(&files).expect("expected cache hit");
        assert_eq!(hit_digest, digest);
        assert!(hit_path.exists());
    }

    #[test]
    fn test_lookup_misses_when_input_changes() {
        let work = tempfile::tempdir().unwrap();
        let mut cache = LayerCache::open(&work.path().join("cache"), 100).unwrap();

        let files = vec![write_input(work.path(), "a.py", b"a")];
        store_layer(&mut cache, work.path(), &files, b"layer bytes");

        // Same path, different size -> different fingerprint
        let changed = vec![write_input(work.path(), "a.py", b"changed")];
        assert!(cache.lookup(&changed).is_none());
    }

    #[test]
    fn test_stale_entry_is_repaired() {
        let work = tempfile::tempdir().unwrap();
        let mut cache = LayerCache::open(&work.path().join("cache"), 100).unwrap();

        let files = vec![write_input(work.path(), "a.py", b"a")];
        let digest = store_layer(&mut cache, work.path(), &files, b"layer bytes");

        let blob = cache.blobs_dir.join(digest::hex_part(&digest).unwrap());
        fs::remove_file(&blob).unwrap();

        assert!(cache.lookup(&files).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_lru_eviction_respects_watermark() {
        let work = tempfile::tempdir().unwrap();
        // 1 KB budget, three 600-byte layers
        let mut cache = LayerCache::open(&work.path().join("cache"), 0).unwrap();
        cache.max_size_bytes = 1024;

        let files_a = vec![write_input(work.path(), "a.py", b"a")];
        let files_b = vec![write_input(work.path(), "b.py", b"b")];
        let files_c = vec![write_input(work.path(), "c.py", b"c")];
        let digest_a = store_layer(&mut cache, work.path(), &files_a, &[b'A'; 600]);
        cache.index.get_mut(&LayerCache::fingerprint(&files_a)).unwrap().last_used -= 20;
        let digest_b = store_layer(&mut cache, work.path(), &files_b, &[b'B'; 600]);
        cache.index.get_mut(&LayerCache::fingerprint(&files_b)).unwrap().last_used -= 10;
        store_layer(&mut cache, work.path(), &files_c, &[b'C'; 600]);

        let stats = cache.stats();
        assert!(stats.total_bytes <= 1024, "post-eviction total within budget");
        assert!(stats.total_bytes <= 819, "eviction drains to the 80% watermark");

        // Oldest entries are gone, blobs included
        assert!(cache.lookup(&files_a).is_none());
        assert!(!cache.blobs_dir.join(digest::hex_part(&digest_a).unwrap()).exists());
        assert!(!cache.blobs_dir.join(digest::hex_part(&digest_b).unwrap()).exists());
        assert!(cache.lookup(&files_c).is_some());
    }

    #[test]
    fn test_clear_and_stats() {
        let work = tempfile::tempdir().unwrap();
        let mut cache = LayerCache::open(&work.path().join("cache"), 100).unwrap();

        let files = vec![write_input(work.path(), "a.py", b"a")];
        store_layer(&mut cache, work.path(), &files, b"layer bytes");
        assert_eq!(cache.stats().entries, 1);

        cache.clear().unwrap();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().total_bytes, 0);
        assert!(cache.lookup(&files).is_none());
    }

    #[test]
    fn test_index_survives_reopen() {
        let work = tempfile::tempdir().unwrap();
        let cache_dir = work.path().join("cache");

        let files = vec![write_input(work.path(), "a.py", b"a")];
        let digest = {
            let mut cache = LayerCache::open(&cache_dir, 100).unwrap();
            store_layer(&mut cache, work.path(), &files, b"layer bytes")
        };

        let mut reopened = LayerCache::open(&cache_dir, 100).unwrap();
        let (hit_digest, _) = reopened.lookup(&files).expect("hit after reopen");
        assert_eq!(hit_digest, digest);
    }
}
