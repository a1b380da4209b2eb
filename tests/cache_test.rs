// tests/cache_test.rs

//! Layer cache behavior through the public API.

use std::fs;
use std::path::{Path, PathBuf};
use stratum::LayerCache;

fn input(dir: &Path, name: &str, content: &[u8]) -> (PathBuf, PathBuf) {
    let abs = dir.join(name);
    fs::write(&abs, content).unwrap();
    (abs, PathBuf::from(name))
}

fn layer_tar(dir: &Path, name: &str, size: usize) -> (PathBuf, String) {
    let path = dir.join(name);
    let content = vec![name.as_bytes()[0]; size];
    fs::write(&path, &content).unwrap();
    (path, stratum::digest::sha256_digest(&content))
}

#[test]
fn test_store_lookup_round_trip() {
    let work = tempfile::tempdir().unwrap();
    let mut cache = LayerCache::open(&work.path().join("cache"), 100).unwrap();

    let files = vec![input(work.path(), "a.py", b"a"), input(work.path(), "b.py", b"bb")];
    let (tar, digest) = layer_tar(work.path(), "layer.tar", 512);
    cache.store(&files, &digest, &tar).unwrap();

    let (hit, path) = cache.lookup(&files).expect("unchanged inputs must hit");
    assert_eq!(hit, digest);
    assert_eq!(fs::read(path).unwrap().len(), 512);
}

#[test]
fn test_fingerprint_is_order_independent() {
    let work = tempfile::tempdir().unwrap();
    let a = input(work.path(), "a.py", b"a");
    let b = input(work.path(), "b.py", b"bb");

    let forward = LayerCache::fingerprint(&[a.clone(), b.clone()]);
    let reversed = LayerCache::fingerprint(&[b, a]);
    assert_eq!(forward, reversed, "pairs are sorted by relative path");
}

#[test]
fn test_touched_file_invalidates() {
    let work = tempfile::tempdir().unwrap();
    let mut cache = LayerCache::open(&work.path().join("cache"), 100).unwrap();

    let files = vec![input(work.path(), "a.py", b"aaaa")];
    let (tar, digest) = layer_tar(work.path(), "layer.tar", 128);
    cache.store(&files, &digest, &tar).unwrap();

    // Rewrite with different size: the fingerprint moves
    let files = vec![input(work.path(), "a.py", b"aa")];
    assert!(cache.lookup(&files).is_none());
}

#[test]
fn test_eviction_drops_everything_on_a_zero_budget() {
    let work = tempfile::tempdir().unwrap();
    let cache_dir = work.path().join("cache");
    let mut cache = LayerCache::open(&cache_dir, 0).unwrap();

    let files_a = vec![input(work.path(), "a.py", b"a")];
    let files_b = vec![input(work.path(), "b.py", b"b")];
    let (tar_a, digest_a) = layer_tar(work.path(), "aa.tar", 600);
    let (tar_b, digest_b) = layer_tar(work.path(), "bb.tar", 600);

    cache.store(&files_a, &digest_a, &tar_a).unwrap();
    cache.store(&files_b, &digest_b, &tar_b).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.total_bytes, 0, "a zero budget retains nothing");

    let blobs: Vec<_> = fs::read_dir(cache_dir.join("blobs/sha256"))
        .unwrap()
        .collect();
    assert!(blobs.is_empty(), "evicted blobs are removed from disk");
}

#[test]
fn test_clear_empties_everything() {
    let work = tempfile::tempdir().unwrap();
    let mut cache = LayerCache::open(&work.path().join("cache"), 100).unwrap();

    let files = vec![input(work.path(), "a.py", b"a")];
    let (tar, digest) = layer_tar(work.path(), "layer.tar", 64);
    cache.store(&files, &digest, &tar).unwrap();

    cache.clear().unwrap();
    assert_eq!(cache.stats().entries, 0);
    assert!(cache.lookup(&files).is_none());
}
