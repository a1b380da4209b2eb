// src/layer.rs

//! Layer tar emission
//!
//! Writes the selected files as an uncompressed tar, placing each at
//! `<workdir>/<relative-path>`. The tar bytes stream through a SHA-256
//! hashing writer into a temp file, so the digest falls out of the same
//! pass that writes the bytes; the temp file is then persisted under
//! `blobs/sha256/<hex>`.
//!
//! In reproducible mode (the default) the output depends only on file
//! contents and in-archive names: entries are sorted by archive path,
//! `mtime` is zeroed, ownership is `root:root`, and no extended
//! attributes are emitted.

use crate::digest::{self, HashingWriter};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// A blob written into a `blobs/sha256` directory
#[derive(Debug, Clone)]
pub struct WrittenBlob {
    pub digest: String,
    pub size: u64,
    pub path: PathBuf,
}

/// Build a layer tar from `(absolute, relative)` file pairs
///
/// Returns the digest-named blob inside `blobs_dir`. `workdir` is the
/// in-image prefix each relative path is placed under.
pub fn write_layer(
    files: &[(PathBuf, PathBuf)],
    workdir: &str,
    blobs_dir: &Path,
    reproducible: bool,
) -> Result<WrittenBlob> {
    let staging = NamedTempFile::new_in(blobs_dir).map_err(|e| {
        Error::IoError(format!("failed to create temp file in {}: {e}", blobs_dir.display()))
    })?;

    let mut entries: Vec<(&PathBuf, String)> = files
        .iter()
        .map(|(abs, rel)| (abs, archive_path(workdir, rel)))
        .collect();
    if reproducible {
        entries.sort_by(|a, b| a.1.cmp(&b.1));
    }

    let writer = HashingWriter::new(staging);
    let mut archive = tar::Builder::new(writer);
    let mut created_dirs: HashSet<String> = HashSet::new();

    for (abs, arc_path) in &entries {
        append_parent_dirs(&mut archive, arc_path, reproducible, &mut created_dirs)?;
        append_file(&mut archive, abs, arc_path, reproducible)?;
    }

    let writer = archive
        .into_inner()
        .map_err(|e| Error::IoError(format!("failed to finish layer tar: {e}")))?;
    let (staging, digest, size) = writer.finalize();

    let blob_path = blobs_dir.join(digest::hex_part(&digest)?);
    staging
        .persist(&blob_path)
        .map_err(|e| Error::IoError(format!("failed to persist {}: {e}", blob_path.display())))?;

    debug!("wrote layer {} ({} bytes, {} files)", digest, size, files.len());
    Ok(WrittenBlob {
        digest,
        size,
        path: blob_path,
    })
}

/// Write an in-memory document (config, manifest) as a digest-named blob
pub fn write_blob(blobs_dir: &Path, data: &[u8]) -> Result<WrittenBlob> {
    let digest = digest::sha256_digest(data);
    let blob_path = blobs_dir.join(digest::hex_part(&digest)?);
    std::fs::write(&blob_path, data)
        .map_err(|e| Error::IoError(format!("failed to write {}: {e}", blob_path.display())))?;
    Ok(WrittenBlob {
        digest,
        size: data.len() as u64,
        path: blob_path,
    })
}

/// In-archive path for a file: `<workdir>/<relative>` without the leading slash
fn archive_path(workdir: &str, rel: &Path) -> String {
    let prefix = workdir.trim_matches('/');
    let rel = rel.to_string_lossy();
    if prefix.is_empty() {
        rel.into_owned()
    } else {
        format!("{prefix}/{rel}")
    }
}

/// Emit directory entries for every ancestor of `arc_path` not yet seen
fn append_parent_dirs<W: io::Write>(
    archive: &mut tar::Builder<W>,
    arc_path: &str,
    reproducible: bool,
    created: &mut HashSet<String>,
) -> Result<()> {
    let components: Vec<&str> = arc_path.split('/').collect();
    let mut current = String::new();
    for component in &components[..components.len().saturating_sub(1)] {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(component);
        if created.contains(&current) {
            continue;
        }

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        set_ownership(&mut header, reproducible, None)?;
        header.set_cksum();
        archive
            .append_data(&mut header, format!("{current}/"), io::empty())
            .map_err(|e| Error::IoError(format!("failed to append dir {current}: {e}")))?;
        created.insert(current.clone());
    }
    Ok(())
}

fn append_file<W: io::Write>(
    archive: &mut tar::Builder<W>,
    abs: &Path,
    arc_path: &str,
    reproducible: bool,
) -> Result<()> {
    let metadata = abs
        .metadata()
        .map_err(|e| Error::IoError(format!("failed to stat {}: {e}", abs.display())))?;
    let mut file = File::open(abs)
        .map_err(|e| Error::IoError(format!("failed to open {}: {e}", abs.display())))?;

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(metadata.len());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        header.set_mode(metadata.permissions().mode());
    }
    #[cfg(not(unix))]
    header.set_mode(0o644);
    set_ownership(&mut header, reproducible, Some(&metadata))?;
    header.set_cksum();

    archive
        .append_data(&mut header, arc_path, &mut file)
        .map_err(|e| Error::IoError(format!("failed to append {}: {e}", abs.display())))?;
    Ok(())
}

/// Zero out identity and time in reproducible mode; mirror the host otherwise
fn set_ownership(
    header: &mut tar::Header,
    reproducible: bool,
    metadata: Option<&std::fs::Metadata>,
) -> Result<()> {
    if reproducible {
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header
            .set_username("root")
            .and_then(|()| header.set_groupname("root"))
            .map_err(|e| Error::IoError(format!("failed to set tar ownership: {e}")))?;
        return Ok(());
    }

    if let Some(metadata) = metadata {
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        header.set_mtime(mtime);
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            header.set_uid(metadata.uid() as u64);
            header.set_gid(metadata.gid() as u64);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture(dir: &Path) -> Vec<(PathBuf, PathBuf)> {
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/main.py"), b"print('hi')\n").unwrap();
        fs::write(dir.join("util.py"), b"pass\n").unwrap();
        vec![
            (dir.join("util.py"), PathBuf::from("util.py")),
            (dir.join("src/main.py"), PathBuf::from("src/main.py")),
        ]
    }

    #[test]
    fn test_layer_is_digest_named_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = dir.path().join("blobs/sha256");
        fs::create_dir_all(&blobs).unwrap();
        let files = fixture(dir.path());

        let blob = write_layer(&files, "/app", &blobs, true).unwrap();

        assert!(blob.path.exists());
        assert_eq!(
            blob.path.file_name().unwrap().to_str().unwrap(),
            digest::hex_part(&blob.digest).unwrap()
        );
        assert_eq!(blob.size, blob.path.metadata().unwrap().len());
        digest::verify_file(&blob.path, &blob.digest).unwrap();
    }

    #[test]
    fn test_reproducible_layers_are_byte_identical() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let blobs_a = dir_a.path().join("blobs");
        let blobs_b = dir_b.path().join("blobs");
        fs::create_dir_all(&blobs_a).unwrap();
        fs::create_dir_all(&blobs_b).unwrap();

        let mut files_a = fixture(dir_a.path());
        let files_b = fixture(dir_b.path());
        // Input order must not matter in reproducible mode
        files_a.reverse();

        let blob_a = write_layer(&files_a, "/app", &blobs_a, true).unwrap();
        let blob_b = write_layer(&files_b, "/app", &blobs_b, true).unwrap();

        assert_eq!(blob_a.digest, blob_b.digest);
        assert_eq!(
            fs::read(&blob_a.path).unwrap(),
            fs::read(&blob_b.path).unwrap()
        );
    }

    #[test]
    fn test_entries_are_placed_under_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = dir.path().join("blobs");
        fs::create_dir_all(&blobs).unwrap();
        let files = fixture(dir.path());

        let blob = write_layer(&files, "/app", &blobs, true).unwrap();

        let mut archive = tar::Archive::new(File::open(&blob.path).unwrap());
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            paths,
            vec!["app/", "app/src/", "app/src/main.py", "app/util.py"]
        );
    }

    #[test]
    fn test_reproducible_metadata_is_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = dir.path().join("blobs");
        fs::create_dir_all(&blobs).unwrap();
        let files = fixture(dir.path());

        let blob = write_layer(&files, "/app", &blobs, true).unwrap();

        let mut archive = tar::Archive::new(File::open(&blob.path).unwrap());
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.mtime().unwrap(), 0);
            assert_eq!(header.uid().unwrap(), 0);
            assert_eq!(header.gid().unwrap(), 0);
        }
    }

    #[test]
    fn test_write_blob() {
        let dir = tempfile::tempdir().unwrap();
        let blob = write_blob(dir.path(), b"{\"a\":1}").unwrap();
        assert_eq!(blob.size, 7);
        assert_eq!(fs::read(&blob.path).unwrap(), b"{\"a\":1}");
        digest::verify_file(&blob.path, &blob.digest).unwrap();
    }
}
