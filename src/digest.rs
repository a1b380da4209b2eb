// src/digest.rs

//! SHA-256 digests for content addressing
//!
//! Every blob in the system is named by the lowercase hex SHA-256 of its
//! bytes, rendered as `sha256:<hex>`. This module provides one-shot and
//! streaming hashing plus validation helpers for digest strings.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Digest algorithm prefix used throughout the OCI layout
pub const SHA256_PREFIX: &str = "sha256:";

/// Length of a hex-formatted SHA-256
const SHA256_HEX_LEN: usize = 64;

/// Buffer size for streaming file hashing (8 KB)
const HASH_BUFFER_SIZE: usize = 8192;

/// Compute the `sha256:<hex>` digest of a byte slice
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{SHA256_PREFIX}{}", hex::encode(hasher.finalize()))
}

/// Compute the `sha256:<hex>` digest of a file without loading it into memory
pub fn sha256_digest_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| Error::IoError(format!("failed to open {}: {e}", path.display())))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| Error::IoError(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{SHA256_PREFIX}{}", hex::encode(hasher.finalize())))
}

/// Check that a digest string is well-formed (`sha256:` + 64 lowercase hex)
pub fn is_valid(digest: &str) -> bool {
    match digest.strip_prefix(SHA256_PREFIX) {
        Some(hex_part) => {
            hex_part.len() == SHA256_HEX_LEN
                && hex_part.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        }
        None => false,
    }
}

/// Extract the hex portion of a digest string
pub fn hex_part(digest: &str) -> Result<&str> {
    if !is_valid(digest) {
        return Err(Error::ProtocolError(format!("malformed digest: {digest}")));
    }
    Ok(&digest[SHA256_PREFIX.len()..])
}

/// Recompute a file's digest and compare against the expected value
pub fn verify_file(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_digest_file(path)?;
    if actual != expected {
        return Err(Error::ProtocolError(format!(
            "digest mismatch for {}: expected {expected}, got {actual}",
            path.display()
        )));
    }
    Ok(())
}

/// Writer adapter that hashes everything passing through it
///
/// Used by the layer writer so the tar bytes are hashed in the same pass
/// that writes them to disk.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Consume the writer, returning the inner writer, the final digest,
    /// and the number of bytes written
    pub fn finalize(self) -> (W, String, u64) {
        let digest = format!("{SHA256_PREFIX}{}", hex::encode(self.hasher.finalize()));
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_digest() {
        assert_eq!(
            sha256_digest(b"hello world"),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_digest_validation() {
        let good = sha256_digest(b"x");
        assert!(is_valid(&good));
        assert!(!is_valid("sha256:short"));
        assert!(!is_valid("md5:abc"));
        assert!(!is_valid(
            "sha256:B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9"
        ));
        assert_eq!(hex_part(&good).unwrap().len(), 64);
        assert!(hex_part("sha256:nope").is_err());
    }

    #[test]
    fn test_hashing_writer_matches_one_shot() {
        let mut out = Vec::new();
        let mut writer = HashingWriter::new(&mut out);
        writer.write_all(b"some layer ").unwrap();
        writer.write_all(b"content").unwrap();
        let (_, digest, written) = writer.finalize();

        assert_eq!(digest, sha256_digest(b"some layer content"));
        assert_eq!(written, 18);
    }

    #[test]
    fn test_file_digest_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"blob bytes").unwrap();

        let digest = sha256_digest_file(&path).unwrap();
        assert_eq!(digest, sha256_digest(b"blob bytes"));
        assert!(verify_file(&path, &digest).is_ok());
        assert!(verify_file(&path, &sha256_digest(b"other")).is_err());
    }
}
