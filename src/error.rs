// src/error.rs

//! Crate-wide error type
//!
//! All fallible operations in the library return `crate::error::Result`.
//! Variants carry preformatted messages; callers construct them with
//! `map_err(|e| Error::IoError(format!(...)))` at the failure site so the
//! message names the file or URL involved.

use thiserror::Error;

/// Errors raised by the build and push engine
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid reference, platform string, or missing required field
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Filesystem failure during layer write or cache access
    #[error("I/O error: {0}")]
    IoError(String),

    /// Credential resolution or token exchange failed
    #[error("authentication error: {0}")]
    AuthError(String),

    /// HTTP response outside the accepted set for a registry operation
    #[error("registry error (HTTP {status}): {body}")]
    RegistryError { status: u16, body: String },

    /// Index pull found no manifest matching the requested platform
    #[error("no manifest for platform {0}")]
    PlatformMismatch(String),

    /// Malformed manifest JSON, missing upload location, or digest mismatch
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Builder operation called out of order (push before build)
    #[error("invalid builder state: {0}")]
    StateError(String),
}

pub type Result<T> = std::result::Result<T, Error>;
