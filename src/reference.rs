// src/reference.rs

//! Image references and target platforms
//!
//! A reference is `[registry/]repository[:tag]`. Canonicalization follows
//! the container-ecosystem conventions: a bare name maps to the `library`
//! namespace on Docker Hub, and the first path segment is only treated as a
//! registry host when it contains a `.` or `:`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default registry host for short references
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when a reference carries none
pub const DEFAULT_TAG: &str = "latest";

/// A parsed image reference: `(registry, repository, tag)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    /// Parse and canonicalize a reference string
    ///
    /// `alpine` becomes `docker.io/library/alpine:latest`; `user/app`
    /// becomes `docker.io/user/app:latest`; `localhost:5000/test` keeps
    /// its explicit registry host.
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.is_empty() {
            return Err(Error::ConfigError("empty image reference".to_string()));
        }

        // Bare name: no path separator at all
        if !reference.contains('/') {
            let (name, tag) = split_tag(reference);
            if name.is_empty() {
                return Err(Error::ConfigError(format!(
                    "invalid image reference: {reference}"
                )));
            }
            return Ok(Self {
                registry: DEFAULT_REGISTRY.to_string(),
                repository: format!("library/{name}"),
                tag: tag.to_string(),
            });
        }

        let (first, rest) = reference.split_once('/').unwrap();

        // The first segment is a registry host iff it looks like one
        let (registry, remainder) = if first.contains('.') || first.contains(':') {
            (first.to_string(), rest)
        } else {
            (DEFAULT_REGISTRY.to_string(), reference)
        };

        let (repository, tag) = split_tag(remainder);
        if repository.is_empty() {
            return Err(Error::ConfigError(format!(
                "invalid image reference: {reference}"
            )));
        }

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Render the fully qualified `registry/repository:tag` form
    pub fn canonical(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Split a trailing `:tag` off a repository path
///
/// Only the last path segment may carry a tag, so a `:` before the final
/// `/` (a registry port) is never mistaken for a tag separator.
fn split_tag(remainder: &str) -> (&str, &str) {
    match remainder.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (remainder, DEFAULT_TAG),
    }
}

/// A build target platform: `<os>/<arch>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl Platform {
    /// Parse a `<os>/<arch>` string; both segments must be non-empty
    pub fn parse(platform: &str) -> Result<Self> {
        let parts: Vec<&str> = platform.split('/').collect();
        if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(Error::ConfigError(format!(
                "invalid platform format: {platform:?} (expected <os>/<arch>, e.g. linux/amd64)"
            )));
        }
        Ok(Self {
            os: parts[0].to_string(),
            architecture: parts[1].to_string(),
        })
    }

    /// Whether a manifest-list platform entry matches this target
    pub fn matches(&self, architecture: &str, os: &str) -> bool {
        self.architecture == architecture && self.os == os
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}
