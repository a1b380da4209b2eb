// src/config.rs

//! Build configuration
//!
//! `BuildConfig` is the single input to the builder. It can be constructed
//! directly, loaded from a `stratum.toml` file (`[build]` table), or both:
//! file values first, CLI overrides on top. `env` and `labels` merge
//! key-wise when overridden; every other override replaces the file value.

use crate::error::{Error, Result};
use crate::reference::{ImageReference, Platform};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Default in-image directory for application files
pub const DEFAULT_WORKDIR: &str = "/app";

/// Default layer cache budget in megabytes
pub const DEFAULT_MAX_CACHE_SIZE_MB: u64 = 5000;

/// Configuration consumed by the image builder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Image reference to build (required)
    pub tag: String,

    /// Base image reference; `None` builds from scratch
    pub base_image: Option<String>,

    /// Project root on disk
    pub context_dir: PathBuf,

    /// In-image directory under which project files are placed
    pub workdir: String,

    /// Container entrypoint; auto-detected from the project when unset
    pub entrypoint: Option<Vec<String>>,

    /// Default command arguments
    pub cmd: Option<Vec<String>>,

    /// User to run as
    pub user: Option<String>,

    /// Environment variables added to the image config
    pub env: BTreeMap<String, String>,

    /// Image labels
    pub labels: BTreeMap<String, String>,

    /// TCP ports to expose
    pub exposed_ports: Vec<u16>,

    /// Explicit file selection relative to the context; auto-selected when unset
    pub include_paths: Option<Vec<String>>,

    /// Build a dependency layer below the application layer
    pub include_deps: bool,

    /// Requirements manifest used for the dependency layer
    pub requirements_file: String,

    /// OCI layout destination
    pub output_dir: PathBuf,

    /// Layer cache control
    pub use_cache: bool,
    pub cache_dir: Option<PathBuf>,
    pub max_cache_size_mb: u64,

    /// Target platform as `<os>/<arch>`
    pub platform: String,

    /// Deterministic tar emission
    pub reproducible: bool,

    /// Log the build plan without building
    pub dry_run: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            tag: String::new(),
            base_image: None,
            context_dir: PathBuf::from("."),
            workdir: DEFAULT_WORKDIR.to_string(),
            entrypoint: None,
            cmd: None,
            user: None,
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            exposed_ports: Vec::new(),
            include_paths: None,
            include_deps: false,
            requirements_file: "requirements.txt".to_string(),
            output_dir: PathBuf::from("dist/image"),
            use_cache: true,
            cache_dir: None,
            max_cache_size_mb: DEFAULT_MAX_CACHE_SIZE_MB,
            platform: "linux/amd64".to_string(),
            reproducible: true,
            dry_run: false,
        }
    }
}

impl BuildConfig {
    /// Load a config from the `[build]` table of a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("failed to read {}: {e}", path.display())))?;

        let file: ConfigFile = toml::from_str(&text)
            .map_err(|e| Error::ConfigError(format!("failed to parse {}: {e}", path.display())))?;

        Ok(file.build)
    }

    /// Apply CLI overrides on top of this config; overrides win, except
    /// `env` and `labels` which merge key-wise
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(tag) = overrides.tag {
            self.tag = tag;
        }
        if let Some(base_image) = overrides.base_image {
            self.base_image = Some(base_image);
        }
        if let Some(context_dir) = overrides.context_dir {
            self.context_dir = context_dir;
        }
        if let Some(entrypoint) = overrides.entrypoint {
            self.entrypoint = Some(entrypoint);
        }
        if let Some(env) = overrides.env {
            self.env.extend(env);
        }
        if let Some(labels) = overrides.labels {
            self.labels.extend(labels);
        }
        if let Some(output_dir) = overrides.output_dir {
            self.output_dir = output_dir;
        }
        if let Some(use_cache) = overrides.use_cache {
            self.use_cache = use_cache;
        }
        if let Some(cache_dir) = overrides.cache_dir {
            self.cache_dir = Some(cache_dir);
        }
        if let Some(include_deps) = overrides.include_deps {
            self.include_deps = include_deps;
        }
        if let Some(requirements_file) = overrides.requirements_file {
            self.requirements_file = requirements_file;
        }
        if let Some(platform) = overrides.platform {
            self.platform = platform;
        }
        if let Some(reproducible) = overrides.reproducible {
            self.reproducible = reproducible;
        }
        if let Some(dry_run) = overrides.dry_run {
            self.dry_run = dry_run;
        }
    }

    /// Check required fields and formats before a build
    pub fn validate(&self) -> Result<()> {
        if self.tag.is_empty() {
            return Err(Error::ConfigError("missing required field: tag".to_string()));
        }
        ImageReference::parse(&self.tag)?;
        if let Some(base) = &self.base_image {
            ImageReference::parse(base)?;
        }
        Platform::parse(&self.platform)?;
        if !self.context_dir.is_dir() {
            return Err(Error::ConfigError(format!(
                "context directory does not exist: {}",
                self.context_dir.display()
            )));
        }
        Ok(())
    }
}

/// On-disk config file shape: a single `[build]` table
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    build: BuildConfig,
}

/// Optional CLI-side overrides applied on top of a file config
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub tag: Option<String>,
    pub base_image: Option<String>,
    pub context_dir: Option<PathBuf>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub labels: Option<BTreeMap<String, String>>,
    pub output_dir: Option<PathBuf>,
    pub use_cache: Option<bool>,
    pub cache_dir: Option<PathBuf>,
    pub include_deps: Option<bool>,
    pub requirements_file: Option<String>,
    pub platform: Option<String>,
    pub reproducible: Option<bool>,
    pub dry_run: Option<bool>,
}
