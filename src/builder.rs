// src/builder.rs

//! Image build and push orchestration
//!
//! `ImageBuilder` drives the whole pipeline: pull the base image for the
//! target platform, assemble the dependency and application layers
//! (through the cache), merge the image config, write the OCI layout, and
//! push the result with HEAD-before-PUT deduplication. One builder
//! instance serves one caller; `build()` must precede `push()`, and
//! re-pushing the same built image is idempotent.
//!
//! A build failure leaves the output directory partial; re-running is
//! safe because every blob is content-addressed. A push only becomes
//! visible to registry clients at the final manifest PUT.

use crate::auth;
use crate::cache::LayerCache;
use crate::config::BuildConfig;
use crate::digest;
use crate::error::{Error, Result};
use crate::framework;
use crate::layer;
use crate::oci::{self, Descriptor, ImageConfig, Index, LayoutMarker, Manifest};
use crate::progress::{BuildObserver, SilentObserver};
use crate::project;
use crate::reference::{ImageReference, Platform};
use crate::registry::{ManifestResponse, RegistryClient};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Artifacts of a completed build, kept for the push phase
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub manifest_digest: String,
    pub config_digest: String,
    /// Full layer stack in manifest order: base layers, then own layers
    pub layers: Vec<Descriptor>,
}

/// Builds an OCI image layout from a project and pushes it to a registry
pub struct ImageBuilder {
    config: BuildConfig,
    cache: Option<LayerCache>,
    observer: Box<dyn BuildObserver>,
    built: Option<BuiltImage>,
}

impl ImageBuilder {
    /// Create a builder; framework hints fill config fields the user
    /// left unset, and the layer cache is opened when enabled
    pub fn new(mut config: BuildConfig) -> Self {
        framework::apply_framework_hints(&mut config);

        let cache = if config.use_cache {
            match cache_dir_for(&config) {
                Some(dir) => match LayerCache::open(&dir, config.max_cache_size_mb) {
                    Ok(cache) => Some(cache),
                    Err(e) => {
                        // A broken cache must not break the build
                        warn!("layer cache disabled: {e}");
                        None
                    }
                },
                None => {
                    warn!("no home directory found, layer cache disabled");
                    None
                }
            }
        } else {
            None
        };

        Self {
            config,
            cache,
            observer: Box::new(SilentObserver),
            built: None,
        }
    }

    /// Replace the progress observer
    pub fn with_observer(mut self, observer: Box<dyn BuildObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn built(&self) -> Option<&BuiltImage> {
        self.built.as_ref()
    }

    /// Run the build pipeline, returning the configured tag
    pub fn build(&mut self) -> Result<String> {
        self.config.validate()?;
        let platform = Platform::parse(&self.config.platform)?;

        if self.config.dry_run {
            self.log_build_plan();
            return Ok(self.config.tag.clone());
        }

        let output = self.config.output_dir.clone();
        let blobs_dir = output.join("blobs").join("sha256");
        let refs_dir = output.join("refs").join("tags");
        for dir in [&blobs_dir, &refs_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                Error::IoError(format!("failed to create {}: {e}", dir.display()))
            })?;
        }

        let (base_layers, base_config) = match self.config.base_image.clone() {
            Some(base) => {
                let (layers, config) = self.pull_base_image(&base, &platform, &blobs_dir)?;
                (layers, Some(config))
            }
            None => {
                debug!("no base image configured, building from scratch");
                (Vec::new(), None)
            }
        };

        let entrypoint = self
            .config
            .entrypoint
            .clone()
            .unwrap_or_else(|| project::detect_entrypoint(&self.config.context_dir));
        let include = self
            .config
            .include_paths
            .clone()
            .unwrap_or_else(|| project::default_include_paths(&self.config.context_dir));

        let mut own_layers = Vec::new();
        if self.config.include_deps {
            if let Some(deps) = self.build_deps_layer(&blobs_dir)? {
                own_layers.push(deps);
            }
        }
        own_layers.push(self.build_app_layer(&blobs_dir, &include)?);

        // Own layers are uncompressed tar, so their diff_ids equal their
        // blob digests
        let diff_ids: Vec<String> = own_layers.iter().map(|l| l.digest.clone()).collect();
        let merged = oci::merged_config(base_config, &self.config, &entrypoint, &platform, &diff_ids);
        let config_blob = layer::write_blob(&blobs_dir, &oci::canonical_json(&merged)?)?;

        let mut layers = base_layers;
        layers.extend(own_layers);

        let manifest = Manifest::new(
            Descriptor::new(oci::CONFIG_MEDIA_TYPE, config_blob.digest.clone(), config_blob.size),
            layers.clone(),
        );
        let manifest_blob = layer::write_blob(&blobs_dir, &oci::canonical_json(&manifest)?)?;

        fs::write(
            output.join("oci-layout"),
            oci::canonical_json(&LayoutMarker::default())?,
        )
        .map_err(|e| Error::IoError(format!("failed to write oci-layout: {e}")))?;

        let mut manifest_desc = Descriptor::new(
            oci::MANIFEST_MEDIA_TYPE,
            manifest_blob.digest.clone(),
            manifest_blob.size,
        );
        manifest_desc.platform = Some(platform.clone());
        manifest_desc.annotations = Some(
            [(oci::REF_NAME_ANNOTATION.to_string(), self.config.tag.clone())].into(),
        );
        fs::write(
            output.join("index.json"),
            oci::canonical_json(&Index::new(vec![manifest_desc]))?,
        )
        .map_err(|e| Error::IoError(format!("failed to write index.json: {e}")))?;

        let reference = ImageReference::parse(&self.config.tag)?;
        fs::write(refs_dir.join(&reference.tag), &manifest_blob.digest)
            .map_err(|e| Error::IoError(format!("failed to write tag ref: {e}")))?;

        info!(
            "built {} ({}, {} layers)",
            self.config.tag,
            manifest_blob.digest,
            layers.len()
        );
        self.observer.build_done(&self.config.tag, &manifest_blob.digest);

        self.built = Some(BuiltImage {
            manifest_digest: manifest_blob.digest,
            config_digest: config_blob.digest,
            layers,
        });
        Ok(self.config.tag.clone())
    }

    /// Push the built image; layers and config first, manifest last
    ///
    /// `destination` overrides the build tag; explicit credentials
    /// override the provider chain. Returns the canonical pushed
    /// reference.
    pub fn push(
        &self,
        destination: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<String> {
        let built = self.built.as_ref().ok_or_else(|| {
            Error::StateError("push() called before build()".to_string())
        })?;

        let target = destination.unwrap_or(&self.config.tag);
        let reference = ImageReference::parse(target)?;
        let auth = auth::resolve_auth(
            &auth::default_chain(),
            &reference.registry,
            username,
            password,
        );
        let mut client = RegistryClient::new(&reference.registry, &reference.repository, auth)?;

        let blobs_dir = self.config.output_dir.join("blobs").join("sha256");
        info!("pushing {}", reference);

        let total = built.layers.len();
        for (i, layer_desc) in built.layers.iter().enumerate() {
            self.observer.push_layer_start(i + 1, total, &layer_desc.digest);
            let blob_path = blobs_dir.join(digest::hex_part(&layer_desc.digest)?);
            let uploaded = client.push_blob(&layer_desc.digest, &blob_path, true)?;
            if !uploaded {
                self.observer.push_layer_skipped(i + 1, total, &layer_desc.digest);
            }
        }

        let config_path = blobs_dir.join(digest::hex_part(&built.config_digest)?);
        client.push_blob(&built.config_digest, &config_path, true)?;

        let manifest_path = blobs_dir.join(digest::hex_part(&built.manifest_digest)?);
        let manifest_data = fs::read(&manifest_path).map_err(|e| {
            Error::IoError(format!("failed to read {}: {e}", manifest_path.display()))
        })?;
        self.observer.push_manifest(&reference.tag, &built.manifest_digest);
        client.push_manifest(&reference.tag, manifest_data, oci::MANIFEST_MEDIA_TYPE)?;

        info!("pushed {}", reference.canonical());
        Ok(reference.canonical())
    }

    /// Pull the base image's manifest, config, and layers for the target
    /// platform into the output blob store
    fn pull_base_image(
        &self,
        base: &str,
        platform: &Platform,
        blobs_dir: &Path,
    ) -> Result<(Vec<Descriptor>, ImageConfig)> {
        let reference = ImageReference::parse(base)?;
        let auth = auth::resolve_auth(&auth::default_chain(), &reference.registry, None, None);
        let mut client = RegistryClient::new(&reference.registry, &reference.repository, auth)?;

        info!("pulling base image {}", reference);
        let (response, _) = client.pull_manifest(&reference.tag)?;
        let manifest = match response {
            ManifestResponse::Manifest(manifest) => manifest,
            ManifestResponse::Index(index) => {
                let entry = index
                    .manifests
                    .iter()
                    .find(|d| {
                        d.platform
                            .as_ref()
                            .is_some_and(|p| platform.matches(&p.architecture, &p.os))
                    })
                    .ok_or_else(|| {
                        Error::PlatformMismatch(format!("{platform} in base image {reference}"))
                    })?;
                debug!("selected {} manifest {}", platform, entry.digest);
                match client.pull_manifest(&entry.digest)? {
                    (ManifestResponse::Manifest(manifest), _) => manifest,
                    (ManifestResponse::Index(_), _) => {
                        return Err(Error::ProtocolError(format!(
                            "index entry {} resolved to another index",
                            entry.digest
                        )));
                    }
                }
            }
        };

        let config_path = blobs_dir.join(digest::hex_part(&manifest.config.digest)?);
        if !config_path.exists() {
            client.pull_blob(&manifest.config.digest, &config_path)?;
        }
        let config_data = fs::read(&config_path).map_err(|e| {
            Error::IoError(format!("failed to read {}: {e}", config_path.display()))
        })?;
        let base_config: ImageConfig = serde_json::from_slice(&config_data)
            .map_err(|e| Error::ProtocolError(format!("malformed base image config: {e}")))?;

        let total = manifest.layers.len();
        for (i, layer_desc) in manifest.layers.iter().enumerate() {
            let layer_path = blobs_dir.join(digest::hex_part(&layer_desc.digest)?);
            if layer_path.exists() {
                debug!("base layer {} already present", layer_desc.digest);
                continue;
            }
            self.observer.pull_layer_start(i + 1, total, &layer_desc.digest);
            client.pull_blob(&layer_desc.digest, &layer_path)?;
            self.observer.pull_layer_done(i + 1, total, &layer_desc.digest);
        }

        info!("base image pulled ({} layers)", total);
        Ok((manifest.layers, base_config))
    }

    /// Build the dependency layer, when the project has dependencies
    fn build_deps_layer(&self, blobs_dir: &Path) -> Result<Option<Descriptor>> {
        let deps =
            project::find_dependencies(&self.config.context_dir, &self.config.requirements_file)?;
        if deps.is_empty() {
            debug!("no dependencies found, skipping dependency layer");
            return Ok(None);
        }

        info!("creating dependency layer ({} files)", deps.len());
        let blob = layer::write_layer(
            &deps,
            &self.config.workdir,
            blobs_dir,
            self.config.reproducible,
        )?;
        Ok(Some(Descriptor::new(oci::LAYER_MEDIA_TYPE, blob.digest, blob.size)))
    }

    /// Build the application layer, going through the cache
    fn build_app_layer(&mut self, blobs_dir: &Path, include: &[String]) -> Result<Descriptor> {
        let files = project::collect_files(&self.config.context_dir, include)?;
        debug!("application layer: {} files selected", files.len());

        if let Some(cache) = &mut self.cache {
            if let Some((cached_digest, cache_path)) = cache.lookup(&files) {
                info!("application layer unchanged, using cached {}", cached_digest);
                let blob_path = blobs_dir.join(digest::hex_part(&cached_digest)?);
                if !blob_path.exists() {
                    fs::copy(&cache_path, &blob_path).map_err(|e| {
                        Error::IoError(format!("failed to restore cached layer: {e}"))
                    })?;
                }
                let size = blob_path
                    .metadata()
                    .map_err(|e| {
                        Error::IoError(format!("failed to stat {}: {e}", blob_path.display()))
                    })?
                    .len();
                return Ok(Descriptor::new(oci::LAYER_MEDIA_TYPE, cached_digest, size));
            }
        }

        let blob = layer::write_layer(
            &files,
            &self.config.workdir,
            blobs_dir,
            self.config.reproducible,
        )?;
        if let Some(cache) = &mut self.cache {
            if let Err(e) = cache.store(&files, &blob.digest, &blob.path) {
                warn!("layer not cached: {e}");
            }
        }
        Ok(Descriptor::new(oci::LAYER_MEDIA_TYPE, blob.digest, blob.size))
    }

    fn log_build_plan(&self) {
        info!("dry run: would build {}", self.config.tag);
        info!("  base image: {}", self.config.base_image.as_deref().unwrap_or("<scratch>"));
        info!("  context: {}", self.config.context_dir.display());
        info!("  platform: {}", self.config.platform);
        info!("  working dir: {}", self.config.workdir);
        match &self.config.entrypoint {
            Some(entry) => info!("  entrypoint: {}", entry.join(" ")),
            None => info!("  entrypoint: <auto-detect>"),
        }
        if !self.config.exposed_ports.is_empty() {
            let ports: Vec<String> =
                self.config.exposed_ports.iter().map(u16::to_string).collect();
            info!("  exposed ports: {}", ports.join(", "));
        }
        info!("  include dependencies: {}", self.config.include_deps);
        info!("  cache: {}", self.config.use_cache);
    }
}

/// Cache location: explicit config, else `~/.stratum/cache`
fn cache_dir_for(config: &BuildConfig) -> Option<std::path::PathBuf> {
    match &config.cache_dir {
        Some(dir) => Some(dir.clone()),
        None => dirs::home_dir().map(|home| home.join(".stratum").join("cache")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_config(context: &Path, output: &Path) -> BuildConfig {
        BuildConfig {
            tag: "localhost:5000/demo:v1".to_string(),
            context_dir: context.to_path_buf(),
            output_dir: output.to_path_buf(),
            entrypoint: Some(vec!["python".to_string(), "-m".to_string(), "app".to_string()]),
            use_cache: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_push_before_build_is_a_state_error() {
        let work = tempfile::tempdir().unwrap();
        let builder = ImageBuilder::new(scratch_config(work.path(), &work.path().join("out")));
        assert!(matches!(
            builder.push(None, None, None),
            Err(Error::StateError(_))
        ));
    }

    #[test]
    fn test_dry_run_builds_nothing() {
        let work = tempfile::tempdir().unwrap();
        let output = work.path().join("out");
        let mut config = scratch_config(work.path(), &output);
        config.dry_run = true;
        std::fs::write(work.path().join("app.py"), b"print('hi')\n").unwrap();

        let mut builder = ImageBuilder::new(config);
        let tag = builder.build().unwrap();

        assert_eq!(tag, "localhost:5000/demo:v1");
        assert!(!output.exists());
        assert!(builder.built().is_none());
    }

    #[test]
    fn test_invalid_platform_fails_before_any_io() {
        let work = tempfile::tempdir().unwrap();
        let output = work.path().join("out");
        let mut config = scratch_config(work.path(), &output);
        config.platform = "amd64".to_string();

        let mut builder = ImageBuilder::new(config);
        assert!(matches!(builder.build(), Err(Error::ConfigError(_))));
        assert!(!output.exists());
    }

    #[test]
    fn test_scratch_build_records_built_image() {
        let work = tempfile::tempdir().unwrap();
        let output = work.path().join("out");
        std::fs::write(work.path().join("app.py"), b"print('hi')\n").unwrap();

        let mut builder = ImageBuilder::new(scratch_config(work.path(), &output));
        builder.build().unwrap();

        let built = builder.built().expect("build() must record artifacts");
        assert_eq!(built.layers.len(), 1);
        assert!(digest::is_valid(&built.manifest_digest));
        assert!(digest::is_valid(&built.config_digest));
    }
}
