// src/oci.rs

//! OCI image model
//!
//! Typed representations of descriptors, manifests, indexes, and image
//! configs, plus the base-image config merge. Serialization is canonical:
//! compact JSON with struct-declaration key order, because every document
//! here is content-addressed and any drift changes the digest.

use crate::config::BuildConfig;
use crate::error::{Error, Result};
use crate::reference::Platform;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// OCI image layout version written to the `oci-layout` marker
pub const OCI_LAYOUT_VERSION: &str = "1.0.0";

/// OCI image manifest media type
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image config media type
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// OCI layer media type (uncompressed tar, used for own layers)
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

/// OCI layer media type for gzipped tar (inherited from base images)
pub const LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI image index media type
pub const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Docker schema2 manifest media type (accepted on pull)
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Docker schema2 manifest list media type (treated as an index on pull)
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Annotation key carrying the image tag in the layout index
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Label naming the base image, used for distroless detection
pub const BASE_NAME_LABEL: &str = "org.opencontainers.image.base.name";

/// Content descriptor: the cross-reference currency between artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: String, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest,
            size,
            annotations: None,
            platform: None,
        }
    }
}

/// Image manifest: config descriptor plus the ordered layer stack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Manifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config,
            layers,
            annotations: None,
        }
    }
}

/// Image index: a list of per-platform manifest descriptors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Index {
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: INDEX_MEDIA_TYPE.to_string(),
            manifests,
            annotations: None,
        }
    }
}

/// Runtime section of an image config
///
/// Fields this tool does not manage (Volumes, StopSignal, ...) round-trip
/// through `extra` so a base config is never truncated by the merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "ExposedPorts", default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(rename = "Env", default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "Labels", default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Layer diff-id list of an image config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rootfs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<String>,
}

impl Default for Rootfs {
    fn default() -> Self {
        Self {
            kind: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// Image configuration blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub config: RuntimeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<Rootfs>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The `oci-layout` marker document
#[derive(Debug, Serialize, Deserialize)]
pub struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    pub image_layout_version: String,
}

impl Default for LayoutMarker {
    fn default() -> Self {
        Self {
            image_layout_version: OCI_LAYOUT_VERSION.to_string(),
        }
    }
}

/// Serialize a document in its canonical (digest-stable) form
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| Error::ProtocolError(format!("failed to serialize document: {e}")))
}

/// Shells that mark an entrypoint as needing a shell in the base image
const SHELLS: [&str; 4] = ["sh", "bash", "/bin/sh", "/bin/bash"];

/// Whether a base image is distroless (no shell), detected by label
pub fn is_distroless(config: &ImageConfig) -> bool {
    let Some(labels) = &config.config.labels else {
        return false;
    };
    [BASE_NAME_LABEL, "name"].iter().any(|key| {
        labels
            .get(*key)
            .is_some_and(|v| v.to_lowercase().contains("distroless"))
    })
}

/// Merge application intent over a base image config
///
/// Env is a union with base-first ordering and application values shadowing
/// base keys in place. An application entrypoint replaces the base one,
/// except that a shell entrypoint against a distroless base is demoted to
/// `Cmd` so the base launcher keeps running. `new_diff_ids` are the
/// uncompressed digests of the layers this build appends.
pub fn merged_config(
    base: Option<ImageConfig>,
    cfg: &BuildConfig,
    entrypoint: &[String],
    platform: &Platform,
    new_diff_ids: &[String],
) -> ImageConfig {
    let mut merged = base.unwrap_or_else(|| ImageConfig {
        architecture: platform.architecture.clone(),
        os: platform.os.clone(),
        config: RuntimeConfig::default(),
        rootfs: Some(Rootfs::default()),
        extra: serde_json::Map::new(),
    });

    merged.architecture = platform.architecture.clone();
    merged.os = platform.os.clone();

    // Env: walk the base list in order, shadowing keys the application
    // sets, then append application-only keys.
    let mut env = Vec::new();
    let mut remaining = cfg.env.clone();
    for entry in merged.config.env.take().unwrap_or_default() {
        let shadowed = entry
            .split_once('=')
            .and_then(|(key, _)| remaining.remove(key).map(|value| format!("{key}={value}")));
        env.push(shadowed.unwrap_or(entry));
    }
    for (key, value) in remaining {
        env.push(format!("{key}={value}"));
    }
    if !env.is_empty() {
        merged.config.env = Some(env);
    }

    if !cfg.workdir.is_empty() {
        merged.config.working_dir = Some(cfg.workdir.clone());
    }

    // Entrypoint replacement, with shell demotion on distroless bases
    if !entrypoint.is_empty() {
        let shell_argv0 = SHELLS.contains(&entrypoint[0].as_str());
        if is_distroless(&merged) && shell_argv0 && merged.config.entrypoint.is_some() {
            merged.config.cmd = Some(entrypoint.to_vec());
        } else {
            merged.config.entrypoint = Some(entrypoint.to_vec());
        }
    }
    // An explicit Cmd wins over both the base Cmd and a demoted entrypoint
    if let Some(cmd) = &cfg.cmd {
        merged.config.cmd = Some(cmd.clone());
    }

    if let Some(user) = &cfg.user {
        merged.config.user = Some(user.clone());
    }

    if !cfg.labels.is_empty() {
        let labels = merged.config.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in &cfg.labels {
            labels.insert(key.clone(), value.clone());
        }
    }

    if !cfg.exposed_ports.is_empty() {
        merged.config.exposed_ports = Some(
            cfg.exposed_ports
                .iter()
                .map(|p| (format!("{p}/tcp"), serde_json::json!({})))
                .collect(),
        );
    }

    let rootfs = merged.rootfs.get_or_insert_with(Rootfs::default);
    rootfs.diff_ids.extend(new_diff_ids.iter().cloned());

    merged
}
