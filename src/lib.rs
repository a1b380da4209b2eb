// src/lib.rs

//! Stratum
//!
//! Daemonless OCI image builder: composes container images for
//! application source trees straight on disk and exchanges them with
//! Distribution v2 registries, no container runtime involved.
//!
//! # Architecture
//!
//! - Content-addressed: every config, manifest, and layer blob is named
//!   by its SHA-256 digest and written as an OCI Image Layout
//! - Reproducible: layer tars are emitted deterministically, so equal
//!   inputs yield equal digests
//! - Cached: built layers are fingerprinted by their input files and
//!   reused across builds, with LRU eviction
//! - Registry-native: base images are pulled and results pushed over the
//!   Distribution v2 HTTP protocol with bearer-token negotiation and
//!   HEAD-before-PUT blob deduplication

pub mod auth;
pub mod builder;
pub mod cache;
pub mod config;
pub mod digest;
mod error;
pub mod framework;
pub mod layer;
pub mod oci;
pub mod progress;
pub mod project;
pub mod reference;
pub mod registry;

pub use builder::{BuiltImage, ImageBuilder};
pub use cache::{CacheEntry, CacheStats, LayerCache};
pub use config::{BuildConfig, ConfigOverrides};
pub use error::{Error, Result};
pub use progress::{BuildObserver, CliObserver, LogObserver, SilentObserver};
pub use reference::{ImageReference, Platform};
pub use registry::RegistryClient;
