// src/registry/mod.rs

//! Distribution Registry API v2 client
//!
//! Talks HTTPS to container registries: blob existence checks and
//! monolithic uploads, manifest pulls (including multi-platform indexes)
//! and pushes, and redirect-aware blob downloads. Authentication is the
//! standard bearer-token dance: a 401 with a `Www-Authenticate` challenge
//! triggers one token exchange against the named realm, after which the
//! original request is retried exactly once.

mod challenge;
mod client;

pub use challenge::{parse_bearer_challenge, BearerChallenge};
pub use client::{ManifestResponse, RegistryClient};
