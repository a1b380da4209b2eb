// src/registry/client.rs

//! HTTP client for a single registry/repository pair
//!
//! Built on blocking reqwest with redirects disabled: registries answer
//! blob GETs with 30x redirects to object storage, and the redirect hop
//! must be followed *without* the `Authorization` header (the redirect
//! URL carries its own signed query parameters).

use crate::auth::Auth;
use crate::digest::HashingWriter;
use crate::error::{Error, Result};
use crate::oci::{
    Index, Manifest, DOCKER_MANIFEST_LIST_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE,
    INDEX_MEDIA_TYPE, MANIFEST_MEDIA_TYPE,
};
use crate::registry::challenge::parse_bearer_challenge;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use url::Url;

/// Default timeout for registry requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer size for streaming blob downloads (8 KB)
const STREAM_BUFFER_SIZE: usize = 8192;

/// Response header carrying the canonical digest of a pulled manifest
const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// A pulled manifest document: either a single-platform manifest or a
/// multi-platform index the caller must select from
#[derive(Debug)]
pub enum ManifestResponse {
    Manifest(Manifest),
    Index(Index),
}

/// Distribution v2 client scoped to one repository on one registry
pub struct RegistryClient {
    registry: String,
    repository: String,
    base_url: String,
    client: Client,
    auth: Auth,
    /// Bearer token obtained from a challenge exchange; cached until the
    /// next 401 forces re-acquisition
    bearer: Option<String>,
}

impl RegistryClient {
    /// Create a client with the default timeout
    pub fn new(registry: &str, repository: &str, auth: Auth) -> Result<Self> {
        Self::with_timeout(registry, repository, auth, HTTP_TIMEOUT)
    }

    /// Create a client with an explicit request timeout
    pub fn with_timeout(
        registry: &str,
        repository: &str,
        auth: Auth,
        timeout: Duration,
    ) -> Result<Self> {
        // Docker Hub's API host differs from its reference host
        let registry = if registry == "docker.io" {
            "registry-1.docker.io".to_string()
        } else {
            registry.to_string()
        };

        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::RegistryError {
                status: 0,
                body: format!("failed to create HTTP client: {e}"),
            })?;

        let base_url = format!("https://{registry}/v2");
        Ok(Self {
            registry,
            repository: repository.to_string(),
            base_url,
            client,
            auth,
            bearer: None,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check whether the registry already holds a blob
    pub fn blob_exists(&mut self, digest: &str) -> Result<bool> {
        let url = format!("{}/{}/blobs/{digest}", self.base_url, self.repository);
        let response = self.send(Method::HEAD, &url, &[], None)?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(status_error(response)),
        }
    }

    /// Start a blob upload session, returning the absolute upload URL
    pub fn initiate_blob_upload(&mut self) -> Result<String> {
        let url = format!("{}/{}/blobs/uploads/", self.base_url, self.repository);
        let response = self.send(Method::POST, &url, &[], Some(Vec::new()))?;
        let status = response.status().as_u16();
        if !matches!(status, 200 | 202) {
            return Err(status_error(response));
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                Error::ProtocolError("no Location header in upload initiation response".to_string())
            })?;
        Ok(absolutize_location(&self.registry, location))
    }

    /// Upload a blob in a single request
    pub fn upload_blob_monolithic(&mut self, digest: &str, data: Vec<u8>) -> Result<()> {
        let upload_url = self.initiate_blob_upload()?;
        let final_url = append_digest_param(&upload_url, digest);

        let headers = [
            ("Content-Type", "application/octet-stream".to_string()),
            ("Content-Length", data.len().to_string()),
        ];
        let response = self.send(Method::PUT, &final_url, &headers, Some(data))?;
        let status = response.status().as_u16();
        if !matches!(status, 201 | 202) {
            return Err(status_error(response));
        }
        Ok(())
    }

    /// Push a blob from disk, skipping the upload when the registry
    /// already has it. Returns `true` when bytes were uploaded.
    pub fn push_blob(&mut self, digest: &str, blob_path: &Path, check_exists: bool) -> Result<bool> {
        if check_exists && self.blob_exists(digest)? {
            debug!("blob {} already present, skipping upload", digest);
            return Ok(false);
        }
        let data = fs::read(blob_path)
            .map_err(|e| Error::IoError(format!("failed to read {}: {e}", blob_path.display())))?;
        self.upload_blob_monolithic(digest, data)?;
        Ok(true)
    }

    /// Push a manifest under a tag or digest reference
    pub fn push_manifest(&mut self, reference: &str, data: Vec<u8>, media_type: &str) -> Result<()> {
        let url = format!("{}/{}/manifests/{reference}", self.base_url, self.repository);
        let headers = [("Content-Type", media_type.to_string())];
        let response = self.send(Method::PUT, &url, &headers, Some(data))?;
        let status = response.status().as_u16();
        if !matches!(status, 200 | 201) {
            return Err(status_error(response));
        }
        Ok(())
    }

    /// Pull a manifest by tag or digest
    ///
    /// The `Accept` list covers single manifests and both index flavors,
    /// so a multi-platform image comes back as an index for the caller to
    /// select from. The returned digest comes from the
    /// `Docker-Content-Digest` response header.
    pub fn pull_manifest(&mut self, reference: &str) -> Result<(ManifestResponse, Option<String>)> {
        let url = format!("{}/{}/manifests/{reference}", self.base_url, self.repository);
        let accept = [
            MANIFEST_MEDIA_TYPE,
            DOCKER_MANIFEST_MEDIA_TYPE,
            INDEX_MEDIA_TYPE,
            DOCKER_MANIFEST_LIST_MEDIA_TYPE,
        ]
        .join(", ");
        let headers = [("Accept", accept)];

        let response = self.send(Method::GET, &url, &headers, None)?;
        if response.status() != StatusCode::OK {
            return Err(status_error(response));
        }

        let digest = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().map_err(|e| Error::RegistryError {
            status: 0,
            body: format!("failed to read manifest body: {e}"),
        })?;

        Ok((parse_manifest_body(&body)?, digest))
    }

    /// Pull a blob to a file, following at most one storage redirect
    ///
    /// The redirect hop is requested without `Authorization`: the
    /// redirect URL is pre-signed, and forwarding registry credentials
    /// makes some storage backends reject the request. The downloaded
    /// bytes are digest-verified before the file is moved into place.
    pub fn pull_blob(&mut self, digest: &str, dest: &Path) -> Result<()> {
        let url = format!("{}/{}/blobs/{digest}", self.base_url, self.repository);
        let mut response = self.send(Method::GET, &url, &[], None)?;

        if response.status().is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    Error::ProtocolError("redirect without Location on blob download".to_string())
                })?;
            let target = Url::parse(&url)
                .and_then(|base| base.join(location))
                .map_err(|e| Error::ProtocolError(format!("invalid redirect location: {e}")))?;
            debug!("following blob redirect to {}", target.host_str().unwrap_or("?"));

            // Fresh unauthenticated request; the URL itself is the credential
            response = self
                .client
                .get(target)
                .send()
                .map_err(|e| Error::RegistryError {
                    status: 0,
                    body: format!("blob redirect request failed: {e}"),
                })?;
        }

        if response.status() != StatusCode::OK {
            return Err(status_error(response));
        }
        stream_verified(&mut response, dest, digest)
    }

    /// Issue a request, re-authenticating at most once on a 401
    fn send(
        &mut self,
        method: Method,
        url: &str,
        headers: &[(&str, String)],
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let mut retried = false;
        loop {
            let mut request = self.client.request(method.clone(), url);
            for (name, value) in headers {
                request = request.header(*name, value);
            }
            if let Some(body) = &body {
                request = request.body(body.clone());
            }
            request = self.apply_auth(request);

            let response = request.send().map_err(|e| Error::RegistryError {
                status: 0,
                body: format!("request to {url} failed: {e}"),
            })?;

            if response.status() == StatusCode::UNAUTHORIZED && !retried {
                let challenge = response
                    .headers()
                    .get(reqwest::header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                self.authenticate(&challenge)?;
                retried = true;
                continue;
            }
            return Ok(response);
        }
    }

    fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.bearer {
            return request.bearer_auth(token);
        }
        match &self.auth {
            Auth::Token(token) => request.bearer_auth(token),
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
            Auth::Anonymous => request,
        }
    }

    /// Handle a 401: exchange credentials for a bearer token at the realm
    /// named by the challenge
    fn authenticate(&mut self, challenge_header: &str) -> Result<()> {
        let challenge = parse_bearer_challenge(challenge_header).ok_or_else(|| {
            Error::AuthError(format!(
                "registry requires authentication and sent no usable bearer challenge \
                 (Www-Authenticate: {challenge_header:?})"
            ))
        })?;

        debug!("exchanging credentials at {}", challenge.realm);
        let mut token_url = Url::parse(&challenge.realm).map_err(|e| {
            Error::AuthError(format!("invalid token realm {}: {e}", challenge.realm))
        })?;
        {
            let mut query = token_url.query_pairs_mut();
            if let Some(service) = &challenge.service {
                query.append_pair("service", service);
            }
            if let Some(scope) = &challenge.scope {
                query.append_pair("scope", scope);
            }
        }

        let mut request = self.client.get(token_url.clone());
        request = match &self.auth {
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
            Auth::Token(token) => request.bearer_auth(token),
            Auth::Anonymous => request,
        };

        let response = request.send().map_err(|e| {
            Error::AuthError(format!("token request to {} failed: {e}", challenge.realm))
        })?;
        if !response.status().is_success() {
            return Err(Error::AuthError(format!(
                "token exchange failed: HTTP {} from {}",
                response.status().as_u16(),
                challenge.realm
            )));
        }

        let body: serde_json::Value = response.json().map_err(|e| {
            Error::AuthError(format!("failed to parse token response: {e}"))
        })?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::AuthError("token service response carried no token".to_string())
            })?;

        self.bearer = Some(token.to_string());
        Ok(())
    }
}

/// Turn an unexpected response into a `RegistryError` with its body
fn status_error(response: Response) -> Error {
    let status = response.status().as_u16();
    let body = response.text().unwrap_or_default();
    warn!("unexpected registry response: HTTP {status}");
    Error::RegistryError { status, body }
}

/// Decide manifest vs index from the document's own media type
fn parse_manifest_body(body: &[u8]) -> Result<ManifestResponse> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| Error::ProtocolError(format!("malformed manifest JSON: {e}")))?;

    let media_type = value.get("mediaType").and_then(|v| v.as_str()).unwrap_or("");
    let is_index = media_type == INDEX_MEDIA_TYPE
        || media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE
        || (media_type.is_empty() && value.get("manifests").is_some());

    if is_index {
        let index: Index = serde_json::from_value(value)
            .map_err(|e| Error::ProtocolError(format!("malformed image index: {e}")))?;
        Ok(ManifestResponse::Index(index))
    } else {
        let manifest: Manifest = serde_json::from_value(value)
            .map_err(|e| Error::ProtocolError(format!("malformed image manifest: {e}")))?;
        Ok(ManifestResponse::Manifest(manifest))
    }
}

/// Make a relative upload/redirect `Location` absolute on the registry host
fn absolutize_location(registry: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        format!("https://{registry}{location}")
    }
}

/// Append the `digest` query parameter to an upload session URL
fn append_digest_param(upload_url: &str, digest: &str) -> String {
    if upload_url.contains('?') {
        format!("{upload_url}&digest={digest}")
    } else {
        format!("{upload_url}?digest={digest}")
    }
}

/// Stream a response body to `dest`, verifying its digest on the way
fn stream_verified(response: &mut Response, dest: &Path, expected: &str) -> Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|e| Error::IoError(format!("failed to create {}: {e}", parent.display())))?;
    let staging = NamedTempFile::new_in(parent)
        .map_err(|e| Error::IoError(format!("failed to create temp file: {e}")))?;

    let mut writer = HashingWriter::new(staging);
    let mut buffer = [0u8; STREAM_BUFFER_SIZE];
    loop {
        let n = response.read(&mut buffer).map_err(|e| Error::RegistryError {
            status: 0,
            body: format!("failed to read blob stream: {e}"),
        })?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buffer[..n])
            .map_err(|e| Error::IoError(format!("failed to write {}: {e}", dest.display())))?;
    }

    let (staging, actual, size) = writer.finalize();
    if actual != expected {
        // The temp file is dropped (and removed) on this return
        return Err(Error::ProtocolError(format!(
            "digest mismatch on pulled blob: expected {expected}, got {actual}"
        )));
    }
    staging
        .persist(dest)
        .map_err(|e| Error::IoError(format!("failed to persist {}: {e}", dest.display())))?;
    debug!("pulled blob {} ({} bytes)", expected, size);
    Ok(())
}
