// src/auth.rs

//! Registry credential resolution
//!
//! A `CredentialProvider` answers two questions for a registry host: do
//! you have a `(username, secret)` pair, and do you have a raw bearer
//! token. Providers are chained; the first non-empty answer wins. The
//! client consumes the result as `Auth` without knowing where it came
//! from.

use base64::Engine;
use serde_json::Value;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Bound on external credential helper invocations
const HELPER_TIMEOUT: Duration = Duration::from_secs(10);

/// Authentication material handed to the registry client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Anonymous,
    /// Raw bearer token sent as `Authorization: Bearer ...`
    Token(String),
    /// Username/secret pair, used for Basic against the target or the
    /// token service
    Basic { username: String, password: String },
}

/// A source of registry credentials
pub trait CredentialProvider {
    /// `(username, secret)` for a registry host, if this provider has one
    fn credentials(&self, registry: &str) -> Option<(String, String)>;

    /// Raw bearer token for a registry host, if this provider has one
    fn token(&self, registry: &str) -> Option<String>;
}

/// Credentials from environment variables
///
/// `REGISTRY_USERNAME`/`REGISTRY_PASSWORD` and `REGISTRY_TOKEN` apply to
/// any registry; `GITHUB_TOKEN` is used for `ghcr.io`.
#[derive(Debug, Default)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn credentials(&self, registry: &str) -> Option<(String, String)> {
        if let (Ok(user), Ok(password)) = (
            std::env::var("REGISTRY_USERNAME"),
            std::env::var("REGISTRY_PASSWORD"),
        ) {
            if !user.is_empty() && !password.is_empty() {
                return Some((user, password));
            }
        }

        if registry.contains("ghcr.io") {
            if let Ok(token) = std::env::var("GITHUB_TOKEN") {
                if !token.is_empty() {
                    return Some(("USERNAME".to_string(), token));
                }
            }
        }

        None
    }

    fn token(&self, registry: &str) -> Option<String> {
        if registry.contains("ghcr.io") {
            if let Ok(token) = std::env::var("GITHUB_TOKEN") {
                if !token.is_empty() {
                    return Some(token);
                }
            }
        }
        std::env::var("REGISTRY_TOKEN").ok().filter(|t| !t.is_empty())
    }
}

/// Credentials from a Docker `config.json`
#[derive(Debug)]
pub struct DockerConfigCredentials {
    config_path: PathBuf,
}

impl DockerConfigCredentials {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// The conventional `~/.docker/config.json` location
    pub fn default_location() -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(".docker").join("config.json")))
    }

    fn load(&self) -> Option<Value> {
        let text = std::fs::read_to_string(&self.config_path).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Decode a base64 `user:password` auth string
    fn decode_auth(auth: &str) -> Option<(String, String)> {
        let decoded = base64::engine::general_purpose::STANDARD.decode(auth).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        match decoded.split_once(':') {
            Some((user, password)) => Some((user.to_string(), password.to_string())),
            None => Some((String::new(), decoded)),
        }
    }
}

impl CredentialProvider for DockerConfigCredentials {
    fn credentials(&self, registry: &str) -> Option<(String, String)> {
        let config = self.load()?;
        let auths = config.get("auths")?.as_object()?;

        // Docker config keys vary: with or without scheme and /v2/ suffix
        let mut candidates = vec![
            format!("https://{registry}"),
            registry.to_string(),
            format!("https://{registry}/v2/"),
            format!("{registry}/v2/"),
        ];
        // Docker Hub logins are stored under the legacy v1 index key
        if matches!(registry, "docker.io" | "registry-1.docker.io" | "index.docker.io") {
            candidates.push("https://index.docker.io/v1/".to_string());
            candidates.push("index.docker.io/v1/".to_string());
        }
        for key in candidates {
            let Some(entry) = auths.get(&key) else {
                continue;
            };
            if let Some(auth) = entry.get("auth").and_then(Value::as_str) {
                if let Some(creds) = Self::decode_auth(auth) {
                    return Some(creds);
                }
            }
            if let (Some(user), Some(password)) = (
                entry.get("username").and_then(Value::as_str),
                entry.get("password").and_then(Value::as_str),
            ) {
                return Some((user.to_string(), password.to_string()));
            }
        }
        None
    }

    fn token(&self, registry: &str) -> Option<String> {
        self.credentials(registry).map(|(_, secret)| secret)
    }
}

/// Credentials from the Azure CLI, for `*.azurecr.io` registries
///
/// Invokes `az acr login --expose-token`; the subprocess is killed after
/// 10 seconds so a hung helper cannot stall the build.
#[derive(Debug, Default)]
pub struct AzureCliCredentials;

/// Placeholder username ACR expects alongside an access token
const ACR_TOKEN_USER: &str = "00000000-0000-0000-0000-000000000000";

impl CredentialProvider for AzureCliCredentials {
    fn credentials(&self, registry: &str) -> Option<(String, String)> {
        if !registry.contains("azurecr.io") {
            return None;
        }
        let acr_name = registry.split('.').next()?;

        let mut child = Command::new("az")
            .args([
                "acr",
                "login",
                "--name",
                acr_name,
                "--expose-token",
                "--output",
                "json",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .ok()?;

        let status = match child.wait_timeout(HELPER_TIMEOUT) {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!("az acr login timed out after {:?}, killing", HELPER_TIMEOUT);
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
            Err(e) => {
                debug!("az acr login failed to run: {e}");
                return None;
            }
        };
        if !status.success() {
            return None;
        }

        let mut stdout = String::new();
        child.stdout.take()?.read_to_string(&mut stdout).ok()?;
        let output: Value = serde_json::from_str(&stdout).ok()?;
        let token = output.get("accessToken")?.as_str()?.to_string();
        Some((ACR_TOKEN_USER.to_string(), token))
    }

    fn token(&self, registry: &str) -> Option<String> {
        self.credentials(registry).map(|(_, token)| token)
    }
}

/// Tries each provider in order; the first non-empty result wins
pub struct CredentialChain {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl CredentialChain {
    pub fn new(providers: Vec<Box<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }
}

impl CredentialProvider for CredentialChain {
    fn credentials(&self, registry: &str) -> Option<(String, String)> {
        self.providers.iter().find_map(|p| p.credentials(registry))
    }

    fn token(&self, registry: &str) -> Option<String> {
        self.providers.iter().find_map(|p| p.token(registry))
    }
}

/// The default provider chain: environment, Docker config, Azure CLI
pub fn default_chain() -> CredentialChain {
    let mut providers: Vec<Box<dyn CredentialProvider>> = vec![Box::new(EnvCredentials)];
    if let Some(docker) = DockerConfigCredentials::default_location() {
        providers.push(Box::new(docker));
    }
    providers.push(Box::new(AzureCliCredentials));
    CredentialChain::new(providers)
}

/// Resolve the auth material for a registry
///
/// Explicit credentials win: a password alone is treated as a bearer
/// token, a full pair as Basic. Otherwise the chain is consulted for a
/// token, then for a credential pair.
pub fn resolve_auth(
    provider: &dyn CredentialProvider,
    registry: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Auth {
    match (username, password) {
        (Some(user), Some(password)) => {
            return Auth::Basic {
                username: user.to_string(),
                password: password.to_string(),
            };
        }
        (None, Some(password)) => return Auth::Token(password.to_string()),
        _ => {}
    }

    if let Some(token) = provider.token(registry) {
        return Auth::Token(token);
    }
    if let Some((username, password)) = provider.credentials(registry) {
        return Auth::Basic { username, password };
    }
    Auth::Anonymous
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedProvider {
        creds: HashMap<String, (String, String)>,
        tokens: HashMap<String, String>,
    }

    impl CredentialProvider for FixedProvider {
        fn credentials(&self, registry: &str) -> Option<(String, String)> {
            self.creds.get(registry).cloned()
        }
        fn token(&self, registry: &str) -> Option<String> {
            self.tokens.get(registry).cloned()
        }
    }

    fn docker_config(dir: &std::path::Path, body: &str) -> DockerConfigCredentials {
        let path = dir.join("config.json");
        std::fs::write(&path, body).unwrap();
        DockerConfigCredentials::new(path)
    }

    #[test]
    fn test_docker_config_base64_auth() {
        let dir = tempfile::tempdir().unwrap();
        // "testuser:testpass"
        let provider = docker_config(
            dir.path(),
            r#"{"auths":{"ghcr.io":{"auth":"dGVzdHVzZXI6dGVzdHBhc3M="}}}"#,
        );

        assert_eq!(
            provider.credentials("ghcr.io"),
            Some(("testuser".to_string(), "testpass".to_string()))
        );
        assert_eq!(provider.credentials("unknown.registry"), None);
    }

    #[test]
    fn test_docker_config_plain_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let provider = docker_config(
            dir.path(),
            r#"{"auths":{"registry.example.com":{"username":"u","password":"p"}}}"#,
        );
        assert_eq!(
            provider.credentials("registry.example.com"),
            Some(("u".to_string(), "p".to_string()))
        );
    }

    #[test]
    fn test_docker_config_hub_legacy_key() {
        let dir = tempfile::tempdir().unwrap();
        let provider = docker_config(
            dir.path(),
            r#"{"auths":{"https://index.docker.io/v1/":{"username":"dockeruser","password":"dockerpass"}}}"#,
        );
        // Hub logins land under the legacy v1 index key regardless of the
        // host the client dials
        assert_eq!(
            provider.credentials("docker.io"),
            Some(("dockeruser".to_string(), "dockerpass".to_string()))
        );
        assert_eq!(
            provider.credentials("registry-1.docker.io"),
            Some(("dockeruser".to_string(), "dockerpass".to_string()))
        );
    }

    #[test]
    fn test_docker_config_missing_file() {
        let provider = DockerConfigCredentials::new(PathBuf::from("/nonexistent/config.json"));
        assert_eq!(provider.credentials("any.registry"), None);
        assert_eq!(provider.token("any.registry"), None);
    }

    #[test]
    fn test_azure_provider_skips_non_acr() {
        let provider = AzureCliCredentials;
        assert_eq!(provider.credentials("docker.io"), None);
        assert_eq!(provider.credentials("ghcr.io"), None);
    }

    #[test]
    fn test_chain_first_result_wins() {
        let empty = FixedProvider {
            creds: HashMap::new(),
            tokens: HashMap::new(),
        };
        let full = FixedProvider {
            creds: [(
                "r.io".to_string(),
                ("user".to_string(), "secret".to_string()),
            )]
            .into(),
            tokens: [("r.io".to_string(), "tok".to_string())].into(),
        };
        let chain = CredentialChain::new(vec![Box::new(empty), Box::new(full)]);

        assert_eq!(chain.token("r.io"), Some("tok".to_string()));
        assert_eq!(
            chain.credentials("r.io"),
            Some(("user".to_string(), "secret".to_string()))
        );
        assert_eq!(chain.token("other.io"), None);
    }

    #[test]
    fn test_resolve_auth_precedence() {
        let provider = FixedProvider {
            creds: [(
                "r.io".to_string(),
                ("user".to_string(), "secret".to_string()),
            )]
            .into(),
            tokens: [("r.io".to_string(), "chain-token".to_string())].into(),
        };

        // Explicit password alone becomes a bearer token
        assert_eq!(
            resolve_auth(&provider, "r.io", None, Some("override")),
            Auth::Token("override".to_string())
        );
        // Explicit pair becomes Basic
        assert_eq!(
            resolve_auth(&provider, "r.io", Some("u"), Some("p")),
            Auth::Basic {
                username: "u".to_string(),
                password: "p".to_string()
            }
        );
        // Chain token comes before chain credentials
        assert_eq!(
            resolve_auth(&provider, "r.io", None, None),
            Auth::Token("chain-token".to_string())
        );
        // Nothing anywhere -> anonymous
        assert_eq!(resolve_auth(&provider, "x.io", None, None), Auth::Anonymous);
    }

    #[test]
    fn test_resolve_auth_falls_back_to_credentials() {
        let provider = FixedProvider {
            creds: [(
                "r.io".to_string(),
                ("user".to_string(), "secret".to_string()),
            )]
            .into(),
            tokens: HashMap::new(),
        };
        assert_eq!(
            resolve_auth(&provider, "r.io", None, None),
            Auth::Basic {
                username: "user".to_string(),
                password: "secret".to_string()
            }
        );
    }
}
