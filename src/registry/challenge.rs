// src/registry/challenge.rs

//! `Www-Authenticate` bearer challenge parsing
//!
//! A 401 from a registry carries something like:
//!
//! ```text
//! Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull"
//! ```
//!
//! The values are `key="quoted"` or bare `key=value` pairs separated by
//! commas; only `realm` is mandatory.

/// Parsed bearer challenge from a 401 response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parse a `Www-Authenticate` header value; `None` when it is not a
/// bearer challenge or lacks a realm
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let rest = header.trim().strip_prefix("Bearer ")?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    let mut remaining = rest;
    while !remaining.is_empty() {
        remaining = remaining.trim_start_matches([' ', ',']);
        if remaining.is_empty() {
            break;
        }

        let eq = remaining.find('=')?;
        let key = &remaining[..eq];
        remaining = &remaining[eq + 1..];

        let value = if let Some(quoted) = remaining.strip_prefix('"') {
            let close = quoted.find('"')?;
            remaining = &quoted[close + 1..];
            &quoted[..close]
        } else {
            let end = remaining.find(',').unwrap_or(remaining.len());
            let value = &remaining[..end];
            remaining = &remaining[end..];
            value
        };

        match key.trim() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            "scope" => scope = Some(value.to_string()),
            _ => {}
        }
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_challenge() {
        let challenge = parse_bearer_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/alpine:pull")
        );
    }

    #[test]
    fn test_parse_realm_only() {
        let challenge =
            parse_bearer_challenge(r#"Bearer realm="https://ghcr.io/token""#).unwrap();
        assert_eq!(challenge.realm, "https://ghcr.io/token");
        assert_eq!(challenge.service, None);
        assert_eq!(challenge.scope, None);
    }

    #[test]
    fn test_parse_unquoted_values() {
        let challenge =
            parse_bearer_challenge("Bearer realm=https://t.io/token,service=t.io").unwrap();
        assert_eq!(challenge.realm, "https://t.io/token");
        assert_eq!(challenge.service.as_deref(), Some("t.io"));
    }

    #[test]
    fn test_rejects_non_bearer() {
        assert!(parse_bearer_challenge(r#"Basic realm="registry""#).is_none());
        assert!(parse_bearer_challenge("Bearer service=\"x\"").is_none());
        assert!(parse_bearer_challenge("").is_none());
    }

    #[test]
    fn test_scope_with_commas_inside_quotes() {
        let challenge = parse_bearer_challenge(
            r#"Bearer realm="https://t.io/token",scope="repository:a/b:pull,push""#,
        )
        .unwrap();
        assert_eq!(challenge.scope.as_deref(), Some("repository:a/b:pull,push"));
    }
}
