//! Identity resolution seam for the auth collaborator.
//!
//! The router does not mint identities: it maps a bearer token to a user id
//! from configuration and otherwise resolves to `"anon"`. Routes that
//! require authentication reject anonymous contexts at the entrypoint.

use http::header::AUTHORIZATION;
use rustc_hash::FxHashMap;

use crate::config::AppConfig;

pub const ANON_USER: &str = "anon";

/// Compact token index used in hot-path identity resolution.
pub enum ClientIdentityIndex {
    Empty,
    Single { token: Box<str>, user_id: Box<str> },
    Multiple(FxHashMap<String, String>),
}

#[must_use]
pub fn build_identity_index(config: &AppConfig) -> ClientIdentityIndex {
    let identities = &config.features.client_identities;
    match identities.len() {
        0 => ClientIdentityIndex::Empty,
        1 => ClientIdentityIndex::Single {
            token: identities[0].token.clone().into_boxed_str(),
            user_id: identities[0].user_id.clone().into_boxed_str(),
        },
        _ => ClientIdentityIndex::Multiple(
            identities
                .iter()
                .map(|identity| (identity.token.clone(), identity.user_id.clone()))
                .collect(),
        ),
    }
}

/// Extract the bearer token from request headers, if any.
#[must_use]
pub fn extract_bearer_token(headers: &http::HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolve the caller's user id; unauthenticated callers are `"anon"`.
#[must_use]
pub fn resolve_user_id(headers: &http::HeaderMap, index: &ClientIdentityIndex) -> String {
    let Some(token) = extract_bearer_token(headers) else {
        return ANON_USER.to_string();
    };
    match index {
        ClientIdentityIndex::Empty => ANON_USER.to_string(),
        ClientIdentityIndex::Single {
            token: known,
            user_id,
        } => {
            if token == known.as_ref() {
                user_id.to_string()
            } else {
                ANON_USER.to_string()
            }
        }
        ClientIdentityIndex::Multiple(map) => map
            .get(token)
            .cloned()
            .unwrap_or_else(|| ANON_USER.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientIdentity;

    fn config_with(identities: Vec<(&str, &str)>) -> AppConfig {
        let mut config = AppConfig::default();
        config.features.client_identities = identities
            .into_iter()
            .map(|(token, user_id)| ClientIdentity {
                token: token.to_string(),
                user_id: user_id.to_string(),
            })
            .collect();
        config
    }

    fn headers_with_bearer(token: &str) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            http::HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn missing_header_is_anonymous() {
        let index = build_identity_index(&config_with(vec![("t1", "alice")]));
        assert_eq!(resolve_user_id(&http::HeaderMap::new(), &index), ANON_USER);
    }

    #[test]
    fn single_token_resolves() {
        let index = build_identity_index(&config_with(vec![("t1", "alice")]));
        assert_eq!(resolve_user_id(&headers_with_bearer("t1"), &index), "alice");
        assert_eq!(
            resolve_user_id(&headers_with_bearer("wrong"), &index),
            ANON_USER
        );
    }

    #[test]
    fn multiple_tokens_resolve() {
        let index = build_identity_index(&config_with(vec![("t1", "alice"), ("t2", "bob")]));
        assert_eq!(resolve_user_id(&headers_with_bearer("t2"), &index), "bob");
    }

    #[test]
    fn empty_index_never_authenticates() {
        let index = build_identity_index(&config_with(vec![]));
        assert_eq!(
            resolve_user_id(&headers_with_bearer("anything"), &index),
            ANON_USER
        );
    }

    #[test]
    fn malformed_authorization_is_anonymous() {
        let index = build_identity_index(&config_with(vec![("t1", "alice")]));
        let mut headers = http::HeaderMap::new();
        headers.insert(AUTHORIZATION, http::HeaderValue::from_static("Basic dDE="));
        assert_eq!(resolve_user_id(&headers, &index), ANON_USER);
    }
}
