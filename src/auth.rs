//! API-key authentication for the management surface.
//!
//! The gate is enabled iff at least one active key exists; until then every
//! route is open so the first key can be created. Keys arrive via
//! `x-api-key` or `Authorization: Bearer` and are compared by SHA-256 hash
//! in constant time. `admin` reaches everything; `api-only` reaches only the
//! proxy endpoints.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::models::{ApiKeyRole, AuthContext};
use crate::state::AppState;

/// Paths that never require a key: health, and the OAuth flow endpoints a
/// browser must be able to reach mid-login.
fn is_exempt(path: &str) -> bool {
    path == "/health" || path.starts_with("/api/oauth/")
}

fn is_proxy_path(path: &str) -> bool {
    path.starts_with("/v1/") || path.starts_with("/messages")
}

pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Freshly minted management key; shown to the caller exactly once.
pub fn generate_api_key() -> String {
    let buf: [u8; 24] = rand::random();
    format!("crk_{}", hex::encode(buf))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

fn presented_key(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get("x-api-key") {
        return value.to_str().ok().map(String::from);
    }
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from)
}

pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();
    if is_exempt(&path) {
        return Ok(next.run(request).await);
    }

    let active = state.store.api_keys().active().await?;
    if active.is_empty() {
        // Bootstrap mode: no keys yet, the surface is open.
        request.extensions_mut().insert(AuthContext {
            api_key_id: None,
            role: ApiKeyRole::Admin,
        });
        return Ok(next.run(request).await);
    }

    let Some(key) = presented_key(&request) else {
        return Err(ApiError::Auth);
    };
    let hashed = hash_api_key(&key);

    // Walk every row so timing does not reveal which key matched.
    let mut matched: Option<&crate::models::ApiKeyRow> = None;
    for row in &active {
        if constant_time_eq(&row.hashed_key, &hashed) && matched.is_none() {
            matched = Some(row);
        }
    }
    let Some(row) = matched else {
        tracing::warn!("auth: rejected request with unknown API key");
        return Err(ApiError::Auth);
    };

    let role = row.role_kind();
    if role == ApiKeyRole::ApiOnly && !is_proxy_path(&path) {
        return Err(ApiError::Forbidden);
    }

    if let Err(e) = state.store.api_keys().touch(&row.id).await {
        tracing::warn!("auth: usage bump failed for key {}: {}", row.id, e);
    }

    request.extensions_mut().insert(AuthContext {
        api_key_id: Some(row.id.clone()),
        role,
    });
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exempt_paths_cover_health_and_oauth() {
        assert!(is_exempt("/health"));
        assert!(is_exempt("/api/oauth/init"));
        assert!(is_exempt("/api/oauth/callback"));
        assert!(!is_exempt("/api/accounts"));
        assert!(!is_exempt("/v1/messages"));
    }

    #[test]
    fn proxy_paths_cover_both_prefixes() {
        assert!(is_proxy_path("/v1/messages"));
        assert!(is_proxy_path("/messages/stream"));
        assert!(!is_proxy_path("/api/requests"));
    }

    #[test]
    fn hashes_are_stable_hex_sha256() {
        let h = hash_api_key("crk_abc");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_api_key("crk_abc"));
        assert_ne!(h, hash_api_key("crk_abd"));
    }

    #[test]
    fn generated_keys_carry_the_prefix() {
        let key = generate_api_key();
        assert!(key.starts_with("crk_"));
        assert_eq!(key.len(), 4 + 48);
        assert_ne!(key, generate_api_key());
    }

    #[test]
    fn constant_time_eq_requires_equal_lengths() {
        assert!(constant_time_eq("abcd", "abcd"));
        assert!(!constant_time_eq("abcd", "abce"));
        assert!(!constant_time_eq("abcd", "abcde"));
    }
}
