//! Tagged error taxonomy for the whole service.
//!
//! Every failure that can cross the HTTP boundary is one of these variants;
//! handlers return `Result<_, ApiError>` and the `IntoResponse` impl maps
//! each kind to its status code. Context maps are redacted before logging.

use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

use crate::validation::ValidationError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed for `{field}`: {message}")]
    Validation { field: String, message: String },

    #[error("missing or invalid API key")]
    Auth,

    #[error("role does not permit this endpoint")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    #[error("all accounts rate limited")]
    RateLimit { retry_after_ms: Option<i64> },

    #[error("token refresh failed for account {account}: {reason}")]
    TokenRefresh { account: String, reason: String },

    #[error("upstream provider error: {reason}")]
    Provider {
        status: Option<u16>,
        reason: String,
    },

    #[error("no accounts available")]
    ServiceUnavailable,

    #[error("oauth flow failed: {reason}")]
    OAuth {
        reason: String,
        provider_code: Option<String>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Auth => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::TokenRefresh { .. } => StatusCode::BAD_GATEWAY,
            Self::Provider { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::OAuth { .. } => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable kind tag for clients and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Auth => "auth",
            Self::Forbidden => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::RateLimit { .. } => "rate_limit",
            Self::TokenRefresh { .. } => "token_refresh",
            Self::Provider { .. } => "provider",
            Self::ServiceUnavailable => "service_unavailable",
            Self::OAuth { .. } => "oauth",
            Self::Internal(_) => "internal",
        }
    }

    fn body(&self) -> Value {
        match self {
            Self::Validation { field, message } => json!({
                "error": { "kind": self.kind(), "field": field, "message": message }
            }),
            Self::RateLimit { retry_after_ms } => json!({
                "error": { "kind": self.kind(), "message": self.to_string(), "retry_after_ms": retry_after_ms }
            }),
            Self::OAuth {
                reason,
                provider_code,
            } => json!({
                "error": { "kind": self.kind(), "message": reason, "provider_code": provider_code }
            }),
            other => json!({
                "error": { "kind": other.kind(), "message": other.to_string() }
            }),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::Validation {
            field: e.field,
            message: e.message,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("row".into()),
            other => Self::Internal(format!("database error: {other}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "{}", self);
        } else {
            tracing::debug!(kind = self.kind(), "{}", self);
        }
        (status, Json(self.body())).into_response()
    }
}

// ── Redaction ───────────────────────────────────────────────────────────

const SENSITIVE_MARKERS: &[&str] = &["token", "password", "secret", "key", "authorization"];

fn is_sensitive(field: &str) -> bool {
    let lower = field.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Recursively replace sensitive values in a JSON tree before logging.
pub fn redact_json(value: &mut Value) {
    if let Value::Object(map) = value {
        for (k, v) in map.iter_mut() {
            if is_sensitive(k) {
                *v = Value::String("[REDACTED]".into());
            } else {
                redact_json(v);
            }
        }
    } else if let Value::Array(arr) = value {
        for v in arr.iter_mut() {
            redact_json(v);
        }
    }
}

/// Redacted copy of a flat context map, for error logging.
pub fn redact_context(context: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    context
        .iter()
        .map(|(k, v)| {
            if is_sensitive(k) {
                (k.clone(), "[REDACTED]".into())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            ApiError::Validation {
                field: "name".into(),
                message: "bad".into()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::Auth.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::ServiceUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Provider {
                status: Some(503),
                reason: "upstream".into()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Provider {
                status: None,
                reason: "network".into()
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn nested_secrets_are_redacted() {
        let mut v = json!({
            "model": "claude-sonnet-4-5",
            "access_token": "sk-live-1234",
            "nested": { "Authorization": "Bearer abc", "path": "/v1/messages" },
            "list": [{ "refresh_token": "r-1" }]
        });
        redact_json(&mut v);
        assert_eq!(v["access_token"], "[REDACTED]");
        assert_eq!(v["nested"]["Authorization"], "[REDACTED]");
        assert_eq!(v["list"][0]["refresh_token"], "[REDACTED]");
        assert_eq!(v["nested"]["path"], "/v1/messages");
        assert_eq!(v["model"], "claude-sonnet-4-5");
    }
}
