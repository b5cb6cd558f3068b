//! Proxy endpoints. Thin translation from HTTP to the dispatcher — the
//! request body goes through untouched apart from model rewriting.

use axum::extract::{Request, State};
use axum::response::Response;

use crate::dispatch;
use crate::error::ApiError;
use crate::models::AuthContext;
use crate::state::AppState;

/// Anthropic requests can carry large base64 attachments.
const MAX_PROXY_BODY: usize = 60 * 1024 * 1024;

/// POST /v1/messages, /v1/messages/*, /messages, /messages/*
pub async fn proxy_messages(
    State(state): State<AppState>,
    req: Request,
) -> Result<Response, ApiError> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let api_key_id = req
        .extensions()
        .get::<AuthContext>()
        .and_then(|ctx| ctx.api_key_id.clone());
    let correlation = req
        .extensions()
        .get::<crate::RequestId>()
        .map(|id| id.0.clone());
    let body = axum::body::to_bytes(req.into_body(), MAX_PROXY_BODY)
        .await
        .map_err(|e| ApiError::Validation {
            field: "body".into(),
            message: format!("unreadable request body: {e}"),
        })?;

    if let Some(correlation) = correlation.as_deref() {
        tracing::debug!(correlation, %path, "proxy request accepted");
    }
    dispatch::handle_proxy(state, method, path, api_key_id, body).await
}
