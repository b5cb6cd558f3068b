//! Handler modules for the management and proxy surface.
//!
//! - `proxy` — Anthropic-style proxy endpoints (`/v1/messages`, `/messages/*`)
//! - `accounts` — account CRUD, pause/resume, priority, endpoint, mappings
//! - `oauth` — PKCE init + callback
//! - `requests` — telemetry listing, detail, SSE stream
//! - `analytics` — bucketed aggregates
//! - `config` — strategy, default model, retention, translations
//! - `agents` — per-agent model preferences
//! - `api_keys` — management API keys
//! - `maintenance` — store cleanup/compact/optimize
//! - `logs` — log SSE + history
//! - `health` — liveness summary

pub mod accounts;
pub mod agents;
pub mod analytics;
pub mod api_keys;
pub mod config;
pub mod health;
pub mod logs;
pub mod maintenance;
pub mod oauth;
pub mod proxy;
pub mod requests;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use futures_util::Stream;

use crate::error::ApiError;

/// Build a `text/event-stream` response from a frame stream, prefixed by
/// the `connected` control frame.
pub(crate) fn sse_response<S>(stream: S) -> Result<Response, ApiError>
where
    S: Stream<Item = Result<axum::body::Bytes, std::convert::Infallible>> + Send + 'static,
{
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(format!("response build failed: {e}")))
}
