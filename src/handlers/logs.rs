//! Log history and the live log SSE stream.

use axum::extract::{Query, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::events::{sse_frame, SSE_CONNECTED};
use crate::state::AppState;

use super::sse_response;

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

/// GET /api/logs/history
pub async fn log_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Json<Value> {
    let limit = params.limit.unwrap_or(200).clamp(1, 1000);
    Json(json!({ "logs": state.log_buffer.recent(limit) }))
}

/// GET /api/logs/stream — SSE of log events.
pub async fn stream_logs(State(state): State<AppState>) -> Result<Response, ApiError> {
    let mut subscription = state
        .events
        .logs
        .subscribe()
        .await
        .ok_or_else(|| ApiError::Internal("log subscriber limit reached".into()))?;

    let stream = async_stream::stream! {
        yield Ok::<_, std::convert::Infallible>(axum::body::Bytes::from_static(
            SSE_CONNECTED.as_bytes(),
        ));
        while let Some(event) = subscription.recv().await {
            yield Ok(axum::body::Bytes::from(sse_frame(event.as_ref())));
        }
    };
    sse_response(stream)
}
