//! Telemetry listing, detail, and the live SSE stream.

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
pub struct ListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /api/requests
#[utoipa::path(
    get,
    path = "/api/requests",
    tag = "requests",
    responses((status = 200, description = "Recent request telemetry"))
)]
pub async fn list_requests(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let offset = params.offset.unwrap_or(0).max(0);
    let rows = state.store.requests().list(limit, offset).await?;
    let total = state.store.requests().count().await?;
    Ok(Json(json!({ "requests": rows, "total": total })))
}

#[derive(Debug, Deserialize)]
pub struct DetailParams {
    pub id: String,
}

/// GET /api/requests/detail?id=
pub async fn request_detail(
    State(state): State<AppState>,
    Query(params): Query<DetailParams>,
) -> Result<Json<Value>, ApiError> {
    let row = state
        .store
        .requests()
        .get(&params.id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("request {}", params.id)))?;
    let payload = state.store.requests().get_payload(&params.id).await?;

    Ok(Json(json!({
        "request": row,
        "payload": payload.map(|p| json!({
            "request_json": p.request_json,
            "response_json": p.response_json,
            "created_at": p.created_at,
        })),
    })))
}

/// GET /api/requests/stream — SSE of request lifecycle events.
pub async fn stream_requests(State(state): State<AppState>) -> Result<Response, ApiError> {
    let mut subscription = state
        .events
        .requests
        .subscribe()
        .await
        .ok_or_else(|| ApiError::Internal("request event subscriber limit reached".into()))?;

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
