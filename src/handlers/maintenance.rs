//! Store maintenance endpoints.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

const DAY_MS: i64 = 24 * 3_600_000;

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    pub payload_age_days: Option<u32>,
    pub request_age_days: Option<u32>,
}

/// POST /api/maintenance/cleanup — ages default to the retention settings.
#[utoipa::path(
    post,
    path = "/api/maintenance/cleanup",
    tag = "maintenance",
    responses((status = 200, description = "Deleted row counts"))
)]
pub async fn cleanup(
    State(state): State<AppState>,
    body: Option<Json<CleanupRequest>>,
) -> Result<Json<Value>, ApiError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let settings = state.settings.read().await.clone();

    let payload_age_days = req
        .payload_age_days
        .unwrap_or(settings.payload_retention_days);
    let request_age_days = req
        .request_age_days
        .or((settings.request_retention_days > 0).then_some(settings.request_retention_days));

    let counts = state
        .store
        .cleanup_old_requests(
            payload_age_days as i64 * DAY_MS,
            request_age_days.map(|d| d as i64 * DAY_MS),
        )
        .await?;
    Ok(Json(json!({
        "removed_requests": counts.removed_requests,
        "removed_payloads": counts.removed_payloads,
    })))
}

/// POST /api/maintenance/compact — truncating checkpoint + VACUUM.
#[utoipa::path(
    post,
    path = "/api/maintenance/compact",
    tag = "maintenance",
    responses((status = 200, description = "Store compacted"))
)]
pub async fn compact(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.store.compact().await?;
    tracing::info!("store compacted");
    Ok(Json(json!({ "compacted": true })))
}

/// POST /api/maintenance/optimize — checkpoint + plan refresh.
pub async fn optimize(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.store.optimize().await?;
    Ok(Json(json!({ "optimized": true })))
}
