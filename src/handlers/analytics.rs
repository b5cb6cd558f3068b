//! Bucketed analytics over request telemetry.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::db::stats::{AnalyticsFilter, AnalyticsRange};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AnalyticsParams {
    pub range: Option<String>,
    pub mode: Option<String>,
    /// Comma-separated account names.
    pub accounts: Option<String>,
    /// Comma-separated model ids.
    pub models: Option<String>,
    /// `success` or `error`.
    pub status: Option<String>,
}

fn split_csv(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

/// GET /api/analytics?range=1h|6h|24h|7d|30d&mode=normal|cumulative&…
#[utoipa::path(
    get,
    path = "/api/analytics",
    tag = "analytics",
    responses((status = 200, description = "Time-bucketed aggregates"))
)]
pub async fn analytics(
    State(state): State<AppState>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<Value>, ApiError> {
    let range_raw = params.range.as_deref().unwrap_or("24h");
    let range = AnalyticsRange::parse(range_raw).ok_or_else(|| ApiError::Validation {
        field: "range".into(),
        message: "must be one of: 1h, 6h, 24h, 7d, 30d".into(),
    })?;

    let cumulative = match params.mode.as_deref() {
        None | Some("normal") => false,
        Some("cumulative") => true,
        Some(_) => {
            return Err(ApiError::Validation {
                field: "mode".into(),
                message: "must be `normal` or `cumulative`".into(),
            });
        }
    };

    let success = match params.status.as_deref() {
        None | Some("") => None,
        Some("success") => Some(true),
        Some("error") => Some(false),
        Some(_) => {
            return Err(ApiError::Validation {
                field: "status".into(),
                message: "must be `success` or `error`".into(),
            });
        }
    };

    let filter = AnalyticsFilter {
        accounts: split_csv(params.accounts.as_deref()),
        models: split_csv(params.models.as_deref()),
        success,
        cumulative,
    };

    let result = state.store.stats().analytics(range, &filter).await?;
    Ok(Json(result))
}

/// GET /api/stats — dashboard summary.
#[utoipa::path(
    get,
    path = "/api/stats",
    tag = "analytics",
    responses((status = 200, description = "Totals and per-account counters"))
)]
pub async fn stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.store.stats().summary().await?))
}
