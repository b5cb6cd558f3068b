//! Liveness endpoint.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Service healthy"))
)]
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let accounts = state.store.accounts().count().await.unwrap_or(0);
    let strategy = state.settings.read().await.strategy;
    let db_ok = sqlx::query("SELECT 1")
        .fetch_one(state.store.pool())
        .await
        .is_ok();

    Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "accounts": accounts,
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "strategy": strategy.as_str(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}
