//! Per-agent default-model preferences.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;
use crate::validation::{validate_string, StringRules};

/// GET /api/agents/preferences
pub async fn list_preferences(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let preferences = state.store.agent_preferences().list().await?;
    Ok(Json(json!({ "preferences": preferences })))
}

#[derive(Debug, Deserialize)]
pub struct PreferenceRequest {
    pub agent_id: String,
    pub model: String,
}

/// POST /api/agents/preferences
pub async fn set_preference(
    State(state): State<AppState>,
    Json(req): Json<PreferenceRequest>,
) -> Result<Json<Value>, ApiError> {
    let rules = StringRules {
        min: Some(1),
        max: Some(128),
        ..Default::default()
    };
    let agent_id = validate_string("agent_id", Some(&req.agent_id), &rules)?.unwrap_or_default();
    let model = validate_string("model", Some(&req.model), &rules)?.unwrap_or_default();
    state.store.agent_preferences().upsert(&agent_id, &model).await?;
    Ok(Json(json!({ "agent_id": agent_id, "model": model })))
}

/// DELETE /api/agents/preferences/{agent_id}
pub async fn delete_preference(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.agent_preferences().delete(&agent_id).await? {
        return Err(ApiError::NotFound(format!("agent preference {agent_id}")));
    }
    Ok(Json(json!({ "deleted": true })))
}
