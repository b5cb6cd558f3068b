//! Runtime configuration endpoints: strategy, default model, retention,
//! and global model translations.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;
use crate::strategy::StrategyKind;
use crate::validation::{validate_string, StringRules};

/// GET /api/config
#[utoipa::path(
    get,
    path = "/api/config",
    tag = "config",
    responses((status = 200, description = "Current runtime settings"))
)]
pub async fn get_config(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let settings = state.settings.read().await.clone();
    Ok(Json(json!({
        "strategy": settings.strategy.as_str(),
        "available_strategies": StrategyKind::ALL,
        "default_model": settings.default_model,
        "payload_retention_days": settings.payload_retention_days,
        "request_retention_days": settings.request_retention_days,
        "session_duration_ms": settings.session_duration_ms,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StrategyRequest {
    pub strategy: String,
}

/// POST /api/config/strategy — names come from a closed set.
pub async fn set_strategy(
    State(state): State<AppState>,
    Json(req): Json<StrategyRequest>,
) -> Result<Json<Value>, ApiError> {
    let strategy: StrategyKind = req.strategy.parse().map_err(|_: String| {
        ApiError::Validation {
            field: "strategy".into(),
            message: format!("must be one of: {}", StrategyKind::ALL.join(", ")),
        }
    })?;

    let settings = {
        let mut settings = state.settings.write().await;
        settings.strategy = strategy;
        settings.clone()
    };
    state.store.settings().save(&settings).await?;
    tracing::info!(strategy = strategy.as_str(), "load-balancing strategy changed");
    Ok(Json(json!({ "strategy": strategy.as_str() })))
}

#[derive(Debug, Deserialize)]
pub struct ModelRequest {
    pub model: String,
}

/// POST /api/config/model
pub async fn set_default_model(
    State(state): State<AppState>,
    Json(req): Json<ModelRequest>,
) -> Result<Json<Value>, ApiError> {
    let model = validate_string(
        "model",
        Some(&req.model),
        &StringRules {
            min: Some(1),
            max: Some(128),
            ..Default::default()
        },
    )?
    .unwrap_or_default();

    let settings = {
        let mut settings = state.settings.write().await;
        settings.default_model = model.clone();
        settings.clone()
    };
    state.store.settings().save(&settings).await?;
    Ok(Json(json!({ "default_model": model })))
}

#[derive(Debug, Deserialize)]
pub struct RetentionRequest {
    pub payload_retention_days: Option<u32>,
    pub request_retention_days: Option<u32>,
}

/// POST /api/config/retention — days, separately for payloads and meta.
pub async fn set_retention(
    State(state): State<AppState>,
    Json(req): Json<RetentionRequest>,
) -> Result<Json<Value>, ApiError> {
    let settings = {
        let mut settings = state.settings.write().await;
        if let Some(days) = req.payload_retention_days {
            settings.payload_retention_days = days;
        }
        if let Some(days) = req.request_retention_days {
            settings.request_retention_days = days;
        }
        settings.clone()
    };
    state.store.settings().save(&settings).await?;
    Ok(Json(json!({
        "payload_retention_days": settings.payload_retention_days,
        "request_retention_days": settings.request_retention_days,
    })))
}

/// GET /api/config/translations
pub async fn list_translations(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let translations = state.store.model_translations().list().await?;
    Ok(Json(json!({ "translations": translations })))
}

#[derive(Debug, Deserialize)]
pub struct TranslationRequest {
    pub source: String,
    pub target: String,
}

/// POST /api/config/translations
pub async fn upsert_translation(
    State(state): State<AppState>,
    Json(req): Json<TranslationRequest>,
) -> Result<Json<Value>, ApiError> {
    let rules = StringRules {
        min: Some(1),
        max: Some(128),
        ..Default::default()
    };
    let source = validate_string("source", Some(&req.source), &rules)?.unwrap_or_default();
    let target = validate_string("target", Some(&req.target), &rules)?.unwrap_or_default();
    state.store.model_translations().upsert(&source, &target).await?;
    Ok(Json(json!({ "source": source, "target": target })))
}

/// DELETE /api/config/translations/{source}
pub async fn delete_translation(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.model_translations().delete(&source).await? {
        return Err(ApiError::NotFound(format!("translation {source}")));
    }
    Ok(Json(json!({ "deleted": true })))
}
