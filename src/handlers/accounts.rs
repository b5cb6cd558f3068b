//! Account management endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::models::{Account, AccountView, ProviderKind};
use crate::state::AppState;
use crate::validation::{
    validate_account_name, validate_api_key_format, validate_endpoint_url,
    validate_model_mappings, validate_priority,
};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// GET /api/accounts
#[utoipa::path(
    get,
    path = "/api/accounts",
    tag = "accounts",
    responses((status = 200, description = "All accounts with availability", body = [AccountView]))
)]
pub async fn list_accounts(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let now = now_ms();
    let accounts = state.store.accounts().all().await?;
    let views: Vec<AccountView> = accounts
        .iter()
        .map(|a| AccountView::from_account(a, now))
        .collect();
    Ok(Json(json!({ "accounts": views })))
}

#[derive(Debug, Deserialize)]
pub struct AddAccountRequest {
    pub name: String,
    pub provider: String,
    pub api_key: String,
    pub custom_endpoint: Option<String>,
    pub priority: Option<i64>,
}

/// POST /api/accounts — direct API-key registration. OAuth accounts come in
/// through the OAuth flow instead.
pub async fn add_account(
    State(state): State<AppState>,
    Json(req): Json<AddAccountRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = validate_account_name("name", &req.name)?;
    let provider: ProviderKind = req.provider.parse().map_err(|message: String| {
        ApiError::Validation {
            field: "provider".into(),
            message,
        }
    })?;
    let api_key = validate_api_key_format("api_key", &req.api_key)?;
    let custom_endpoint = match req.custom_endpoint.as_deref() {
        Some(raw) if !raw.trim().is_empty() => {
            Some(validate_endpoint_url("custom_endpoint", raw)?.to_string())
        }
        _ => None,
    };
    let priority = validate_priority("priority", req.priority.unwrap_or(0))?;

    if state.store.accounts().get_by_name(&name).await?.is_some() {
        return Err(ApiError::Validation {
            field: "name".into(),
            message: format!("account `{name}` already exists"),
        });
    }

    let now = now_ms();
    let account = Account {
        id: uuid::Uuid::new_v4().to_string(),
        name,
        provider: provider.as_str().to_string(),
        auth_type: "api_key".into(),
        access_token: None,
        refresh_token: None,
        api_key: Some(api_key),
        expires_at: None,
        created_at: now,
        last_used: None,
        request_count: 0,
        total_requests: 0,
        session_start: None,
        session_request_count: 0,
        rate_limited_until: None,
        rate_limit_status: None,
        rate_limit_reset: None,
        rate_limit_remaining: None,
        paused: false,
        priority,
        auto_fallback_enabled: true,
        auto_refresh_enabled: true,
        custom_endpoint,
        model_mappings: None,
    };
    state.store.accounts().insert(&account).await?;
    tracing::info!(account = %account.name, provider = %account.provider, "account added");

    Ok(Json(json!({
        "account": AccountView::from_account(&account, now)
    })))
}

/// DELETE /api/accounts/{id}
pub async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.accounts().delete(&id).await? {
        return Err(ApiError::NotFound(format!("account {id}")));
    }
    tracing::info!(account_id = %id, "account deleted");
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

/// POST /api/accounts/{id}/rename
pub async fn rename_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = validate_account_name("name", &req.name)?;
    if let Some(existing) = state.store.accounts().get_by_name(&name).await?
        && existing.id != id
    {
        return Err(ApiError::Validation {
            field: "name".into(),
            message: format!("account `{name}` already exists"),
        });
    }
    if !state.store.accounts().rename(&id, &name).await? {
        return Err(ApiError::NotFound(format!("account {id}")));
    }
    Ok(Json(json!({ "renamed": true, "name": name })))
}

/// POST /api/accounts/{id}/pause
pub async fn pause_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    set_paused(&state, &id, true).await
}

/// POST /api/accounts/{id}/resume
pub async fn resume_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    set_paused(&state, &id, false).await
}

async fn set_paused(state: &AppState, id: &str, paused: bool) -> Result<Json<Value>, ApiError> {
    if !state.store.accounts().set_paused(id, paused).await? {
        return Err(ApiError::NotFound(format!("account {id}")));
    }
    tracing::info!(account_id = %id, paused, "account pause state changed");
    Ok(Json(json!({ "paused": paused })))
}

#[derive(Debug, Deserialize)]
pub struct PriorityRequest {
    pub priority: i64,
}

/// POST /api/accounts/{id}/priority
pub async fn set_priority(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PriorityRequest>,
) -> Result<Json<Value>, ApiError> {
    let priority = validate_priority("priority", req.priority)?;
    if !state.store.accounts().set_priority(&id, priority).await? {
        return Err(ApiError::NotFound(format!("account {id}")));
    }
    Ok(Json(json!({ "priority": priority })))
}

#[derive(Debug, Deserialize)]
pub struct EndpointRequest {
    pub endpoint: Option<String>,
}

/// POST /api/accounts/{id}/endpoint — set or clear the custom endpoint.
pub async fn set_endpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<EndpointRequest>,
) -> Result<Json<Value>, ApiError> {
    let endpoint = match req.endpoint.as_deref() {
        Some(raw) if !raw.trim().is_empty() => {
            Some(validate_endpoint_url("endpoint", raw)?.to_string())
        }
        _ => None,
    };
    if !state
        .store
        .accounts()
        .set_custom_endpoint(&id, endpoint.as_deref())
        .await?
    {
        return Err(ApiError::NotFound(format!("account {id}")));
    }
    Ok(Json(json!({ "endpoint": endpoint })))
}

/// GET /api/accounts/{id}/mappings
pub async fn get_mappings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let account = state
        .store
        .accounts()
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("account {id}")))?;
    let mappings = account
        .mappings()
        .map(Value::Object)
        .unwrap_or_else(|| json!({}));
    Ok(Json(json!({ "mappings": mappings })))
}

/// POST /api/accounts/{id}/mappings — set (object) or clear (null).
pub async fn set_mappings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let mappings = body.get("mappings").cloned().unwrap_or(Value::Null);
    let stored = match &mappings {
        Value::Null => None,
        other => {
            validate_model_mappings("mappings", other)?;
            Some(other.to_string())
        }
    };
    if !state
        .store
        .accounts()
        .set_model_mappings(&id, stored.as_deref())
        .await?
    {
        return Err(ApiError::NotFound(format!("account {id}")));
    }
    Ok(Json(json!({ "mappings": mappings })))
}

/// POST /api/accounts/{id}/reset-session
pub async fn reset_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.accounts().reset_session(&id).await? {
        return Err(ApiError::NotFound(format!("account {id}")));
    }
    Ok(Json(json!({ "reset": true })))
}
