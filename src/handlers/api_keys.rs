//! Management API keys. Creating the first key flips the auth gate on; the
//! plaintext key is returned exactly once.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{generate_api_key, hash_api_key};
use crate::error::ApiError;
use crate::models::{ApiKeyRole, ApiKeyRow};
use crate::state::AppState;
use crate::validation::{validate_string, StringRules};

fn key_view(row: &ApiKeyRow) -> Value {
    json!({
        "id": row.id,
        "name": row.name,
        "prefix_last_8": row.prefix_last_8,
        "created_at": row.created_at,
        "last_used": row.last_used,
        "usage_count": row.usage_count,
        "is_active": row.is_active,
        "role": row.role,
    })
}

/// GET /api/api-keys
#[utoipa::path(
    get,
    path = "/api/api-keys",
    tag = "api-keys",
    responses((status = 200, description = "API keys (hashes never leave the store)"))
)]
pub async fn list_keys(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let keys = state.store.api_keys().list().await?;
    Ok(Json(json!({
        "keys": keys.iter().map(key_view).collect::<Vec<_>>()
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "api-only".to_string()
}

/// POST /api/api-keys
pub async fn create_key(
    State(state): State<AppState>,
    Json(req): Json<CreateKeyRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = validate_string(
        "name",
        Some(&req.name),
        &StringRules {
            min: Some(1),
            max: Some(64),
            ..Default::default()
        },
    )?
    .unwrap_or_default();
    let role: ApiKeyRole = req.role.parse().map_err(|message: String| {
        ApiError::Validation {
            field: "role".into(),
            message,
        }
    })?;

    if state
        .store
        .api_keys()
        .list()
        .await?
        .iter()
        .any(|k| k.name == name)
    {
        return Err(ApiError::Validation {
            field: "name".into(),
            message: format!("key `{name}` already exists"),
        });
    }

    let plaintext = generate_api_key();
    let row = ApiKeyRow {
        id: uuid::Uuid::new_v4().to_string(),
        name,
        hashed_key: hash_api_key(&plaintext),
        prefix_last_8: plaintext[plaintext.len() - 8..].to_string(),
        created_at: chrono::Utc::now().timestamp_millis(),
        last_used: None,
        usage_count: 0,
        is_active: true,
        role: role.as_str().to_string(),
    };
    state.store.api_keys().insert(&row).await?;
    tracing::info!(key = %row.name, role = %row.role, "API key created");

    Ok(Json(json!({
        "key": key_view(&row),
        // Shown exactly once; only the hash is stored.
        "api_key": plaintext,
    })))
}

/// POST /api/api-keys/{id}/deactivate
pub async fn deactivate_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.api_keys().deactivate(&id).await? {
        return Err(ApiError::NotFound(format!("api key {id}")));
    }
    Ok(Json(json!({ "deactivated": true })))
}

/// DELETE /api/api-keys/{id}
pub async fn delete_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.api_keys().delete(&id).await? {
        return Err(ApiError::NotFound(format!("api key {id}")));
    }
    tracing::info!(key_id = %id, "API key deleted");
    Ok(Json(json!({ "deleted": true })))
}
