//! PKCE flow endpoints.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::models::{AccountView, OAuthMode};
use crate::state::AppState;
use crate::validation::validate_account_name;

#[derive(Debug, Deserialize)]
pub struct OAuthInitRequest {
    pub name: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    pub custom_endpoint: Option<String>,
}

fn default_mode() -> String {
    "claude-oauth".to_string()
}

/// POST /api/oauth/init
#[utoipa::path(
    post,
    path = "/api/oauth/init",
    tag = "oauth",
    responses((status = 200, description = "PKCE session created; visit auth_url"))
)]
pub async fn oauth_init(
    State(state): State<AppState>,
    Json(req): Json<OAuthInitRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = validate_account_name("name", &req.name)?;
    let mode: OAuthMode = req.mode.parse().map_err(|message: String| {
        ApiError::Validation {
            field: "mode".into(),
            message,
        }
    })?;
    if state.store.accounts().get_by_name(&name).await?.is_some() {
        return Err(ApiError::Validation {
            field: "name".into(),
            message: format!("account `{name}` already exists"),
        });
    }

    let begin = state
        .tokens
        .begin_login(&name, mode, req.custom_endpoint.as_deref())
        .await?;
    Ok(Json(json!({
        "session_id": begin.session_id,
        "auth_url": begin.auth_url,
    })))
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackRequest {
    pub session_id: String,
    pub code: String,
}

/// POST /api/oauth/callback
#[utoipa::path(
    post,
    path = "/api/oauth/callback",
    tag = "oauth",
    responses((status = 200, description = "Account created from OAuth exchange"))
)]
pub async fn oauth_callback(
    State(state): State<AppState>,
    Json(req): Json<OAuthCallbackRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.code.trim().is_empty() {
        return Err(ApiError::Validation {
            field: "code".into(),
            message: "is required".into(),
        });
    }
    let account = state
        .tokens
        .complete_login(&req.session_id, req.code.trim())
        .await?;
    let now = chrono::Utc::now().timestamp_millis();
    Ok(Json(json!({
        "account": AccountView::from_account(&account, now)
    })))
}
