pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handlers;
pub mod lifecycle;
pub mod logs;
pub mod mappings;
pub mod models;
pub mod oauth;
pub mod pricing;
pub mod providers;
pub mod ratelimit;
pub mod state;
pub mod strategy;
pub mod usage;
pub mod validation;
pub mod watchdog;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

// ═══════════════════════════════════════════════════════════════════════
//  Request correlation ID middleware
// ═══════════════════════════════════════════════════════════════════════

/// Correlation id for one inbound request. Distinct from the telemetry row
/// id: the row id is always a fresh UUID, while the correlation id honors
/// whatever `X-Request-Id` an upstream proxy already assigned.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        let id = headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self(id)
    }
}

/// Attaches a [`RequestId`] to request extensions and echoes it on the
/// response so clients can correlate telemetry rows with their own logs.
async fn request_id_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let request_id = RequestId::from_headers(req.headers());
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;
    if let Ok(header_value) = axum::http::HeaderValue::from_str(&request_id.0) {
        response.headers_mut().insert("x-request-id", header_value);
    }
    response
}

// ── OpenAPI documentation ───────────────────────────────────────────────

#[derive(OpenApi)]
#[openapi(
    info(
        title = "claude-relay API",
        version = "1.0.0",
        description = "Reverse proxy and load balancer for Anthropic-compatible LLM traffic"
    ),
    paths(
        handlers::health::health,
        handlers::accounts::list_accounts,
        handlers::oauth::oauth_init,
        handlers::oauth::oauth_callback,
        handlers::requests::list_requests,
        handlers::analytics::analytics,
        handlers::analytics::stats,
        handlers::config::get_config,
        handlers::api_keys::list_keys,
        handlers::maintenance::cleanup,
        handlers::maintenance::compact,
    ),
    components(schemas(
        models::AccountView,
        models::RequestRow,
        models::AgentPreference,
        models::ModelTranslation,
        models::CleanupCounts,
    )),
    tags(
        (name = "health", description = "Liveness"),
        (name = "accounts", description = "Upstream account pool"),
        (name = "oauth", description = "PKCE login flow"),
        (name = "requests", description = "Request telemetry"),
        (name = "analytics", description = "Aggregates"),
        (name = "config", description = "Runtime settings"),
        (name = "api-keys", description = "Management surface auth"),
        (name = "maintenance", description = "Store upkeep"),
    )
)]
pub struct ApiDoc;

/// Build the application router with the given shared state. Extracted from
/// `main()` so integration tests can drive the app without a socket.
pub fn create_router(state: AppState) -> Router {
    // ── Proxy surface ───────────────────────────────────────────────────
    let proxy = Router::new()
        .route("/v1/messages", post(handlers::proxy::proxy_messages))
        .route("/v1/messages/{*rest}", post(handlers::proxy::proxy_messages))
        .route("/messages", post(handlers::proxy::proxy_messages))
        .route("/messages/{*rest}", post(handlers::proxy::proxy_messages));

    // ── Management surface ──────────────────────────────────────────────
    let management = Router::new()
        .route("/health", get(handlers::health::health))
        // Accounts
        .route(
            "/api/accounts",
            get(handlers::accounts::list_accounts).post(handlers::accounts::add_account),
        )
        .route(
            "/api/accounts/{id}",
            delete(handlers::accounts::delete_account),
        )
        .route(
            "/api/accounts/{id}/rename",
            post(handlers::accounts::rename_account),
        )
        .route(
            "/api/accounts/{id}/pause",
            post(handlers::accounts::pause_account),
        )
        .route(
            "/api/accounts/{id}/resume",
            post(handlers::accounts::resume_account),
        )
        .route(
            "/api/accounts/{id}/priority",
            post(handlers::accounts::set_priority),
        )
        .route(
            "/api/accounts/{id}/endpoint",
            post(handlers::accounts::set_endpoint),
        )
        .route(
            "/api/accounts/{id}/mappings",
            get(handlers::accounts::get_mappings).post(handlers::accounts::set_mappings),
        )
        .route(
            "/api/accounts/{id}/reset-session",
            post(handlers::accounts::reset_session),
        )
        // OAuth
        .route("/api/oauth/init", post(handlers::oauth::oauth_init))
        .route("/api/oauth/callback", post(handlers::oauth::oauth_callback))
        // Requests
        .route("/api/requests", get(handlers::requests::list_requests))
        .route(
            "/api/requests/detail",
            get(handlers::requests::request_detail),
        )
        .route(
            "/api/requests/stream",
            get(handlers::requests::stream_requests),
        )
        // Analytics
        .route("/api/analytics", get(handlers::analytics::analytics))
        .route("/api/stats", get(handlers::analytics::stats))
        // Config
        .route("/api/config", get(handlers::config::get_config))
        .route("/api/config/strategy", post(handlers::config::set_strategy))
        .route("/api/config/model", post(handlers::config::set_default_model))
        .route(
            "/api/config/retention",
            post(handlers::config::set_retention),
        )
        .route(
            "/api/config/translations",
            get(handlers::config::list_translations).post(handlers::config::upsert_translation),
        )
        .route(
            "/api/config/translations/{source}",
            delete(handlers::config::delete_translation),
        )
        // Agent preferences
        .route(
            "/api/agents/preferences",
            get(handlers::agents::list_preferences).post(handlers::agents::set_preference),
        )
        .route(
            "/api/agents/preferences/{agent_id}",
            delete(handlers::agents::delete_preference),
        )
        // API keys
        .route(
            "/api/api-keys",
            get(handlers::api_keys::list_keys).post(handlers::api_keys::create_key),
        )
        .route(
            "/api/api-keys/{id}",
            delete(handlers::api_keys::delete_key),
        )
        .route(
            "/api/api-keys/{id}/deactivate",
            post(handlers::api_keys::deactivate_key),
        )
        // Maintenance
        .route(
            "/api/maintenance/cleanup",
            post(handlers::maintenance::cleanup),
        )
        .route(
            "/api/maintenance/compact",
            post(handlers::maintenance::compact),
        )
        .route(
            "/api/maintenance/optimize",
            post(handlers::maintenance::optimize),
        )
        // Logs
        .route("/api/logs/stream", get(handlers::logs::stream_logs))
        .route("/api/logs/history", get(handlers::logs::log_history));

    proxy
        .merge(management)
        // One gate for everything; it exempts health + OAuth and stays open
        // until the first API key exists.
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Large Anthropic bodies — must precede .with_state() for Json.
        .layer(DefaultBodyLimit::max(60 * 1024 * 1024))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}
