use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use claude_relay::state::AppState;

/// Helper: build a fresh app router backed by an in-memory store.
async fn app() -> (axum::Router, AppState) {
    let state = AppState::new_test().await;
    (claude_relay::create_router(state.clone()), state)
}

/// Helper: collect a response body into a serde_json::Value.
async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ═══════════════════════════════════════════════════════════════════════
//  GET /health
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn health_returns_expected_shape() {
    let (app, _state) = app().await;
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["accounts"], 0);
    assert_eq!(json["strategy"], "session");
    assert!(json["timestamp"].is_i64());
}

// ═══════════════════════════════════════════════════════════════════════
//  Accounts
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn accounts_list_starts_empty() {
    let (app, _state) = app().await;
    let response = app.oneshot(get("/api/accounts")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["accounts"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn add_account_round_trips_through_the_listing() {
    let (app, _state) = app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/accounts",
            json!({
                "name": "zai-main",
                "provider": "zai",
                "api_key": "sk-zai-0123456789",
                "priority": 10,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    assert_eq!(created["account"]["name"], "zai-main");
    assert_eq!(created["account"]["priority"], 10);
    assert_eq!(created["account"]["available"], true);

    let response = app.oneshot(get("/api/accounts")).await.unwrap();
    let json = body_json(response).await;
    let accounts = json["accounts"].as_array().unwrap();
    assert_eq!(accounts.len(), 1);
    // Credentials never appear in the management view.
    assert!(accounts[0].get("api_key").is_none());
    assert!(accounts[0].get("access_token").is_none());
}

#[tokio::test]
async fn add_account_rejects_bad_names_with_field_error() {
    let (app, _state) = app().await;
    let response = app
        .oneshot(post_json(
            "/api/accounts",
            json!({
                "name": "bad name!",
                "provider": "zai",
                "api_key": "sk-zai-0123456789",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["kind"], "validation");
    assert_eq!(json["error"]["field"], "name");
}

#[tokio::test]
async fn unknown_provider_is_rejected() {
    let (app, _state) = app().await;
    let response = app
        .oneshot(post_json(
            "/api/accounts",
            json!({
                "name": "acct",
                "provider": "not-a-provider",
                "api_key": "sk-test-0123456789",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pause_resume_and_priority_cycle() {
    let (app, state) = app().await;
    app.clone()
        .oneshot(post_json(
            "/api/accounts",
            json!({
                "name": "acct",
                "provider": "zai",
                "api_key": "sk-zai-0123456789",
            }),
        ))
        .await
        .unwrap();
    let account = state
        .store
        .accounts()
        .get_by_name("acct")
        .await
        .unwrap()
        .unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/api/accounts/{}/pause", account.id),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let paused = state
        .store
        .accounts()
        .get(&account.id)
        .await
        .unwrap()
        .unwrap();
    assert!(paused.paused);
    assert!(!paused.is_available(chrono::Utc::now().timestamp_millis()));

    app.clone()
        .oneshot(post_json(
            &format!("/api/accounts/{}/resume", account.id),
            json!({}),
        ))
        .await
        .unwrap();

    let response = app
        .oneshot(post_json(
            &format!("/api/accounts/{}/priority", account.id),
            json!({ "priority": 101 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn mappings_validate_and_persist() {
    let (app, state) = app().await;
    app.clone()
        .oneshot(post_json(
            "/api/accounts",
            json!({
                "name": "acct",
                "provider": "minimax",
                "api_key": "sk-mini-0123456789",
            }),
        ))
        .await
        .unwrap();
    let account = state
        .store
        .accounts()
        .get_by_name("acct")
        .await
        .unwrap()
        .unwrap();

    // Non-string values are rejected.
    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/api/accounts/{}/mappings", account.id),
            json!({ "mappings": { "opus": 7 } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/api/accounts/{}/mappings", account.id),
            json!({ "mappings": { "opus": "minimax-m2", "sonnet": "minimax-m2" } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get(&format!("/api/accounts/{}/mappings", account.id)))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["mappings"]["opus"], "minimax-m2");
}

// ═══════════════════════════════════════════════════════════════════════
//  Proxy path with no accounts
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn proxy_with_no_accounts_returns_503_and_persists_telemetry() {
    let (app, state) = app().await;
    let response = app
        .oneshot(post_json(
            "/v1/messages",
            json!({ "model": "claude-sonnet-4-5", "max_tokens": 64, "messages": [] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response).await;
    assert_eq!(json["error"]["kind"], "service_unavailable");

    let rows = state.store.requests().list(10, 0).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].success);
    assert_eq!(rows[0].error_message.as_deref(), Some("no accounts available"));
    assert_eq!(rows[0].status_code, Some(503));
    assert_eq!(rows[0].path, "/v1/messages");
}

// ═══════════════════════════════════════════════════════════════════════
//  API keys & role scoping
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn first_key_creation_enables_the_gate() {
    let (app, _state) = app().await;

    // Bootstrap: open surface, create the first (admin) key.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/api-keys",
            json!({ "name": "ops", "role": "admin" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    let plaintext = created["api_key"].as_str().unwrap().to_string();
    assert!(plaintext.starts_with("crk_"));

    // Without a key the management surface is now closed.
    let response = app.clone().oneshot(get("/api/accounts")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Health stays exempt.
    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // With the key it opens again.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/accounts")
                .header("x-api-key", &plaintext)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_only_keys_reach_proxy_but_not_management() {
    let (app, _state) = app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/api-keys",
            json!({ "name": "bot", "role": "api-only" }),
        ))
        .await
        .unwrap();
    let plaintext = body_json(response).await["api_key"]
        .as_str()
        .unwrap()
        .to_string();

    // Management: forbidden for api-only.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/requests")
                .header("authorization", format!("Bearer {plaintext}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Proxy: allowed (503 because the pool is empty, not 401/403).
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/messages")
                .header("x-api-key", &plaintext)
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "model": "claude-sonnet-4-5", "messages": [] }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// ═══════════════════════════════════════════════════════════════════════
//  Config
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn strategy_updates_are_validated_and_persisted() {
    let (app, state) = app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/config/strategy",
            json!({ "strategy": "least-requests" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        state.settings.read().await.strategy.as_str(),
        "least-requests"
    );
    // Survives a settings reload from the store.
    let reloaded = state.store.settings().load().await.unwrap();
    assert_eq!(reloaded.strategy.as_str(), "least-requests");

    let response = app
        .oneshot(post_json(
            "/api/config/strategy",
            json!({ "strategy": "fastest-first" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn translations_crud() {
    let (app, _state) = app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/config/translations",
            json!({ "source": "gpt-4o", "target": "claude-sonnet-4-5" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get("/api/config/translations"))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["translations"][0]["source"], "gpt-4o");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/config/translations/gpt-4o")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/config/translations/gpt-4o")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ═══════════════════════════════════════════════════════════════════════
//  OAuth boundary
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn oauth_init_validates_name_and_mode() {
    let (app, _state) = app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/oauth/init",
            json!({ "name": "bad name!", "mode": "claude-oauth" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(post_json(
            "/api/oauth/init",
            json!({ "name": "work", "mode": "implicit" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oauth_callback_with_unknown_session_is_an_oauth_error() {
    let (app, _state) = app().await;
    let response = app
        .oneshot(post_json(
            "/api/oauth/callback",
            json!({ "session_id": "nope", "code": "abc" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["kind"], "oauth");
}

// ═══════════════════════════════════════════════════════════════════════
//  Maintenance & logs
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn cleanup_returns_counts() {
    let (app, _state) = app().await;
    let response = app
        .oneshot(post_json("/api/maintenance/cleanup", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["removed_requests"], 0);
    assert_eq!(json["removed_payloads"], 0);
}

#[tokio::test]
async fn log_history_is_empty_on_a_fresh_app() {
    let (app, _state) = app().await;
    let response = app.oneshot(get("/api/logs/history")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["logs"].as_array().unwrap().is_empty());
}
