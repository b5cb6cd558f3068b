//! Scenario coverage that exercises the store, strategy engine, and
//! maintenance paths together against an in-memory database.

use std::sync::Arc;

use claude_relay::config::{Config, DebugMode, RuntimeSettings, DEFAULT_SESSION_DURATION_MS};
use claude_relay::db::requests::RequestOutcome;
use claude_relay::db::Store;
use claude_relay::models::{Account, RequestMeta, TokenUsage};
use claude_relay::strategy::{StrategyEngine, StrategyKind};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn account(id: &str, name: &str, priority: i64) -> Account {
    Account {
        id: id.into(),
        name: name.into(),
        provider: "anthropic".into(),
        auth_type: "oauth".into(),
        access_token: Some("token".into()),
        refresh_token: Some("refresh".into()),
        api_key: None,
        expires_at: Some(now_ms() + 3_600_000),
        created_at: now_ms(),
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
        custom_endpoint: None,
        model_mappings: None,
    }
}

async fn store_with_accounts(accounts: &[Account]) -> Arc<Store> {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    for account in accounts {
        store.accounts().insert(account).await.unwrap();
    }
    store
}

// ═══════════════════════════════════════════════════════════════════════
//  On-disk store lifecycle
// ═══════════════════════════════════════════════════════════════════════

fn disk_config(db_path: std::path::PathBuf) -> Config {
    Config {
        port: 0,
        db_path,
        fast_mode: true,
        busy_timeout: std::time::Duration::from_secs(1),
        pricing_offline: true,
        pricing_refresh_hours: 24,
        debug: DebugMode::Off,
        session_duration_ms: DEFAULT_SESSION_DURATION_MS,
        openai_model_mappings: None,
        oauth_client_id: "test-client".into(),
    }
}

#[tokio::test]
async fn on_disk_store_survives_reopen_with_idempotent_migrations() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(dir.path().join("relay.db"));

    let store = Store::open(&config).await.unwrap();
    store.accounts().insert(&account("a", "A", 3)).await.unwrap();
    let settings = RuntimeSettings {
        strategy: StrategyKind::RoundRobin,
        ..Default::default()
    };
    store.settings().save(&settings).await.unwrap();
    store.close().await;

    // Second open runs the migration routine against the existing file and
    // must leave the data untouched.
    let reopened = Store::open(&config).await.unwrap();
    let a = reopened.accounts().get("a").await.unwrap().unwrap();
    assert_eq!(a.name, "A");
    assert_eq!(a.priority, 3);
    let loaded = reopened.settings().load().await.unwrap();
    assert_eq!(loaded.strategy, StrategyKind::RoundRobin);
    reopened.close().await;

    assert!(config.db_path.exists());
}

// ═══════════════════════════════════════════════════════════════════════
//  Session strategy happy path
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn session_strategy_sticks_then_reelects_after_window() {
    let store = store_with_accounts(&[account("a", "A", 0), account("b", "B", 0)]).await;
    let engine = StrategyEngine::new(store.clone());
    let meta = RequestMeta::default();
    let window_ms = 10_000;
    let t0 = now_ms();

    // Request 1: no active session, elects by least-requests (tie → "A").
    let accounts = store.accounts().all().await.unwrap();
    let picks = engine
        .select(StrategyKind::Session, &accounts, &meta, window_ms, t0)
        .await
        .unwrap();
    assert_eq!(picks[0].name, "A");
    // Dispatcher would record usage on the winner.
    store.accounts().record_usage(&picks[0].id).await.unwrap();

    // Request 2 inside the window sticks to A even though B has fewer
    // requests now.
    let accounts = store.accounts().all().await.unwrap();
    let picks = engine
        .select(StrategyKind::Session, &accounts, &meta, window_ms, t0 + 1_000)
        .await
        .unwrap();
    assert_eq!(picks[0].name, "A");
    store.accounts().record_usage(&picks[0].id).await.unwrap();

    // Request 3 after the window elapses re-elects by least-requests → B.
    let accounts = store.accounts().all().await.unwrap();
    let picks = engine
        .select(
            StrategyKind::Session,
            &accounts,
            &meta,
            window_ms,
            t0 + window_ms + 5_000,
        )
        .await
        .unwrap();
    assert_eq!(picks[0].name, "B");

    let b = store.accounts().get("b").await.unwrap().unwrap();
    assert!(b.session_start.is_some());
    assert_eq!(b.session_request_count, 0);
}

// ═══════════════════════════════════════════════════════════════════════
//  Rate-limit windows
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn rate_limited_account_is_hidden_until_the_window_elapses() {
    let store = store_with_accounts(&[account("a", "A", 0), account("b", "B", 0)]).await;
    let engine = StrategyEngine::new(store.clone());
    let meta = RequestMeta::default();
    let now = now_ms();

    store
        .accounts()
        .set_rate_limit("a", now + 30_000, "rate_limited", None, Some(0))
        .await
        .unwrap();

    let accounts = store.accounts().all().await.unwrap();
    let picks = engine
        .select(StrategyKind::LeastRequests, &accounts, &meta, 0, now)
        .await
        .unwrap();
    assert_eq!(picks.len(), 1);
    assert_eq!(picks[0].name, "B");

    // Past the window the account is selectable again.
    let picks = engine
        .select(StrategyKind::LeastRequests, &accounts, &meta, 0, now + 30_001)
        .await
        .unwrap();
    assert_eq!(picks.len(), 2);

    // The sweep clears the stale window from the row itself.
    let cleared = store
        .accounts()
        .clear_expired_rate_limits(now + 30_001)
        .await
        .unwrap();
    assert_eq!(cleared, 1);
    let a = store.accounts().get("a").await.unwrap().unwrap();
    assert!(a.rate_limited_until.is_none());
    assert!(a.rate_limit_status.is_none());
}

#[tokio::test]
async fn round_robin_cursor_persists_across_selections() {
    let store = store_with_accounts(&[
        account("a", "A", 0),
        account("b", "B", 0),
        account("c", "C", 0),
    ])
    .await;
    let engine = StrategyEngine::new(store.clone());
    let meta = RequestMeta::default();
    let accounts = store.accounts().all().await.unwrap();

    let mut leaders = Vec::new();
    for _ in 0..4 {
        let picks = engine
            .select(StrategyKind::RoundRobin, &accounts, &meta, 0, now_ms())
            .await
            .unwrap();
        leaders.push(picks[0].name.clone());
    }
    assert_eq!(leaders, vec!["A", "B", "C", "A"]);
}

// ═══════════════════════════════════════════════════════════════════════
//  Telemetry lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn request_row_finalize_records_usage_and_rates() {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    store
        .requests()
        .insert_start("req-1", now_ms(), "POST", "/v1/messages", None, None)
        .await
        .unwrap();

    let usage = TokenUsage {
        input_tokens: 100,
        output_tokens: 500,
        cache_read_input_tokens: 0,
        cache_creation_input_tokens: 0,
    };
    store
        .requests()
        .finalize(
            "req-1",
            &RequestOutcome {
                account_used: Some("A".into()),
                status_code: Some(200),
                success: true,
                error_message: None,
                response_time_ms: Some(2_000),
                failover_attempts: 1,
                model: Some("claude-sonnet-4-5".into()),
                usage: Some(usage),
                cost_usd: Some(0.0078),
                output_tokens_per_second: Some(500.0 * 1000.0 / 2_000.0),
            },
        )
        .await
        .unwrap();

    let row = store.requests().get("req-1").await.unwrap().unwrap();
    assert!(row.success);
    assert_eq!(row.total_tokens, Some(600));
    assert_eq!(row.failover_attempts, 1);
    // output_tokens * 1000 / response_time_ms
    assert_eq!(row.output_tokens_per_second, Some(250.0));
    assert!(row.response_time_ms.unwrap() >= 0);
}

#[tokio::test]
async fn payload_round_trips_and_cascades_with_parent() {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    store
        .requests()
        .insert_start("req-1", now_ms(), "POST", "/v1/messages", None, None)
        .await
        .unwrap();

    let request_json = r#"{"model":"claude-sonnet-4-5","messages":[{"role":"user","content":"hi"}]}"#;
    let response_json = r#"{"id":"msg_1","usage":{"input_tokens":3,"output_tokens":5}}"#;
    store
        .requests()
        .insert_payload("req-1", request_json, response_json)
        .await
        .unwrap();

    // Byte-identical round trip.
    let payload = store.requests().get_payload("req-1").await.unwrap().unwrap();
    assert_eq!(payload.request_json, request_json);
    assert_eq!(payload.response_json, response_json);

    // Deleting the parent cascades.
    assert!(store.requests().delete("req-1").await.unwrap());
    assert!(store.requests().get_payload("req-1").await.unwrap().is_none());
}

#[tokio::test]
async fn cleanup_deletes_by_age_and_sweeps_orphans() {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let now = now_ms();
    let hour = 3_600_000;

    // Old request with old payload; fresh request with fresh payload.
    for (id, age) in [("old", 48 * hour), ("fresh", 0)] {
        sqlx::query(
            "INSERT INTO requests (id, timestamp, method, path, success, failover_attempts) \
             VALUES (?, ?, 'POST', '/v1/messages', 1, 0)",
        )
        .bind(id)
        .bind(now - age)
        .execute(store.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO request_payloads (id, request_json, response_json, created_at) \
             VALUES (?, '{}', '{}', ?)",
        )
        .bind(id)
        .bind(now - age)
        .execute(store.pool())
        .await
        .unwrap();
    }
    // Orphan payload with no parent row, recent enough to survive by age.
    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(store.pool())
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO request_payloads (id, request_json, response_json, created_at) \
         VALUES ('ghost', '{}', '{}', ?)",
    )
    .bind(now)
    .execute(store.pool())
    .await
    .unwrap();
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(store.pool())
        .await
        .unwrap();

    let counts = store
        .cleanup_old_requests(24 * hour, Some(24 * hour))
        .await
        .unwrap();

    // Old payload by age, ghost by orphan sweep; old request row by age.
    assert_eq!(counts.removed_payloads, 2);
    assert_eq!(counts.removed_requests, 1);
    assert!(store.requests().get("fresh").await.unwrap().is_some());
    assert!(store.requests().get_payload("fresh").await.unwrap().is_some());
    assert!(store.requests().get("old").await.unwrap().is_none());
}

// ═══════════════════════════════════════════════════════════════════════
//  Analytics
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn analytics_buckets_and_summary_reflect_rows() {
    use claude_relay::db::stats::{AnalyticsFilter, AnalyticsRange};

    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let now = now_ms();
    for (id, success, tokens, cost) in [
        ("r1", true, 600, 0.01),
        ("r2", true, 400, 0.02),
        ("r3", false, 0, 0.0),
    ] {
        sqlx::query(
            "INSERT INTO requests (id, timestamp, method, path, account_used, success, \
             failover_attempts, model, total_tokens, cost_usd, response_time_ms) \
             VALUES (?, ?, 'POST', '/v1/messages', 'A', ?, 0, 'claude-sonnet-4-5', ?, ?, 1000)",
        )
        .bind(id)
        .bind(now - 60_000)
        .bind(success)
        .bind(tokens)
        .bind(cost)
        .execute(store.pool())
        .await
        .unwrap();
    }

    let summary = store.stats().summary().await.unwrap();
    assert_eq!(summary["total_requests"], 3);
    assert_eq!(summary["successful_requests"], 2);
    assert_eq!(summary["accounts"][0]["account"], "A");
    assert_eq!(summary["top_models"][0]["model"], "claude-sonnet-4-5");

    let analytics = store
        .stats()
        .analytics(AnalyticsRange::Hour, &AnalyticsFilter::default())
        .await
        .unwrap();
    let buckets = analytics["buckets"].as_array().unwrap();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0]["requests"], 3);
    assert_eq!(buckets[0]["tokens"], 1000);

    // Success-only filter drops the failed row.
    let filtered = store
        .stats()
        .analytics(
            AnalyticsRange::Hour,
            &AnalyticsFilter {
                success: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(filtered["buckets"][0]["requests"], 2);
}
