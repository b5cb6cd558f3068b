//! Idempotent, hand-rolled schema evolution.
//!
//! Databases written by any prior version must open cleanly, so the routine
//! is: create missing tables/indexes, add missing additive columns with
//! their documented defaults, then apply a small fixed set of legacy
//! rewrites. Each step runs in its own transaction; a file-copy backup is
//! taken before any destructive rewrite. Running twice yields the same
//! schema and zero additional row rewrites.

use std::collections::HashSet;
use std::path::Path;

use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::validation::sanitize_account_name;

const CREATE_ACCOUNTS: &str = "CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    provider TEXT NOT NULL DEFAULT 'anthropic',
    auth_type TEXT NOT NULL DEFAULT 'oauth',
    access_token TEXT,
    refresh_token TEXT,
    api_key TEXT,
    expires_at INTEGER,
    created_at INTEGER NOT NULL,
    last_used INTEGER,
    request_count INTEGER NOT NULL DEFAULT 0,
    total_requests INTEGER NOT NULL DEFAULT 0,
    session_start INTEGER,
    session_request_count INTEGER NOT NULL DEFAULT 0,
    rate_limited_until INTEGER,
    rate_limit_status TEXT,
    rate_limit_reset INTEGER,
    rate_limit_remaining INTEGER,
    paused INTEGER NOT NULL DEFAULT 0,
    priority INTEGER NOT NULL DEFAULT 0,
    auto_fallback_enabled INTEGER NOT NULL DEFAULT 1,
    auto_refresh_enabled INTEGER NOT NULL DEFAULT 1,
    custom_endpoint TEXT,
    model_mappings TEXT
)";

const CREATE_REQUESTS: &str = "CREATE TABLE IF NOT EXISTS requests (
    id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    account_used TEXT,
    status_code INTEGER,
    success INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    response_time_ms INTEGER,
    failover_attempts INTEGER NOT NULL DEFAULT 0,
    model TEXT,
    input_tokens INTEGER,
    output_tokens INTEGER,
    cache_read_input_tokens INTEGER,
    cache_creation_input_tokens INTEGER,
    total_tokens INTEGER,
    cost_usd REAL,
    output_tokens_per_second REAL,
    agent_used TEXT,
    api_key_id TEXT
)";

const CREATE_REQUEST_PAYLOADS: &str = "CREATE TABLE IF NOT EXISTS request_payloads (
    id TEXT PRIMARY KEY REFERENCES requests(id) ON DELETE CASCADE,
    request_json TEXT NOT NULL,
    response_json TEXT NOT NULL,
    created_at INTEGER NOT NULL
)";

const CREATE_OAUTH_SESSIONS: &str = "CREATE TABLE IF NOT EXISTS oauth_sessions (
    id TEXT PRIMARY KEY,
    account_name TEXT NOT NULL,
    pkce_verifier TEXT NOT NULL,
    mode TEXT NOT NULL DEFAULT 'claude-oauth',
    custom_endpoint TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
)";

const CREATE_STRATEGIES: &str = "CREATE TABLE IF NOT EXISTS strategies (
    name TEXT PRIMARY KEY,
    config TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)";

const CREATE_AGENT_PREFERENCES: &str = "CREATE TABLE IF NOT EXISTS agent_preferences (
    agent_id TEXT PRIMARY KEY,
    model TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)";

const CREATE_API_KEYS: &str = "CREATE TABLE IF NOT EXISTS api_keys (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    hashed_key TEXT NOT NULL,
    prefix_last_8 TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_used INTEGER,
    usage_count INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    role TEXT NOT NULL DEFAULT 'api-only'
)";

const CREATE_MODEL_TRANSLATIONS: &str = "CREATE TABLE IF NOT EXISTS model_translations (
    source TEXT PRIMARY KEY,
    target TEXT NOT NULL
)";

const CREATE_APP_CONFIG: &str = "CREATE TABLE IF NOT EXISTS app_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_requests_account ON requests(account_used)",
    "CREATE INDEX IF NOT EXISTS idx_requests_model ON requests(model)",
    "CREATE INDEX IF NOT EXISTS idx_payloads_created ON request_payloads(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_oauth_sessions_expiry ON oauth_sessions(expires_at)",
];

/// Additive columns and their documented defaults, applied when absent.
/// Order matters only for readability.
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("accounts", "session_start", "INTEGER"),
    ("accounts", "session_request_count", "INTEGER NOT NULL DEFAULT 0"),
    ("accounts", "rate_limited_until", "INTEGER"),
    ("accounts", "rate_limit_status", "TEXT"),
    ("accounts", "rate_limit_reset", "INTEGER"),
    ("accounts", "rate_limit_remaining", "INTEGER"),
    ("accounts", "paused", "INTEGER NOT NULL DEFAULT 0"),
    ("accounts", "priority", "INTEGER NOT NULL DEFAULT 0"),
    ("accounts", "auto_fallback_enabled", "INTEGER NOT NULL DEFAULT 1"),
    ("accounts", "auto_refresh_enabled", "INTEGER NOT NULL DEFAULT 1"),
    ("accounts", "custom_endpoint", "TEXT"),
    ("accounts", "model_mappings", "TEXT"),
    ("requests", "cache_read_input_tokens", "INTEGER"),
    ("requests", "cache_creation_input_tokens", "INTEGER"),
    ("requests", "cost_usd", "REAL"),
    ("requests", "output_tokens_per_second", "REAL"),
    ("requests", "agent_used", "TEXT"),
    ("requests", "api_key_id", "TEXT"),
    ("api_keys", "role", "TEXT NOT NULL DEFAULT 'api-only'"),
    ("oauth_sessions", "custom_endpoint", "TEXT"),
];

/// Obsolete columns removed by table rebuild.
const OBSOLETE_ACCOUNT_COLUMNS: &[&str] = &["account_tier", "tier"];

pub async fn run(pool: &SqlitePool, db_path: Option<&Path>) -> Result<(), sqlx::Error> {
    create_tables(pool).await?;
    add_missing_columns(pool).await?;
    rebuild_accounts_if_needed(pool, db_path).await?;
    rewrite_legacy_oauth_mode(pool).await?;
    relocate_api_keys(pool).await?;
    sanitize_account_names(pool).await?;
    Ok(())
}

async fn create_tables(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for stmt in [
        CREATE_ACCOUNTS,
        CREATE_REQUESTS,
        CREATE_REQUEST_PAYLOADS,
        CREATE_OAUTH_SESSIONS,
        CREATE_STRATEGIES,
        CREATE_AGENT_PREFERENCES,
        CREATE_API_KEYS,
        CREATE_MODEL_TRANSLATIONS,
        CREATE_APP_CONFIG,
    ] {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }
    for stmt in INDEXES {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }
    tx.commit().await
}

async fn column_names(pool: &SqlitePool, table: &str) -> Result<HashSet<String>, sqlx::Error> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect())
}

async fn add_missing_columns(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut known: std::collections::HashMap<&str, HashSet<String>> =
        std::collections::HashMap::new();
    for (table, column, decl) in ADDITIVE_COLUMNS {
        if !known.contains_key(table) {
            known.insert(table, column_names(pool, table).await?);
        }
        let columns = known.get_mut(table).expect("just inserted");
        if !columns.contains(*column) {
            tracing::info!("migrations: adding column {}.{}", table, column);
            sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
                .execute(pool)
                .await?;
            columns.insert((*column).to_string());
        }
    }
    Ok(())
}

/// Copy the database file aside before a destructive rewrite. Skipped for
/// in-memory stores.
fn backup_before_destructive(db_path: Option<&Path>, step: &str) {
    let Some(path) = db_path else { return };
    if !path.exists() {
        return;
    }
    let backup = path.with_extension(format!("db.pre-{step}.bak"));
    match std::fs::copy(path, &backup) {
        Ok(_) => tracing::info!("migrations: backup written to {:?}", backup),
        Err(e) => tracing::warn!("migrations: backup before `{}` failed: {}", step, e),
    }
}

/// Remove obsolete tier columns by rebuild-and-swap: SQLite cannot drop a
/// column in place across the versions we support.
async fn rebuild_accounts_if_needed(
    pool: &SqlitePool,
    db_path: Option<&Path>,
) -> Result<(), sqlx::Error> {
    let columns = column_names(pool, "accounts").await?;
    if !OBSOLETE_ACCOUNT_COLUMNS
        .iter()
        .any(|c| columns.contains(*c))
    {
        return Ok(());
    }

    tracing::info!("migrations: rebuilding accounts table to drop tier columns");
    backup_before_destructive(db_path, "accounts-rebuild");

    // Columns to carry over: canonical set intersected with what exists.
    let canonical = [
        "id",
        "name",
        "provider",
        "auth_type",
        "access_token",
        "refresh_token",
        "api_key",
        "expires_at",
        "created_at",
        "last_used",
        "request_count",
        "total_requests",
        "session_start",
        "session_request_count",
        "rate_limited_until",
        "rate_limit_status",
        "rate_limit_reset",
        "rate_limit_remaining",
        "paused",
        "priority",
        "auto_fallback_enabled",
        "auto_refresh_enabled",
        "custom_endpoint",
        "model_mappings",
    ];
    let carried: Vec<&str> = canonical
        .iter()
        .copied()
        .filter(|c| columns.contains(*c))
        .collect();
    let column_list = carried.join(", ");

    let mut tx = pool.begin().await?;
    sqlx::query(&CREATE_ACCOUNTS.replace(
        "CREATE TABLE IF NOT EXISTS accounts",
        "CREATE TABLE accounts_new",
    ))
    .execute(&mut *tx)
    .await?;
    sqlx::query(&format!(
        "INSERT INTO accounts_new ({column_list}) SELECT {column_list} FROM accounts"
    ))
    .execute(&mut *tx)
    .await?;
    sqlx::query("DROP TABLE accounts").execute(&mut *tx).await?;
    sqlx::query("ALTER TABLE accounts_new RENAME TO accounts")
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}

/// `mode='max'` predates the console/claude-oauth split.
async fn rewrite_legacy_oauth_mode(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let result = sqlx::query("UPDATE oauth_sessions SET mode = 'claude-oauth' WHERE mode = 'max'")
        .execute(pool)
        .await?;
    if result.rows_affected() > 0 {
        tracing::info!(
            "migrations: rewrote {} legacy oauth mode row(s)",
            result.rows_affected()
        );
    }
    Ok(())
}

/// Early versions stored API keys for key-based providers in the
/// refresh_token column.
async fn relocate_api_keys(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let result = sqlx::query(
        "UPDATE accounts SET api_key = refresh_token, refresh_token = NULL, access_token = NULL
         WHERE auth_type = 'api_key' AND api_key IS NULL AND refresh_token IS NOT NULL",
    )
    .execute(pool)
    .await?;
    if result.rows_affected() > 0 {
        tracing::info!(
            "migrations: relocated {} stored API key(s)",
            result.rows_affected()
        );
    }
    Ok(())
}

/// Force account names into `[A-Za-z0-9_-]+`, de-duplicating collisions by
/// numeric suffix.
async fn sanitize_account_names(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let rows = sqlx::query("SELECT id, name FROM accounts")
        .fetch_all(pool)
        .await?;

    let mut taken: HashSet<String> = rows
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect();

    let mut tx = pool.begin().await?;
    let mut rewritten = 0u64;
    for row in &rows {
        let id: String = row.get("id");
        let name: String = row.get("name");
        if crate::validation::ACCOUNT_NAME_RE.is_match(&name) {
            continue;
        }
        let base = sanitize_account_name(&name);
        let mut candidate = base.clone();
        let mut suffix = 2;
        while taken.contains(&candidate) {
            candidate = format!("{base}-{suffix}");
            suffix += 1;
        }
        taken.remove(&name);
        taken.insert(candidate.clone());
        sqlx::query("UPDATE accounts SET name = ? WHERE id = ?")
            .bind(&candidate)
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        rewritten += 1;
    }
    tx.commit().await?;
    if rewritten > 0 {
        tracing::info!("migrations: sanitized {} account name(s)", rewritten);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().in_memory(true).foreign_keys(true))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = memory_pool().await;
        run(&pool, None).await.unwrap();
        let first = column_names(&pool, "accounts").await.unwrap();
        run(&pool, None).await.unwrap();
        let second = column_names(&pool, "accounts").await.unwrap();
        assert_eq!(first, second);
        assert!(first.contains("priority"));
        assert!(first.contains("model_mappings"));
    }

    #[tokio::test]
    async fn tier_columns_are_dropped_by_rebuild() {
        let pool = memory_pool().await;
        // Seed a pre-rebuild schema carrying the obsolete column.
        sqlx::query(
            "CREATE TABLE accounts (
                id TEXT PRIMARY KEY, name TEXT NOT NULL UNIQUE,
                provider TEXT NOT NULL DEFAULT 'anthropic',
                auth_type TEXT NOT NULL DEFAULT 'oauth',
                access_token TEXT, refresh_token TEXT, api_key TEXT,
                expires_at INTEGER, created_at INTEGER NOT NULL,
                last_used INTEGER, request_count INTEGER NOT NULL DEFAULT 0,
                total_requests INTEGER NOT NULL DEFAULT 0,
                account_tier INTEGER
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO accounts (id, name, created_at, account_tier) VALUES ('a1', 'legacy', 1, 5)",
        )
        .execute(&pool)
        .await
        .unwrap();

        run(&pool, None).await.unwrap();

        let columns = column_names(&pool, "accounts").await.unwrap();
        assert!(!columns.contains("account_tier"));
        let name: String = sqlx::query_scalar("SELECT name FROM accounts WHERE id = 'a1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(name, "legacy");
    }

    #[tokio::test]
    async fn legacy_max_mode_is_rewritten() {
        let pool = memory_pool().await;
        run(&pool, None).await.unwrap();
        sqlx::query(
            "INSERT INTO oauth_sessions (id, account_name, pkce_verifier, mode, created_at, expires_at)
             VALUES ('s1', 'acc', 'v', 'max', 0, 9999999999999)",
        )
        .execute(&pool)
        .await
        .unwrap();

        run(&pool, None).await.unwrap();

        let mode: String = sqlx::query_scalar("SELECT mode FROM oauth_sessions WHERE id = 's1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode, "claude-oauth");
    }

    #[tokio::test]
    async fn api_keys_move_out_of_refresh_token() {
        let pool = memory_pool().await;
        run(&pool, None).await.unwrap();
        sqlx::query(
            "INSERT INTO accounts (id, name, provider, auth_type, refresh_token, created_at)
             VALUES ('a1', 'console', 'claude-console', 'api_key', 'sk-key-in-wrong-column', 1)",
        )
        .execute(&pool)
        .await
        .unwrap();

        run(&pool, None).await.unwrap();

        let row = sqlx::query("SELECT api_key, refresh_token FROM accounts WHERE id = 'a1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(
            row.get::<Option<String>, _>("api_key").as_deref(),
            Some("sk-key-in-wrong-column")
        );
        assert_eq!(row.get::<Option<String>, _>("refresh_token"), None);
    }

    #[tokio::test]
    async fn invalid_names_are_sanitized_with_suffix_dedupe() {
        let pool = memory_pool().await;
        run(&pool, None).await.unwrap();
        for (id, name) in [("a1", "My Account"), ("a2", "My-Account"), ("a3", "My&Account")] {
            sqlx::query("INSERT INTO accounts (id, name, created_at) VALUES (?, ?, 1)")
                .bind(id)
                .bind(name)
                .execute(&pool)
                .await
                .unwrap();
        }

        run(&pool, None).await.unwrap();

        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM accounts ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert!(names.iter().all(|n| crate::validation::ACCOUNT_NAME_RE.is_match(n)));
        let unique: HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), 3);
    }
}
