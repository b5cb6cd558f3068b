//! Embedded relational store.
//!
//! SQLite via sqlx: WAL journaling, configurable busy_timeout,
//! `synchronous=FULL` (NORMAL in fast mode), foreign keys on. The store is
//! the sole synchronization point for persistent state; every write path
//! runs through [`with_retry`].

pub mod accounts;
pub mod agent_prefs;
pub mod api_keys;
pub mod migrations;
pub mod model_translations;
pub mod oauth_sessions;
pub mod requests;
pub mod settings;
pub mod stats;
pub mod strategies;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::config::Config;
use crate::models::CleanupCounts;

pub use accounts::AccountRepo;
pub use agent_prefs::AgentPreferenceRepo;
pub use api_keys::ApiKeyRepo;
pub use model_translations::ModelTranslationRepo;
pub use oauth_sessions::OAuthSessionRepo;
pub use requests::RequestRepo;
pub use settings::SettingsRepo;
pub use stats::StatsRepo;
pub use strategies::StrategyRepo;

// ── Retry-on-lock ───────────────────────────────────────────────────────

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;
const RETRY_MAX_DELAY_MS: u64 = 5_000;

/// `SQLITE_BUSY` / `SQLITE_LOCKED` surface as database errors whose message
/// carries the lock state; anything else is not retryable.
pub(crate) fn is_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database table is locked") || msg.contains("busy")
        }
        _ => false,
    }
}

/// Run a write, retrying on lock contention with exponential backoff and
/// 10% jitter (3 attempts, 100 ms base, 2x, capped at 5 s).
pub(crate) async fn with_retry<T, F, Fut>(op: &str, f: F) -> Result<T, sqlx::Error>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if is_busy_error(&e) && attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                let backoff =
                    (RETRY_BASE_DELAY_MS << (attempt - 1)).min(RETRY_MAX_DELAY_MS);
                let jitter = (backoff as f64 * 0.1 * rand::thread_rng().r#gen::<f64>()) as u64;
                tracing::warn!(
                    "store: `{}` hit lock contention (attempt {}/{}), retrying in {}ms",
                    op,
                    attempt,
                    RETRY_ATTEMPTS,
                    backoff + jitter
                );
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Store ───────────────────────────────────────────────────────────────

pub struct Store {
    pool: SqlitePool,
    db_path: Option<PathBuf>,
}

impl Store {
    pub async fn open(config: &Config) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(if config.fast_mode {
                SqliteSynchronous::Normal
            } else {
                SqliteSynchronous::Full
            })
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        migrations::run(&pool, Some(config.db_path.as_path())).await?;

        Ok(Self {
            pool,
            db_path: Some(config.db_path.clone()),
        })
    }

    /// Fresh in-memory store for tests.
    pub async fn open_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        // A single connection: each in-memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        migrations::run(&pool, None).await?;
        Ok(Self {
            pool,
            db_path: None,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    // ── Repositories ────────────────────────────────────────────────────

    pub fn accounts(&self) -> AccountRepo<'_> {
        AccountRepo::new(&self.pool)
    }

    pub fn requests(&self) -> RequestRepo<'_> {
        RequestRepo::new(&self.pool)
    }

    pub fn oauth_sessions(&self) -> OAuthSessionRepo<'_> {
        OAuthSessionRepo::new(&self.pool)
    }

    pub fn strategies(&self) -> StrategyRepo<'_> {
        StrategyRepo::new(&self.pool)
    }

    pub fn agent_preferences(&self) -> AgentPreferenceRepo<'_> {
        AgentPreferenceRepo::new(&self.pool)
    }

    pub fn api_keys(&self) -> ApiKeyRepo<'_> {
        ApiKeyRepo::new(&self.pool)
    }

    pub fn model_translations(&self) -> ModelTranslationRepo<'_> {
        ModelTranslationRepo::new(&self.pool)
    }

    pub fn stats(&self) -> StatsRepo<'_> {
        StatsRepo::new(&self.pool)
    }

    pub fn settings(&self) -> SettingsRepo<'_> {
        SettingsRepo::new(&self.pool)
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    /// Passive checkpoint + query-planner statistics refresh.
    pub async fn optimize(&self) -> Result<(), sqlx::Error> {
        sqlx::query("PRAGMA wal_checkpoint(PASSIVE)")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA optimize").execute(&self.pool).await?;
        Ok(())
    }

    /// Truncating checkpoint + VACUUM. Reclaims disk after large deletes.
    pub async fn compact(&self) -> Result<(), sqlx::Error> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Delete payload rows older than `payload_age_ms`, optionally request
    /// metadata older than `request_age_ms`, then sweep orphaned payloads.
    pub async fn cleanup_old_requests(
        &self,
        payload_age_ms: i64,
        request_age_ms: Option<i64>,
    ) -> Result<CleanupCounts, sqlx::Error> {
        let now = now_ms();
        let mut counts = CleanupCounts::default();

        let payload_cutoff = now - payload_age_ms;
        let removed = with_retry("cleanup.payloads", || async move {
            sqlx::query("DELETE FROM request_payloads WHERE created_at < ?")
                .bind(payload_cutoff)
                .execute(&self.pool)
                .await
        })
        .await?;
        counts.removed_payloads += removed.rows_affected();

        if let Some(age) = request_age_ms {
            let request_cutoff = now - age;
            let removed = with_retry("cleanup.requests", || async move {
                sqlx::query("DELETE FROM requests WHERE timestamp < ?")
                    .bind(request_cutoff)
                    .execute(&self.pool)
                    .await
            })
            .await?;
            counts.removed_requests += removed.rows_affected();
        }

        // Orphans: payload rows whose parent request row is gone.
        let removed = with_retry("cleanup.orphans", || async move {
            sqlx::query(
                "DELETE FROM request_payloads WHERE id NOT IN (SELECT id FROM requests)",
            )
            .execute(&self.pool)
            .await
        })
        .await?;
        counts.removed_payloads += removed.rows_affected();

        tracing::info!(
            "store: cleanup removed {} request row(s), {} payload row(s)",
            counts.removed_requests,
            counts.removed_payloads
        );
        Ok(counts)
    }

    /// Truncating checkpoint, then close the pool.
    pub async fn close(&self) {
        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
        {
            tracing::warn!("store: final checkpoint failed: {}", e);
        }
        self.pool.close().await;
    }
}
