//! Per-strategy JSON config rows (round-robin cursor, smooth-WRR weights).

use serde_json::Value;
use sqlx::sqlite::SqlitePool;

use super::{now_ms, with_retry};

pub struct StrategyRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> StrategyRepo<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, name: &str) -> Result<Option<Value>, sqlx::Error> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT config FROM strategies WHERE name = ?")
                .bind(name)
                .fetch_optional(self.pool)
                .await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    pub async fn set(&self, name: &str, config: &Value) -> Result<(), sqlx::Error> {
        let encoded = config.to_string();
        let raw = encoded.as_str();
        let now = now_ms();
        with_retry("strategies.set", || async move {
            sqlx::query(
                "INSERT INTO strategies (name, config, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(name) DO UPDATE SET config = excluded.config, \
                 updated_at = excluded.updated_at",
            )
            .bind(name)
            .bind(raw)
            .bind(now)
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }
}
