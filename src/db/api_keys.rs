//! Management-surface API keys. Only the SHA-256 hash is stored; the
//! plaintext key is shown exactly once at creation.

use sqlx::sqlite::SqlitePool;

use crate::models::ApiKeyRow;

use super::{now_ms, with_retry};

const SELECT_COLUMNS: &str =
    "id, name, hashed_key, prefix_last_8, created_at, last_used, usage_count, is_active, role";

pub struct ApiKeyRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ApiKeyRepo<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, key: &ApiKeyRow) -> Result<(), sqlx::Error> {
        with_retry("api_keys.insert", || async move {
            sqlx::query(
                "INSERT INTO api_keys (id, name, hashed_key, prefix_last_8, created_at, \
                 last_used, usage_count, is_active, role) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&key.id)
            .bind(&key.name)
            .bind(&key.hashed_key)
            .bind(&key.prefix_last_8)
            .bind(key.created_at)
            .bind(key.last_used)
            .bind(key.usage_count)
            .bind(key.is_active)
            .bind(&key.role)
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<ApiKeyRow>, sqlx::Error> {
        sqlx::query_as::<_, ApiKeyRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM api_keys ORDER BY created_at"
        ))
        .fetch_all(self.pool)
        .await
    }

    pub async fn active(&self) -> Result<Vec<ApiKeyRow>, sqlx::Error> {
        sqlx::query_as::<_, ApiKeyRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM api_keys WHERE is_active = 1"
        ))
        .fetch_all(self.pool)
        .await
    }

    pub async fn count_active(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM api_keys WHERE is_active = 1")
            .fetch_one(self.pool)
            .await
    }

    /// Record a successful authentication against this key.
    pub async fn touch(&self, id: &str) -> Result<(), sqlx::Error> {
        let now = now_ms();
        with_retry("api_keys.touch", || async move {
            sqlx::query(
                "UPDATE api_keys SET last_used = ?, usage_count = usage_count + 1 WHERE id = ?",
            )
            .bind(now)
            .bind(id)
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn deactivate(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = with_retry("api_keys.deactivate", || async move {
            sqlx::query("UPDATE api_keys SET is_active = 0 WHERE id = ?")
                .bind(id)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = with_retry("api_keys.delete", || async move {
            sqlx::query("DELETE FROM api_keys WHERE id = ?")
                .bind(id)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
