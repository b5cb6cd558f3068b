//! Ephemeral PKCE session rows (TTL ≤ 10 minutes).

use sqlx::sqlite::SqlitePool;

use crate::models::OAuthSession;

use super::with_retry;

pub struct OAuthSessionRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> OAuthSessionRepo<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, session: &OAuthSession) -> Result<(), sqlx::Error> {
        with_retry("oauth_sessions.insert", || async move {
            sqlx::query(
                "INSERT INTO oauth_sessions (id, account_name, pkce_verifier, mode, \
                 custom_endpoint, created_at, expires_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&session.id)
            .bind(&session.account_name)
            .bind(&session.pkce_verifier)
            .bind(&session.mode)
            .bind(session.custom_endpoint.as_deref())
            .bind(session.created_at)
            .bind(session.expires_at)
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<OAuthSession>, sqlx::Error> {
        sqlx::query_as::<_, OAuthSession>(
            "SELECT id, account_name, pkce_verifier, mode, custom_endpoint, created_at, \
             expires_at FROM oauth_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<(), sqlx::Error> {
        with_retry("oauth_sessions.delete", || async move {
            sqlx::query("DELETE FROM oauth_sessions WHERE id = ?")
                .bind(id)
                .execute(self.pool)
                .await
                .map(|_| ())
        })
        .await
    }

    /// Expiry sweep; returns how many stale sessions were removed.
    pub async fn delete_expired(&self, now_ms: i64) -> Result<u64, sqlx::Error> {
        let result = with_retry("oauth_sessions.delete_expired", || async move {
            sqlx::query("DELETE FROM oauth_sessions WHERE expires_at < ?")
                .bind(now_ms)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected())
    }
}
