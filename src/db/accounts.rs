//! Account repository. Credentials are sealed on write and opened on read
//! (see `crypto`); callers only ever see plaintext values.

use sqlx::sqlite::SqlitePool;

use crate::crypto;
use crate::models::Account;

use super::{now_ms, with_retry};

const SELECT_COLUMNS: &str = "id, name, provider, auth_type, access_token, refresh_token, api_key, \
     expires_at, created_at, last_used, request_count, total_requests, session_start, \
     session_request_count, rate_limited_until, rate_limit_status, rate_limit_reset, \
     rate_limit_remaining, paused, priority, auto_fallback_enabled, auto_refresh_enabled, \
     custom_endpoint, model_mappings";

pub struct AccountRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> AccountRepo<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    fn unseal(mut account: Account) -> Account {
        account.access_token = crypto::open_opt(account.access_token.as_deref());
        account.refresh_token = crypto::open_opt(account.refresh_token.as_deref());
        account.api_key = crypto::open_opt(account.api_key.as_deref());
        account
    }

    pub async fn insert(&self, account: &Account) -> Result<(), sqlx::Error> {
        let sealed_access = crypto::seal_opt(account.access_token.as_deref());
        let sealed_refresh = crypto::seal_opt(account.refresh_token.as_deref());
        let sealed_key = crypto::seal_opt(account.api_key.as_deref());
        // Copy-only captures keep the retry closure re-invocable.
        let access_token = sealed_access.as_deref();
        let refresh_token = sealed_refresh.as_deref();
        let api_key = sealed_key.as_deref();
        with_retry("accounts.insert", || async move {
            sqlx::query(
                "INSERT INTO accounts (id, name, provider, auth_type, access_token, refresh_token, \
                 api_key, expires_at, created_at, last_used, request_count, total_requests, \
                 session_start, session_request_count, rate_limited_until, rate_limit_status, \
                 rate_limit_reset, rate_limit_remaining, paused, priority, auto_fallback_enabled, \
                 auto_refresh_enabled, custom_endpoint, model_mappings) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&account.id)
            .bind(&account.name)
            .bind(&account.provider)
            .bind(&account.auth_type)
            .bind(access_token)
            .bind(refresh_token)
            .bind(api_key)
            .bind(account.expires_at)
            .bind(account.created_at)
            .bind(account.last_used)
            .bind(account.request_count)
            .bind(account.total_requests)
            .bind(account.session_start)
            .bind(account.session_request_count)
            .bind(account.rate_limited_until)
            .bind(account.rate_limit_status.as_deref())
            .bind(account.rate_limit_reset)
            .bind(account.rate_limit_remaining)
            .bind(account.paused)
            .bind(account.priority)
            .bind(account.auto_fallback_enabled)
            .bind(account.auto_refresh_enabled)
            .bind(account.custom_endpoint.as_deref())
            .bind(account.model_mappings.as_deref())
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn all(&self) -> Result<Vec<Account>, sqlx::Error> {
        let rows = sqlx::query_as::<_, Account>(&format!(
            "SELECT {SELECT_COLUMNS} FROM accounts ORDER BY name"
        ))
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(Self::unseal).collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query_as::<_, Account>(&format!(
            "SELECT {SELECT_COLUMNS} FROM accounts WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(Self::unseal))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query_as::<_, Account>(&format!(
            "SELECT {SELECT_COLUMNS} FROM accounts WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(Self::unseal))
    }

    pub async fn delete(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = with_retry("accounts.delete", || async move {
            sqlx::query("DELETE FROM accounts WHERE id = ?")
                .bind(id)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn rename(&self, id: &str, new_name: &str) -> Result<bool, sqlx::Error> {
        let result = with_retry("accounts.rename", || async move {
            sqlx::query("UPDATE accounts SET name = ? WHERE id = ?")
                .bind(new_name)
                .bind(id)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_paused(&self, id: &str, paused: bool) -> Result<bool, sqlx::Error> {
        let result = with_retry("accounts.set_paused", || async move {
            sqlx::query("UPDATE accounts SET paused = ? WHERE id = ?")
                .bind(paused)
                .bind(id)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_priority(&self, id: &str, priority: i64) -> Result<bool, sqlx::Error> {
        let result = with_retry("accounts.set_priority", || async move {
            sqlx::query("UPDATE accounts SET priority = ? WHERE id = ?")
                .bind(priority)
                .bind(id)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_custom_endpoint(
        &self,
        id: &str,
        endpoint: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = with_retry("accounts.set_custom_endpoint", || async move {
            sqlx::query("UPDATE accounts SET custom_endpoint = ? WHERE id = ?")
                .bind(endpoint)
                .bind(id)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_model_mappings(
        &self,
        id: &str,
        mappings_json: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = with_retry("accounts.set_model_mappings", || async move {
            sqlx::query("UPDATE accounts SET model_mappings = ? WHERE id = ?")
                .bind(mappings_json)
                .bind(id)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Persist refreshed OAuth tokens. The refresh token may rotate.
    pub async fn update_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: i64,
    ) -> Result<(), sqlx::Error> {
        let sealed_access = crypto::seal(access_token);
        let sealed_refresh = crypto::seal(refresh_token);
        let access = sealed_access.as_str();
        let refresh = sealed_refresh.as_str();
        with_retry("accounts.update_tokens", || async move {
            sqlx::query(
                "UPDATE accounts SET access_token = ?, refresh_token = ?, expires_at = ? WHERE id = ?",
            )
            .bind(access)
            .bind(refresh)
            .bind(expires_at)
            .bind(id)
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    /// One dispatch used this account: bump counters, stamp `last_used`.
    pub async fn record_usage(&self, id: &str) -> Result<(), sqlx::Error> {
        let now = now_ms();
        with_retry("accounts.record_usage", || async move {
            sqlx::query(
                "UPDATE accounts SET request_count = request_count + 1, \
                 total_requests = total_requests + 1, \
                 session_request_count = session_request_count + 1, \
                 last_used = ? WHERE id = ?",
            )
            .bind(now)
            .bind(id)
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    /// Elect this account as session owner: new window, counter reset.
    pub async fn start_session(&self, id: &str, now_ms: i64) -> Result<(), sqlx::Error> {
        with_retry("accounts.start_session", || async move {
            sqlx::query(
                "UPDATE accounts SET session_start = ?, session_request_count = 0 WHERE id = ?",
            )
            .bind(now_ms)
            .bind(id)
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn reset_session(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = with_retry("accounts.reset_session", || async move {
            sqlx::query(
                "UPDATE accounts SET session_start = NULL, session_request_count = 0, \
                 request_count = 0 WHERE id = ?",
            )
            .bind(id)
            .execute(self.pool)
            .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_rate_limit(
        &self,
        id: &str,
        until_ms: i64,
        status: &str,
        reset_ms: Option<i64>,
        remaining: Option<i64>,
    ) -> Result<(), sqlx::Error> {
        with_retry("accounts.set_rate_limit", || async move {
            sqlx::query(
                "UPDATE accounts SET rate_limited_until = ?, rate_limit_status = ?, \
                 rate_limit_reset = ?, rate_limit_remaining = ? WHERE id = ?",
            )
            .bind(until_ms)
            .bind(status)
            .bind(reset_ms)
            .bind(remaining)
            .bind(id)
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    /// Sweep: clear windows that have elapsed so stale state never lingers
    /// in listings.
    pub async fn clear_expired_rate_limits(&self, now_ms: i64) -> Result<u64, sqlx::Error> {
        let result = with_retry("accounts.clear_expired_rate_limits", || async move {
            sqlx::query(
                "UPDATE accounts SET rate_limited_until = NULL, rate_limit_status = NULL \
                 WHERE rate_limited_until IS NOT NULL AND rate_limited_until < ?",
            )
            .bind(now_ms)
            .execute(self.pool)
            .await
        })
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM accounts")
            .fetch_one(self.pool)
            .await
    }
}
