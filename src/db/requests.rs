//! Request telemetry repository: meta rows, payload archive, listings.

use sqlx::sqlite::SqlitePool;

use crate::models::{RequestPayloadRow, RequestRow, TokenUsage};

use super::{now_ms, with_retry};

const SELECT_COLUMNS: &str = "id, timestamp, method, path, account_used, status_code, success, \
     error_message, response_time_ms, failover_attempts, model, input_tokens, output_tokens, \
     cache_read_input_tokens, cache_creation_input_tokens, total_tokens, cost_usd, \
     output_tokens_per_second, agent_used, api_key_id";

/// Everything known about a finished request, applied in one atomic update.
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    pub account_used: Option<String>,
    pub status_code: Option<i64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub response_time_ms: Option<i64>,
    pub failover_attempts: i64,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
    pub output_tokens_per_second: Option<f64>,
}

pub struct RequestRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> RequestRepo<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert the meta row at dispatch start — the row becomes visible to
    /// readers from this point on.
    pub async fn insert_start(
        &self,
        id: &str,
        timestamp: i64,
        method: &str,
        path: &str,
        agent_used: Option<&str>,
        api_key_id: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        with_retry("requests.insert_start", || async move {
            sqlx::query(
                "INSERT INTO requests (id, timestamp, method, path, success, failover_attempts, \
                 agent_used, api_key_id) VALUES (?, ?, ?, ?, 0, 0, ?, ?)",
            )
            .bind(id)
            .bind(timestamp)
            .bind(method)
            .bind(path)
            .bind(agent_used)
            .bind(api_key_id)
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    /// Atomic final update once the dispatch loop has a terminal outcome.
    pub async fn finalize(&self, id: &str, outcome: &RequestOutcome) -> Result<(), sqlx::Error> {
        let total = outcome.usage.map(|u| u.total());
        with_retry("requests.finalize", || async move {
            sqlx::query(
                "UPDATE requests SET account_used = ?, status_code = ?, success = ?, \
                 error_message = ?, response_time_ms = ?, failover_attempts = ?, model = ?, \
                 input_tokens = ?, output_tokens = ?, cache_read_input_tokens = ?, \
                 cache_creation_input_tokens = ?, total_tokens = ?, cost_usd = ?, \
                 output_tokens_per_second = ? WHERE id = ?",
            )
            .bind(outcome.account_used.as_deref())
            .bind(outcome.status_code)
            .bind(outcome.success)
            .bind(outcome.error_message.as_deref())
            .bind(outcome.response_time_ms)
            .bind(outcome.failover_attempts)
            .bind(outcome.model.as_deref())
            .bind(outcome.usage.map(|u| u.input_tokens))
            .bind(outcome.usage.map(|u| u.output_tokens))
            .bind(outcome.usage.map(|u| u.cache_read_input_tokens))
            .bind(outcome.usage.map(|u| u.cache_creation_input_tokens))
            .bind(total)
            .bind(outcome.cost_usd)
            .bind(outcome.output_tokens_per_second)
            .bind(id)
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<RequestRow>, sqlx::Error> {
        sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM requests ORDER BY timestamp DESC LIMIT ? OFFSET ?"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool)
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<RequestRow>, sqlx::Error> {
        sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM requests WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await
    }

    pub async fn insert_payload(
        &self,
        id: &str,
        request_json: &str,
        response_json: &str,
    ) -> Result<(), sqlx::Error> {
        let now = now_ms();
        with_retry("requests.insert_payload", || async move {
            sqlx::query(
                "INSERT OR REPLACE INTO request_payloads (id, request_json, response_json, created_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(request_json)
            .bind(response_json)
            .bind(now)
            .execute(self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn get_payload(&self, id: &str) -> Result<Option<RequestPayloadRow>, sqlx::Error> {
        sqlx::query_as::<_, RequestPayloadRow>(
            "SELECT id, request_json, response_json, created_at FROM request_payloads WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = with_retry("requests.delete", || async move {
            sqlx::query("DELETE FROM requests WHERE id = ?")
                .bind(id)
                .execute(self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM requests")
            .fetch_one(self.pool)
            .await
    }
}
