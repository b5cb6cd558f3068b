//! Read-only aggregates over request telemetry: dashboard summary and the
//! bucketed analytics series. Aggregations lean on the timestamp/account/
//! model indexes; nothing here writes.

use serde_json::{json, Value};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use super::now_ms;

/// Time window for the analytics endpoint, with its bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyticsRange {
    Hour,
    SixHours,
    Day,
    Week,
    Month,
}

impl AnalyticsRange {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1h" => Some(Self::Hour),
            "6h" => Some(Self::SixHours),
            "24h" => Some(Self::Day),
            "7d" => Some(Self::Week),
            "30d" => Some(Self::Month),
            _ => None,
        }
    }

    pub fn span_ms(&self) -> i64 {
        match self {
            Self::Hour => 3_600_000,
            Self::SixHours => 6 * 3_600_000,
            Self::Day => 24 * 3_600_000,
            Self::Week => 7 * 24 * 3_600_000,
            Self::Month => 30 * 24 * 3_600_000,
        }
    }

    pub fn bucket_ms(&self) -> i64 {
        match self {
            Self::Hour => 60_000,
            Self::SixHours => 300_000,
            Self::Day => 900_000,
            Self::Week => 3_600_000,
            Self::Month => 6 * 3_600_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalyticsFilter {
    pub accounts: Vec<String>,
    pub models: Vec<String>,
    /// `Some(true)` = successes only, `Some(false)` = failures only.
    pub success: Option<bool>,
    pub cumulative: bool,
}

fn placeholders(n: usize) -> String {
    std::iter::repeat_n("?", n).collect::<Vec<_>>().join(", ")
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

/// Bind the shared WHERE-clause arguments in the order the conditions were
/// emitted: since, accounts, models, success.
fn bind_filters<'q>(
    mut q: SqliteQuery<'q>,
    since: i64,
    filter: &'q AnalyticsFilter,
) -> SqliteQuery<'q> {
    q = q.bind(since);
    for account in &filter.accounts {
        q = q.bind(account);
    }
    for model in &filter.models {
        q = q.bind(model);
    }
    if let Some(success) = filter.success {
        q = q.bind(success);
    }
    q
}

pub struct StatsRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> StatsRepo<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Dashboard summary: totals, per-account counters, top models.
    pub async fn summary(&self) -> Result<Value, sqlx::Error> {
        let totals = sqlx::query(
            "SELECT COUNT(*) AS total, \
             COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS succeeded, \
             COALESCE(SUM(total_tokens), 0) AS tokens, \
             COALESCE(SUM(cost_usd), 0.0) AS cost, \
             COALESCE(AVG(response_time_ms), 0.0) AS avg_response_ms \
             FROM requests",
        )
        .fetch_one(self.pool)
        .await?;

        let day_ago = now_ms() - 24 * 3_600_000;
        let recent_errors: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM requests WHERE success = 0 AND timestamp > ?",
        )
        .bind(day_ago)
        .fetch_one(self.pool)
        .await?;

        let per_account = sqlx::query(
            "SELECT account_used, COUNT(*) AS requests, COALESCE(SUM(total_tokens), 0) AS tokens, \
             COALESCE(SUM(cost_usd), 0.0) AS cost \
             FROM requests WHERE account_used IS NOT NULL \
             GROUP BY account_used ORDER BY requests DESC",
        )
        .fetch_all(self.pool)
        .await?;

        let top_models = sqlx::query(
            "SELECT model, COUNT(*) AS requests, COALESCE(SUM(total_tokens), 0) AS tokens \
             FROM requests WHERE model IS NOT NULL \
             GROUP BY model ORDER BY requests DESC LIMIT 10",
        )
        .fetch_all(self.pool)
        .await?;

        let total: i64 = totals.get("total");
        let succeeded: i64 = totals.get("succeeded");
        Ok(json!({
            "total_requests": total,
            "successful_requests": succeeded,
            "success_rate": if total > 0 { succeeded as f64 / total as f64 } else { 0.0 },
            "total_tokens": totals.get::<i64, _>("tokens"),
            "total_cost_usd": totals.get::<f64, _>("cost"),
            "avg_response_time_ms": totals.get::<f64, _>("avg_response_ms"),
            "recent_errors_24h": recent_errors,
            "accounts": per_account
                .iter()
                .map(|row| {
                    json!({
                        "account": row.get::<String, _>("account_used"),
                        "requests": row.get::<i64, _>("requests"),
                        "tokens": row.get::<i64, _>("tokens"),
                        "cost_usd": row.get::<f64, _>("cost"),
                    })
                })
                .collect::<Vec<_>>(),
            "top_models": top_models
                .iter()
                .map(|row| {
                    json!({
                        "model": row.get::<String, _>("model"),
                        "requests": row.get::<i64, _>("requests"),
                        "tokens": row.get::<i64, _>("tokens"),
                    })
                })
                .collect::<Vec<_>>(),
        }))
    }

    /// Bucketed time series plus per-account and per-model breakdowns.
    pub async fn analytics(
        &self,
        range: AnalyticsRange,
        filter: &AnalyticsFilter,
    ) -> Result<Value, sqlx::Error> {
        let since = now_ms() - range.span_ms();
        let bucket = range.bucket_ms();

        let mut conditions = vec!["timestamp > ?".to_string()];
        if !filter.accounts.is_empty() {
            conditions.push(format!(
                "account_used IN ({})",
                placeholders(filter.accounts.len())
            ));
        }
        if !filter.models.is_empty() {
            conditions.push(format!("model IN ({})", placeholders(filter.models.len())));
        }
        if filter.success.is_some() {
            conditions.push("success = ?".to_string());
        }
        let where_clause = conditions.join(" AND ");

        let bucket_sql = format!(
            "SELECT (timestamp / {bucket}) * {bucket} AS bucket, \
             COUNT(*) AS requests, \
             COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS succeeded, \
             COALESCE(SUM(input_tokens), 0) AS input_tokens, \
             COALESCE(SUM(output_tokens), 0) AS output_tokens, \
             COALESCE(SUM(cache_read_input_tokens), 0) AS cache_read_tokens, \
             COALESCE(SUM(total_tokens), 0) AS tokens, \
             COALESCE(SUM(cost_usd), 0.0) AS cost, \
             COALESCE(AVG(response_time_ms), 0.0) AS avg_response_ms, \
             COALESCE(AVG(output_tokens_per_second), 0.0) AS avg_tokens_per_second \
             FROM requests WHERE {where_clause} \
             GROUP BY bucket ORDER BY bucket",
        );

        let rows = bind_filters(sqlx::query(&bucket_sql), since, filter)
            .fetch_all(self.pool)
            .await?;

        let mut running = (0i64, 0i64, 0.0f64);
        let buckets: Vec<Value> = rows
            .iter()
            .map(|row| {
                let mut requests: i64 = row.get("requests");
                let mut tokens: i64 = row.get("tokens");
                let mut cost: f64 = row.get("cost");
                if filter.cumulative {
                    running.0 += requests;
                    running.1 += tokens;
                    running.2 += cost;
                    (requests, tokens, cost) = running;
                }
                let succeeded: i64 = row.get("succeeded");
                let bucket_requests: i64 = row.get("requests");
                json!({
                    "bucket": row.get::<i64, _>("bucket"),
                    "requests": requests,
                    "success_rate": if bucket_requests > 0 {
                        succeeded as f64 / bucket_requests as f64
                    } else {
                        0.0
                    },
                    "input_tokens": row.get::<i64, _>("input_tokens"),
                    "output_tokens": row.get::<i64, _>("output_tokens"),
                    "cache_read_tokens": row.get::<i64, _>("cache_read_tokens"),
                    "tokens": tokens,
                    "cost_usd": cost,
                    "avg_response_time_ms": row.get::<f64, _>("avg_response_ms"),
                    "avg_tokens_per_second": row.get::<f64, _>("avg_tokens_per_second"),
                })
            })
            .collect();

        // p95 over the filtered range, via offset into the ordered set.
        let count_sql = format!(
            "SELECT COUNT(*) FROM requests WHERE {where_clause} AND response_time_ms IS NOT NULL"
        );
        let count: i64 = bind_filters(sqlx::query(&count_sql), since, filter)
            .fetch_one(self.pool)
            .await?
            .get(0);
        let p95 = if count > 0 {
            let offset = (count * 95 / 100).min(count - 1);
            let p95_sql = format!(
                "SELECT response_time_ms FROM requests WHERE {where_clause} \
                 AND response_time_ms IS NOT NULL ORDER BY response_time_ms LIMIT 1 OFFSET {offset}"
            );
            bind_filters(sqlx::query(&p95_sql), since, filter)
                .fetch_optional(self.pool)
                .await?
                .map(|row| row.get::<i64, _>(0))
        } else {
            None
        };

        Ok(json!({
            "range_ms": range.span_ms(),
            "bucket_ms": bucket,
            "mode": if filter.cumulative { "cumulative" } else { "normal" },
            "p95_response_time_ms": p95,
            "buckets": buckets,
        }))
    }
}
