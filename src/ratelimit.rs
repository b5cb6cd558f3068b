//! Per-account rate-limit bookkeeping.
//!
//! On a 429 (or provider overload signal) the tracker derives the cooldown
//! window from response headers, hides the account from selection until it
//! elapses, and emits a log event. A scheduled sweep clears expired windows
//! so listings never show stale state.

use std::sync::Arc;

use http::HeaderMap;

use crate::db::Store;
use crate::events::{EventBus, LogEvent};
use crate::models::Account;

/// Cooldown assumed when the upstream gives no reset hint.
pub const DEFAULT_COOLDOWN_MS: i64 = 60_000;

/// Reset time in epoch ms, from whichever header the provider speaks.
pub fn parse_reset_ms(headers: &HeaderMap, now_ms: i64) -> Option<i64> {
    let header_i64 = |name: &str| {
        headers
            .get(name)?
            .to_str()
            .ok()?
            .trim()
            .parse::<i64>()
            .ok()
    };

    // `retry-after: <seconds>` is relative.
    if let Some(secs) = header_i64("retry-after") {
        return Some(now_ms + secs.max(0) * 1000);
    }
    // Anthropic unified reset is absolute epoch seconds.
    if let Some(epoch_secs) = header_i64("anthropic-ratelimit-unified-reset") {
        return Some(epoch_secs * 1000);
    }
    // Generic aggregator headers: epoch seconds (or ms when large enough).
    if let Some(value) = header_i64("x-ratelimit-reset") {
        return Some(if value > 10_000_000_000 {
            value
        } else {
            value * 1000
        });
    }
    None
}

pub fn parse_remaining(headers: &HeaderMap) -> Option<i64> {
    for name in [
        "anthropic-ratelimit-unified-remaining",
        "anthropic-ratelimit-requests-remaining",
        "x-ratelimit-remaining",
    ] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if let Ok(n) = value.trim().parse() {
                return Some(n);
            }
        }
    }
    None
}

pub fn parse_status(headers: &HeaderMap) -> String {
    headers
        .get("anthropic-ratelimit-unified-status")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("rate_limited")
        .to_string()
}

pub struct RateLimitTracker {
    store: Arc<Store>,
    events: Arc<EventBus>,
}

impl RateLimitTracker {
    pub fn new(store: Arc<Store>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    /// Record an upstream rate-limit response against `account`. Returns
    /// the moment the account becomes selectable again (epoch ms).
    pub async fn mark_rate_limited(
        &self,
        account: &Account,
        headers: &HeaderMap,
        now_ms: i64,
    ) -> Result<i64, sqlx::Error> {
        let reset_ms = parse_reset_ms(headers, now_ms);
        let until_ms = reset_ms.unwrap_or(now_ms + DEFAULT_COOLDOWN_MS).max(now_ms);
        let remaining = parse_remaining(headers);
        let status = parse_status(headers);

        self.store
            .accounts()
            .set_rate_limit(&account.id, until_ms, &status, reset_ms, remaining)
            .await?;

        let message = format!(
            "account {} rate limited for {}s (status: {})",
            account.name,
            (until_ms - now_ms) / 1000,
            status
        );
        tracing::warn!("{}", message);
        self.events
            .logs
            .publish(LogEvent {
                timestamp: now_ms,
                level: "WARN".into(),
                target: "ratelimit".into(),
                message,
            })
            .await;

        Ok(until_ms)
    }

    /// Clear windows that have elapsed.
    pub async fn sweep(&self, now_ms: i64) -> Result<u64, sqlx::Error> {
        let cleared = self.store.accounts().clear_expired_rate_limits(now_ms).await?;
        if cleared > 0 {
            tracing::debug!("ratelimit: cleared {} expired window(s)", cleared);
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn retry_after_is_relative_seconds() {
        let now = 1_000_000;
        let h = headers(&[("retry-after", "30")]);
        assert_eq!(parse_reset_ms(&h, now), Some(now + 30_000));
    }

    #[test]
    fn unified_reset_is_epoch_seconds() {
        let h = headers(&[("anthropic-ratelimit-unified-reset", "1750000000")]);
        assert_eq!(parse_reset_ms(&h, 0), Some(1_750_000_000_000));
    }

    #[test]
    fn generic_reset_handles_seconds_and_millis() {
        let h = headers(&[("x-ratelimit-reset", "1750000000")]);
        assert_eq!(parse_reset_ms(&h, 0), Some(1_750_000_000_000));
        let h = headers(&[("x-ratelimit-reset", "1750000000000")]);
        assert_eq!(parse_reset_ms(&h, 0), Some(1_750_000_000_000));
    }

    #[test]
    fn missing_headers_yield_no_reset() {
        assert_eq!(parse_reset_ms(&HeaderMap::new(), 123), None);
        assert_eq!(parse_remaining(&HeaderMap::new()), None);
        assert_eq!(parse_status(&HeaderMap::new()), "rate_limited");
    }

    #[test]
    fn remaining_prefers_anthropic_headers() {
        let h = headers(&[
            ("x-ratelimit-remaining", "9"),
            ("anthropic-ratelimit-unified-remaining", "3"),
        ]);
        assert_eq!(parse_remaining(&h), Some(3));
    }
}
