//! Load-balancing strategies.
//!
//! A strategy turns the live account set into a filtered, ordered candidate
//! list: the first entry is tried first, the rest are failover order. All
//! strategies filter with the availability predicate and respect `priority`
//! as a coarse tie-breaker when the primary key is equal.

use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::models::{Account, RequestMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    LeastRequests,
    RoundRobin,
    Session,
    Weighted,
    WeightedRoundRobin,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeastRequests => "least-requests",
            Self::RoundRobin => "round-robin",
            Self::Session => "session",
            Self::Weighted => "weighted",
            Self::WeightedRoundRobin => "weighted-round-robin",
        }
    }

    pub const ALL: &'static [&'static str] = &[
        "least-requests",
        "round-robin",
        "session",
        "weighted",
        "weighted-round-robin",
    ];
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least-requests" => Ok(Self::LeastRequests),
            "round-robin" => Ok(Self::RoundRobin),
            "session" => Ok(Self::Session),
            "weighted" => Ok(Self::Weighted),
            "weighted-round-robin" => Ok(Self::WeightedRoundRobin),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

// ── Pure ordering helpers ───────────────────────────────────────────────

/// Ascending `request_count`, then `last_used` asc (never-used first),
/// then priority desc, then name for a stable order.
pub fn order_least_requests(accounts: &mut [Account]) {
    accounts.sort_by(|a, b| {
        a.request_count
            .cmp(&b.request_count)
            .then_with(|| {
                a.last_used
                    .unwrap_or(i64::MIN)
                    .cmp(&b.last_used.unwrap_or(i64::MIN))
            })
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Rotate a stably-sorted list by the persisted cursor.
pub fn order_round_robin(accounts: &mut Vec<Account>, cursor: u64) {
    if accounts.is_empty() {
        return;
    }
    accounts.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
    let offset = (cursor % accounts.len() as u64) as usize;
    accounts.rotate_left(offset);
}

/// Weighted random: the first slot is sampled with probability proportional
/// to `priority` (zero priorities weigh 1), repeated without replacement.
/// Equal-priority ties fall back to least-requests order via the sort below.
pub fn order_weighted<R: Rng>(accounts: &mut Vec<Account>, rng: &mut R) {
    order_least_requests(accounts);
    let mut remaining: Vec<Account> = std::mem::take(accounts);
    while !remaining.is_empty() {
        let total: i64 = remaining.iter().map(|a| a.priority.max(0) + 1).sum();
        let mut roll = rng.gen_range(0..total);
        let mut picked = 0;
        for (i, acc) in remaining.iter().enumerate() {
            let weight = acc.priority.max(0) + 1;
            if roll < weight {
                picked = i;
                break;
            }
            roll -= weight;
        }
        accounts.push(remaining.remove(picked));
    }
}

/// Smooth weighted round-robin: the leader is picked deterministically in
/// proportion to `priority` via running current-weights carried in `state`;
/// the failover tail is ordered by priority desc then least-requests and
/// does not advance the schedule. Leader ties break by request_count asc
/// then name.
pub fn order_weighted_round_robin(
    accounts: &mut Vec<Account>,
    state: &mut serde_json::Map<String, serde_json::Value>,
) {
    if accounts.is_empty() {
        return;
    }
    let total: i64 = accounts.iter().map(|a| a.priority.max(0) + 1).sum();

    let mut best: Option<usize> = None;
    let mut best_weight = i64::MIN;
    for (i, acc) in accounts.iter().enumerate() {
        let weight = acc.priority.max(0) + 1;
        let current = state.get(&acc.id).and_then(|v| v.as_i64()).unwrap_or(0) + weight;
        state.insert(acc.id.clone(), json!(current));
        let better = match best {
            None => true,
            Some(b) => {
                current > best_weight
                    || (current == best_weight
                        && (acc.request_count, &acc.name)
                            < (accounts[b].request_count, &accounts[b].name))
            }
        };
        if better {
            best = Some(i);
            best_weight = current;
        }
    }

    let leader = accounts.remove(best.expect("non-empty accounts"));
    let current = state.get(&leader.id).and_then(|v| v.as_i64()).unwrap_or(0);
    state.insert(leader.id.clone(), json!(current - total));

    accounts.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.request_count.cmp(&b.request_count))
            .then_with(|| a.name.cmp(&b.name))
    });
    accounts.insert(0, leader);
}

/// The account currently owning an active session window, if any.
/// The most recently started active session wins.
pub fn active_session_owner(accounts: &[Account], now_ms: i64, duration_ms: i64) -> Option<usize> {
    accounts
        .iter()
        .enumerate()
        .filter(|(_, a)| {
            a.session_start
                .is_some_and(|start| now_ms - start < duration_ms)
        })
        .max_by_key(|(_, a)| a.session_start)
        .map(|(i, _)| i)
}

/// Sticky-session ordering: owner first, rest by least-requests. Returns the
/// id of a newly elected owner when no session was active.
pub fn order_session(
    accounts: &mut Vec<Account>,
    now_ms: i64,
    duration_ms: i64,
) -> Option<String> {
    match active_session_owner(accounts, now_ms, duration_ms) {
        Some(idx) => {
            let owner = accounts.remove(idx);
            order_least_requests(accounts);
            accounts.insert(0, owner);
            None
        }
        None => {
            order_least_requests(accounts);
            accounts.first().map(|a| a.id.clone())
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────────

/// Strategy state persisted between requests (round-robin cursor, smooth
/// WRR weights, session elections) lives in the store; the engine loads it,
/// orders, and writes it back.
pub struct StrategyEngine {
    store: std::sync::Arc<crate::db::Store>,
}

impl StrategyEngine {
    pub fn new(store: std::sync::Arc<crate::db::Store>) -> Self {
        Self { store }
    }

    /// Filter to available accounts and order per the active strategy.
    pub async fn select(
        &self,
        kind: StrategyKind,
        accounts: &[Account],
        _meta: &RequestMeta,
        session_duration_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<Account>, sqlx::Error> {
        let mut candidates: Vec<Account> = accounts
            .iter()
            .filter(|a| a.is_available(now_ms))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(candidates);
        }

        match kind {
            StrategyKind::LeastRequests => order_least_requests(&mut candidates),
            StrategyKind::RoundRobin => {
                let config = self.store.strategies().get(kind.as_str()).await?;
                let cursor = config
                    .as_ref()
                    .and_then(|c| c.get("cursor"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                order_round_robin(&mut candidates, cursor);
                self.store
                    .strategies()
                    .set(kind.as_str(), &json!({ "cursor": cursor.wrapping_add(1) }))
                    .await?;
            }
            StrategyKind::Session => {
                let new_owner = order_session(&mut candidates, now_ms, session_duration_ms);
                if let Some(owner_id) = new_owner {
                    self.store
                        .accounts()
                        .start_session(&owner_id, now_ms)
                        .await?;
                    tracing::debug!(account = %owner_id, "session strategy: elected new owner");
                }
            }
            StrategyKind::Weighted => {
                order_weighted(&mut candidates, &mut rand::thread_rng());
            }
            StrategyKind::WeightedRoundRobin => {
                let config = self.store.strategies().get(kind.as_str()).await?;
                let mut state = config
                    .as_ref()
                    .and_then(|c| c.get("weights"))
                    .and_then(|v| v.as_object().cloned())
                    .unwrap_or_default();
                // Drop weights for accounts that no longer exist.
                state.retain(|id, _| candidates.iter().any(|a| &a.id == id));
                order_weighted_round_robin(&mut candidates, &mut state);
                self.store
                    .strategies()
                    .set(kind.as_str(), &json!({ "weights": state }))
                    .await?;
            }
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str, request_count: i64, priority: i64) -> Account {
        Account {
            id: id.into(),
            name: id.into(),
            provider: "anthropic".into(),
            auth_type: "oauth".into(),
            access_token: Some("t".into()),
            refresh_token: Some("r".into()),
            api_key: None,
            expires_at: None,
            created_at: 0,
            last_used: None,
            request_count,
            total_requests: request_count,
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

    fn names(accounts: &[Account]) -> Vec<&str> {
        accounts.iter().map(|a| a.name.as_str()).collect()
    }

    #[test]
    fn least_requests_orders_ascending_with_last_used_tiebreak() {
        let mut accounts = vec![account("b", 5, 0), account("a", 2, 0), account("c", 2, 0)];
        accounts[2].last_used = Some(100); // "c" used more recently than "a"
        accounts[1].last_used = Some(50);
        order_least_requests(&mut accounts);
        assert_eq!(names(&accounts), vec!["a", "c", "b"]);
    }

    #[test]
    fn round_robin_rotates_by_cursor() {
        let mut accounts = vec![account("a", 0, 0), account("b", 0, 0), account("c", 0, 0)];
        order_round_robin(&mut accounts, 4); // 4 % 3 == 1
        assert_eq!(names(&accounts), vec!["b", "c", "a"]);
    }

    #[test]
    fn weighted_keeps_every_account_in_the_output() {
        let mut accounts = vec![account("a", 0, 10), account("b", 0, 1), account("c", 0, 0)];
        order_weighted(&mut accounts, &mut rand::thread_rng());
        let mut got = names(&accounts);
        got.sort_unstable();
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[test]
    fn weighted_round_robin_interleaves_by_priority() {
        // Weights: a=5, b=1. Over 6 rounds "a" must lead 5 times, "b" once.
        let mut state = serde_json::Map::new();
        let mut a_leads = 0;
        for _ in 0..6 {
            let mut accounts = vec![account("a", 0, 4), account("b", 0, 0)];
            order_weighted_round_robin(&mut accounts, &mut state);
            if accounts[0].name == "a" {
                a_leads += 1;
            }
        }
        assert_eq!(a_leads, 5);
    }

    #[test]
    fn session_prefers_active_owner() {
        let now = 1_000_000;
        let mut accounts = vec![account("a", 9, 0), account("b", 0, 0)];
        accounts[0].session_start = Some(now - 1_000);
        let elected = order_session(&mut accounts, now, 10_000);
        assert!(elected.is_none());
        assert_eq!(names(&accounts), vec!["a", "b"]);
    }

    #[test]
    fn session_reelects_by_least_requests_after_window() {
        let now = 1_000_000;
        let mut accounts = vec![account("a", 9, 0), account("b", 0, 0)];
        accounts[0].session_start = Some(now - 20_000); // expired window
        let elected = order_session(&mut accounts, now, 10_000);
        assert_eq!(elected.as_deref(), Some("b"));
        assert_eq!(names(&accounts), vec!["b", "a"]);
    }

    #[test]
    fn strategy_names_round_trip_the_closed_set() {
        for name in StrategyKind::ALL {
            assert_eq!(name.parse::<StrategyKind>().unwrap().as_str(), *name);
        }
        assert!("priority-first".parse::<StrategyKind>().is_err());
    }
}
