//! Pricing catalog: `provider → model → dollars per 1M tokens`.
//!
//! One remote fetch per process start (LiteLLM community price table), disk
//! snapshot fallback with TTL, compiled-in bundled table as the floor. The
//! NanoGPT feed is overlaid separately with single-flight coalescing and
//! stale-cache fallback. Unknown models warn exactly once, then cost 0.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::config::{Config, PRICING_FETCH_TIMEOUT};
use crate::models::TokenUsage;

const LITELLM_PRICES_URL: &str =
    "https://raw.githubusercontent.com/BerriAI/litellm/main/model_prices_and_context_window.json";
const NANOGPT_PRICES_URL: &str = "https://nano-gpt.com/api/v1/models";

/// Remote providers preferred over bundled data when both carry a model.
const PREFERRED_PROVIDERS: &[&str] = &["zai", "anthropic"];

/// Remote provider names matching these suffixes are promotional or broken
/// mirrors of the real tables; they are filtered before merging.
const PROBLEMATIC_SUFFIXES: &[&str] = &["-coding-plan", "-special", "-demo", "-free", "-trial"];

const SNAPSHOT_FILE: &str = "claude-relay-pricing.json";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Dollars per 1M tokens.
    pub input: f64,
    pub output: f64,
    pub cache_read: Option<f64>,
    pub cache_write: Option<f64>,
}

impl ModelPricing {
    pub const fn flat(input: f64, output: f64) -> Self {
        Self {
            input,
            output,
            cache_read: None,
            cache_write: None,
        }
    }

    pub const fn cached(input: f64, output: f64, cache_read: f64, cache_write: f64) -> Self {
        Self {
            input,
            output,
            cache_read: Some(cache_read),
            cache_write: Some(cache_write),
        }
    }

    fn is_free(&self) -> bool {
        self.input == 0.0 && self.output == 0.0
    }
}

pub type PricingTable = HashMap<String, HashMap<String, ModelPricing>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    fetched_at_ms: i64,
    table: PricingTable,
}

#[derive(Default)]
struct CatalogState {
    table: PricingTable,
    fetched_at_ms: Option<i64>,
}

pub struct PricingCatalog {
    http: reqwest::Client,
    offline: bool,
    refresh_interval: Duration,
    snapshot_path: PathBuf,
    state: RwLock<CatalogState>,
    nanogpt_inflight: Mutex<()>,
    warned_models: StdMutex<HashSet<String>>,
}

impl PricingCatalog {
    pub fn new(http: reqwest::Client, config: &Config) -> Self {
        Self {
            http,
            offline: config.pricing_offline,
            refresh_interval: Duration::from_secs(config.pricing_refresh_hours * 3600),
            snapshot_path: std::env::temp_dir().join(SNAPSHOT_FILE),
            state: RwLock::new(CatalogState {
                table: bundled_table(),
                fetched_at_ms: None,
            }),
            nanogpt_inflight: Mutex::new(()),
            warned_models: StdMutex::new(HashSet::new()),
        }
    }

    /// Offline catalog for tests: bundled table only, no network.
    pub fn offline_for_tests() -> Self {
        Self {
            http: reqwest::Client::new(),
            offline: true,
            refresh_interval: Duration::from_secs(24 * 3600),
            snapshot_path: std::env::temp_dir().join(SNAPSHOT_FILE),
            state: RwLock::new(CatalogState {
                table: bundled_table(),
                fetched_at_ms: None,
            }),
            nanogpt_inflight: Mutex::new(()),
            warned_models: StdMutex::new(HashSet::new()),
        }
    }

    /// Populate the catalog: remote fetch → disk snapshot → bundled table.
    pub async fn refresh(&self) {
        if self.offline {
            tracing::info!("pricing: offline mode, using snapshot/bundled data");
            self.load_snapshot_or_bundled().await;
            return;
        }

        match self.fetch_remote().await {
            Ok(remote) => {
                let merged = merge_with_bundled(remote);
                let now = chrono::Utc::now().timestamp_millis();
                self.write_snapshot(&merged, now);
                let mut state = self.state.write().await;
                state.table = merged;
                state.fetched_at_ms = Some(now);
                tracing::info!(
                    "pricing: remote catalog loaded ({} providers)",
                    state.table.len()
                );
            }
            Err(e) => {
                tracing::warn!("pricing: remote fetch failed ({}), falling back", e);
                self.load_snapshot_or_bundled().await;
            }
        }
    }

    /// Catalog is older than the refresh interval (or never fetched).
    pub async fn is_stale(&self) -> bool {
        let state = self.state.read().await;
        match state.fetched_at_ms {
            None => true,
            Some(at) => {
                let age = chrono::Utc::now().timestamp_millis() - at;
                age > self.refresh_interval.as_millis() as i64
            }
        }
    }

    async fn fetch_remote(&self) -> Result<PricingTable, reqwest::Error> {
        let body: Value = self
            .http
            .get(LITELLM_PRICES_URL)
            .timeout(PRICING_FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(parse_litellm(&body))
    }

    async fn load_snapshot_or_bundled(&self) {
        if let Some(snapshot) = self.read_snapshot() {
            let age = chrono::Utc::now().timestamp_millis() - snapshot.fetched_at_ms;
            if age <= self.refresh_interval.as_millis() as i64 {
                let mut state = self.state.write().await;
                state.table = merge_with_bundled(snapshot.table);
                state.fetched_at_ms = Some(snapshot.fetched_at_ms);
                tracing::info!("pricing: loaded disk snapshot ({}h old)", age / 3_600_000);
                return;
            }
            tracing::info!("pricing: disk snapshot expired, using bundled table");
        }
        let mut state = self.state.write().await;
        state.table = bundled_table();
    }

    fn read_snapshot(&self) -> Option<Snapshot> {
        let raw = std::fs::read_to_string(&self.snapshot_path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn write_snapshot(&self, table: &PricingTable, fetched_at_ms: i64) {
        let snapshot = Snapshot {
            fetched_at_ms,
            table: table.clone(),
        };
        match serde_json::to_string(&snapshot) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&self.snapshot_path, raw) {
                    tracing::warn!("pricing: snapshot write failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("pricing: snapshot encode failed: {}", e),
        }
    }

    /// Fetch the NanoGPT feed and overlay it under the `nanogpt` provider.
    /// Coalesced: concurrent callers share one fetch. A failed fetch keeps
    /// whatever nanogpt table is already loaded (stale cache beats nothing).
    pub async fn refresh_nanogpt(&self) {
        if self.offline {
            return;
        }
        let _guard = self.nanogpt_inflight.lock().await;
        match self.fetch_nanogpt().await {
            Ok(models) if !models.is_empty() => {
                let count = models.len();
                let mut state = self.state.write().await;
                state.table.insert("nanogpt".to_string(), models);
                tracing::info!("pricing: nanogpt overlay loaded ({} models)", count);
            }
            Ok(_) => tracing::warn!("pricing: nanogpt feed returned no models, keeping cache"),
            Err(e) => tracing::warn!("pricing: nanogpt fetch failed ({}), keeping cache", e),
        }
    }

    async fn fetch_nanogpt(&self) -> Result<HashMap<String, ModelPricing>, reqwest::Error> {
        let body: Value = self
            .http
            .get(NANOGPT_PRICES_URL)
            .timeout(PRICING_FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(parse_nanogpt(&body))
    }

    /// Cost in dollars for one request's token counts. Unknown models warn
    /// once per process, then price at 0.
    pub async fn estimate_cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        let state = self.state.read().await;
        let Some(pricing) = lookup(&state.table, model) else {
            drop(state);
            let mut warned = self.warned_models.lock().expect("warned set poisoned");
            if warned.insert(model.to_string()) {
                tracing::warn!("pricing: no entry for model `{}`, costing 0", model);
            }
            return 0.0;
        };
        cost_for(&pricing, usage)
    }

    /// Full table snapshot (for the config/debug surface).
    pub async fn table(&self) -> PricingTable {
        self.state.read().await.table.clone()
    }
}

/// Per-million rates applied to the four token buckets. Missing cache rates
/// price those buckets at 0.
pub fn cost_for(pricing: &ModelPricing, usage: &TokenUsage) -> f64 {
    let per_token = |dollars_per_million: f64| dollars_per_million / 1_000_000.0;
    usage.input_tokens as f64 * per_token(pricing.input)
        + usage.output_tokens as f64 * per_token(pricing.output)
        + usage.cache_read_input_tokens as f64 * per_token(pricing.cache_read.unwrap_or(0.0))
        + usage.cache_creation_input_tokens as f64 * per_token(pricing.cache_write.unwrap_or(0.0))
}

/// Preferred providers first, then the rest, exact model-id match.
fn lookup(table: &PricingTable, model: &str) -> Option<ModelPricing> {
    for provider in PREFERRED_PROVIDERS {
        if let Some(pricing) = table.get(*provider).and_then(|m| m.get(model)) {
            return Some(*pricing);
        }
    }
    for (provider, models) in table {
        if PREFERRED_PROVIDERS.contains(&provider.as_str()) {
            continue;
        }
        if let Some(pricing) = models.get(model) {
            return Some(*pricing);
        }
    }
    None
}

// ── Remote feed parsing ─────────────────────────────────────────────────

/// LiteLLM publishes per-token costs keyed by model, with the provider in
/// `litellm_provider`. Convert to dollars per 1M.
fn parse_litellm(body: &Value) -> PricingTable {
    let mut table: PricingTable = HashMap::new();
    let Some(entries) = body.as_object() else {
        return table;
    };
    for (model, entry) in entries {
        let Some(provider) = entry.get("litellm_provider").and_then(|p| p.as_str()) else {
            continue;
        };
        let per_million = |field: &str| {
            entry
                .get(field)
                .and_then(|v| v.as_f64())
                .map(|per_token| per_token * 1_000_000.0)
        };
        let (Some(input), Some(output)) = (
            per_million("input_cost_per_token"),
            per_million("output_cost_per_token"),
        ) else {
            continue;
        };
        // Model keys may be provider-qualified ("anthropic/claude-..."): strip.
        let model_id = model.rsplit('/').next().unwrap_or(model).to_string();
        table.entry(provider.to_string()).or_default().insert(
            model_id,
            ModelPricing {
                input,
                output,
                cache_read: per_million("cache_read_input_token_cost"),
                cache_write: per_million("cache_creation_input_token_cost"),
            },
        );
    }
    table
}

/// NanoGPT publishes `{ models: [ { id/name, pricing: { prompt, completion } } ] }`
/// with dollars per 1M already.
fn parse_nanogpt(body: &Value) -> HashMap<String, ModelPricing> {
    let mut models = HashMap::new();
    let Some(list) = body
        .get("models")
        .or_else(|| body.get("data"))
        .and_then(|m| m.as_array())
    else {
        return models;
    };
    for entry in list {
        let Some(id) = entry
            .get("id")
            .or_else(|| entry.get("name"))
            .and_then(|v| v.as_str())
        else {
            continue;
        };
        let pricing = entry.get("pricing").unwrap_or(entry);
        let rate = |field: &str| pricing.get(field).and_then(|v| v.as_f64());
        let (Some(input), Some(output)) = (
            rate("prompt").or_else(|| rate("input")),
            rate("completion").or_else(|| rate("output")),
        ) else {
            continue;
        };
        models.insert(id.to_string(), ModelPricing::flat(input, output));
    }
    models
}

// ── Merge ───────────────────────────────────────────────────────────────

/// Preferred providers come from remote first; remote providers with
/// problematic name suffixes or all-zero-cost models are dropped; bundled
/// entries fill gaps at both provider and model level.
pub fn merge_with_bundled(remote: PricingTable) -> PricingTable {
    let mut merged: PricingTable = HashMap::new();

    for (provider, models) in remote {
        if PROBLEMATIC_SUFFIXES
            .iter()
            .any(|suffix| provider.ends_with(suffix))
        {
            tracing::debug!("pricing: filtering problematic provider `{}`", provider);
            continue;
        }
        if !models.is_empty() && models.values().all(ModelPricing::is_free) {
            tracing::debug!("pricing: filtering all-zero-cost provider `{}`", provider);
            continue;
        }
        merged.insert(provider, models);
    }

    for (provider, bundled_models) in bundled_table() {
        let models = merged.entry(provider).or_default();
        for (model, pricing) in bundled_models {
            models.entry(model).or_insert(pricing);
        }
    }
    merged
}

// ── Bundled fallback ────────────────────────────────────────────────────

/// Compiled-in floor so cost accounting works with no network at all.
/// Rates are dollars per 1M tokens.
pub fn bundled_table() -> PricingTable {
    let mut table: PricingTable = HashMap::new();

    let anthropic: &[(&str, ModelPricing)] = &[
        ("claude-opus-4-1", ModelPricing::cached(15.0, 75.0, 1.5, 18.75)),
        ("claude-opus-4-0", ModelPricing::cached(15.0, 75.0, 1.5, 18.75)),
        ("claude-sonnet-4-5", ModelPricing::cached(3.0, 15.0, 0.3, 3.75)),
        ("claude-sonnet-4-0", ModelPricing::cached(3.0, 15.0, 0.3, 3.75)),
        ("claude-3-7-sonnet-latest", ModelPricing::cached(3.0, 15.0, 0.3, 3.75)),
        ("claude-haiku-4-5", ModelPricing::cached(1.0, 5.0, 0.1, 1.25)),
        ("claude-3-5-haiku-latest", ModelPricing::cached(0.8, 4.0, 0.08, 1.0)),
    ];
    let zai: &[(&str, ModelPricing)] = &[
        ("glm-4.6", ModelPricing::cached(0.6, 2.2, 0.11, 0.0)),
        ("glm-4.5", ModelPricing::cached(0.6, 2.2, 0.11, 0.0)),
        ("glm-4.5-air", ModelPricing::flat(0.2, 1.1)),
    ];
    let minimax: &[(&str, ModelPricing)] = &[
        ("minimax-m2", ModelPricing::flat(0.3, 1.2)),
        ("minimax-m1", ModelPricing::flat(0.4, 2.2)),
        ("abab6.5s-chat", ModelPricing::flat(0.2, 0.2)),
    ];
    let nanogpt: &[(&str, ModelPricing)] = &[
        ("chatgpt-4o-latest", ModelPricing::flat(5.0, 15.0)),
        ("deepseek-chat", ModelPricing::flat(0.27, 1.1)),
    ];
    let kilo: &[(&str, ModelPricing)] = &[
        ("kilo-default", ModelPricing::flat(1.0, 4.0)),
    ];
    let openai: &[(&str, ModelPricing)] = &[
        ("gpt-4o", ModelPricing::cached(2.5, 10.0, 1.25, 0.0)),
        ("gpt-4o-mini", ModelPricing::cached(0.15, 0.6, 0.075, 0.0)),
        ("gpt-4.1", ModelPricing::cached(2.0, 8.0, 0.5, 0.0)),
    ];

    for (provider, models) in [
        ("anthropic", anthropic),
        ("zai", zai),
        ("minimax", minimax),
        ("nanogpt", nanogpt),
        ("kilo", kilo),
        ("openai", openai),
    ] {
        table.insert(
            provider.to_string(),
            models
                .iter()
                .map(|(id, pricing)| (id.to_string(), *pricing))
                .collect(),
        );
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_input_price_is_exact() {
        // 1M input tokens at a known model costs exactly the table rate.
        let table = bundled_table();
        let pricing = lookup(&table, "claude-sonnet-4-5").unwrap();
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            ..Default::default()
        };
        assert_eq!(cost_for(&pricing, &usage), 3.0);
    }

    #[test]
    fn cache_read_bucket_is_priced() {
        let pricing = ModelPricing::cached(3.0, 15.0, 0.3, 3.75);
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 500_000,
            cache_read_input_tokens: 2_000_000,
            cache_creation_input_tokens: 0,
        };
        // 3 + 7.5 + 0.6
        let cost = cost_for(&pricing, &usage);
        assert!((cost - 11.1).abs() < 1e-9);
    }

    #[test]
    fn missing_cache_rates_price_at_zero() {
        let pricing = ModelPricing::flat(0.4, 2.2);
        let usage = TokenUsage {
            cache_read_input_tokens: 1_000_000,
            ..Default::default()
        };
        assert_eq!(cost_for(&pricing, &usage), 0.0);
    }

    #[test]
    fn merge_filters_problematic_and_free_providers() {
        let mut remote: PricingTable = HashMap::new();
        remote.insert(
            "vendor-coding-plan".into(),
            HashMap::from([("m".to_string(), ModelPricing::flat(1.0, 1.0))]),
        );
        remote.insert(
            "freebie".into(),
            HashMap::from([("m".to_string(), ModelPricing::flat(0.0, 0.0))]),
        );
        remote.insert(
            "anthropic".into(),
            HashMap::from([("claude-sonnet-4-5".to_string(), ModelPricing::flat(9.9, 9.9))]),
        );

        let merged = merge_with_bundled(remote);
        assert!(!merged.contains_key("vendor-coding-plan"));
        assert!(!merged.contains_key("freebie"));
        // Remote wins for the model it carries...
        assert_eq!(merged["anthropic"]["claude-sonnet-4-5"].input, 9.9);
        // ...and bundled fills the gaps.
        assert!(merged["anthropic"].contains_key("claude-opus-4-1"));
        assert!(merged.contains_key("minimax"));
    }

    #[test]
    fn litellm_rates_convert_to_per_million() {
        let body = serde_json::json!({
            "claude-sonnet-4-5": {
                "litellm_provider": "anthropic",
                "input_cost_per_token": 0.000003,
                "output_cost_per_token": 0.000015,
                "cache_read_input_token_cost": 0.0000003
            },
            "no-provider-model": { "input_cost_per_token": 0.1 }
        });
        let table = parse_litellm(&body);
        let pricing = table["anthropic"]["claude-sonnet-4-5"];
        assert!((pricing.input - 3.0).abs() < 1e-9);
        assert!((pricing.output - 15.0).abs() < 1e-9);
        assert!((pricing.cache_read.unwrap() - 0.3).abs() < 1e-9);
        assert!(pricing.cache_write.is_none());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn unknown_model_costs_zero() {
        let catalog = PricingCatalog::offline_for_tests();
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            ..Default::default()
        };
        assert_eq!(catalog.estimate_cost("mystery-model-9", &usage).await, 0.0);
        // Second call exercises the warn-once path.
        assert_eq!(catalog.estimate_cost("mystery-model-9", &usage).await, 0.0);
    }
}
