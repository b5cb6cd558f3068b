//! Process configuration: environment variables, data-directory resolution,
//! and the runtime-tunable settings persisted through the store.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::strategy::StrategyKind;

pub const APP_DIR: &str = "claude-relay";
/// Pre-rename data directory; contents are copied over once if found.
pub const LEGACY_APP_DIR: &str = "cc-relay";
pub const DB_FILE: &str = "relay.db";

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SESSION_DURATION_MS: i64 = 5 * 60 * 60 * 1000;
pub const DEFAULT_PRICING_REFRESH_HOURS: u64 = 24;

/// Per-attempt upstream timeout and the total dispatch budget.
pub const UPSTREAM_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DISPATCH_TOTAL_BUDGET: Duration = Duration::from_secs(300);
pub const OAUTH_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);
pub const PRICING_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    Off,
    /// Log model-mapping rewrites only.
    Model,
    /// Verbose dispatch logging.
    Full,
}

/// Immutable process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    pub fast_mode: bool,
    pub busy_timeout: Duration,
    pub pricing_offline: bool,
    pub pricing_refresh_hours: u64,
    pub debug: DebugMode,
    pub session_duration_ms: i64,
    pub openai_model_mappings: Option<serde_json::Value>,
    /// OAuth client identifier, supplied at runtime.
    pub oauth_client_id: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let db_path = match std::env::var("RELAY_DB_PATH") {
            Ok(p) if !p.is_empty() => PathBuf::from(p),
            _ => default_db_path()?,
        };

        let fast_mode = env_flag("RELAY_DB_FAST");

        let busy_timeout = std::env::var("RELAY_DB_BUSY_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS));

        let pricing_refresh_hours = std::env::var("RELAY_PRICING_REFRESH_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PRICING_REFRESH_HOURS);

        let debug = match std::env::var("RELAY_DEBUG").as_deref() {
            Ok("model") => DebugMode::Model,
            Ok("true") | Ok("1") => DebugMode::Full,
            _ => DebugMode::Off,
        };

        let session_duration_ms = std::env::var("RELAY_SESSION_DURATION_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SESSION_DURATION_MS);

        let openai_model_mappings = std::env::var("RELAY_OPENAI_MODEL_MAPPINGS")
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());

        let oauth_client_id = std::env::var("RELAY_OAUTH_CLIENT_ID")
            .unwrap_or_else(|_| crate::oauth::DEFAULT_CLIENT_ID.to_string());

        Ok(Self {
            port,
            db_path,
            fast_mode,
            busy_timeout,
            pricing_offline: env_flag("RELAY_PRICING_OFFLINE"),
            pricing_refresh_hours,
            debug,
            session_duration_ms,
            openai_model_mappings,
            oauth_client_id,
        })
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE")
    )
}

/// `<config_dir>/claude-relay/relay.db`, creating the directory and copying
/// a legacy `cc-relay` database over once if one exists.
fn default_db_path() -> anyhow::Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("no platform config directory available"))?;
    let dir = base.join(APP_DIR);
    std::fs::create_dir_all(&dir)?;

    let db_path = dir.join(DB_FILE);
    if !db_path.exists() {
        let legacy = base.join(LEGACY_APP_DIR).join(DB_FILE);
        if legacy.exists() {
            tracing::info!("migrating database from legacy directory {:?}", legacy);
            std::fs::copy(&legacy, &db_path)?;
        }
    }
    Ok(db_path)
}

// ── Runtime-tunable settings (persisted via the store) ──────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub strategy: StrategyKind,
    pub default_model: String,
    /// Payload rows are deleted after this many days.
    pub payload_retention_days: u32,
    /// Request metadata rows; 0 = keep forever.
    pub request_retention_days: u32,
    pub session_duration_ms: i64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Session,
            default_model: "claude-sonnet-4-5".to_string(),
            payload_retention_days: 7,
            request_retention_days: 0,
            session_duration_ms: DEFAULT_SESSION_DURATION_MS,
        }
    }
}
