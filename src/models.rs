use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

// ── Provider families ───────────────────────────────────────────────────

/// Upstream provider family an account belongs to. Determines base URL,
/// auth header shape, and whether Anthropic SSE usage framing applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Anthropic,
    ClaudeConsole,
    OpenaiCompatible,
    AnthropicCompatible,
    Minimax,
    Kilo,
    Nanogpt,
    Zai,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::ClaudeConsole => "claude-console",
            Self::OpenaiCompatible => "openai-compatible",
            Self::AnthropicCompatible => "anthropic-compatible",
            Self::Minimax => "minimax",
            Self::Kilo => "kilo",
            Self::Nanogpt => "nanogpt",
            Self::Zai => "zai",
        }
    }

    pub fn all() -> &'static [ProviderKind] {
        &[
            Self::Anthropic,
            Self::ClaudeConsole,
            Self::OpenaiCompatible,
            Self::AnthropicCompatible,
            Self::Minimax,
            Self::Kilo,
            Self::Nanogpt,
            Self::Zai,
        ]
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(Self::Anthropic),
            "claude-console" => Ok(Self::ClaudeConsole),
            "openai-compatible" => Ok(Self::OpenaiCompatible),
            "anthropic-compatible" => Ok(Self::AnthropicCompatible),
            "minimax" => Ok(Self::Minimax),
            "kilo" => Ok(Self::Kilo),
            "nanogpt" => Ok(Self::Nanogpt),
            "zai" => Ok(Self::Zai),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Oauth,
    ApiKey,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oauth => "oauth",
            Self::ApiKey => "api_key",
        }
    }
}

impl FromStr for AuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oauth" => Ok(Self::Oauth),
            "api_key" => Ok(Self::ApiKey),
            other => Err(format!("unknown auth type: {other}")),
        }
    }
}

// ── Account ─────────────────────────────────────────────────────────────

/// An upstream credential set. Exactly one of `{access_token, refresh_token}`
/// or `api_key` is populated, per `auth_type`. All timestamps are epoch ms.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub auth_type: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub api_key: Option<String>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub last_used: Option<i64>,
    pub request_count: i64,
    pub total_requests: i64,
    pub session_start: Option<i64>,
    pub session_request_count: i64,
    pub rate_limited_until: Option<i64>,
    pub rate_limit_status: Option<String>,
    pub rate_limit_reset: Option<i64>,
    pub rate_limit_remaining: Option<i64>,
    pub paused: bool,
    pub priority: i64,
    pub auto_fallback_enabled: bool,
    pub auto_refresh_enabled: bool,
    pub custom_endpoint: Option<String>,
    pub model_mappings: Option<String>,
}

impl Account {
    pub fn provider_kind(&self) -> ProviderKind {
        self.provider
            .parse()
            .unwrap_or(ProviderKind::AnthropicCompatible)
    }

    pub fn auth_kind(&self) -> AuthType {
        self.auth_type.parse().unwrap_or(AuthType::ApiKey)
    }

    /// `!paused && (rate_limited_until == null || rate_limited_until < now)`.
    pub fn is_available(&self, now_ms: i64) -> bool {
        !self.paused && self.rate_limited_until.is_none_or(|until| until < now_ms)
    }

    /// OAuth access token needs a refresh before dispatch.
    pub fn needs_refresh(&self, now_ms: i64, skew_ms: i64) -> bool {
        self.auth_kind() == AuthType::Oauth
            && self.expires_at.is_none_or(|exp| exp <= now_ms + skew_ms)
    }

    /// Parsed per-account model mappings, `None` when absent or malformed.
    pub fn mappings(&self) -> Option<serde_json::Map<String, Value>> {
        let raw = self.model_mappings.as_deref()?;
        serde_json::from_str::<Value>(raw)
            .ok()?
            .as_object()
            .cloned()
    }
}

/// Redacted account view for the management API — never exposes credentials.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AccountView {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub auth_type: String,
    pub created_at: i64,
    pub last_used: Option<i64>,
    pub request_count: i64,
    pub total_requests: i64,
    pub session_request_count: i64,
    pub rate_limited_until: Option<i64>,
    pub rate_limit_status: Option<String>,
    pub rate_limit_remaining: Option<i64>,
    pub paused: bool,
    pub priority: i64,
    pub available: bool,
    pub token_expires_at: Option<i64>,
    pub custom_endpoint: Option<String>,
    pub has_model_mappings: bool,
}

impl AccountView {
    pub fn from_account(account: &Account, now_ms: i64) -> Self {
        Self {
            id: account.id.clone(),
            name: account.name.clone(),
            provider: account.provider.clone(),
            auth_type: account.auth_type.clone(),
            created_at: account.created_at,
            last_used: account.last_used,
            request_count: account.request_count,
            total_requests: account.total_requests,
            session_request_count: account.session_request_count,
            rate_limited_until: account.rate_limited_until,
            rate_limit_status: account.rate_limit_status.clone(),
            rate_limit_remaining: account.rate_limit_remaining,
            paused: account.paused,
            priority: account.priority,
            available: account.is_available(now_ms),
            token_expires_at: account.expires_at,
            custom_endpoint: account.custom_endpoint.clone(),
            has_model_mappings: account.model_mappings.is_some(),
        }
    }
}

// ── OAuth session (ephemeral, TTL ≤ 10 min) ─────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OAuthSession {
    pub id: String,
    pub account_name: String,
    pub pkce_verifier: String,
    pub mode: String,
    pub custom_endpoint: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

/// OAuth flow mode — `console` yields an API key, `claude-oauth` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OAuthMode {
    Console,
    ClaudeOauth,
}

impl OAuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::ClaudeOauth => "claude-oauth",
        }
    }
}

impl FromStr for OAuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "console" => Ok(Self::Console),
            // Legacy rows may still carry the pre-rename value.
            "claude-oauth" | "max" => Ok(Self::ClaudeOauth),
            other => Err(format!("unknown oauth mode: {other}")),
        }
    }
}

// ── Request telemetry ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct RequestRow {
    pub id: String,
    pub timestamp: i64,
    pub method: String,
    pub path: String,
    pub account_used: Option<String>,
    pub status_code: Option<i64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub response_time_ms: Option<i64>,
    pub failover_attempts: i64,
    pub model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_read_input_tokens: Option<i64>,
    pub cache_creation_input_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub output_tokens_per_second: Option<f64>,
    pub agent_used: Option<String>,
    pub api_key_id: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RequestPayloadRow {
    pub id: String,
    pub request_json: String,
    pub response_json: String,
    pub created_at: i64,
}

/// Metadata handed to the strategy engine for one inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub id: String,
    pub method: String,
    pub path: String,
    pub agent: Option<String>,
    pub api_key_id: Option<String>,
}

// ── Token usage ─────────────────────────────────────────────────────────

/// Token counts observed from one upstream response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub cache_creation_input_tokens: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

// ── API keys (management surface auth) ──────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiKeyRole {
    Admin,
    ApiOnly,
}

impl ApiKeyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::ApiOnly => "api-only",
        }
    }
}

impl FromStr for ApiKeyRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "api-only" => Ok(Self::ApiOnly),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub id: String,
    pub name: String,
    pub hashed_key: String,
    pub prefix_last_8: String,
    pub created_at: i64,
    pub last_used: Option<i64>,
    pub usage_count: i64,
    pub is_active: bool,
    pub role: String,
}

impl ApiKeyRow {
    pub fn role_kind(&self) -> ApiKeyRole {
        self.role.parse().unwrap_or(ApiKeyRole::ApiOnly)
    }
}

/// Auth context attached to request extensions after the gate passes.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key_id: Option<String>,
    pub role: ApiKeyRole,
}

// ── Agent preferences & model translations ──────────────────────────────

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct AgentPreference {
    pub agent_id: String,
    pub model: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct ModelTranslation {
    pub source: String,
    pub target: String,
}

// ── Maintenance ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, ToSchema)]
pub struct CleanupCounts {
    pub removed_requests: u64,
    pub removed_payloads: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(paused: bool, rate_limited_until: Option<i64>) -> Account {
        Account {
            id: "acc-1".into(),
            name: "primary".into(),
            provider: "anthropic".into(),
            auth_type: "oauth".into(),
            access_token: Some("tok".into()),
            refresh_token: Some("ref".into()),
            api_key: None,
            expires_at: Some(10_000),
            created_at: 0,
            last_used: None,
            request_count: 0,
            total_requests: 0,
            session_start: None,
            session_request_count: 0,
            rate_limited_until,
            rate_limit_status: None,
            rate_limit_reset: None,
            rate_limit_remaining: None,
            paused,
            priority: 0,
            auto_fallback_enabled: true,
            auto_refresh_enabled: true,
            custom_endpoint: None,
            model_mappings: None,
        }
    }

    #[test]
    fn paused_accounts_are_never_available() {
        assert!(!account(true, None).is_available(0));
    }

    #[test]
    fn rate_limit_window_hides_account_until_expiry() {
        let acc = account(false, Some(1_000));
        assert!(!acc.is_available(500));
        assert!(!acc.is_available(1_000));
        assert!(acc.is_available(1_001));
    }

    #[test]
    fn refresh_needed_inside_skew_window() {
        let acc = account(false, None);
        assert!(!acc.needs_refresh(0, 60_000));
        assert!(acc.needs_refresh(9_999, 60_000));
        assert!(acc.needs_refresh(10_001, 0));
    }

    #[test]
    fn provider_round_trips() {
        for kind in ProviderKind::all() {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), *kind);
        }
    }
}
