//! Provider adapters: per-family base URL, auth header shape, rate-limit
//! signals, and which usage framing the response body speaks.
//!
//! The proxy forwards Anthropic Messages bodies verbatim; adapters only
//! decide where the request goes, how it authenticates, and how usage is
//! observed on the way back.

use reqwest::RequestBuilder;

use crate::models::{Account, AuthType, ProviderKind};

/// Beta features header required for OAuth-authenticated requests.
pub const ANTHROPIC_BETA: &str = "oauth-2025-04-20,claude-code-20250219,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14";

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ZAI_MESSAGES_URL: &str = "https://api.z.ai/api/anthropic/v1/messages";
const MINIMAX_MESSAGES_URL: &str = "https://api.minimax.io/anthropic/v1/messages";
const KILO_MESSAGES_URL: &str = "https://api.kilocode.ai/api/anthropic/v1/messages";
const NANOGPT_COMPLETIONS_URL: &str = "https://nano-gpt.com/api/v1/chat/completions";
const OPENAI_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

/// How token usage appears in the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageFraming {
    /// Anthropic SSE (`message_start`/`message_delta`/`message_stop`) or an
    /// Anthropic Messages JSON body.
    AnthropicSse,
    /// OpenAI-style `usage: {prompt_tokens, completion_tokens}`.
    OpenAiJson,
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderAdapter {
    kind: ProviderKind,
}

impl ProviderAdapter {
    pub fn for_account(account: &Account) -> Self {
        Self {
            kind: account.provider_kind(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// Upstream messages endpoint. A per-account custom endpoint always
    /// wins; otherwise each family has a fixed default.
    pub fn messages_url(&self, account: &Account) -> String {
        if let Some(endpoint) = account.custom_endpoint.as_deref() {
            // Custom endpoints may be a bare origin or a full path.
            if endpoint.contains("/v1/") || endpoint.ends_with("/messages") {
                return endpoint.to_string();
            }
            let base = endpoint.trim_end_matches('/');
            return match self.usage_framing() {
                UsageFraming::AnthropicSse => format!("{base}/v1/messages"),
                UsageFraming::OpenAiJson => format!("{base}/v1/chat/completions"),
            };
        }
        match self.kind {
            ProviderKind::Anthropic | ProviderKind::ClaudeConsole => {
                ANTHROPIC_MESSAGES_URL.to_string()
            }
            ProviderKind::AnthropicCompatible => ANTHROPIC_MESSAGES_URL.to_string(),
            ProviderKind::Zai => ZAI_MESSAGES_URL.to_string(),
            ProviderKind::Minimax => MINIMAX_MESSAGES_URL.to_string(),
            ProviderKind::Kilo => KILO_MESSAGES_URL.to_string(),
            ProviderKind::Nanogpt => NANOGPT_COMPLETIONS_URL.to_string(),
            ProviderKind::OpenaiCompatible => OPENAI_COMPLETIONS_URL.to_string(),
        }
    }

    /// Attach the credential the way this family expects.
    pub fn apply_auth(
        &self,
        builder: RequestBuilder,
        credential: &str,
        auth_type: AuthType,
    ) -> RequestBuilder {
        match (self.kind, auth_type) {
            // OAuth tokens go out as bearer with the beta feature set.
            (ProviderKind::Anthropic, AuthType::Oauth) => builder
                .header("authorization", format!("Bearer {credential}"))
                .header("anthropic-beta", ANTHROPIC_BETA)
                .header("anthropic-version", ANTHROPIC_VERSION),
            // Anthropic-protocol providers authenticate with x-api-key.
            (
                ProviderKind::Anthropic
                | ProviderKind::ClaudeConsole
                | ProviderKind::AnthropicCompatible
                | ProviderKind::Zai,
                _,
            ) => builder
                .header("x-api-key", credential)
                .header("anthropic-version", ANTHROPIC_VERSION),
            // OpenAI-protocol and the remaining aggregators use bearer keys.
            _ => builder.header("authorization", format!("Bearer {credential}")),
        }
    }

    pub fn usage_framing(&self) -> UsageFraming {
        match self.kind {
            ProviderKind::Anthropic
            | ProviderKind::ClaudeConsole
            | ProviderKind::AnthropicCompatible
            | ProviderKind::Zai
            | ProviderKind::Minimax
            | ProviderKind::Kilo => UsageFraming::AnthropicSse,
            ProviderKind::OpenaiCompatible | ProviderKind::Nanogpt => UsageFraming::OpenAiJson,
        }
    }

    /// 429 everywhere; Anthropic additionally signals overload with 529.
    pub fn is_rate_limited(&self, status: u16) -> bool {
        status == 429
            || (status == 529
                && matches!(
                    self.kind,
                    ProviderKind::Anthropic | ProviderKind::ClaudeConsole
                ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(provider: &str, auth_type: &str, endpoint: Option<&str>) -> Account {
        Account {
            id: "a".into(),
            name: "a".into(),
            provider: provider.into(),
            auth_type: auth_type.into(),
            access_token: None,
            refresh_token: None,
            api_key: Some("sk-test-123456".into()),
            expires_at: None,
            created_at: 0,
            last_used: None,
            request_count: 0,
            total_requests: 0,
            session_start: None,
            session_request_count: 0,
            rate_limited_until: None,
            rate_limit_status: None,
            rate_limit_reset: None,
            rate_limit_remaining: None,
            paused: false,
            priority: 0,
            auto_fallback_enabled: true,
            auto_refresh_enabled: true,
            custom_endpoint: endpoint.map(String::from),
            model_mappings: None,
        }
    }

    #[test]
    fn default_urls_per_family() {
        let acc = account("anthropic", "oauth", None);
        assert_eq!(
            ProviderAdapter::for_account(&acc).messages_url(&acc),
            ANTHROPIC_MESSAGES_URL
        );
        let acc = account("zai", "api_key", None);
        assert_eq!(
            ProviderAdapter::for_account(&acc).messages_url(&acc),
            ZAI_MESSAGES_URL
        );
    }

    #[test]
    fn custom_endpoint_origin_gets_a_path() {
        let acc = account("anthropic-compatible", "api_key", Some("https://llm.corp.example"));
        assert_eq!(
            ProviderAdapter::for_account(&acc).messages_url(&acc),
            "https://llm.corp.example/v1/messages"
        );
        let acc = account("openai-compatible", "api_key", Some("https://llm.corp.example/"));
        assert_eq!(
            ProviderAdapter::for_account(&acc).messages_url(&acc),
            "https://llm.corp.example/v1/chat/completions"
        );
    }

    #[test]
    fn full_custom_endpoint_is_used_verbatim() {
        let acc = account(
            "anthropic-compatible",
            "api_key",
            Some("https://llm.corp.example/proxy/v1/messages"),
        );
        assert_eq!(
            ProviderAdapter::for_account(&acc).messages_url(&acc),
            "https://llm.corp.example/proxy/v1/messages"
        );
    }

    #[test]
    fn overload_status_counts_for_first_party_only() {
        let anthropic = ProviderAdapter::for_account(&account("anthropic", "oauth", None));
        assert!(anthropic.is_rate_limited(429));
        assert!(anthropic.is_rate_limited(529));
        let zai = ProviderAdapter::for_account(&account("zai", "api_key", None));
        assert!(zai.is_rate_limited(429));
        assert!(!zai.is_rate_limited(529));
    }
}
