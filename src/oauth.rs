//! OAuth credential lifecycle: PKCE begin/complete and access-token refresh
//! with single-flight coalescing per account.
//!
//! The refresh path re-architects the usual promise-cache into a per-account
//! async mutex with a post-lock freshness re-check: N concurrent callers for
//! one stale account make exactly one upstream call and all observe the new
//! token. A failed refresh releases the slot so the next caller retries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::OAUTH_EXCHANGE_TIMEOUT;
use crate::db::Store;
use crate::error::ApiError;
use crate::models::{Account, AuthType, OAuthMode, OAuthSession};

pub const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";
const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
const CREATE_API_KEY_URL: &str = "https://api.anthropic.com/api/oauth/claude_cli/create_api_key";
const SCOPE: &str = "org:create_api_key user:profile user:inference";

/// Refresh this far before the recorded expiry.
pub const TOKEN_EXPIRY_SKEW_MS: i64 = 60_000;
/// PKCE sessions are short-lived by design.
pub const OAUTH_SESSION_TTL_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

/// Upstream OAuth wire operations, seamed out so the refresh logic is
/// testable without the network.
pub trait TokenExchange: Send + Sync {
    fn refresh(
        &self,
        client_id: &str,
        refresh_token: &str,
    ) -> impl Future<Output = Result<TokenResponse, String>> + Send;

    fn exchange_code(
        &self,
        client_id: &str,
        code: &str,
        verifier: &str,
    ) -> impl Future<Output = Result<TokenResponse, String>> + Send;

    fn create_api_key(
        &self,
        access_token: &str,
    ) -> impl Future<Output = Result<String, String>> + Send;
}

/// Production exchanger speaking the Anthropic console endpoints.
#[derive(Clone)]
pub struct HttpTokenExchange {
    http: reqwest::Client,
}

impl HttpTokenExchange {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn post_token(&self, body: serde_json::Value) -> Result<TokenResponse, String> {
        let resp = self
            .http
            .post(TOKEN_URL)
            .header("content-type", "application/json")
            .json(&body)
            .timeout(OAUTH_EXCHANGE_TIMEOUT)
            .send()
            .await
            .map_err(|e| format!("token endpoint unreachable: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("token endpoint returned {status}: {text}"));
        }
        resp.json::<TokenResponse>()
            .await
            .map_err(|e| format!("invalid token response: {e}"))
    }
}

impl TokenExchange for HttpTokenExchange {
    async fn refresh(&self, client_id: &str, refresh_token: &str) -> Result<TokenResponse, String> {
        self.post_token(json!({
            "grant_type": "refresh_token",
            "client_id": client_id,
            "refresh_token": refresh_token,
        }))
        .await
    }

    async fn exchange_code(
        &self,
        client_id: &str,
        code: &str,
        verifier: &str,
    ) -> Result<TokenResponse, String> {
        // The console callback hands back `code#state`.
        let (code, state) = match code.split_once('#') {
            Some((c, s)) => (c, s),
            None => (code, ""),
        };
        self.post_token(json!({
            "grant_type": "authorization_code",
            "client_id": client_id,
            "code": code,
            "state": state,
            "redirect_uri": REDIRECT_URI,
            "code_verifier": verifier,
        }))
        .await
    }

    async fn create_api_key(&self, access_token: &str) -> Result<String, String> {
        let resp = self
            .http
            .post(CREATE_API_KEY_URL)
            .header("authorization", format!("Bearer {access_token}"))
            .header("content-type", "application/json")
            .timeout(OAUTH_EXCHANGE_TIMEOUT)
            .send()
            .await
            .map_err(|e| format!("create_api_key unreachable: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("create_api_key returned {status}"));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| format!("invalid create_api_key response: {e}"))?;
        body.get("raw_key")
            .and_then(|k| k.as_str())
            .map(String::from)
            .ok_or_else(|| "create_api_key response missing raw_key".to_string())
    }
}

// ── PKCE helpers ────────────────────────────────────────────────────────

/// 32 random bytes → 43 URL-safe chars, within the 43–128 PKCE range.
fn random_verifier() -> String {
    let buf: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(buf)
}

/// `code_challenge = BASE64URL(SHA-256(verifier))`, method S256.
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub struct LoginBegin {
    pub session_id: String,
    pub auth_url: String,
    pub verifier: String,
}

// ── Token manager ───────────────────────────────────────────────────────

pub struct TokenManager<X = HttpTokenExchange> {
    store: Arc<Store>,
    exchange: X,
    client_id: String,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<X: TokenExchange> TokenManager<X> {
    pub fn new(store: Arc<Store>, exchange: X, client_id: String) -> Self {
        Self {
            store,
            exchange,
            client_id,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Credential ready for dispatch: the API key for key accounts, a fresh
    /// access token for OAuth accounts (refreshing if inside the skew).
    pub async fn ensure_fresh(&self, account: &Account) -> Result<String, ApiError> {
        match account.auth_kind() {
            AuthType::ApiKey => account.api_key.clone().ok_or_else(|| {
                ApiError::Internal(format!("account {} has no API key", account.name))
            }),
            AuthType::Oauth => {
                let now = chrono::Utc::now().timestamp_millis();
                if !account.needs_refresh(now, TOKEN_EXPIRY_SKEW_MS) {
                    return account.access_token.clone().ok_or_else(|| {
                        ApiError::Internal(format!("account {} has no access token", account.name))
                    });
                }
                self.refresh_single_flight(&account.id).await
            }
        }
    }

    /// Serialize refreshes per account id. The freshness re-check after the
    /// lock means coalesced waiters reuse the winner's token instead of
    /// refreshing again.
    async fn refresh_single_flight(&self, account_id: &str) -> Result<String, ApiError> {
        let slot = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(account_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = slot.lock().await;

        let account = self
            .store
            .accounts()
            .get(account_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("account {account_id}")))?;

        let now = chrono::Utc::now().timestamp_millis();
        if !account.needs_refresh(now, TOKEN_EXPIRY_SKEW_MS) {
            // Someone refreshed while we queued.
            return account.access_token.clone().ok_or_else(|| {
                ApiError::Internal(format!("account {} has no access token", account.name))
            });
        }

        let refresh_token =
            account
                .refresh_token
                .clone()
                .ok_or_else(|| ApiError::TokenRefresh {
                    account: account.name.clone(),
                    reason: "no refresh token stored".into(),
                })?;

        tracing::info!(account = %account.name, "refreshing OAuth access token");
        let token = self
            .exchange
            .refresh(&self.client_id, &refresh_token)
            .await
            .map_err(|reason| {
                tracing::warn!(account = %account.name, "token refresh failed: {}", reason);
                ApiError::TokenRefresh {
                    account: account.name.clone(),
                    reason,
                }
            })?;

        let expires_at = now + token.expires_in * 1000;
        let new_refresh = token.refresh_token.unwrap_or(refresh_token);
        self.store
            .accounts()
            .update_tokens(&account.id, &token.access_token, &new_refresh, expires_at)
            .await?;
        tracing::info!(account = %account.name, "OAuth token refreshed");
        Ok(token.access_token)
    }

    // ── PKCE flows ──────────────────────────────────────────────────────

    /// Start a login: persist the PKCE session (TTL 10 min) and hand the
    /// caller the authorization URL.
    pub async fn begin_login(
        &self,
        account_name: &str,
        mode: OAuthMode,
        custom_endpoint: Option<&str>,
    ) -> Result<LoginBegin, ApiError> {
        let verifier = random_verifier();
        let challenge = pkce_challenge(&verifier);
        let session_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();

        let mut auth_url =
            url::Url::parse(AUTHORIZE_URL).expect("AUTHORIZE_URL is a valid hardcoded URL");
        auth_url
            .query_pairs_mut()
            .append_pair("code", "true")
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", REDIRECT_URI)
            .append_pair("scope", SCOPE)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &session_id);

        self.store
            .oauth_sessions()
            .insert(&OAuthSession {
                id: session_id.clone(),
                account_name: account_name.to_string(),
                pkce_verifier: verifier.clone(),
                mode: mode.as_str().to_string(),
                custom_endpoint: custom_endpoint.map(String::from),
                created_at: now,
                expires_at: now + OAUTH_SESSION_TTL_MS,
            })
            .await?;

        Ok(LoginBegin {
            session_id,
            auth_url: auth_url.to_string(),
            verifier,
        })
    }

    /// Complete a login: exchange the code, insert the account atomically,
    /// and burn the session.
    pub async fn complete_login(&self, session_id: &str, code: &str) -> Result<Account, ApiError> {
        let session = self
            .store
            .oauth_sessions()
            .get(session_id)
            .await?
            .ok_or_else(|| ApiError::OAuth {
                reason: "unknown or already-used OAuth session".into(),
                provider_code: None,
            })?;

        let now = chrono::Utc::now().timestamp_millis();
        if session.expires_at < now {
            self.store.oauth_sessions().delete(session_id).await?;
            return Err(ApiError::OAuth {
                reason: "OAuth session expired".into(),
                provider_code: None,
            });
        }

        let mode: OAuthMode = session
            .mode
            .parse()
            .map_err(|reason: String| ApiError::OAuth {
                reason,
                provider_code: None,
            })?;

        let token = self
            .exchange
            .exchange_code(&self.client_id, code, &session.pkce_verifier)
            .await
            .map_err(|reason| ApiError::OAuth {
                reason,
                provider_code: None,
            })?;

        let account = match mode {
            OAuthMode::ClaudeOauth => new_account_base(
                &session,
                "anthropic",
                "oauth",
                Some(token.access_token),
                token.refresh_token,
                None,
                Some(now + token.expires_in * 1000),
                now,
            ),
            OAuthMode::Console => {
                let api_key = self
                    .exchange
                    .create_api_key(&token.access_token)
                    .await
                    .map_err(|reason| ApiError::OAuth {
                        reason,
                        provider_code: None,
                    })?;
                new_account_base(
                    &session,
                    "claude-console",
                    "api_key",
                    None,
                    None,
                    Some(api_key),
                    None,
                    now,
                )
            }
        };

        self.store.accounts().insert(&account).await?;
        self.store.oauth_sessions().delete(session_id).await?;
        tracing::info!(account = %account.name, mode = %session.mode, "OAuth login complete");
        Ok(account)
    }
}

#[allow(clippy::too_many_arguments)]
fn new_account_base(
    session: &OAuthSession,
    provider: &str,
    auth_type: &str,
    access_token: Option<String>,
    refresh_token: Option<String>,
    api_key: Option<String>,
    expires_at: Option<i64>,
    now: i64,
) -> Account {
    Account {
        id: uuid::Uuid::new_v4().to_string(),
        name: session.account_name.clone(),
        provider: provider.into(),
        auth_type: auth_type.into(),
        access_token,
        refresh_token,
        api_key,
        expires_at,
        created_at: now,
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
        custom_endpoint: session.custom_endpoint.clone(),
        model_mappings: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Exchanger that counts upstream calls and always succeeds.
    struct CountingExchange {
        refreshes: AtomicUsize,
    }

    impl CountingExchange {
        fn new() -> Self {
            Self {
                refreshes: AtomicUsize::new(0),
            }
        }
    }

    impl TokenExchange for CountingExchange {
        async fn refresh(&self, _: &str, _: &str) -> Result<TokenResponse, String> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            // A little latency so concurrent callers genuinely overlap.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(TokenResponse {
                access_token: "fresh-token".into(),
                refresh_token: Some("rotated-refresh".into()),
                expires_in: 3600,
            })
        }

        async fn exchange_code(&self, _: &str, _: &str, _: &str) -> Result<TokenResponse, String> {
            Ok(TokenResponse {
                access_token: "exchanged-token".into(),
                refresh_token: Some("first-refresh".into()),
                expires_in: 3600,
            })
        }

        async fn create_api_key(&self, _: &str) -> Result<String, String> {
            Ok("sk-ant-created-key".into())
        }
    }

    async fn seed_stale_account(store: &Store) -> Account {
        let account = Account {
            id: "acc-x".into(),
            name: "stale".into(),
            provider: "anthropic".into(),
            auth_type: "oauth".into(),
            access_token: Some("old-token".into()),
            refresh_token: Some("old-refresh".into()),
            api_key: None,
            expires_at: Some(chrono::Utc::now().timestamp_millis() - 1_000),
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
            custom_endpoint: None,
            model_mappings: None,
        };
        store.accounts().insert(&account).await.unwrap();
        account
    }

    #[tokio::test]
    async fn concurrent_refreshes_coalesce_to_one_upstream_call() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let account = seed_stale_account(&store).await;
        let manager = Arc::new(TokenManager::new(
            store.clone(),
            CountingExchange::new(),
            DEFAULT_CLIENT_ID.to_string(),
        ));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = manager.clone();
            let account = account.clone();
            handles.push(tokio::spawn(async move {
                manager.ensure_fresh(&account).await.unwrap()
            }));
        }
        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap());
        }

        assert_eq!(manager.exchange.refreshes.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == "fresh-token"));

        let stored = store.accounts().get("acc-x").await.unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("fresh-token"));
        assert_eq!(stored.refresh_token.as_deref(), Some("rotated-refresh"));
        assert!(stored.expires_at.unwrap() > chrono::Utc::now().timestamp_millis());
    }

    #[tokio::test]
    async fn fresh_token_skips_refresh() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mut account = seed_stale_account(&store).await;
        account.expires_at = Some(chrono::Utc::now().timestamp_millis() + 3_600_000);
        let manager = TokenManager::new(
            store.clone(),
            CountingExchange::new(),
            DEFAULT_CLIENT_ID.to_string(),
        );

        let token = manager.ensure_fresh(&account).await.unwrap();
        assert_eq!(token, "old-token");
        assert_eq!(manager.exchange.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_refresh_releases_the_slot() {
        struct FailingExchange;
        impl TokenExchange for FailingExchange {
            async fn refresh(&self, _: &str, _: &str) -> Result<TokenResponse, String> {
                Err("upstream said no".into())
            }
            async fn exchange_code(
                &self,
                _: &str,
                _: &str,
                _: &str,
            ) -> Result<TokenResponse, String> {
                Err("unused".into())
            }
            async fn create_api_key(&self, _: &str) -> Result<String, String> {
                Err("unused".into())
            }
        }

        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let account = seed_stale_account(&store).await;
        let manager = TokenManager::new(store, FailingExchange, DEFAULT_CLIENT_ID.to_string());

        let first = manager.ensure_fresh(&account).await;
        assert!(matches!(first, Err(ApiError::TokenRefresh { .. })));
        // The slot must not be wedged: the next caller fails the same way
        // rather than deadlocking.
        let second = manager.ensure_fresh(&account).await;
        assert!(matches!(second, Err(ApiError::TokenRefresh { .. })));
    }

    #[tokio::test]
    async fn begin_login_persists_a_session_with_ttl() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let manager = TokenManager::new(
            store.clone(),
            CountingExchange::new(),
            DEFAULT_CLIENT_ID.to_string(),
        );

        let begin = manager
            .begin_login("work", OAuthMode::ClaudeOauth, None)
            .await
            .unwrap();
        assert!(begin.auth_url.contains("code_challenge_method=S256"));
        assert!(begin.verifier.len() >= 43);

        let session = store
            .oauth_sessions()
            .get(&begin.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.account_name, "work");
        assert!(session.expires_at - session.created_at <= OAUTH_SESSION_TTL_MS);
    }

    #[tokio::test]
    async fn complete_login_inserts_account_and_burns_session() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let manager = TokenManager::new(
            store.clone(),
            CountingExchange::new(),
            DEFAULT_CLIENT_ID.to_string(),
        );

        let begin = manager
            .begin_login("work", OAuthMode::ClaudeOauth, None)
            .await
            .unwrap();
        let account = manager
            .complete_login(&begin.session_id, "auth-code#state")
            .await
            .unwrap();

        assert_eq!(account.name, "work");
        assert_eq!(account.access_token.as_deref(), Some("exchanged-token"));
        assert!(
            store
                .oauth_sessions()
                .get(&begin.session_id)
                .await
                .unwrap()
                .is_none()
        );
        // Burned session now fails with a typed OAuth error.
        let err = manager
            .complete_login(&begin.session_id, "auth-code")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::OAuth { .. }));
    }

    #[tokio::test]
    async fn console_mode_yields_an_api_key_account() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let manager = TokenManager::new(
            store.clone(),
            CountingExchange::new(),
            DEFAULT_CLIENT_ID.to_string(),
        );

        let begin = manager
            .begin_login("console-acct", OAuthMode::Console, None)
            .await
            .unwrap();
        let account = manager
            .complete_login(&begin.session_id, "auth-code")
            .await
            .unwrap();

        assert_eq!(account.auth_type, "api_key");
        assert_eq!(account.api_key.as_deref(), Some("sk-ant-created-key"));
        assert!(account.access_token.is_none());
    }

    #[test]
    fn challenge_is_s256_of_verifier() {
        // RFC 7636 appendix B test vector.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            pkce_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }
}
