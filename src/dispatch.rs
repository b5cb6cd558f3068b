//! Proxy dispatcher: strategy → candidate loop → failover → stream
//! passthrough → usage capture → telemetry.
//!
//! The client sees upstream bytes with the same framing; usage parsing rides
//! the forwarding path without delaying it. The telemetry row is inserted at
//! dispatch start, finalized atomically at the end, and the final row is
//! durable before the `summary` event goes out.

use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::Response;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::config::{DebugMode, RuntimeSettings, DISPATCH_TOTAL_BUDGET, UPSTREAM_ATTEMPT_TIMEOUT};
use crate::db::requests::RequestOutcome;
use crate::error::{redact_json, ApiError};
use crate::events::RequestEvent;
use crate::models::{Account, RequestMeta};
use crate::providers::ProviderAdapter;
use crate::state::AppState;
use crate::usage::UsageObserver;

/// Backoff between candidates after a 5xx or network failure.
const RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(500);

/// Largest upstream error body copied into `error_message`.
const ERROR_SNIPPET_CAP: usize = 500;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub async fn handle_proxy(
    state: AppState,
    method: String,
    path: String,
    api_key_id: Option<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request_id = uuid::Uuid::new_v4().to_string();
    let timestamp = now_ms();
    let started = Instant::now();

    let body_json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let agent = body_json
        .pointer("/metadata/agent_id")
        .and_then(|v| v.as_str())
        .map(String::from);

    let meta = RequestMeta {
        id: request_id.clone(),
        method: method.clone(),
        path: path.clone(),
        agent: agent.clone(),
        api_key_id: api_key_id.clone(),
    };

    state
        .store
        .requests()
        .insert_start(
            &request_id,
            timestamp,
            &method,
            &path,
            agent.as_deref(),
            api_key_id.as_deref(),
        )
        .await?;
    state
        .events
        .requests
        .publish(state.events.start_event(
            &request_id,
            timestamp,
            &method,
            &path,
            agent.clone(),
        ))
        .await;

    let settings = state.settings.read().await.clone();
    let accounts = state.store.accounts().all().await?;
    let candidates = state
        .strategy
        .select(
            settings.strategy,
            &accounts,
            &meta,
            settings.session_duration_ms,
            timestamp,
        )
        .await?;

    if candidates.is_empty() {
        finalize_failure(
            &state,
            &request_id,
            RequestOutcome {
                status_code: Some(503),
                success: false,
                error_message: Some("no accounts available".into()),
                response_time_ms: Some(started.elapsed().as_millis() as i64),
                ..Default::default()
            },
        )
        .await;
        return Err(ApiError::ServiceUnavailable);
    }

    // Resolve the model the client asked for; an agent preference overrides.
    let mut requested_model = body_json
        .get("model")
        .and_then(|m| m.as_str())
        .map(String::from)
        .unwrap_or_else(|| settings.default_model.clone());
    if let Some(agent_id) = agent.as_deref()
        && let Ok(Some(pref)) = state.store.agent_preferences().get(agent_id).await
    {
        requested_model = pref.model;
    }

    let mut failover_attempts: i64 = 0;
    let mut last_status: Option<u16> = None;
    let mut last_error: Option<String> = None;
    let mut exhausted_by_rate_limit = false;

    for account in candidates {
        if started.elapsed() > DISPATCH_TOTAL_BUDGET {
            last_error = Some("dispatch time budget exhausted".into());
            break;
        }

        let credential = match state.tokens.ensure_fresh(&account).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(account = %account.name, "skipping candidate: {}", e);
                failover_attempts += 1;
                last_error = Some(e.to_string());
                continue;
            }
        };

        let adapter = ProviderAdapter::for_account(&account);
        let model = rewrite_model(&state, &account, &requested_model, &settings).await;
        let mut attempt_body = body_json.clone();
        if attempt_body.is_object() {
            attempt_body["model"] = json!(model.clone());
        }
        let payload_bytes = serde_json::to_vec(&attempt_body).unwrap_or_else(|_| body.to_vec());

        if state.config.debug == DebugMode::Full {
            tracing::debug!(
                account = %account.name,
                model = %model,
                "dispatching attempt {}",
                failover_attempts + 1
            );
        }

        let url = adapter.messages_url(&account);
        let request = adapter
            .apply_auth(state.http_client.post(&url), &credential, account.auth_kind())
            .header("content-type", "application/json")
            .timeout(UPSTREAM_ATTEMPT_TIMEOUT)
            .body(payload_bytes);

        let resp = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(account = %account.name, "upstream unreachable: {}", e);
                failover_attempts += 1;
                last_error = Some(format!("network error: {e}"));
                exhausted_by_rate_limit = false;
                tokio::time::sleep(RETRY_BACKOFF).await;
                continue;
            }
        };

        let status = resp.status().as_u16();

        if resp.status().is_success() {
            return Ok(stream_success(
                state,
                request_id,
                started,
                account,
                adapter,
                model,
                resp,
                failover_attempts,
                body_json,
                settings,
            )
            .await);
        }

        if adapter.is_rate_limited(status) {
            state
                .ratelimit
                .mark_rate_limited(&account, resp.headers(), now_ms())
                .await
                .ok();
            failover_attempts += 1;
            last_status = Some(status);
            last_error = Some(format!("account {} rate limited", account.name));
            exhausted_by_rate_limit = true;
            continue;
        }

        if status == 401 || status == 403 {
            // Token was fresh yet the upstream refused it: account is
            // unhealthy, but not auto-paused.
            tracing::error!(
                account = %account.name,
                "upstream auth failure ({}) with fresh credentials",
                status
            );
            failover_attempts += 1;
            last_status = Some(status);
            last_error = Some(format!("auth failure on account {}", account.name));
            exhausted_by_rate_limit = false;
            continue;
        }

        if status >= 500 {
            tracing::warn!(account = %account.name, "upstream error {}", status);
            failover_attempts += 1;
            last_status = Some(status);
            last_error = Some(format!("upstream {status}"));
            exhausted_by_rate_limit = false;
            tokio::time::sleep(RETRY_BACKOFF).await;
            continue;
        }

        // Remaining 4xx are the client's fault: no failover, surface as-is.
        let headers = resp.headers().clone();
        let error_body = resp.bytes().await.unwrap_or_default();
        let snippet = String::from_utf8_lossy(&error_body)
            .chars()
            .take(ERROR_SNIPPET_CAP)
            .collect::<String>();
        finalize_failure(
            &state,
            &request_id,
            RequestOutcome {
                account_used: Some(account.name.clone()),
                status_code: Some(status as i64),
                success: false,
                error_message: Some(snippet),
                response_time_ms: Some(started.elapsed().as_millis() as i64),
                failover_attempts,
                model: Some(model),
                ..Default::default()
            },
        )
        .await;

        let mut builder = Response::builder().status(status);
        if let Some(content_type) = headers.get("content-type") {
            builder = builder.header("content-type", content_type);
        }
        return Ok(builder
            .body(Body::from(error_body))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response_empty()));
    }

    // Candidate list exhausted.
    let status = last_status.unwrap_or(502);
    let reason = last_error.unwrap_or_else(|| "all candidates exhausted".into());
    finalize_failure(
        &state,
        &request_id,
        RequestOutcome {
            status_code: Some(status as i64),
            success: false,
            error_message: Some(reason.clone()),
            response_time_ms: Some(started.elapsed().as_millis() as i64),
            failover_attempts,
            ..Default::default()
        },
    )
    .await;

    if exhausted_by_rate_limit {
        Err(ApiError::RateLimit {
            retry_after_ms: None,
        })
    } else {
        Err(ApiError::Provider {
            status: Some(status),
            reason,
        })
    }
}

/// Rewrite precedence: per-account mappings, then the OpenAI-compatible env
/// override, then global translations, else the name passes through.
async fn rewrite_model(
    state: &AppState,
    account: &Account,
    requested: &str,
    _settings: &RuntimeSettings,
) -> String {
    let log_rewrite = |to: &str, source: &str| {
        if matches!(state.config.debug, DebugMode::Model | DebugMode::Full) && to != requested {
            tracing::debug!("model rewrite ({source}): {requested} -> {to}");
        }
    };

    if let Some(mappings) = account.mappings()
        && let Some(mapped) = state.mapper.resolve(&mappings, requested)
    {
        log_rewrite(&mapped, "account");
        return mapped;
    }

    if account.provider_kind() == crate::models::ProviderKind::OpenaiCompatible
        && let Some(env_map) = state
            .config
            .openai_model_mappings
            .as_ref()
            .and_then(|v| v.as_object())
        && let Some(mapped) = state.mapper.resolve(env_map, requested)
    {
        log_rewrite(&mapped, "env");
        return mapped;
    }

    if let Ok(Some(target)) = state.store.model_translations().get(requested).await {
        log_rewrite(&target, "global");
        return target;
    }

    requested.to_string()
}

/// Persist a failed outcome and emit its `summary` event.
async fn finalize_failure(state: &AppState, request_id: &str, outcome: RequestOutcome) {
    if let Err(e) = state.store.requests().finalize(request_id, &outcome).await {
        tracing::error!("failed to finalize request {}: {}", request_id, e);
    }
    publish_summary(state, request_id, &outcome).await;
}

async fn publish_summary(state: &AppState, request_id: &str, outcome: &RequestOutcome) {
    let usage = outcome.usage.unwrap_or_default();
    state
        .events
        .requests
        .publish(RequestEvent::Summary {
            id: request_id.to_string(),
            summary: json!({
                "account_used": outcome.account_used,
                "status_code": outcome.status_code,
                "success": outcome.success,
                "error_message": outcome.error_message,
                "response_time_ms": outcome.response_time_ms,
                "failover_attempts": outcome.failover_attempts,
                "model": outcome.model,
                "input_tokens": outcome.usage.map(|_| usage.input_tokens),
                "output_tokens": outcome.usage.map(|_| usage.output_tokens),
                "total_tokens": outcome.usage.map(|_| usage.total()),
                "cost_usd": outcome.cost_usd,
                "output_tokens_per_second": outcome.output_tokens_per_second,
            }),
        })
        .await;
}

/// Forward the upstream body byte-for-byte while the observer accumulates
/// usage; finalize telemetry when the stream ends (or the client leaves).
#[allow(clippy::too_many_arguments)]
async fn stream_success(
    state: AppState,
    request_id: String,
    started: Instant,
    account: Account,
    adapter: ProviderAdapter,
    model: String,
    resp: reqwest::Response,
    failover_attempts: i64,
    request_body: Value,
    settings: RuntimeSettings,
) -> Response {
    if let Err(e) = state.store.accounts().record_usage(&account.id).await {
        tracing::warn!(account = %account.name, "usage bump failed: {}", e);
    }

    let status = resp.status();
    let upstream_headers = resp.headers().clone();

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(64);

    tokio::spawn(async move {
        let mut observer = UsageObserver::new(adapter.usage_framing());
        let mut upstream = resp.bytes_stream();
        let mut client_aborted = false;
        let mut stream_error: Option<String> = None;

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    observer.observe(&bytes);
                    if tx.send(Ok(bytes)).await.is_err() {
                        client_aborted = true;
                        break;
                    }
                }
                Err(e) => {
                    // Mid-stream failure: status is already committed, so
                    // append a final SSE error event and close cleanly.
                    stream_error = Some(e.to_string());
                    let frame = format!(
                        "event: error\ndata: {}\n\n",
                        json!({ "type": "error", "message": e.to_string() })
                    );
                    let _ = tx.send(Ok(Bytes::from(frame))).await;
                    break;
                }
            }
        }
        drop(tx);

        let elapsed_ms = started.elapsed().as_millis() as i64;
        let summary = observer.finish();
        let model_used = summary.model.clone().unwrap_or(model);

        let cost = match summary.usage.as_ref() {
            Some(usage) => Some(state.pricing.estimate_cost(&model_used, usage).await),
            None => None,
        };
        let tokens_per_second = summary.usage.and_then(|u| {
            (u.output_tokens > 0 && elapsed_ms > 0)
                .then(|| u.output_tokens as f64 * 1000.0 / elapsed_ms as f64)
        });

        let (success, error_message) = if client_aborted {
            (false, Some("client aborted".to_string()))
        } else if let Some(e) = stream_error {
            (false, Some(format!("stream error: {e}")))
        } else {
            (true, None)
        };

        let outcome = RequestOutcome {
            account_used: Some(account.name.clone()),
            status_code: Some(status.as_u16() as i64),
            success,
            error_message,
            response_time_ms: Some(elapsed_ms),
            failover_attempts,
            model: Some(model_used),
            usage: summary.usage,
            cost_usd: cost,
            output_tokens_per_second: tokens_per_second,
        };

        if let Err(e) = state.store.requests().finalize(&request_id, &outcome).await {
            tracing::error!("failed to finalize request {}: {}", request_id, e);
        }
        publish_summary(&state, &request_id, &outcome).await;

        if settings.payload_retention_days > 0 {
            let mut redacted_request = request_body;
            redact_json(&mut redacted_request);
            let response_text = String::from_utf8_lossy(&summary.body).into_owned();
            match state
                .store
                .requests()
                .insert_payload(&request_id, &redacted_request.to_string(), &response_text)
                .await
            {
                Ok(()) => {
                    state
                        .events
                        .requests
                        .publish(RequestEvent::Payload {
                            id: request_id.clone(),
                        })
                        .await;
                }
                Err(e) => tracing::warn!("payload capture failed for {}: {}", request_id, e),
            }
        }
    });

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_headers.iter() {
        // Hop-by-hop and length headers do not survive re-framing.
        if matches!(
            name.as_str(),
            "connection" | "transfer-encoding" | "content-length" | "keep-alive"
        ) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response_empty())
}

/// Tiny helper so builder fallbacks stay readable.
trait EmptyResponse {
    fn into_response_empty(self) -> Response;
}

impl EmptyResponse for StatusCode {
    fn into_response_empty(self) -> Response {
        Response::builder()
            .status(self)
            .body(Body::empty())
            .expect("empty response")
    }
}
