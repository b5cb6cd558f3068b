//! Background watchdog.
//!
//! Periodically checks service health and performs routine upkeep:
//! - DB connectivity ping (SELECT 1)
//! - expired rate-limit window sweep
//! - expired OAuth session sweep
//! - pricing-catalog staleness check + refresh

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::state::AppState;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);
const DB_PING_TIMEOUT: Duration = Duration::from_secs(5);
const PRICING_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

pub fn spawn(state: AppState, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("watchdog: started (interval={}s)", CHECK_INTERVAL.as_secs());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("watchdog: stopping");
                    return;
                }
                _ = tokio::time::sleep(CHECK_INTERVAL) => {}
            }

            let db_ok = check_db(&state).await;
            sweep_rate_limits(&state).await;
            sweep_oauth_sessions(&state).await;
            refresh_pricing_if_stale(&state).await;

            if db_ok {
                tracing::debug!("watchdog: all checks passed");
            }
        }
    })
}

async fn check_db(state: &AppState) -> bool {
    let result = tokio::time::timeout(
        DB_PING_TIMEOUT,
        sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(state.store.pool()),
    )
    .await;

    match result {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::error!("watchdog: DB ping failed: {}", e);
            false
        }
        Err(_) => {
            tracing::error!(
                "watchdog: DB ping timed out after {}s",
                DB_PING_TIMEOUT.as_secs()
            );
            false
        }
    }
}

async fn sweep_rate_limits(state: &AppState) {
    let now = chrono::Utc::now().timestamp_millis();
    if let Err(e) = state.ratelimit.sweep(now).await {
        tracing::warn!("watchdog: rate-limit sweep failed: {}", e);
    }
}

async fn sweep_oauth_sessions(state: &AppState) {
    let now = chrono::Utc::now().timestamp_millis();
    match state.store.oauth_sessions().delete_expired(now).await {
        Ok(0) => {}
        Ok(n) => tracing::info!("watchdog: swept {} expired OAuth session(s)", n),
        Err(e) => tracing::warn!("watchdog: OAuth session sweep failed: {}", e),
    }
}

async fn refresh_pricing_if_stale(state: &AppState) {
    if !state.pricing.is_stale().await {
        return;
    }
    tracing::info!("watchdog: pricing catalog stale, refreshing");
    let refresh = async {
        state.pricing.refresh().await;
        state.pricing.refresh_nanogpt().await;
    };
    if tokio::time::timeout(PRICING_REFRESH_TIMEOUT, refresh).await.is_err() {
        tracing::error!(
            "watchdog: pricing refresh timed out after {}s",
            PRICING_REFRESH_TIMEOUT.as_secs()
        );
    }
}
