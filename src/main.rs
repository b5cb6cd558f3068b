use std::sync::Arc;

use http::header;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use claude_relay::config::{Config, RuntimeSettings};
use claude_relay::db::Store;
use claude_relay::logs::{spawn_forwarder, LogCaptureLayer};
use claude_relay::state::AppState;
use claude_relay::watchdog;

fn build_app(state: AppState) -> axum::Router {
    // Dashboard is served from arbitrary local origins.
    let cors = CorsLayer::permissive();

    // Coarse per-IP limiting for the management surface; account-level
    // rate limits are domain logic and live in the dispatcher.
    let governor_conf = GovernorConfigBuilder::default()
        .per_millisecond(250)
        .burst_size(200)
        .finish()
        .expect("rate limiter config");

    claude_relay::create_router(state)
        .layer(GovernorLayer::new(governor_conf))
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            header::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            header::HeaderValue::from_static("DENY"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Log capture has to exist before the subscriber is installed; the
    // forwarder task is wired up once the event bus is alive.
    let log_buffer = Arc::new(claude_relay::logs::LogBuffer::new());
    let (capture_layer, capture_rx) = LogCaptureLayer::new(log_buffer.clone());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .with(capture_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(true))
            .with(capture_layer)
            .init();
    }

    let config = Config::from_env()?;
    tracing::info!(db = ?config.db_path, "opening store");
    let store = Store::open(&config).await.map_err(|e| {
        tracing::error!("fatal: store open failed: {}", e);
        anyhow::anyhow!("store open failed: {e}")
    })?;
    let settings = store.settings().load().await.unwrap_or_else(|e| {
        tracing::warn!("settings load failed ({}), using defaults", e);
        RuntimeSettings::default()
    });

    let port = config.port;
    let state = {
        let mut state = AppState::new(config, store, settings);
        // Swap in the buffer the capture layer writes into.
        state.log_buffer = log_buffer;
        state
    };

    // ── Background services, registered for ordered shutdown ───────────
    let forwarder = spawn_forwarder(capture_rx, state.events.clone());
    state.lifecycle.register_task("log-forwarder", forwarder).await;

    let pricing_state = state.clone();
    tokio::spawn(async move {
        pricing_state.pricing.refresh().await;
        pricing_state.pricing.refresh_nanogpt().await;
    });

    let watchdog_handle = watchdog::spawn(state.clone(), state.lifecycle.cancellation_token());
    state.lifecycle.register_task("watchdog", watchdog_handle).await;

    let store_for_close = state.store.clone();
    state
        .lifecycle
        .register("store", move || async move {
            store_for_close.close().await;
        })
        .await;

    let app = build_app(state.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    print_banner(port);
    tracing::info!("claude-relay listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    state.lifecycle.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

fn print_banner(port: u16) {
    println!();
    println!("  \x1b[1;36m>>>  CLAUDE RELAY  <<<\x1b[0m");
    println!("  \x1b[36mLLM reverse proxy & load balancer\x1b[0m");
    println!("  \x1b[1;32mhttp://localhost:{port}\x1b[0m");
    println!();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("shutdown signal received, starting graceful shutdown");
}
