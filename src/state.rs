//! Central application state. Clone-friendly — every service is behind an
//! Arc; the entry point wires them once and the router clones freely.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::config::{Config, RuntimeSettings};
use crate::db::Store;
use crate::events::EventBus;
use crate::lifecycle::Lifecycle;
use crate::logs::LogBuffer;
use crate::mappings::ModelMapper;
use crate::oauth::{HttpTokenExchange, TokenManager};
use crate::pricing::PricingCatalog;
use crate::ratelimit::RateLimitTracker;
use crate::strategy::StrategyEngine;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub http_client: reqwest::Client,
    pub events: Arc<EventBus>,
    pub pricing: Arc<PricingCatalog>,
    pub tokens: Arc<TokenManager<HttpTokenExchange>>,
    pub strategy: Arc<StrategyEngine>,
    pub ratelimit: Arc<RateLimitTracker>,
    pub mapper: Arc<ModelMapper>,
    pub lifecycle: Arc<Lifecycle>,
    pub settings: Arc<RwLock<RuntimeSettings>>,
    pub log_buffer: Arc<LogBuffer>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Config, store: Store, settings: RuntimeSettings) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(store);

        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");

        let events = Arc::new(EventBus::new());
        let pricing = Arc::new(PricingCatalog::new(http_client.clone(), &config));
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            HttpTokenExchange::new(http_client.clone()),
            config.oauth_client_id.clone(),
        ));
        let strategy = Arc::new(StrategyEngine::new(store.clone()));
        let ratelimit = Arc::new(RateLimitTracker::new(store.clone(), events.clone()));

        Self {
            config,
            store,
            http_client,
            events,
            pricing,
            tokens,
            strategy,
            ratelimit,
            mapper: Arc::new(ModelMapper::new()),
            lifecycle: Arc::new(Lifecycle::new()),
            settings: Arc::new(RwLock::new(settings)),
            log_buffer: Arc::new(LogBuffer::new()),
            start_time: Instant::now(),
        }
    }

    /// Test constructor: in-memory store, offline pricing, default settings.
    #[doc(hidden)]
    pub async fn new_test() -> Self {
        let config = Config {
            port: 0,
            db_path: std::path::PathBuf::from(":memory:"),
            fast_mode: true,
            busy_timeout: std::time::Duration::from_secs(1),
            pricing_offline: true,
            pricing_refresh_hours: 24,
            debug: crate::config::DebugMode::Off,
            session_duration_ms: crate::config::DEFAULT_SESSION_DURATION_MS,
            openai_model_mappings: None,
            oauth_client_id: crate::oauth::DEFAULT_CLIENT_ID.to_string(),
        };
        let store = Store::open_in_memory().await.expect("in-memory store");
        AppState::new(config, store, RuntimeSettings::default())
    }
}
