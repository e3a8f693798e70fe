//! Application entry point.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use secrecy::SecretString;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use custody_settlement::api::create_router;
use custody_settlement::app::{
    AppState, ConfirmationWatcher, DepositPromoter, JobRouter, OrchestratorConfig, PromoterConfig,
    SettlementQueue, WatcherConfig, WithdrawalOrchestrator, WorkerConfig, spawn_promoter,
    spawn_reaper, spawn_workers,
};
use custody_settlement::domain::{
    AlertSink, ChainRpcClient, ExchangeClient, LedgerStore, MetadataStore, WalletPool,
};
use custody_settlement::infra::{
    HttpChainRpc, HttpExchangeClient, PostgresConfig, PostgresStore, RpcClientConfig,
    WebhookAlertSink,
};

/// Application configuration
struct Config {
    database_url: String,
    host: String,
    port: u16,
    /// Exchange withdrawal API base URL
    exchange_api_url: String,
    /// Exchange API key (optional - uses mock mode if not set)
    exchange_api_key: Option<SecretString>,
    /// Exchange callback secret for authentication (optional)
    callback_secret: Option<String>,
    /// Operator alert webhook URL (optional - log-only if not set)
    alert_webhook_url: Option<String>,
    /// Chain pinged by the health endpoint
    health_chain: String,
    enable_background_workers: bool,
    worker_config: WorkerConfig,
    orchestrator_config: OrchestratorConfig,
    watcher_config: WatcherConfig,
    promoter_config: PromoterConfig,
}

impl Config {
    fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let exchange_api_url = env::var("EXCHANGE_API_URL")
            .unwrap_or_else(|_| "https://api.exchange.invalid".to_string());
        let exchange_api_key = env::var("EXCHANGE_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::from);
        let callback_secret = env::var("CALLBACK_SECRET").ok().filter(|s| !s.is_empty());
        let alert_webhook_url = env::var("ALERT_WEBHOOK_URL").ok().filter(|u| !u.is_empty());
        let health_chain = env::var("HEALTH_CHAIN").unwrap_or_else(|_| "ETH".to_string());

        let enable_background_workers = env::var("ENABLE_BACKGROUND_WORKERS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        let mut worker_config = WorkerConfig::default();
        if let Some(workers) = env::var("SETTLEMENT_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            worker_config.workers = workers;
        }
        if let Some(secs) = env::var("REAP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            worker_config.reap_interval = Duration::from_secs(secs);
        }

        let mut orchestrator_config = OrchestratorConfig::default();
        if let Some(attempts) = env::var("MAX_SUBMIT_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            orchestrator_config.max_attempts = attempts;
        }
        if let Some(secs) = env::var("SUBMIT_RETRY_DELAY_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            orchestrator_config.submit_retry_delay = Duration::from_secs(secs);
        }

        let mut watcher_config = WatcherConfig::default();
        if let Some(confs) = env::var("REQUIRED_CONFIRMATIONS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            watcher_config.required_confirmations = confs;
        }
        if let Some(secs) = env::var("CONFIRMATION_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            watcher_config.poll_interval = Duration::from_secs(secs);
        }

        let mut promoter_config = PromoterConfig::default();
        if let Some(secs) = env::var("PROMOTER_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            promoter_config.interval = Duration::from_secs(secs);
        }

        Ok(Self {
            database_url,
            host,
            port,
            exchange_api_url,
            exchange_api_key,
            callback_secret,
            alert_webhook_url,
            health_chain,
            enable_background_workers,
            worker_config,
            orchestrator_config,
            watcher_config,
            promoter_config,
        })
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    info!("🏦 Custody Settlement v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    info!("📦 Initializing infrastructure...");

    let postgres = Arc::new(PostgresStore::new(&config.database_url, PostgresConfig::default()).await?);
    postgres.run_migrations().await?;
    info!("   ✓ Database connected and migrations applied");

    let store: Arc<dyn LedgerStore> = postgres.clone();
    let metadata: Arc<dyn MetadataStore> = postgres.clone();
    let wallets: Arc<dyn WalletPool> = postgres.clone();

    let chain_rpc: Arc<dyn ChainRpcClient> = Arc::new(HttpChainRpc::new(RpcClientConfig::default())?);
    info!("   ✓ Chain RPC client created");

    let exchange: Arc<dyn ExchangeClient> = Arc::new(HttpExchangeClient::new(
        config.exchange_api_url.clone(),
        config.exchange_api_key.clone(),
    )?);
    if config.exchange_api_key.is_some() {
        info!("   ✓ Exchange client created");
    } else {
        info!("   ⚠ Exchange client created (MOCK MODE - no EXCHANGE_API_KEY)");
    }

    let alerts: Arc<dyn AlertSink> = Arc::new(WebhookAlertSink::new(config.alert_webhook_url.clone()));
    if config.alert_webhook_url.is_some() {
        info!("   ✓ Alert webhook configured");
    } else {
        info!("   ○ Alert webhook not configured (log-only alerts)");
    }

    let (queue, job_receiver, shutdown_tx) = SettlementQueue::new();

    let app_state = AppState::new(
        Arc::clone(&store),
        Arc::clone(&metadata),
        Arc::clone(&chain_rpc),
        Arc::clone(&exchange),
        Arc::clone(&alerts),
        queue.clone(),
    )
    .with_callback_secret(config.callback_secret.clone())
    .with_health_chain(config.health_chain.clone());
    if config.callback_secret.is_some() {
        info!("   ✓ Exchange callback secret configured");
    } else {
        info!("   ○ Exchange callback secret not configured (callback auth disabled)");
    }
    let app_state = Arc::new(app_state);

    if config.enable_background_workers {
        let orchestrator = Arc::new(WithdrawalOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&metadata),
            Arc::clone(&wallets),
            Arc::clone(&chain_rpc),
            Arc::clone(&exchange),
            Arc::clone(&alerts),
            queue.clone(),
            config.orchestrator_config.clone(),
        ));
        let watcher = Arc::new(ConfirmationWatcher::new(
            Arc::clone(&store),
            Arc::clone(&metadata),
            Arc::clone(&chain_rpc),
            Arc::clone(&alerts),
            queue.clone(),
            config.watcher_config.clone(),
        ));
        let router = Arc::new(JobRouter::new(orchestrator, watcher));

        spawn_workers(
            router,
            job_receiver,
            &config.worker_config,
            queue.shutdown_signal(),
        );
        spawn_reaper(
            Arc::clone(&store),
            queue.clone(),
            &config.worker_config,
            queue.shutdown_signal(),
        );
        info!(
            "   ✓ Settlement workers started ({} workers, reap every {:?})",
            config.worker_config.workers, config.worker_config.reap_interval
        );

        let promoter = Arc::new(DepositPromoter::new(
            Arc::clone(&store),
            Arc::clone(&alerts),
            config.promoter_config.clone(),
        ));
        spawn_promoter(promoter, queue.shutdown_signal());
        info!("   ✓ Deposit promoter started");
    } else {
        info!("   ○ Background workers disabled");
    }

    let router = create_router(app_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("🚀 Server starting on http://{}", addr);
    info!("📖 Swagger UI available at http://{}/swagger-ui", addr);
    info!("📄 OpenAPI spec at http://{}/api-docs/openapi.json", addr);
    info!("💊 Health endpoint pings chain {}", config.health_chain);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Signal background tasks to shutdown
    let _ = shutdown_tx.send(true);

    info!("Server shutdown complete");
    Ok(())
}
