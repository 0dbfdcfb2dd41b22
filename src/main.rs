//! Intent Settler - custodial cross-chain swap settlement
//!
//! Watches for deposits into custody on two chains, validates the intent
//! embedded in each deposit memo and pays the counter-asset out on the other
//! chain at a rate set by an internal market-making oracle.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod clock;
mod config;
mod envelope;
mod error;
mod intent;
mod metrics;
mod oracle;
mod settlement;
mod state;
mod tx;

use chain::ChainManager;
use clock::{Clock, SystemClock};
use config::Settings;
use metrics::MetricsServer;
use settlement::SettlementEngine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Intent Settler v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: {} ({}) <-> {} ({})",
        settings.chains.a.name, settings.chains.a.asset, settings.chains.b.name, settings.chains.b.asset
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Intent store, migrated when backed by Postgres
    let store = state::connect(&settings.storage).await?;
    info!("Intent store ready ({:?})", settings.storage.backend);

    // Oracle resumes from the persisted rate log
    let oracle = Arc::new(
        settlement::bootstrap_oracle(store.as_ref(), settings.oracle.clone(), clock.clone())
            .await?,
    );
    let rate = oracle.current_rate().await;
    info!("Oracle initialized at rate {}", rate.rate);

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Chain connections and payout wallet
    let chain_manager = Arc::new(ChainManager::connect(&settings, clock.clone()).await?);
    info!("Chain connections initialized");

    let engine = Arc::new(SettlementEngine::new(
        store,
        chain_manager,
        oracle,
        settings.settler.clone(),
        clock,
    ));
    info!("Settlement engine initialized");

    if !engine.health_check().await {
        warn!("Starting with an unhealthy dependency; payouts may queue");
    }

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let engine = engine.clone();
        async move {
            if let Err(e) = api::run_server(config, engine).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start the sweep loop
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Settlement engine error: {}", e);
            }
        }
    });

    info!("Intent Settler is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    engine.stop().await;

    api_handle.abort();
    engine_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Intent Settler stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,intent_settler=debug,sqlx=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("SETTLER_LOG_JSON").is_ok() {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
