//! InferLoop Worker - Main Entry Point
//!
//! Loads configuration, starts the worker pool against the configured
//! inference backend and checks model health until shutdown.

use anyhow::{bail, Context, Result};
use inferloop_common::{InferLoopConfig, METRICS};
use inferloop_worker::{InferenceService, MemoryStore, MockEngine, SharedStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::var("INFERLOOP_CONFIG")
        .unwrap_or_else(|_| "configs/worker-config.yaml".to_string());
    let config = InferLoopConfig::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;

    // Initialize logging
    let fallback = format!("inferloop_worker={0},inferloop_common={0}", config.observability.log_level);
    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()),
    );
    if config.observability.structured_logging {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().compact()).init();
    }

    info!("Starting InferLoop Worker");
    info!(
        "Configuration loaded: {} models, default={}, pool_size={}, delivery={:?}",
        config.models.catalog.len(),
        config.models.default_model,
        config.pool_size(),
        config.batching.delivery
    );

    if !config.engine.mock {
        bail!("no inference backend linked into this build; set MOCK_INFERENCE=true");
    }
    warn!("Running with the mock inference engine");

    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let service = Arc::new(InferenceService::new(
        config,
        Arc::new(MockEngine::new()),
        store,
    ));
    service.start();

    let health = tokio::spawn(run_health_checks(Arc::clone(&service)));

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Received shutdown signal");

    health.abort();
    service.shutdown().await;

    if service.config().observability.enable_metrics {
        info!("Final metrics:\n{}", METRICS.gather());
    }
    info!("InferLoop Worker shutdown complete");
    Ok(())
}

/// Periodically run a prompt through the default model
async fn run_health_checks(service: Arc<InferenceService<MockEngine>>) {
    let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    loop {
        interval.tick().await;

        let model = service.health_check().await;
        let store = service.store_health().await;
        if model.healthy && store.healthy {
            info!("Health check: {}; {}", model.message, store.message);
        } else {
            warn!("Health check: {}; {}", model.message, store.message);
        }
    }
}
