use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use framemux::app::LogProcessor;
use framemux::capture::grabber::GrabberRegistry;
use framemux::config::AppConfig;
use framemux::coordinator::{Coordinator, spawn_reconciler};
use framemux::store::StoreProvider;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load config
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed loading configuration");
            return ExitCode::from(1);
        }
    };

    // Pick the frame store backend
    let stores = match &config.redis {
        Some(redis_config) => match redis::Client::open(redis_config.url.as_str()) {
            Ok(client) => {
                tracing::info!(url = %redis_config.url, "Using external redis frame store");
                StoreProvider::Redis(client)
            }
            Err(e) => {
                tracing::error!(error = %e, "Invalid redis configuration");
                return ExitCode::from(1);
            }
        },
        None => StoreProvider::InProcess,
    };

    let coordinator = Coordinator::new(GrabberRegistry::with_defaults(), stores);
    let _reconciler = spawn_reconciler(
        coordinator.clone(),
        Duration::from_secs(config.engine.reconcile_interval_secs),
    );

    // Launch the configured applications
    let processor = Arc::new(LogProcessor);
    let mut started = 0usize;
    for spec in &config.apps {
        match coordinator.add(spec.clone(), processor.clone()).await {
            Ok(handle) => {
                started += 1;
                tracing::info!(app = %handle.name(), source = %handle.key, "Application started");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed starting application");
            }
        }
    }
    if !config.apps.is_empty() && started == 0 {
        tracing::error!("No configured application could be started");
        return ExitCode::from(1);
    }
    tracing::info!(
        n_sources = coordinator.n_sources(),
        n_apps = coordinator.n_apps(),
        "Engine running"
    );

    let mut status = tokio::time::interval(Duration::from_secs(config.engine.status_interval_secs));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
            _ = status.tick() => {
                if coordinator.n_sources() > 0 && coordinator.all_sources_failed() {
                    tracing::error!("All sources failed, giving up");
                    coordinator.stop().await;
                    return ExitCode::from(2);
                }
                if let Ok(snapshot) = serde_json::to_string(&coordinator.describe()) {
                    tracing::debug!(snapshot = %snapshot, "Engine status");
                }
            }
        }
    }

    coordinator.stop().await;
    ExitCode::SUCCESS
}
