use anyhow::{Context, Result};
use recording_sync::api::{start_api_server, AppState};
use recording_sync::{Config, RecordingManager, ShinobiClient};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        recorder = %config.recorder.base_url,
        "Starting recording sync service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let client = Arc::new(
        ShinobiClient::new(&config.recorder).context("Failed to initialize recorder client")?,
    );

    let manager = Arc::new(
        RecordingManager::from_config(&config, client)
            .context("Failed to initialize recording manager")?,
    );
    manager.start().await?;

    // Spawn API server task
    let api_state = AppState {
        manager: manager.clone(),
    };
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Recording sync service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down recording sync service");

    api_handle.abort();
    manager.stop().await;

    info!("Recording sync service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
