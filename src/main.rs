//! # Service Gateway - Main Entry Point
//!
//! Loads configuration, installs logging and the Prometheus recorder, then
//! serves the gateway until SIGINT or SIGTERM.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use service_gateway::core::config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use service_gateway::observability::{init_tracing, install_prometheus_recorder};
use service_gateway::{GatewayConfig, GatewayServer, ServiceRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().await?;
    init_tracing(&config.logging);

    info!("🚀 Starting service gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let prometheus = match install_prometheus_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus exporter unavailable, /metrics/prometheus disabled");
            None
        }
    };

    let registry = Arc::new(
        ServiceRegistry::new(config.health_check.clone()).context("failed to build service registry")?,
    );
    let server = GatewayServer::with_registry(config, registry, prometheus)
        .context("failed to build gateway")?;

    info!(
        routes = server.config().routes.len(),
        static_instances = server.config().static_instances.len(),
        strategy = %server.config().load_balancing.default_strategy,
        "🛣️  Gateway assembled"
    );

    let listener = server.bind().await.context("failed to bind listener")?;
    info!("🌐 Gateway ready on {}", listener.local_addr()?);
    info!("📊 Metrics available on /metrics and /metrics/prometheus");

    server
        .serve(listener, shutdown_signal())
        .await
        .context("gateway terminated with an error")?;

    info!("✅ Service gateway shutdown complete");
    Ok(())
}

/// Read `GATEWAY_CONFIG_PATH`, or the default path if present, or fall back
/// to built-in defaults with environment overrides.
async fn load_config() -> anyhow::Result<GatewayConfig> {
    let explicit = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
    let path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if explicit.is_some() || path.exists() {
        return GatewayConfig::load_from_file(&path)
            .await
            .with_context(|| format!("failed to load configuration from {}", path.display()));
    }

    // logging is not installed yet
    eprintln!(
        "config file {} not found, using built-in defaults",
        path.display()
    );
    let mut config = GatewayConfig::default();
    config
        .apply_env_overrides()
        .context("invalid environment override")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

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
        _ = ctrl_c => info!("📡 Received SIGINT (Ctrl+C), initiating graceful shutdown..."),
        _ = terminate => info!("📡 Received SIGTERM, initiating graceful shutdown..."),
    }
}
