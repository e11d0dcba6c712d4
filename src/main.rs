//! # Kerya API Gateway - Main Entry Point
//!
//! Startup sequence:
//! 1. Load configuration (`GATEWAY_CONFIG_PATH`, defaults if the file is missing)
//! 2. Initialize structured logging
//! 3. Install the Prometheus recorder when metrics are enabled
//! 4. Build the gateway service and start its background jobs
//! 5. Serve until SIGINT/SIGTERM, then drain and stop background jobs

use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use kerya_gateway::core::config::GatewayConfig;
use kerya_gateway::gateway::{build_app, serve, GatewayService};
use kerya_gateway::observability::{init_logging, metrics::install_prometheus_recorder};
use kerya_gateway::GatewayResult;

#[tokio::main]
async fn main() -> GatewayResult<()> {
    let config_path = GatewayConfig::config_path();
    let config = match GatewayConfig::load_or_default(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", config_path.display(), e);
            std::process::exit(1);
        }
    };

    init_logging(&config.observability)?;

    info!("🚀 Starting Kerya API Gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        config_path = %config_path.display(),
        routes = config.routes.len(),
        "📋 Configuration loaded"
    );

    let metrics = if config.observability.metrics_enabled {
        let handle = install_prometheus_recorder()?;
        info!("📊 Prometheus metrics enabled");
        Some(handle)
    } else {
        None
    };

    let bind_address = config.server.bind_address();
    let config = Arc::new(config);

    let service = match GatewayService::new(Arc::clone(&config)) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to build gateway service: {}", e);
            std::process::exit(1);
        }
    };

    for route in service.router().routes() {
        info!(
            service = %route.name,
            prefix = %route.path_prefix,
            target = %route.target_base_url,
            "🔗 Route registered"
        );
    }

    service.start();

    let app = build_app(Arc::clone(&service), metrics);
    let result = serve(app, &bind_address, shutdown_signal()).await;

    info!("🛑 Shutting down background jobs...");
    service.shutdown().await;

    match result {
        Ok(()) => {
            info!("✅ Kerya API Gateway shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Gateway server failed: {}", e);
            Err(e)
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => info!("📡 Received Ctrl+C, starting graceful shutdown"),
        _ = terminate => info!("📡 Received SIGTERM, starting graceful shutdown"),
    }
}
