//! HTLC Relayer - cross-chain hashlock/timelock swap coordination
//!
//! Watches escrow contracts on every configured chain, relays escrow,
//! fulfillment and refund messages between them, and executes orders.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use htlc_relayer::config::Settings;
use htlc_relayer::metrics::MetricsServer;
use htlc_relayer::{api, RelayerService};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting HTLC Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Build the core (journal, adapters, ledger, relay, engine)
    let service = Arc::new(RelayerService::new(settings.clone()).await?);
    service.start().await?;

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let service = service.clone();
        async move {
            if let Err(e) = api::run_server(config, service).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("HTLC Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await?;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: drain deliveries within the grace period
    let stats = service.stop().await;
    if stats.pending > 0 {
        info!(
            "{} messages left pending; they are recovered from chain state on restart",
            stats.pending
        );
    }

    api_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("HTLC Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,htlc_relayer=debug,sqlx=warn,hyper=warn"));

    let json = std::env::var("RELAYER_LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = ctrl_c => result?,
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await?;

    Ok(())
}
