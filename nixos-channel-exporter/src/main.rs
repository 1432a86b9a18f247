//! Prometheus exporter for NixOS channel status.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use nixos_channel_exporter::{
    BuildInfoCollector, ChannelCollector, CollectorSettings, ExporterConfig, Gatherer, HttpServer,
    ProcessCollector,
};
use nixos_channels::{Registry, RevisionFetcher, init_tracing};

/// Prometheus exporter for NixOS channel status.
#[derive(Parser, Debug)]
#[command(name = "nixos-channel-exporter")]
#[command(about = "Export NixOS channel revisions as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// Path to the channels.json file derived from channels.nix (overrides config).
    #[arg(long)]
    channels: Option<String>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Base URL of the channel status server (overrides config).
    #[arg(long)]
    base_url: Option<String>,

    /// Log level (trace, debug, info, warn, error; overrides config).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)
            .with_context(|| format!("failed to load config {}", config_path))?
    } else {
        ExporterConfig::default()
    };

    // Apply CLI overrides
    if let Some(channels) = args.channels {
        config.channels_file = channels;
    }
    if let Some(listen) = args.listen {
        config.prometheus.listen = listen;
    }
    if let Some(base_url) = args.base_url {
        config.upstream.base_url = base_url;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    init_tracing(&config.logging)?;

    info!("Starting NixOS channel exporter");

    // The registry is fatal to get wrong: refuse to serve without it.
    let registry = Registry::load_from_file(&config.channels_file).with_context(|| {
        format!(
            "failed to load channels data from {}",
            config.channels_file
        )
    })?;
    info!(
        channels = registry.len(),
        file = %config.channels_file,
        "Loaded channel registry"
    );

    let fetcher = RevisionFetcher::from_config(&config.upstream)?;
    info!(
        base_url = %fetcher.base_url(),
        scrape_timeout_secs = config.upstream.scrape_timeout_secs,
        fail_fast = config.upstream.fail_fast,
        "Configured channel status server"
    );

    let collector = ChannelCollector::new(
        registry,
        fetcher,
        CollectorSettings::from(&config.upstream),
    );

    let mut gatherer = Gatherer::new();
    gatherer.register(Arc::new(BuildInfoCollector::default()))?;
    gatherer.register(Arc::new(ProcessCollector::new()))?;
    gatherer.register(Arc::new(collector))?;
    let gatherer = Arc::new(gatherer);

    let listen_addr: SocketAddr = config
        .prometheus
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_server = HttpServer::new(
        gatherer,
        listen_addr,
        config.prometheus.path.clone(),
        config.prometheus.error_handling,
    )
    .with_request_timeout(config.prometheus.request_timeout());
    let mut http_task = tokio::spawn(http_server.run(shutdown_rx));

    // Wait for a shutdown signal, or for the server to exit on its own
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
        result = &mut http_task => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("HTTP server error: {}", e);
                    Err(e)
                }
                Err(e) => Err(e.into()),
            };
        }
    }

    // Signal shutdown
    shutdown_tx.send(true)?;

    if tokio::time::timeout(Duration::from_secs(5), http_task)
        .await
        .is_err()
    {
        error!("HTTP server did not stop within 5s");
    }

    info!("Exporter stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
