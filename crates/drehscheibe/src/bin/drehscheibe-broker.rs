//! drehscheibe-broker — Central service broker for the gateway messaging
//! layer.
//!
//! Binds a ROUTER socket, routes client requests to service workers, and
//! evicts unresponsive workers. Periodically logs routing statistics.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (tcp://127.0.0.1:5570)
//! drehscheibe-broker
//!
//! # Custom endpoint
//! drehscheibe-broker --endpoint tcp://0.0.0.0:5570
//!
//! # From a config file, via environment
//! DREHSCHEIBE_CONFIG=/etc/drehscheibe.toml drehscheibe-broker
//! ```

use std::sync::Arc;

use clap::Parser;
use drehscheibe::broker::Broker;
use drehscheibe::config::DrehscheibeConfig;

/// Central service broker for the drehscheibe messaging layer.
#[derive(Parser, Debug)]
#[command(name = "drehscheibe-broker", version, about)]
struct Cli {
    /// Path to a drehscheibe.toml config file.
    #[arg(long, env = "DREHSCHEIBE_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Router socket endpoint (overrides the config file).
    #[arg(long, env = "DREHSCHEIBE_ENDPOINT")]
    endpoint: Option<String>,

    /// Heartbeat interval in milliseconds (overrides the config file).
    #[arg(long, env = "DREHSCHEIBE_HEARTBEAT_MS")]
    heartbeat_ms: Option<u64>,

    /// Interval in seconds between stats log lines (0 = disabled).
    #[arg(long, env = "DREHSCHEIBE_STATS_INTERVAL", default_value_t = 30)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting drehscheibe-broker");

    let mut config = match &cli.config {
        Some(path) => DrehscheibeConfig::from_file(path)?,
        None => DrehscheibeConfig::default(),
    };
    if let Some(endpoint) = cli.endpoint {
        config.broker.endpoint = endpoint;
    }
    if let Some(heartbeat_ms) = cli.heartbeat_ms {
        config.broker.heartbeat_ms = heartbeat_ms;
    }
    config.validate()?;

    let broker = Arc::new(Broker::new(config.broker));
    broker.start().await?;

    // Periodic stats reporter.
    if cli.stats_interval > 0 {
        let broker_for_stats = broker.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(cli.stats_interval));
            loop {
                interval.tick().await;
                let stats = broker_for_stats.stats();
                let services = broker_for_stats.services().await;
                tracing::info!(
                    requests = stats.requests,
                    responses = stats.responses,
                    synthesized_errors = stats.synthesized_errors,
                    dropped = stats.dropped,
                    services = services.len(),
                    "broker stats"
                );
                for service in &services {
                    tracing::debug!(
                        service = %service.name,
                        workers = service.workers,
                        waiting = service.waiting,
                        pending = service.pending,
                        "service stats"
                    );
                }
            }
        });
    }

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    broker.stop().await;

    tracing::info!("drehscheibe-broker exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }
}
