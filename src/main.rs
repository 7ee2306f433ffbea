//! `trackspace`: real-time chat hub for track-space.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use trackspace_server::{load_config, ChatServer};
use trackspace_telemetry::{init_telemetry, parse_level, TelemetryConfig};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "trackspace", about = "WebSocket chat hub for track-space")]
struct Args {
    /// JSON config file, merged over the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address.
    #[arg(long)]
    host: Option<String>,

    /// Bind port (0 picks a free one).
    #[arg(long)]
    port: Option<u16>,

    /// trace, debug, info, warn or error.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())
        .with_context(|| format!("failed to load config: {:?}", args.config))?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if args.json_logs {
        config.json_logs = true;
    }
    config.validate().context("invalid configuration")?;

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(&config.log_level)?,
        json: config.json_logs,
        ..TelemetryConfig::default()
    });

    let server = ChatServer::new(config, telemetry.metrics())?;
    let addr = server.listen().await.context("failed to bind")?;
    tracing::info!(
        %addr,
        max_connections = server.config().max_connections,
        "trackspace ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    let report = server.shutdown(Some(SHUTDOWN_TIMEOUT)).await;
    if !report.drained {
        tracing::warn!("some tasks were aborted during shutdown");
    }
    for series in &report.metrics {
        tracing::info!(
            metric = %series.name,
            kind = ?series.metric_type,
            labels = series.labels.as_deref().unwrap_or(""),
            value = series.value,
            "final metric"
        );
    }
    Ok(())
}
