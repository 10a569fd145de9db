//! Thread Border Router routing daemon
//!
//! Reads control-plane events as JSON lines on stdin, one
//! `BorderRouterEvent` per line:
//!
//! ```text
//! {"event":"set_upstream","interface":"eth0"}
//! {"event":"infra_link_up","interface":"eth0"}
//! {"event":"mesh_link_up"}
//! {"event":"thread_listener","group":"ff05::1234","node":1024,"op":"register"}
//! ```

use anyhow::Context;
use clap::Parser;
use std::time::Duration;
use tbr_routingd::config::DEFAULT_CONFIG_PATH;
use tbr_routingd::daemon::DEFAULT_EVENT_CAPACITY;
use tbr_routingd::{
    BorderRouter, BorderRouterEvent, BorderRoutingConfig, Daemon, DaemonHandle, LoggingPlatform,
    MetricsCollector,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};

/// Thread Border Router border routing and multicast forwarding daemon
#[derive(Parser, Debug)]
#[command(name = "tbr-routingd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults apply if missing)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Infra interface to use as upstream, overrides the config file
    #[arg(short = 'u', long)]
    upstream: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Interval between snapshot dumps in the log, 0 disables them
    #[arg(long, default_value = "60")]
    snapshot_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("tbr-routingd: Starting border routing daemon");

    let mut config = BorderRoutingConfig::load_or_default(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;
    if let Some(upstream) = args.upstream {
        config.infra.upstream = Some(upstream);
        config.validate().context("Invalid --upstream")?;
    }
    info!(
        upstream = ?config.infra.upstream,
        registration_timeout = ?config.registration_timeout(),
        join_retry = ?config.join_retry_interval(),
        ra_interval = ?config.ra_interval(),
        "tbr-routingd: Configuration loaded"
    );

    let metrics = MetricsCollector::new().context("Failed to create metrics registry")?;
    let router = BorderRouter::new(config, LoggingPlatform, metrics.clone());
    let (daemon, handle) = Daemon::new(router, DEFAULT_EVENT_CAPACITY);
    let event_loop = tokio::spawn(daemon.run());

    tokio::spawn(read_control_events(handle.clone()));
    if args.snapshot_interval_secs > 0 {
        tokio::spawn(log_snapshots(
            handle.clone(),
            metrics,
            Duration::from_secs(args.snapshot_interval_secs),
        ));
    }

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("tbr-routingd: Received SIGINT, shutting down");
    handle.shutdown();

    event_loop.await.context("Event loop task failed")?;
    info!("tbr-routingd: Graceful shutdown complete");
    Ok(())
}

fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Forwards JSON-lines events from stdin until EOF.
async fn read_control_events(handle: DaemonHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("tbr-routingd: Control input closed");
                return;
            }
            Err(e) => {
                warn!(error = %e, "tbr-routingd: Failed to read control input");
                return;
            }
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match serde_json::from_str::<BorderRouterEvent>(line) {
            Ok(event) => {
                if handle.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, line, "tbr-routingd: Ignoring unparseable event"),
        }
    }
}

async fn log_snapshots(handle: DaemonHandle, metrics: MetricsCollector, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        match handle.snapshot().to_json() {
            Ok(json) => info!(snapshot = %json, "tbr-routingd: Table snapshot"),
            Err(e) => warn!(error = %e, "tbr-routingd: Failed to serialize snapshot"),
        }
        debug!(metrics = %metrics.gather(), "tbr-routingd: Metrics");
    }
}
