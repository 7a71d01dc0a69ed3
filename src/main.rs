//! idle-watchdogd - ends a session after a period without user activity.
//!
//! Reads activity signals (one per line) from stdin or a Unix socket and runs
//! the configured idle command once no signal has arrived for the timeout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use idle_watchdog::ActivityBus;
use idle_watchdog::Config;
use idle_watchdog::activity::feed::ActivityFeed;
use idle_watchdog::daemon;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Idle session watchdog.
///
/// Ends the session once no activity has been seen for the configured timeout.
#[derive(Parser, Debug)]
#[command(name = "idle-watchdogd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Idle timeout in milliseconds (overrides config).
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Read activity signals from this Unix socket instead of stdin.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Enable dry-run mode (don't actually run the idle command).
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print parsed activity signals to stdout.
    #[arg(long)]
    print_events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("idle-watchdogd v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if args.socket.is_some() {
        config.socket_path = args.socket;
    }
    if args.dry_run {
        config.dry_run = true;
    }

    info!(
        "Configuration loaded (timeout={:?}, dry_run={})",
        config.timeout(),
        config.dry_run
    );

    run(config, args.print_events).await
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("idle_watchdog={level},idle_watchdogd={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

/// Connect the configured feed and watch the session until it goes idle.
async fn run(config: Config, print_events: bool) -> Result<()> {
    let feed = match config.socket_path {
        Some(ref path) => ActivityFeed::connect(path)
            .await
            .context("Failed to connect to activity socket")?,
        None => ActivityFeed::stdin(),
    };

    let bus = Arc::new(ActivityBus::new());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for interrupt: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let outcome = daemon::run(&config, feed, bus, print_events, shutdown).await?;
    info!("idle-watchdogd exiting ({:?})", outcome);
    Ok(())
}
