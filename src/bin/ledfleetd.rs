//! ledfleet daemon - renders site pixel buffers and streams them to devices
//!
//! # Usage
//!
//! ```bash
//! # Run the engine in the foreground (default command)
//! ledfleetd run --config sites.toml
//!
//! # Also write a JSON status snapshot every 5 seconds
//! ledfleetd run --status-file /run/ledfleet/status.json --stats-interval 5
//!
//! # Validate configuration and print the topology
//! ledfleetd check --config sites.toml
//! ```
//!
//! Without `--config`, the path comes from `LEDFLEET_CONFIG`, then the
//! platform config directory (`ledfleet/sites.toml`).

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ledfleet_core::DEFAULT_DEVICE_PORT;
use ledfleetd::config::{resolve_config_path, FleetConfig};
use ledfleetd::engine::Engine;
use ledfleetd::monitor::{spawn_monitor_task, STATS_INTERVAL};
use ledfleetd::telemetry::Telemetry;

/// ledfleet daemon - LED frame distribution
#[derive(Parser, Debug)]
#[command(name = "ledfleetd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine until SIGINT or SIGTERM
    Run {
        /// Site configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write a JSON fleet snapshot here on every stats interval
        #[arg(long)]
        status_file: Option<PathBuf>,

        /// Seconds between fleet status samples
        #[arg(long, default_value_t = STATS_INTERVAL.as_secs())]
        stats_interval: u64,
    },
    /// Validate the configuration and print the site topology
    Check {
        /// Site configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Run {
        config: None,
        status_file: None,
        stats_interval: STATS_INTERVAL.as_secs(),
    });

    match command {
        Command::Run {
            config,
            status_file,
            stats_interval,
        } => run_daemon(config, status_file, Duration::from_secs(stats_interval.max(1))),
        Command::Check { config } => check_config(config),
    }
}

fn load_config(explicit: Option<PathBuf>) -> Result<(PathBuf, FleetConfig)> {
    let path = resolve_config_path(explicit).context("Failed to locate configuration")?;
    let config = FleetConfig::load(&path)
        .with_context(|| format!("Invalid configuration {}", path.display()))?;
    Ok((path, config))
}

fn check_config(explicit: Option<PathBuf>) -> Result<()> {
    let (path, config) = load_config(explicit)?;

    println!("Configuration OK: {}", path.display());
    for site in &config.sites {
        let fps = if site.fps > 0 {
            site.fps.to_string()
        } else {
            "unset (30)".to_string()
        };
        println!(
            "site {:<16} width {:>5}  fps {:<10} producers {}",
            site.name,
            site.width,
            fps,
            site.schedule.len()
        );
        for ch in &site.channels {
            let port = if ch.port == DEFAULT_DEVICE_PORT {
                String::new()
            } else {
                format!(":{}", ch.port)
            };
            println!(
                "  {:<20} {}{}  [{}..{})  batch {}{}{}",
                ch.friendly_name,
                ch.host,
                port,
                ch.offset,
                ch.offset + ch.length,
                ch.batch_size,
                if ch.reversed { "  reversed" } else { "" },
                if ch.clock.is_legacy() { "  legacy-clock" } else { "" },
            );
        }
    }
    println!(
        "{} site(s), {} channel(s)",
        config.sites.len(),
        config.channel_count()
    );
    Ok(())
}

#[tokio::main]
async fn run_daemon(
    config: Option<PathBuf>,
    status_file: Option<PathBuf>,
    stats_interval: Duration,
) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("ledfleetd=info".parse()?)
                .add_directive("ledfleet_core=info".parse()?)
                .add_directive("ledfleet_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "ledfleet daemon starting"
    );

    let (path, config) = load_config(config)?;
    info!(
        config = %path.display(),
        sites = config.sites.len(),
        channels = config.channel_count(),
        "Configuration loaded"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let telemetry = Arc::new(Telemetry::new());
    let engine = Arc::new(Engine::new(&config, telemetry).context("Failed to build engine")?);
    engine
        .start(cancel_token.clone())
        .context("Failed to start engine")?;

    let monitor_handle = spawn_monitor_task(
        Arc::clone(&engine),
        stats_interval,
        status_file,
        cancel_token.clone(),
    );

    cancel_token.cancelled().await;

    if let Err(e) = monitor_handle.await {
        error!(error = %e, "Monitor task failed");
    }

    // Engine threads sleep in short steps; joining them blocks briefly
    let stopper = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || stopper.stop())
        .await
        .context("Failed to join engine threads")?;

    info!("ledfleet daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
