use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::WardenConfig;
use ratewarden::ratelimit::{DistributedRateLimiter, Preset, RateLimiter, RateLimiterBackend};

#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about = "Adaptive rate limiting engine")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read `identifier [user]` lines from stdin and print one JSON verdict per line
    Check {
        /// Treat lines as `user endpoint` and check the user, endpoint and global tiers
        #[arg(long)]
        tiers: bool,

        /// Include the global tier in multi-tier checks
        #[arg(long, requires = "tiers")]
        global: bool,
    },
    /// Print the built-in presets
    Presets,
    /// Load and validate the configuration
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = WardenConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config, cli.json_logs);

    match cli.command {
        Command::Check { tiers, global } => run_check(&config, tiers, global).await,
        Command::Presets => {
            print_presets();
            Ok(())
        }
        Command::Validate => {
            config.validate().context("invalid configuration")?;
            println!(
                "configuration OK: {} limit(s), backend {:?}",
                config.limits.len(),
                config.distributed.backend
            );
            Ok(())
        }
    }
}

fn init_tracing(config: &WardenConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json || config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_presets() {
    println!("{:<10} {:>8}  {}", "preset", "requests", "window");
    for preset in Preset::ALL {
        let (requests, window) = preset.quota();
        println!("{:<10} {:>8}  {:?}", preset.name(), requests, window);
    }
}

async fn run_check(config: &WardenConfig, tiers: bool, global: bool) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;

    info!("Starting Ratewarden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let stopped = async move {
        let _ = shutdown_rx.changed().await;
    };

    let (backend, cleanup): (Arc<dyn RateLimiterBackend>, JoinHandle<()>) =
        match config.connect_store().await? {
            Some(store) => {
                let limiter: Arc<DistributedRateLimiter> = Arc::new(config.build_distributed(store)?);
                let handle = limiter.spawn_cleanup(config.cleanup_interval(), stopped);
                (limiter as Arc<dyn RateLimiterBackend>, handle)
            }
            None => {
                let limiter: Arc<RateLimiter> = Arc::new(config.build_limiter()?);
                let handle = limiter.spawn_cleanup(config.cleanup_interval(), stopped);
                (limiter as Arc<dyn RateLimiterBackend>, handle)
            }
        };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        let mut parts = line.split_whitespace();
        let Some(first) = parts.next() else { continue };
        let second = parts.next();

        let result = if tiers {
            let Some(endpoint) = second else {
                warn!(line = %line, "Expected `user endpoint`");
                continue;
            };
            backend.check_multiple_limits(first, endpoint, global).await
        } else {
            backend.check_rate_limit(first, second).await
        };

        let mut out = serde_json::to_vec(&result.to_report())?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    let _ = shutdown_tx.send(true);
    cleanup.await?;

    info!("Ratewarden stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
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
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
