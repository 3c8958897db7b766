use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clickrank::config::ClickrankConfig;
use clickrank::error::ClickrankError;
use clickrank::ratelimit::{RateDecision, RateLimiter};
use clickrank::service::{CounterService, DEFAULT_LEADERBOARD_LIMIT};
use clickrank::store::PersistentKeyCounter;

#[derive(Parser, Debug)]
#[command(name = "clickrank")]
#[command(about = "Persistent click counters with rankings and per-client rate limiting")]
struct Args {
    /// YAML configuration file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the database path from the configuration
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Count one click for a name and print its count and rank
    Click { name: String },
    /// Print the rank of a name
    Rank { name: String },
    /// Print the leaderboard and total clicks
    Top {
        #[arg(short, long, default_value_t = DEFAULT_LEADERBOARD_LIMIT)]
        limit: usize,
    },
    /// Import the legacy counter file, if present, and exit
    Migrate,
    /// Read `<source> <name>` lines from stdin and run each through the
    /// rate limiter and counter, printing one JSON response per line
    Replay,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClickrankConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ClickrankConfig::default(),
    };
    if let Some(db) = args.db {
        config.storage.db_path = db;
    }
    info!(db_path = %config.storage.db_path.display(), "Configuration loaded");

    let counter = Arc::new(
        PersistentKeyCounter::open(&config.storage).context("failed to open counter store")?,
    );
    let limiter = Arc::new(RateLimiter::with_config(&config.rate_limiting));
    let service = CounterService::new(counter.clone(), limiter.clone());

    match args.command {
        Command::Click { name } => {
            let report = service.increment_and_report(&name)?;
            println!("{}", serde_json::to_string(&report)?);
        }
        Command::Rank { name } => {
            let rank = counter.rank(&name)?;
            println!("{}", json!({ "username": name, "rank": rank }));
        }
        Command::Top { limit } => {
            let board = service.leaderboard(limit)?;
            println!("{}", serde_json::to_string(&board)?);
        }
        Command::Migrate => {
            let report = counter.migration_report();
            println!(
                "{}",
                json!({
                    "imported": report.imported,
                    "skipped": report.skipped,
                    "source_removed": report.source_removed,
                })
            );
        }
        Command::Replay => {
            let sync = counter.run_periodic_sync(config.storage.sync_interval());
            let sweeper = limiter.spawn_sweeper(config.rate_limiting.sweep_interval());

            tokio::select! {
                result = replay(service) => result?,
                name = shutdown_signal() => info!(signal = name, "Stopping replay"),
            }

            sweeper.abort();
            sync.shutdown().await?;
        }
    }

    counter.flush()?;
    Ok(())
}

/// Feed stdin requests through the service until EOF.
async fn replay(service: CounterService) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let mut fields = line.split_whitespace();
        let (Some(source), Some(name)) = (fields.next(), fields.next()) else {
            if !line.trim().is_empty() {
                warn!(line = %line, "Expected `<source> <name>`, skipping");
            }
            continue;
        };

        let response = if service.check_rate(source) == RateDecision::Deny {
            json!({
                "status": RateDecision::TOO_MANY_REQUESTS,
                "description": RateDecision::DENY_DESCRIPTION,
            })
        } else {
            let svc = service.clone();
            let name = name.to_string();
            match tokio::task::spawn_blocking(move || svc.increment_and_report(&name)).await? {
                Ok(report) => json!({ "status": 200, "count": report.count, "rank": report.rank }),
                Err(ClickrankError::Validation(msg)) => json!({ "status": 400, "description": msg }),
                Err(e) => {
                    warn!(error = %e, "Click could not be recorded");
                    json!({ "status": 500, "description": "Internal Server Error" })
                }
            }
        };
        println!("{}", response);
    }

    info!("Replay input exhausted");
    Ok(())
}

/// Resolve with the name of the first termination signal received.
///
/// A signal whose handler cannot be installed is never reported, so the
/// other one still stops the replay.
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        match signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                warn!(error = %e, "Ctrl+C handler unavailable");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    }
}
