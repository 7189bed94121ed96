use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use feedcast::config::{Config, DISCORD_TOKEN_ENV};
use feedcast::notify::DiscordDispatcher;
use feedcast::scheduler::{http_client, Scheduler};
use feedcast::storage::{Database, DatabaseError};

#[derive(Parser, Debug)]
#[command(
    name = "feedcast",
    about = "Announces new YouTube uploads and live streams to Discord"
)]
struct Args {
    /// Config file (TOML)
    #[arg(long, value_name = "FILE", default_value = "feedcast.toml")]
    config: PathBuf,

    /// SQLite database shared with the webhook receiver and command layer
    #[arg(long, value_name = "FILE", default_value = "feedcast.db")]
    db: PathBuf,

    /// Run one cycle of every adapter and exit
    #[arg(long)]
    once: bool,
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down gracefully"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl-C, shutting down gracefully");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("feedcast=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    config.apply_env();
    tracing::debug!(config = ?config, "Effective configuration");

    let token = config.discord_token().with_context(|| {
        format!("No Discord token: set {DISCORD_TOKEN_ENV} or discord_token in the config file")
    })?;
    if config.youtube_api_key.is_none() {
        tracing::warn!("No YouTube API key, live status checks are disabled");
    }

    let db_path = args
        .db
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path).await {
        Ok(db) => db,
        Err(DatabaseError::Locked) => {
            eprintln!("Error: the database is locked by another process. Please close it and try again.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let dispatcher = Arc::new(DiscordDispatcher::new(
        http_client()?,
        &config.endpoints.discord_api,
        token,
        config.request_timeout(),
    ));
    let scheduler = Arc::new(
        Scheduler::from_config(&config, db, dispatcher).context("Failed to build scheduler")?,
    );

    if args.once {
        let report = scheduler.run_once(Utc::now()).await;
        tracing::info!(report = ?report, "Single pass complete");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = Arc::clone(&scheduler).spawn(shutdown_rx);
    tracing::info!(cadence = ?scheduler.cadence(), "Scheduler running");

    shutdown_signal().await?;
    shutdown_tx.send(true).ok();

    // In-flight cycles get a grace period; claims already made are durable.
    let drain = futures::future::join_all(handles);
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        tracing::warn!("Cycles still running after 30s, exiting anyway");
    }
    Ok(())
}
