use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dbconduit::config::ServerConfig;
use dbconduit::engine::DefaultDriverFactory;
use dbconduit::pending::PendingResultManager;
use dbconduit::queue::QueueManager;

#[derive(Parser, Debug)]
#[command(name = "dbconduit", about = "Multi-database query execution service")]
struct Args {
    /// Path to the configuration file (TOML or JSON).
    #[arg(short, long, env = "DBCONDUIT_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = ServerConfig::load(args.config.as_deref()).context("loading configuration")?;
    if cfg.databases.is_empty() {
        warn!("no databases configured; nothing to serve");
    }

    let pending = Arc::new(PendingResultManager::new("pending"));
    let manager = Arc::new(
        QueueManager::start(&cfg, Arc::clone(&pending), Arc::new(DefaultDriverFactory))
            .context("starting queue manager")?,
    );

    if manager
        .wait_ready(Duration::from_secs(cfg.startup_wait_secs))
        .await
    {
        info!("all databases ready");
    } else {
        warn!("one or more databases are still unavailable; continuing");
    }

    let mut housekeeping =
        tokio::time::interval(Duration::from_secs(cfg.housekeeping_interval_secs.max(1)));
    housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup is not followed
    // by an instant heartbeat.
    housekeeping.tick().await;

    loop {
        tokio::select! {
            _ = housekeeping.tick() => {
                let reclaimed = pending.cleanup_expired();
                if reclaimed > 0 {
                    info!("housekeeping reclaimed {reclaimed} expired pending results");
                }
                manager.log_heartbeat();
            }
            result = tokio::signal::ctrl_c() => {
                result.context("listening for shutdown signal")?;
                info!("shutdown signal received; draining queues");
                break;
            }
        }
    }

    manager.shutdown().await;
    info!("dbconduit stopped");
    Ok(())
}
