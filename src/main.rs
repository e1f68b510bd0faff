use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bastion_db::{init_logging, AppConfig, Cli, DbGateway};
use clap::Parser;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the environment may already be set
    let _ = dotenvy::dotenv();
    init_logging();

    let cli = Cli::parse();
    let config = AppConfig::try_from(cli).context("invalid configuration")?;
    info!(
        "Starting bastion-db ({} database(s) configured, tunnel {})",
        config.databases.len(),
        if config.bastion.is_some() { "enabled" } else { "disabled" }
    );

    let gateway = Arc::new(DbGateway::from_config(&config));

    if let Err(e) = gateway.start().await {
        error!("Tunnel unavailable, continuing without it: {}", e);
    }

    for db in gateway.registry().configured() {
        if let Err(e) = gateway.warm_up(db).await {
            warn!("{} warm-up failed: {}", db, e);
        }
    }

    let status_task = config.status_interval.map(|interval| {
        let gateway = gateway.clone();
        tokio::spawn(async move { log_status(gateway, interval).await })
    });

    wait_for_signal().await;
    info!("Shutdown signal received");

    if let Some(task) = status_task {
        task.abort();
    }
    gateway.shutdown().await;
    Ok(())
}

async fn log_status(gateway: Arc<DbGateway>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match serde_json::to_string(&gateway.status()) {
            Ok(status) => info!("Status: {}", status),
            Err(e) => warn!("Failed to serialize status: {}", e),
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
