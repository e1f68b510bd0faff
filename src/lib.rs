//! bastion-db - database access through an SSH bastion
//!
//! Keeps one authenticated session to the bastion, forwards two loopback
//! endpoints through it, reconnects with backoff when it breaks, and keeps
//! every database pool pointed at wherever its database is reachable right
//! now. Applications hold a [`DbGateway`] and ask it for pools or run
//! statements through it.

pub mod config;
pub mod db;
pub mod forwarding;
pub mod gateway;
pub mod ssh;
pub mod tunnel;

pub use config::{AppConfig, Cli, ConfigError};
pub use db::{DbError, LogicalDb};
pub use gateway::{DbGateway, GatewayStatus};
pub use tunnel::{SchedulerState, TunnelError};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
/// Does nothing if a subscriber is already installed.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
