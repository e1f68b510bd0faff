//! Tunnel Module
//!
//! Keeps the bastion session and both service endpoints alive as one unit:
//! - `backoff`: delay bookkeeping for the startup and recovery policies
//! - `backend`: opens/closes the session plus endpoints as a single tunnel
//! - `scheduler`: the reconnect state machine and the tunnel-active flag

mod backend;
mod backoff;
mod error;
mod scheduler;

use serde::Serialize;

pub use backend::{SshTunnelBackend, TunnelBackend, TunnelFault};
pub use backoff::{startup_delay, BackoffState};
pub use error::TunnelError;
pub use scheduler::{ReconnectConfig, ReconnectScheduler, SchedulerState, TunnelProbe};

/// Remote services reachable through the bastion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteService {
    /// Relational analytic store (Oracle)
    Oracle,
    /// Transactional store (Postgres)
    Postgres,
}

impl RemoteService {
    pub const ALL: [RemoteService; 2] = [RemoteService::Oracle, RemoteService::Postgres];

    /// Endpoint name used in logs and tunnel lookups
    pub fn name(self) -> &'static str {
        match self {
            RemoteService::Oracle => "oracle",
            RemoteService::Postgres => "postgres",
        }
    }
}

impl std::fmt::Display for RemoteService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
