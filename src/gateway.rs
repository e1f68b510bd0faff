//! Database gateway
//!
//! The one long-lived object the rest of the application holds (behind an
//! `Arc`). It wires the tunnel scheduler into the pool registry and exposes
//! the runtime surface: `get_pool`, `execute`, `is_tunnel_active`, `status`
//! and `shutdown`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::db::retry::{capped_exponential_backoff, retry};
use crate::db::{
    DatabaseConfig, DbError, DbPool, DriverPoolFactory, Executor, LogicalDb, PoolFactory,
    PoolInfo, PoolRegistry, PoolSource, Row,
};
use crate::forwarding::EndpointStatus;
use crate::ssh::{RemoteSessionManager, SessionState};
use crate::tunnel::{
    ReconnectScheduler, SchedulerState, SshTunnelBackend, TunnelBackend, TunnelError, TunnelProbe,
};

const WARM_UP_ATTEMPTS: u32 = 3;

/// Diagnostics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    /// None when no bastion is configured
    pub scheduler: Option<SchedulerState>,
    pub session: Option<SessionState>,
    pub tunnel_active: bool,
    pub endpoints: Vec<EndpointStatus>,
    pub configured: Vec<LogicalDb>,
    pub pools: Vec<PoolInfo>,
}

pub struct DbGateway<B: TunnelBackend = SshTunnelBackend> {
    scheduler: Option<Arc<ReconnectScheduler<B>>>,
    registry: Arc<PoolRegistry>,
    executor: Executor,
    shut_down: AtomicBool,
}

impl DbGateway<SshTunnelBackend> {
    /// Build everything from configuration. Nothing connects yet.
    pub fn from_config(config: &AppConfig) -> Self {
        let scheduler = config.bastion.as_ref().map(|bastion| {
            info!(
                "Tunnel via {}@{}:{} ({})",
                bastion.username,
                bastion.host,
                bastion.port,
                bastion.auth.label()
            );
            let session = RemoteSessionManager::for_bastion(bastion.clone());
            let backend = SshTunnelBackend::new(
                session,
                config.services.clone(),
                config.drain_deadline,
            );
            ReconnectScheduler::new(Arc::new(backend), config.reconnect.clone())
        });
        if scheduler.is_none() {
            info!("SSH_HOST not set; databases use their configured addresses");
        }

        Self::new(
            scheduler,
            config.databases.clone(),
            Arc::new(DriverPoolFactory),
        )
    }
}

impl<B: TunnelBackend> DbGateway<B> {
    pub fn new(
        scheduler: Option<Arc<ReconnectScheduler<B>>>,
        databases: HashMap<LogicalDb, DatabaseConfig>,
        factory: Arc<dyn PoolFactory>,
    ) -> Self {
        let probe = scheduler
            .clone()
            .map(|s| s as Arc<dyn TunnelProbe>);
        let registry = Arc::new(PoolRegistry::new(databases, probe, factory));
        let executor = Executor::new(registry.clone() as Arc<dyn PoolSource>);
        Self {
            scheduler,
            registry,
            executor,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Bring the tunnel up (startup retry policy included).
    ///
    /// An error here is reported once; the gateway stays usable and pools
    /// fall back to their remote or direct targets.
    pub async fn start(&self) -> Result<(), TunnelError> {
        match &self.scheduler {
            Some(scheduler) => scheduler.start().await,
            None => Ok(()),
        }
    }

    /// Pool bound to the target implied by the current tunnel state
    pub fn get_pool(&self, db: LogicalDb) -> Result<Arc<dyn DbPool>, DbError> {
        self.registry.get_pool(db)
    }

    /// Run one statement with connection-error retry
    pub async fn execute(
        &self,
        db: LogicalDb,
        statement: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, DbError> {
        self.executor.execute(db, statement, params).await
    }

    pub fn is_tunnel_active(&self) -> bool {
        self.scheduler
            .as_ref()
            .map(|s| s.is_tunnel_active())
            .unwrap_or(false)
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> Option<&Arc<ReconnectScheduler<B>>> {
        self.scheduler.as_ref()
    }

    /// Check `db` end to end with its probe statement.
    ///
    /// Any failure resets the pool before the next attempt; a database that
    /// is not configured fails immediately.
    pub async fn warm_up(&self, db: LogicalDb) -> Result<(), DbError> {
        let config = self
            .registry
            .config(db)
            .ok_or_else(|| DbError::NotConfigured(db.to_string()))?;
        let probe = config.backend.probe_statement();

        retry(
            WARM_UP_ATTEMPTS,
            |_| self.executor.execute_once(db, probe, &[]),
            |e: &DbError| {
                !matches!(
                    e,
                    DbError::NotConfigured(_) | DbError::UnknownDatabase(_) | DbError::ShutDown
                )
            },
            capped_exponential_backoff,
            |attempt, e| {
                warn!(
                    "{} warm-up attempt {}/{} failed: {}",
                    db, attempt, WARM_UP_ATTEMPTS, e
                );
                self.registry.reset_pool(db);
            },
        )
        .await?;

        if let Some((target, route)) = self.registry.current_target(db) {
            info!("{} ready at {} ({:?})", db, target, route);
        }
        Ok(())
    }

    pub fn status(&self) -> GatewayStatus {
        let (scheduler, session, endpoints) = match &self.scheduler {
            Some(s) => (
                Some(s.state()),
                s.backend().session_state(),
                s.backend().endpoint_status(),
            ),
            None => (None, None, Vec::new()),
        };
        GatewayStatus {
            scheduler,
            session,
            tunnel_active: self.is_tunnel_active(),
            endpoints,
            configured: self.registry.configured(),
            pools: self.registry.pools(),
        }
    }

    /// Stop the tunnel and close every pool. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown().await;
        }
        self.registry.close_all().await;
        info!("Database gateway shut down");
    }
}
