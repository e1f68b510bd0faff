//! Connection Pool Registry
//!
//! Holds one pool per logical database and keeps it bound to the address the
//! current tunnel state implies:
//!
//! 1. a configured direct target always wins;
//! 2. otherwise the tunnel's loopback port while the tunnel is active;
//! 3. otherwise the configured remote host/port.
//!
//! The target is recomputed on every `get_pool`. When it differs from the
//! pool's, the old pool is swapped out under the map entry lock and closed in
//! the background. After `close_all` no pool is built again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::{DatabaseConfig, LogicalDb, Route, Target};
use super::error::DbError;
use super::pool::{DbPool, PoolFactory, PoolSpec};
use crate::tunnel::TunnelProbe;

/// A live pool and the target it was built for
struct PoolDescriptor {
    target: Target,
    route: Route,
    pool: Arc<dyn DbPool>,
    created_at: DateTime<Utc>,
}

/// Read-only view of a descriptor (for the status report)
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub db: LogicalDb,
    pub target: String,
    pub route: Route,
    pub created_at: DateTime<Utc>,
}

/// Pool lookup used by the executor
pub trait PoolSource: Send + Sync {
    /// A pool bound to the currently correct target
    fn get_pool(&self, db: LogicalDb) -> Result<Arc<dyn DbPool>, DbError>;

    /// Drop the pool so the next `get_pool` rebuilds it. Does no I/O itself.
    fn reset_pool(&self, db: LogicalDb);
}

pub struct PoolRegistry {
    configs: HashMap<LogicalDb, DatabaseConfig>,
    tunnel: Option<Arc<dyn TunnelProbe>>,
    factory: Arc<dyn PoolFactory>,
    descriptors: DashMap<LogicalDb, PoolDescriptor>,
    closed: AtomicBool,
}

impl PoolRegistry {
    pub fn new(
        configs: HashMap<LogicalDb, DatabaseConfig>,
        tunnel: Option<Arc<dyn TunnelProbe>>,
        factory: Arc<dyn PoolFactory>,
    ) -> Self {
        Self {
            configs,
            tunnel,
            factory,
            descriptors: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_configured(&self, db: LogicalDb) -> bool {
        self.configs.contains_key(&db)
    }

    pub fn configured(&self) -> Vec<LogicalDb> {
        let mut dbs: Vec<_> = self.configs.keys().copied().collect();
        dbs.sort();
        dbs
    }

    pub fn config(&self, db: LogicalDb) -> Option<&DatabaseConfig> {
        self.configs.get(&db)
    }

    /// Where a pool for `db` would connect right now
    pub fn resolve_target(&self, db: LogicalDb) -> Result<(Target, Route), DbError> {
        let config = self
            .configs
            .get(&db)
            .ok_or_else(|| DbError::NotConfigured(db.to_string()))?;
        Ok(self.resolve(config))
    }

    fn resolve(&self, config: &DatabaseConfig) -> (Target, Route) {
        if let Some(direct) = &config.direct {
            return (direct.clone(), Route::Direct);
        }

        let tunnel_port = self
            .tunnel
            .as_ref()
            .filter(|t| t.is_tunnel_active())
            .and_then(|t| t.local_port(config.service));

        match tunnel_port {
            Some(port) => (Target::loopback(port), Route::Tunnel),
            None => (config.remote.clone(), Route::Remote),
        }
    }

    fn build_descriptor(
        &self,
        db: LogicalDb,
        config: &DatabaseConfig,
        target: Target,
        route: Route,
    ) -> Result<PoolDescriptor, DbError> {
        let spec = PoolSpec {
            db,
            backend: config.backend,
            target: target.clone(),
            credentials: config.credentials.clone(),
            database: config.database.clone(),
            ssl: config.ssl,
            settings: config.pool.clone(),
        };
        let pool = self.factory.build(&spec)?;
        Ok(PoolDescriptor {
            target,
            route,
            pool,
            created_at: Utc::now(),
        })
    }

    /// Target of the pool currently held for `db`, if any
    pub fn current_target(&self, db: LogicalDb) -> Option<(Target, Route)> {
        self.descriptors
            .get(&db)
            .map(|d| (d.target.clone(), d.route))
    }

    pub fn pools(&self) -> Vec<PoolInfo> {
        let mut pools: Vec<PoolInfo> = self
            .descriptors
            .iter()
            .map(|entry| PoolInfo {
                db: *entry.key(),
                target: entry.target.to_string(),
                route: entry.route,
                created_at: entry.created_at,
            })
            .collect();
        pools.sort_by_key(|p| p.db);
        pools
    }

    /// Close and forget every pool; later `get_pool` calls fail with `ShutDown`
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // A build that passed the closed check before the store lands in a
        // later pass
        loop {
            let dbs: Vec<LogicalDb> = self.descriptors.iter().map(|e| *e.key()).collect();
            if dbs.is_empty() {
                break;
            }
            for db in dbs {
                if let Some((_, descriptor)) = self.descriptors.remove(&db) {
                    info!("Closing pool for {} ({})", db, descriptor.target);
                    descriptor.pool.close().await;
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Close a discarded pool off the caller's path; errors are ignored
fn close_in_background(db: LogicalDb, pool: Arc<dyn DbPool>) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                pool.close().await;
                debug!("Discarded pool for {} closed", db);
            });
        }
        Err(_) => warn!("No runtime to close discarded pool for {}", db),
    }
}

impl PoolSource for PoolRegistry {
    fn get_pool(&self, db: LogicalDb) -> Result<Arc<dyn DbPool>, DbError> {
        let config = self
            .configs
            .get(&db)
            .ok_or_else(|| DbError::NotConfigured(db.to_string()))?;
        let (target, route) = self.resolve(config);

        // The entry guard serializes discard/build for this id only
        let entry = self.descriptors.entry(db);
        if self.is_closed() {
            return Err(DbError::ShutDown);
        }
        match entry {
            Entry::Occupied(mut entry) => {
                if entry.get().target == target && !entry.get().pool.is_closed() {
                    return Ok(entry.get().pool.clone());
                }
                info!(
                    "Rebuilding pool for {}: {} -> {} ({:?})",
                    db,
                    entry.get().target,
                    target,
                    route
                );
                let descriptor = self.build_descriptor(db, config, target, route)?;
                let pool = descriptor.pool.clone();
                let old = entry.insert(descriptor);
                close_in_background(db, old.pool);
                Ok(pool)
            }
            Entry::Vacant(entry) => {
                info!("Creating pool for {} -> {} ({:?})", db, target, route);
                let descriptor = self.build_descriptor(db, config, target, route)?;
                let pool = descriptor.pool.clone();
                entry.insert(descriptor);
                Ok(pool)
            }
        }
    }

    fn reset_pool(&self, db: LogicalDb) {
        if let Some((_, descriptor)) = self.descriptors.remove(&db) {
            info!("Pool for {} reset ({})", db, descriptor.target);
            close_in_background(db, descriptor.pool);
        }
    }
}
