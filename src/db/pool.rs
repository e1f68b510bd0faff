//! Pool abstraction
//!
//! The registry and executor only see these traits, so the Postgres and
//! Oracle drivers plug in behind one seam and tests can use in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::config::{Backend, Credentials, LogicalDb, PoolSettings, Target};
use super::error::DbError;

/// One result row, column name -> JSON value
pub type Row = serde_json::Map<String, Value>;

/// A connection checked out of a pool
#[async_trait]
pub trait DbConnection: Send {
    async fn query(&mut self, statement: &str, params: &[Value]) -> Result<Vec<Row>, DbError>;

    /// Hand the connection back to its pool
    async fn release(self: Box<Self>);
}

/// A pool of connections bound to one target
#[async_trait]
pub trait DbPool: Send + Sync {
    /// Wait for a free connection, bounded by the pool's connect timeout
    async fn acquire(&self) -> Result<Box<dyn DbConnection>, DbError>;

    /// Close every connection; further acquires fail
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Everything a factory needs to build one pool
#[derive(Debug, Clone)]
pub struct PoolSpec {
    pub db: LogicalDb,
    pub backend: Backend,
    pub target: Target,
    pub credentials: Credentials,
    pub database: Option<String>,
    pub ssl: bool,
    pub settings: PoolSettings,
}

/// Builds pools without connecting; connections open on first acquire
pub trait PoolFactory: Send + Sync {
    fn build(&self, spec: &PoolSpec) -> Result<Arc<dyn DbPool>, DbError>;
}

/// Dispatches to the driver for each backend
#[derive(Debug, Default, Clone, Copy)]
pub struct DriverPoolFactory;

impl PoolFactory for DriverPoolFactory {
    fn build(&self, spec: &PoolSpec) -> Result<Arc<dyn DbPool>, DbError> {
        match spec.backend {
            Backend::Postgres => super::postgres::build_pool(spec),
            #[cfg(feature = "oracle")]
            Backend::Oracle => super::oracle::build_pool(spec),
            #[cfg(not(feature = "oracle"))]
            Backend::Oracle => Err(DbError::NotConfigured(format!(
                "{} (built without the `oracle` feature)",
                spec.db
            ))),
        }
    }
}
