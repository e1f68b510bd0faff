//! Database access
//!
//! Per logical database pools whose target follows the tunnel, and a
//! retrying executor on top of them.

pub mod config;
mod error;
mod executor;
#[cfg(feature = "oracle")]
mod oracle;
mod pool;
mod postgres;
mod registry;
pub mod retry;

pub use config::{
    Backend, Credentials, DatabaseConfig, LogicalDb, PoolSettings, Route, Target,
};
pub use error::{is_connection_class_message, DbError, CONNECTION_ERROR_MARKERS};
pub use executor::{Executor, DEFAULT_MAX_ATTEMPTS};
pub use pool::{DbConnection, DbPool, DriverPoolFactory, PoolFactory, PoolSpec, Row};
pub use registry::{PoolInfo, PoolRegistry, PoolSource};
