//! Retry-wrapped statement executor
//!
//! Each attempt resolves the pool fresh, checks out one connection, runs one
//! statement and hands the connection back. Connection-class failures reset
//! the pool and retry after `1000 * attempt` ms.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::config::LogicalDb;
use super::error::DbError;
use super::pool::{DbPool, Row};
use super::registry::PoolSource;
use super::retry::{linear_backoff, retry};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct Executor {
    source: Arc<dyn PoolSource>,
    max_attempts: u32,
}

impl Executor {
    pub fn new(source: Arc<dyn PoolSource>) -> Self {
        Self {
            source,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run one statement against `db`
    pub async fn execute(
        &self,
        db: LogicalDb,
        statement: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, DbError> {
        retry(
            self.max_attempts,
            |attempt| {
                debug!("{} attempt {}", db, attempt);
                self.execute_once(db, statement, params)
            },
            DbError::is_connection_class,
            linear_backoff,
            |attempt, error| {
                warn!(
                    "{} connection error on attempt {}/{}: {}; resetting pool",
                    db, attempt, self.max_attempts, error
                );
                self.source.reset_pool(db);
            },
        )
        .await
    }

    /// One attempt, no retry: resolve the pool, run, release
    pub async fn execute_once(
        &self,
        db: LogicalDb,
        statement: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, DbError> {
        let pool = self.source.get_pool(db)?;
        run_once(pool.as_ref(), statement, params).await
    }

    pub fn source(&self) -> &Arc<dyn PoolSource> {
        &self.source
    }
}

/// Acquire, run, release. The connection goes back to the pool whether the
/// statement succeeded or not.
async fn run_once(
    pool: &dyn DbPool,
    statement: &str,
    params: &[Value],
) -> Result<Vec<Row>, DbError> {
    let mut conn = pool.acquire().await?;
    let result = conn.query(statement, params).await;
    conn.release().await;
    result
}
