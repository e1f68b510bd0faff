//! Oracle pools via the `oracle` crate (ODPI-C)
//!
//! The driver is blocking, so every call runs on the blocking thread pool.
//! The session pool is created on first acquire so that building a pool
//! stays free of I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use oracle::pool::{CloseMode, GetMode, Pool, PoolBuilder};
use oracle::sql_type::ToSql;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::error::DbError;
use super::pool::{DbConnection, DbPool, PoolSpec, Row};

/// ORA-/DPI- codes that mean the session or network is gone
const LOST_CONNECTION_CODES: &[&str] = &[
    "ORA-03113", "ORA-03114", "ORA-03135", "ORA-12170", "ORA-12541", "ORA-12514", "DPI-1010",
    "DPI-1080",
];

pub(super) fn build_pool(spec: &PoolSpec) -> Result<Arc<dyn DbPool>, DbError> {
    let service = spec
        .database
        .clone()
        .ok_or_else(|| DbError::NotConfigured(format!("{}: Oracle service name", spec.db)))?;
    let connect_string = format!("{}:{}/{}", spec.target.host, spec.target.port, service);

    info!(
        "Prepared Oracle pool for {} -> {} (min: {}, max: {})",
        spec.db, connect_string, spec.settings.min_connections, spec.settings.max_connections
    );

    Ok(Arc::new(OraclePoolHandle {
        spec: spec.clone(),
        connect_string,
        pool: Mutex::new(None),
        closed: AtomicBool::new(false),
    }))
}

fn map_oracle_error(err: oracle::Error) -> DbError {
    let message = err.to_string();
    if LOST_CONNECTION_CODES.iter().any(|code| message.contains(code)) {
        DbError::Connection(format!("connection closed: {}", message))
    } else if message.contains("ORA-24459") || message.contains("DPI-1067") {
        DbError::Timeout(message)
    } else {
        DbError::Query(message)
    }
}

fn join_error(e: tokio::task::JoinError) -> DbError {
    DbError::Connection(format!("Oracle worker terminated: {}", e))
}

struct OraclePoolHandle {
    spec: PoolSpec,
    connect_string: String,
    pool: Mutex<Option<Arc<Pool>>>,
    closed: AtomicBool,
}

impl OraclePoolHandle {
    async fn session_pool(&self) -> Result<Arc<Pool>, DbError> {
        if let Some(pool) = self.pool.lock().clone() {
            return Ok(pool);
        }

        let spec = self.spec.clone();
        let connect_string = self.connect_string.clone();
        let built = tokio::task::spawn_blocking(move || {
            PoolBuilder::new(
                spec.credentials.username.clone(),
                spec.credentials.password.clone(),
                connect_string,
            )
            .min_connections(spec.settings.min_connections)
            .max_connections(spec.settings.max_connections)
            .connection_increment(1)
            .timeout(spec.settings.idle_timeout)
            .get_mode(GetMode::TimedWait(spec.settings.connect_timeout))
            .build()
        })
        .await
        .map_err(join_error)?
        .map_err(map_oracle_error)?;

        let built = Arc::new(built);
        let mut slot = self.pool.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::PoolClosed);
        }
        // Another acquire may have raced us; keep the first pool
        Ok(slot.get_or_insert(built).clone())
    }
}

#[async_trait]
impl DbPool for OraclePoolHandle {
    async fn acquire(&self) -> Result<Box<dyn DbConnection>, DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::PoolClosed);
        }
        let pool = self.session_pool().await?;
        let conn = tokio::task::spawn_blocking(move || pool.get())
            .await
            .map_err(join_error)?
            .map_err(map_oracle_error)?;
        Ok(Box::new(OracleConn { conn: Some(conn) }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            let result =
                tokio::task::spawn_blocking(move || pool.close(&CloseMode::Force)).await;
            if let Ok(Err(e)) = result {
                warn!("Oracle pool close failed: {}", e);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct OracleConn {
    conn: Option<oracle::Connection>,
}

#[async_trait]
impl DbConnection for OracleConn {
    async fn query(&mut self, statement: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        let conn = self.conn.take().ok_or(DbError::PoolClosed)?;
        let statement = statement.to_string();
        let params = params.to_vec();

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = run_statement(&conn, &statement, &params);
            (conn, result)
        })
        .await
        .map_err(join_error)?;

        self.conn = Some(conn);
        result
    }

    async fn release(self: Box<Self>) {
        if let Some(conn) = self.conn {
            // close() on a pooled connection returns it to the pool
            let _ = tokio::task::spawn_blocking(move || {
                if let Err(e) = conn.close() {
                    debug!("Oracle connection release failed: {}", e);
                }
            })
            .await;
        }
    }
}

fn to_sql_param(value: &Value) -> Box<dyn ToSql> {
    match value {
        Value::Null => Box::new(None::<String>),
        Value::Bool(b) => Box::new(if *b { 1i64 } else { 0i64 }),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Box::new(i),
            (None, Some(f)) => Box::new(f),
            _ => Box::new(n.to_string()),
        },
        Value::String(s) => Box::new(s.clone()),
        other => Box::new(other.to_string()),
    }
}

/// Run one statement. Queries return their rows; DML and PL/SQL are
/// committed and return no rows.
fn run_statement(
    conn: &oracle::Connection,
    statement: &str,
    params: &[Value],
) -> Result<Vec<Row>, DbError> {
    let owned: Vec<Box<dyn ToSql>> = params.iter().map(to_sql_param).collect();
    let refs: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref()).collect();

    let mut stmt = conn.statement(statement).build().map_err(map_oracle_error)?;
    if !stmt.is_query() {
        stmt.execute(&refs).map_err(map_oracle_error)?;
        let affected = stmt.row_count().map_err(map_oracle_error)?;
        conn.commit().map_err(map_oracle_error)?;
        debug!("Oracle statement committed, {} rows affected", affected);
        return Ok(Vec::new());
    }

    let rows = stmt.query(&refs).map_err(map_oracle_error)?;
    let mut out = Vec::new();
    for row in rows {
        let row = row.map_err(map_oracle_error)?;
        let mut map = Row::new();
        for (idx, column) in row.column_info().iter().enumerate() {
            let value = row
                .get::<usize, Option<String>>(idx)
                .map_err(map_oracle_error)?
                .map(Value::String)
                .unwrap_or(Value::Null);
            map.insert(column.name().to_string(), value);
        }
        out.push(map);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(deprecated)]
    fn oci_error(code: i32, message: &str) -> oracle::Error {
        oracle::Error::OciError(oracle::DbError::new(code, 0, message, "dpiStmt_execute", "execute"))
    }

    #[test]
    fn test_lost_connection_errors_are_connection_class() {
        let samples = [
            (3113, "ORA-03113: end-of-file on communication channel"),
            (3114, "ORA-03114: not connected to ORACLE"),
            (12541, "ORA-12541: TNS:no listener"),
        ];
        for (code, message) in samples {
            let err = map_oracle_error(oci_error(code, message));
            assert!(matches!(err, DbError::Connection(_)), "{} mapped to {:?}", message, err);
            assert!(err.is_connection_class());
        }
    }

    #[test]
    fn test_pool_wait_timeout_is_connection_class() {
        let err = map_oracle_error(oci_error(
            24459,
            "ORA-24459: OCISessionGet() timed out waiting for pool to create new connections",
        ));
        assert!(matches!(err, DbError::Timeout(_)));
        assert!(err.is_connection_class());
    }

    #[test]
    fn test_statement_errors_are_not_retried() {
        let err = map_oracle_error(oci_error(942, "ORA-00942: table or view does not exist"));
        assert!(matches!(err, DbError::Query(_)));
        assert!(!err.is_connection_class());

        let err = map_oracle_error(oci_error(
            1,
            "ORA-00001: unique constraint (FORMS.PK_INDENT) violated",
        ));
        assert!(!err.is_connection_class());
    }
}
