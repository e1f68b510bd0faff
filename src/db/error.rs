//! Database error types and connection-error classification

use thiserror::Error;

/// Substrings (matched case-insensitively) that mark an error as a broken
/// connection rather than a failed statement. This is the only place the
/// policy lives; callers go through [`is_connection_class_message`].
pub const CONNECTION_ERROR_MARKERS: &[&str] = &[
    "terminated",
    "connection refused",
    "econnrefused",
    "timeout",
    "not initialized",
    "connection closed",
];

/// True if `message` describes a broken transport/session
pub fn is_connection_class_message(message: &str) -> bool {
    let message = message.to_lowercase();
    CONNECTION_ERROR_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Unknown database id: {0}")]
    UnknownDatabase(String),

    #[error("Database {0} is not configured")]
    NotConfigured(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection timeout: {0}")]
    Timeout(String),

    #[error("Pool not initialized or already closed")]
    PoolClosed,

    #[error("Database registry is shut down")]
    ShutDown,

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl DbError {
    /// Connection-class errors trigger a pool reset and a retry
    pub fn is_connection_class(&self) -> bool {
        is_connection_class_message(&self.to_string())
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                DbError::Timeout("timed out waiting for a pooled connection".into())
            }
            sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => DbError::PoolClosed,
            sqlx::Error::Io(e) => DbError::Connection(e.to_string()),
            sqlx::Error::Tls(e) => DbError::Connection(format!("TLS: {}", e)),
            sqlx::Error::Protocol(msg) => DbError::Connection(msg),
            sqlx::Error::Configuration(e) => DbError::NotConfigured(e.to_string()),
            other => DbError::Query(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_allow_list() {
        assert!(is_connection_class_message("Connection terminated unexpectedly"));
        assert!(is_connection_class_message("connect ECONNREFUSED 127.0.0.1:5433"));
        assert!(is_connection_class_message("Connection refused (os error 111)"));
        assert!(is_connection_class_message("Query read timeout"));
        assert!(is_connection_class_message("pool not initialized"));
        assert!(is_connection_class_message("Connection closed by peer"));

        assert!(!is_connection_class_message(
            "duplicate key value violates unique constraint \"users_pkey\""
        ));
        assert!(!is_connection_class_message("syntax error at or near \"SELEC\""));
    }

    #[test]
    fn test_error_variants_classify_by_message() {
        assert!(DbError::PoolClosed.is_connection_class());
        assert!(DbError::Timeout("acquire".into()).is_connection_class());
        assert!(DbError::Query("Connection terminated".into()).is_connection_class());
        assert!(!DbError::Query("permission denied for table forms".into()).is_connection_class());
        assert!(!DbError::NotConfigured("db-analytic".into()).is_connection_class());
    }

    #[test]
    fn test_sqlx_errors_map_to_connection_class() {
        assert!(DbError::from(sqlx::Error::PoolTimedOut).is_connection_class());
        assert!(DbError::from(sqlx::Error::PoolClosed).is_connection_class());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        assert!(DbError::from(sqlx::Error::Io(io)).is_connection_class());
        assert!(!DbError::from(sqlx::Error::RowNotFound).is_connection_class());
    }
}
