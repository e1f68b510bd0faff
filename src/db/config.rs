//! Logical databases and their pool configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use super::error::DbError;
use crate::tunnel::RemoteService;

/// Application-level database roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum LogicalDb {
    /// Main transactional database
    #[serde(rename = "db-main")]
    Main,
    /// Login/auth database, co-located with main but a separate pool
    #[serde(rename = "db-login")]
    Login,
    /// Oracle analytic store
    #[serde(rename = "db-analytic")]
    Analytic,
}

impl LogicalDb {
    pub const ALL: [LogicalDb; 3] = [LogicalDb::Main, LogicalDb::Login, LogicalDb::Analytic];

    pub fn as_str(self) -> &'static str {
        match self {
            LogicalDb::Main => "db-main",
            LogicalDb::Login => "db-login",
            LogicalDb::Analytic => "db-analytic",
        }
    }
}

impl fmt::Display for LogicalDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicalDb {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "db-main" | "main" => Ok(LogicalDb::Main),
            "db-login" | "login" => Ok(LogicalDb::Login),
            "db-analytic" | "analytic" | "oracle" => Ok(LogicalDb::Analytic),
            other => Err(DbError::UnknownDatabase(other.to_string())),
        }
    }
}

/// Database engine behind a logical id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Postgres,
    Oracle,
}

impl Backend {
    /// Cheap statement used to check a connection end to end
    pub fn probe_statement(self) -> &'static str {
        match self {
            Backend::Postgres => "SELECT 1",
            Backend::Oracle => "SELECT 1 FROM DUAL",
        }
    }
}

/// host:port a pool connects to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn loopback(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How the current target was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    /// Explicit direct target, never overridden by the tunnel
    Direct,
    /// Loopback endpoint of the active tunnel
    Tunnel,
    /// Configured remote address, tunnel down or disabled
    Remote,
}

/// Username/password for one logical database
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Pool sizing and timeouts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub min_connections: u32,
    pub max_connections: u32,
    /// Hard bound on establishing (or waiting for) a connection
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    /// Server-side statement timeout, where the backend supports it
    pub statement_timeout: Option<Duration>,
}

impl PoolSettings {
    /// Postgres defaults; managed hosts get a longer connect timeout
    pub fn postgres(managed_host: bool) -> Self {
        Self {
            min_connections: 0,
            max_connections: 10,
            connect_timeout: Duration::from_secs(if managed_host { 20 } else { 15 }),
            idle_timeout: Duration::from_secs(30),
            statement_timeout: Some(Duration::from_secs(30)),
        }
    }

    pub fn oracle() -> Self {
        Self {
            min_connections: 1,
            max_connections: 4,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            statement_timeout: None,
        }
    }
}

/// Everything needed to build a pool for one logical database
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: Backend,
    /// Tunnel endpoint that serves this database
    pub service: RemoteService,
    /// Address used when neither a direct target nor the tunnel applies
    pub remote: Target,
    /// Explicit direct target; bypasses tunneling entirely
    pub direct: Option<Target>,
    pub credentials: Credentials,
    /// Database name (Postgres) or service name (Oracle)
    pub database: Option<String>,
    pub ssl: bool,
    pub pool: PoolSettings,
}

impl DatabaseConfig {
    pub fn postgres(remote: Target, credentials: Credentials, database: Option<String>) -> Self {
        Self {
            backend: Backend::Postgres,
            service: RemoteService::Postgres,
            remote,
            direct: None,
            credentials,
            database,
            ssl: false,
            pool: PoolSettings::postgres(false),
        }
    }

    pub fn oracle(remote: Target, credentials: Credentials, service_name: impl Into<String>) -> Self {
        Self {
            backend: Backend::Oracle,
            service: RemoteService::Oracle,
            remote,
            direct: None,
            credentials,
            database: Some(service_name.into()),
            ssl: false,
            pool: PoolSettings::oracle(),
        }
    }

    pub fn with_direct(mut self, direct: Target) -> Self {
        self.direct = Some(direct);
        self
    }
}
