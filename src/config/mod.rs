//! Configuration
//!
//! `Cli` is the raw surface (environment variables and flags); `AppConfig` is
//! the typed result the gateway is built from. Conversion fails only on
//! values that cannot be parsed. An incomplete bastion config (no user, no
//! credentials) is passed through and rejected when the tunnel first
//! connects, which fails the tunnel without stopping the process.

mod cli;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

pub use cli::Cli;

use crate::db::{Credentials, DatabaseConfig, LogicalDb, PoolSettings, Target};
use crate::forwarding::ServiceForward;
use crate::ssh::{default_key_path, expand_tilde, AuthMethod, BastionConfig};
use crate::tunnel::{ReconnectConfig, RemoteService};

/// Postgres hosts under this suffix are managed services: TLS, no tunnel
pub const MANAGED_POSTGRES_SUFFIX: &str = "rds.amazonaws.com";

const DEFAULT_POSTGRES_PORT: u16 = 5432;
const DEFAULT_ORACLE_PORT: u16 = 1521;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("{0} is set without {1}")]
    Incomplete(&'static str, &'static str),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// None when `SSH_HOST` is unset; every database then uses its remote target
    pub bastion: Option<BastionConfig>,
    pub services: Vec<(RemoteService, ServiceForward)>,
    pub reconnect: ReconnectConfig,
    pub drain_deadline: Duration,
    pub databases: HashMap<LogicalDb, DatabaseConfig>,
    pub status_interval: Option<Duration>,
}

impl TryFrom<Cli> for AppConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let default_key = Some(default_key_path()).filter(|path| path.exists());
        build(cli, default_key)
    }
}

fn build(cli: Cli, default_key: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    if cli.local_oracle_port == cli.local_postgres_port {
        return Err(ConfigError::InvalidValue {
            key: "LOCAL_POSTGRES_PORT",
            reason: format!("same as LOCAL_ORACLE_PORT ({})", cli.local_oracle_port),
        });
    }

    let reconnect = reconnect_config(&cli)?;
    let bastion = bastion_config(&cli, default_key);
    let services = vec![
        (
            RemoteService::Oracle,
            ServiceForward::new(
                RemoteService::Oracle.name(),
                cli.local_oracle_port,
                cli.oracle_host.clone(),
                cli.oracle_port,
            ),
        ),
        (
            RemoteService::Postgres,
            ServiceForward::new(
                RemoteService::Postgres.name(),
                cli.local_postgres_port,
                cli.remote_postgres_host.clone(),
                cli.remote_postgres_port,
            ),
        ),
    ];
    let databases = database_configs(&cli)?;

    Ok(AppConfig {
        bastion,
        services,
        reconnect,
        drain_deadline: Duration::from_secs(cli.tunnel_drain_secs),
        databases,
        status_interval: Some(Duration::from_secs(cli.status_interval_secs))
            .filter(|d| !d.is_zero()),
    })
}

fn reconnect_config(cli: &Cli) -> Result<ReconnectConfig, ConfigError> {
    if cli.ssh_reconnect_base_ms == 0 {
        return Err(ConfigError::InvalidValue {
            key: "SSH_RECONNECT_BASE_MS",
            reason: "must be greater than zero".into(),
        });
    }
    if cli.ssh_reconnect_max_ms < cli.ssh_reconnect_base_ms {
        return Err(ConfigError::InvalidValue {
            key: "SSH_RECONNECT_MAX_MS",
            reason: format!(
                "{} is below SSH_RECONNECT_BASE_MS ({})",
                cli.ssh_reconnect_max_ms, cli.ssh_reconnect_base_ms
            ),
        });
    }
    Ok(ReconnectConfig {
        base_delay: Duration::from_millis(cli.ssh_reconnect_base_ms),
        max_delay: Duration::from_millis(cli.ssh_reconnect_max_ms),
        max_initial_attempts: cli.ssh_max_initial_retries.max(1),
    })
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn bastion_config(cli: &Cli, default_key: Option<PathBuf>) -> Option<BastionConfig> {
    let host = non_empty(&cli.ssh_host)?;
    let passphrase = non_empty(&cli.ssh_key_passphrase);

    let password = non_empty(&cli.ssh_password);
    // A missing key file gives way to the password; with no password it is
    // kept so the first connect rejects it as a config error
    let key_path = cli.ssh_key_path.as_deref().map(expand_tilde).filter(|path| {
        if path.exists() || password.is_none() {
            return true;
        }
        warn!(
            "SSH_KEY_PATH {} does not exist, using password authentication",
            path.display()
        );
        false
    });

    // Key wins over password: inline, then path, then the default key file
    let auth = if let Some(inline) = non_empty(&cli.ssh_private_key) {
        AuthMethod::key_inline(inline, passphrase)
    } else if let Some(path) = key_path {
        AuthMethod::key_file(path, passphrase)
    } else if let Some(path) = default_key {
        AuthMethod::key_file(path, passphrase)
    } else {
        AuthMethod::password(password.unwrap_or_default())
    };

    let mut config = BastionConfig::new(host, cli.ssh_user.clone().unwrap_or_default(), auth);
    config.port = cli.ssh_port;
    config.ready_timeout_secs = cli.ssh_ready_timeout_secs;
    config.keepalive_interval_secs = cli.ssh_keepalive_interval_secs;
    config.keepalive_max = cli.ssh_keepalive_max;
    config.host_key_fingerprint = non_empty(&cli.ssh_host_key_fingerprint);
    Some(config)
}

/// True for hosts of a managed Postgres service
pub fn is_managed_postgres_host(host: &str) -> bool {
    host.trim_end_matches('.')
        .to_ascii_lowercase()
        .ends_with(MANAGED_POSTGRES_SUFFIX)
}

fn direct_target(
    host: &Option<String>,
    port: Option<u16>,
    host_key: &'static str,
    port_key: &'static str,
) -> Result<Option<Target>, ConfigError> {
    match (non_empty(host), port) {
        (Some(host), port) => Ok(Some(Target::new(host, port.unwrap_or(DEFAULT_POSTGRES_PORT)))),
        (None, Some(_)) => Err(ConfigError::Incomplete(port_key, host_key)),
        (None, None) => Ok(None),
    }
}

/// Parse `host[:port]/service` (a leading `//` is accepted)
pub fn parse_oracle_connection_string(value: &str) -> Result<(Target, String), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        key: "ORACLE_CONNECTION_STRING",
        reason: format!("{} in {:?}", reason, value),
    };

    let trimmed = value.trim().trim_start_matches("//");
    let (address, service) = trimmed
        .split_once('/')
        .ok_or_else(|| invalid("missing /service"))?;
    if service.is_empty() {
        return Err(invalid("empty service name"));
    }

    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
            (host, port)
        }
        None => (address, DEFAULT_ORACLE_PORT),
    };
    if host.is_empty() {
        return Err(invalid("empty host"));
    }

    Ok((Target::new(host, port), service.to_string()))
}

fn postgres_config(
    remote: Target,
    direct: Option<Target>,
    credentials: Credentials,
    database: Option<String>,
    force_ssl: bool,
) -> DatabaseConfig {
    let effective_host = direct.as_ref().unwrap_or(&remote).host.clone();
    let managed = is_managed_postgres_host(&effective_host);

    let mut config = DatabaseConfig::postgres(remote.clone(), credentials, database);
    config.ssl = managed || force_ssl;
    config.pool = PoolSettings::postgres(managed);
    config.direct = match direct {
        Some(direct) => Some(direct),
        // Managed services are reached directly, never through the bastion
        None if managed => Some(remote),
        None => None,
    };
    config
}

fn database_configs(cli: &Cli) -> Result<HashMap<LogicalDb, DatabaseConfig>, ConfigError> {
    let mut databases = HashMap::new();

    let pg_remote = match non_empty(&cli.pg_host).or_else(|| non_empty(&cli.db_host)) {
        Some(host) => Target::new(
            host,
            cli.pg_port.or(cli.db_port).unwrap_or(DEFAULT_POSTGRES_PORT),
        ),
        None => Target::new(cli.remote_postgres_host.clone(), cli.remote_postgres_port),
    };

    let main_user = non_empty(&cli.db_user).or_else(|| non_empty(&cli.pg_user));
    if let Some(user) = main_user {
        let password = cli
            .db_password
            .clone()
            .or_else(|| cli.pg_password.clone())
            .unwrap_or_default();
        let database = non_empty(&cli.db_name).or_else(|| non_empty(&cli.pg_database));
        let direct = direct_target(
            &cli.main_db_direct_host,
            cli.main_db_direct_port,
            "MAIN_DB_DIRECT_HOST",
            "MAIN_DB_DIRECT_PORT",
        )?;
        databases.insert(
            LogicalDb::Main,
            postgres_config(
                pg_remote.clone(),
                direct,
                Credentials::new(user, password),
                database,
                cli.pg_ssl,
            ),
        );
    }

    let login_user = non_empty(&cli.pg_user).or_else(|| non_empty(&cli.db_user));
    if let Some(user) = login_user {
        let password = cli
            .pg_password
            .clone()
            .or_else(|| cli.db_password.clone())
            .unwrap_or_default();
        let database = non_empty(&cli.pg_name)
            .or_else(|| non_empty(&cli.pg_database))
            .or_else(|| non_empty(&cli.db_name));
        let direct = direct_target(
            &cli.login_db_direct_host,
            cli.login_db_direct_port,
            "LOGIN_DB_DIRECT_HOST",
            "LOGIN_DB_DIRECT_PORT",
        )?;
        databases.insert(
            LogicalDb::Login,
            postgres_config(
                pg_remote,
                direct,
                Credentials::new(user, password),
                database,
                cli.pg_ssl,
            ),
        );
    }

    if let Some(user) = non_empty(&cli.oracle_user) {
        let (remote, service_name) = match non_empty(&cli.oracle_connection_string) {
            Some(value) => parse_oracle_connection_string(&value)?,
            None => (
                Target::new(cli.oracle_host.clone(), cli.oracle_port),
                cli.oracle_service_name.clone(),
            ),
        };
        databases.insert(
            LogicalDb::Analytic,
            DatabaseConfig::oracle(
                remote,
                Credentials::new(user, cli.oracle_password.clone().unwrap_or_default()),
                service_name,
            ),
        );
    }

    Ok(databases)
}
