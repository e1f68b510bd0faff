//! Command line / environment surface
//!
//! Every key is an environment variable first (a `.env` file is loaded before
//! parsing) and also available as a `--long-flag`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "bastion-db",
    author,
    version,
    about = "Keeps database pools reachable through an SSH bastion tunnel"
)]
pub struct Cli {
    // ---- Bastion ----
    /// Bastion host. Without it no tunnel is started.
    #[arg(long, env = "SSH_HOST")]
    pub ssh_host: Option<String>,

    #[arg(long, env = "SSH_PORT", default_value_t = 22)]
    pub ssh_port: u16,

    #[arg(long, env = "SSH_USER")]
    pub ssh_user: Option<String>,

    /// Private key content (OpenSSH or PEM)
    #[arg(long, env = "SSH_PRIVATE_KEY", hide_env_values = true)]
    pub ssh_private_key: Option<String>,

    #[arg(long, env = "SSH_KEY_PATH")]
    pub ssh_key_path: Option<PathBuf>,

    #[arg(long, env = "SSH_KEY_PASSPHRASE", hide_env_values = true)]
    pub ssh_key_passphrase: Option<String>,

    #[arg(long, env = "SSH_PASSWORD", hide_env_values = true)]
    pub ssh_password: Option<String>,

    #[arg(long, env = "SSH_READY_TIMEOUT_SECS", default_value_t = 30)]
    pub ssh_ready_timeout_secs: u64,

    #[arg(long, env = "SSH_KEEPALIVE_INTERVAL_SECS", default_value_t = 10)]
    pub ssh_keepalive_interval_secs: u64,

    #[arg(long, env = "SSH_KEEPALIVE_MAX", default_value_t = 5)]
    pub ssh_keepalive_max: u32,

    /// Expected server key fingerprint (`SHA256:...`); mismatches are rejected
    #[arg(long, env = "SSH_HOST_KEY_FINGERPRINT")]
    pub ssh_host_key_fingerprint: Option<String>,

    // ---- Remote services, as seen from the bastion ----
    #[arg(long, env = "ORACLE_HOST", default_value = "127.0.0.1")]
    pub oracle_host: String,

    #[arg(long, env = "ORACLE_PORT", default_value_t = 1521)]
    pub oracle_port: u16,

    #[arg(long, env = "REMOTE_POSTGRES_HOST", default_value = "127.0.0.1")]
    pub remote_postgres_host: String,

    #[arg(long, env = "REMOTE_POSTGRES_PORT", default_value_t = 5432)]
    pub remote_postgres_port: u16,

    // ---- Local tunnel endpoints ----
    #[arg(long, env = "LOCAL_ORACLE_PORT", default_value_t = 1521)]
    pub local_oracle_port: u16,

    #[arg(long, env = "LOCAL_POSTGRES_PORT", default_value_t = 5433)]
    pub local_postgres_port: u16,

    // ---- Direct targets ----
    #[arg(long, env = "MAIN_DB_DIRECT_HOST")]
    pub main_db_direct_host: Option<String>,

    #[arg(long, env = "MAIN_DB_DIRECT_PORT")]
    pub main_db_direct_port: Option<u16>,

    #[arg(long, env = "LOGIN_DB_DIRECT_HOST")]
    pub login_db_direct_host: Option<String>,

    #[arg(long, env = "LOGIN_DB_DIRECT_PORT")]
    pub login_db_direct_port: Option<u16>,

    /// Oracle address used without the tunnel: `host[:port]/service`
    #[arg(long, env = "ORACLE_CONNECTION_STRING")]
    pub oracle_connection_string: Option<String>,

    // ---- Reconnect tuning ----
    #[arg(long, env = "SSH_RECONNECT_BASE_MS", default_value_t = 5000)]
    pub ssh_reconnect_base_ms: u64,

    #[arg(long, env = "SSH_RECONNECT_MAX_MS", default_value_t = 30_000)]
    pub ssh_reconnect_max_ms: u64,

    #[arg(long, env = "SSH_MAX_INITIAL_RETRIES", default_value_t = 3)]
    pub ssh_max_initial_retries: u32,

    /// How long endpoint shutdown waits for spliced connections
    #[arg(long, env = "TUNNEL_DRAIN_SECS", default_value_t = 5)]
    pub tunnel_drain_secs: u64,

    // ---- Transactional store credentials ----
    #[arg(long, env = "DB_HOST")]
    pub db_host: Option<String>,

    #[arg(long, env = "DB_PORT")]
    pub db_port: Option<u16>,

    #[arg(long, env = "DB_USER")]
    pub db_user: Option<String>,

    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    pub db_password: Option<String>,

    #[arg(long, env = "DB_NAME")]
    pub db_name: Option<String>,

    #[arg(long, env = "PG_HOST")]
    pub pg_host: Option<String>,

    #[arg(long, env = "PG_PORT")]
    pub pg_port: Option<u16>,

    #[arg(long, env = "PG_USER")]
    pub pg_user: Option<String>,

    #[arg(long, env = "PG_PASSWORD", hide_env_values = true)]
    pub pg_password: Option<String>,

    #[arg(long, env = "PG_DATABASE")]
    pub pg_database: Option<String>,

    /// Login database name
    #[arg(long, env = "PG_NAME")]
    pub pg_name: Option<String>,

    #[arg(long, env = "PG_SSL", default_value_t = false)]
    pub pg_ssl: bool,

    // ---- Analytic store credentials ----
    #[arg(long, env = "ORACLE_USER")]
    pub oracle_user: Option<String>,

    #[arg(long, env = "ORACLE_PASSWORD", hide_env_values = true)]
    pub oracle_password: Option<String>,

    #[arg(long, env = "ORACLE_SERVICE_NAME", default_value = "ora11g")]
    pub oracle_service_name: String,

    // ---- Daemon ----
    /// Interval between status log lines (0 disables them)
    #[arg(long, env = "STATUS_INTERVAL_SECS", default_value_t = 60)]
    pub status_interval_secs: u64,
}
