//! Tunnel error types

use thiserror::Error;

use crate::forwarding::ForwardError;
use crate::ssh::SshError;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// Missing or unusable credentials/targets; never retried
    #[error("Tunnel configuration invalid: {0}")]
    Config(String),

    #[error("Bastion session error: {0}")]
    Session(SshError),

    #[error("Tunnel endpoint error: {0}")]
    Bind(#[from] ForwardError),

    #[error("Tunnel startup failed after {attempts} attempt(s): {last_error}")]
    StartupExhausted { attempts: u32, last_error: String },

    #[error("Tunnel scheduler already started")]
    AlreadyStarted,

    #[error("Tunnel is shutting down")]
    ShuttingDown,
}

impl TunnelError {
    /// Errors that end the tunnel for good instead of entering recovery
    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelError::Config(_))
    }
}

impl From<SshError> for TunnelError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::InvalidConfig(msg) => TunnelError::Config(msg),
            other if other.is_config() => TunnelError::Config(other.to_string()),
            other => TunnelError::Session(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_config_errors_are_terminal() {
        let config: TunnelError = SshError::InvalidConfig("SSH_USER missing".into()).into();
        assert!(config.is_terminal());

        let key: TunnelError =
            SshError::KeyError("Key file not found: /keys/bastion".into()).into();
        assert!(key.is_terminal());

        let auth: TunnelError = SshError::AuthenticationFailed("denied".into()).into();
        assert!(!auth.is_terminal());

        let bind = TunnelError::from(ForwardError::Bind {
            addr: "127.0.0.1:5433".into(),
            reason: "port already in use".into(),
        });
        assert!(!bind.is_terminal());
    }
}
