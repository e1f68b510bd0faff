//! Bastion session errors
//!
//! `InvalidConfig` and `KeyError` cannot be fixed by reconnecting; the tunnel
//! layer maps them to a terminal failure. Everything else is treated as a
//! transient session problem.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Invalid bastion configuration: {0}")]
    InvalidConfig(String),

    #[error("Bastion connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Bastion authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Forward channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Private key error: {0}")]
    KeyError(String),

    #[error("Bastion host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Another connect is already in progress")]
    ConnectInProgress,

    #[error("Session disconnected")]
    Disconnected,
}

impl SshError {
    /// True when retrying with the same configuration cannot succeed
    pub fn is_config(&self) -> bool {
        matches!(self, SshError::InvalidConfig(_) | SshError::KeyError(_))
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => SshError::Disconnected,
            russh::Error::IO(e) => SshError::IoError(e),
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_and_key_errors_are_config() {
        assert!(SshError::InvalidConfig("SSH_USER is required".into()).is_config());
        assert!(SshError::KeyError("Key file not found: /keys/bastion".into()).is_config());
        assert!(!SshError::AuthenticationFailed("denied".into()).is_config());
        assert!(!SshError::HostKeyRejected("mismatch".into()).is_config());
        assert!(!SshError::Disconnected.is_config());
    }

    #[test]
    fn test_russh_disconnect_maps_to_disconnected() {
        assert!(matches!(
            SshError::from(russh::Error::Disconnect),
            SshError::Disconnected
        ));
    }
}
