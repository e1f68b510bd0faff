//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::auth::load_private_key_async;
use super::config::{AuthMethod, BastionConfig};
use super::error::SshError;
use super::keyboard_interactive;

/// Opens and authenticates one SSH connection to the bastion
pub struct SshClient {
    config: BastionConfig,
}

impl SshClient {
    pub fn new(config: BastionConfig) -> Self {
        Self { config }
    }

    /// Connect, authenticate and return the raw handle.
    ///
    /// Handshake and authentication together are bounded by
    /// `ready_timeout_secs`.
    pub async fn connect(self) -> Result<Handle<ClientHandler>, SshError> {
        self.config.validate()?;

        let ready_timeout = Duration::from_secs(self.config.ready_timeout_secs);
        let addr = self.config.addr();

        tokio::time::timeout(ready_timeout, self.connect_and_authenticate())
            .await
            .map_err(|_| {
                SshError::Timeout(format!(
                    "SSH handshake with {} did not complete within {}s",
                    addr,
                    ready_timeout.as_secs()
                ))
            })?
    }

    async fn connect_and_authenticate(&self) -> Result<Handle<ClientHandler>, SshError> {
        info!(
            "Connecting to SSH bastion at {} as {} ({})",
            self.config.addr(),
            self.config.username,
            self.config.auth.label()
        );

        let ssh_config = session_config(&self.config);

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.host_key_fingerprint.clone(),
        );

        let mut handle = client::connect(
            Arc::new(ssh_config),
            (self.config.host.as_str(), self.config.port),
            handler,
        )
        .await
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed");

        let authenticated = match &self.config.auth {
            AuthMethod::Key { source, passphrase } => {
                let key = load_private_key_async(source, passphrase.as_deref())
                    .await
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
                    .success()
            }
            AuthMethod::Password {
                password,
                keyboard_interactive,
            } => {
                let accepted = handle
                    .authenticate_password(&self.config.username, password)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
                    .success();

                if !accepted && *keyboard_interactive {
                    debug!("Password auth rejected, trying keyboard-interactive");
                    keyboard_interactive::authenticate_with_password(
                        &mut handle,
                        &self.config.username,
                        password,
                    )
                    .await?
                } else {
                    accepted
                }
            }
        };

        if !authenticated {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful");
        Ok(handle)
    }
}

/// russh session settings for the bastion
///
/// russh sends its own keepalive every interval and closes the session after
/// `keepalive_max` unanswered requests; the handle owner notices the close on
/// its next tick.
fn session_config(config: &BastionConfig) -> client::Config {
    client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(config.keepalive_interval_secs.max(1))),
        keepalive_max: config.keepalive_max.max(1) as usize,
        ..Default::default()
    }
}

/// Compute SHA256 fingerprint of public key
pub fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Compare fingerprints ignoring the `SHA256:` prefix and base64 padding
fn same_fingerprint(expected: &str, actual: &str) -> bool {
    fn normalize(fp: &str) -> &str {
        let fp = fp.trim();
        fp.strip_prefix("SHA256:").unwrap_or(fp).trim_end_matches('=')
    }
    normalize(expected) == normalize(actual)
}

/// Client handler for russh callbacks
pub struct ClientHandler {
    host: String,
    port: u16,
    /// Pinned fingerprint; None accepts any key
    expected_fingerprint: Option<String>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, expected_fingerprint: Option<String>) -> Self {
        Self {
            host,
            port,
            expected_fingerprint,
        }
    }

    fn verify_fingerprint(&self, actual: &str) -> Result<bool, SshError> {
        match &self.expected_fingerprint {
            None => {
                info!(
                    "Accepting host key for {}:{} (fingerprint: {})",
                    self.host, self.port, actual
                );
                Ok(true)
            }
            Some(expected) if same_fingerprint(expected, actual) => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Some(expected) => {
                warn!(
                    "HOST KEY MISMATCH for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected, actual
                );
                Err(SshError::HostKeyRejected(format!(
                    "{}:{} presented {}, expected {}",
                    self.host, self.port, actual, expected
                )))
            }
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.verify_fingerprint(&fingerprint(server_public_key))
    }
}
