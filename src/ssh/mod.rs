//! SSH Module
//!
//! Bastion session layer built on russh:
//! - `client`: handshake, host key pinning and authentication
//! - `handle_owner`: single task owning the handle, keepalive monitor
//! - `session`: the Remote Session Manager and its lifecycle events

mod auth;
mod client;
mod config;
mod error;
mod handle_owner;
pub mod keyboard_interactive;
mod session;

pub use auth::{default_key_path, expand_tilde, load_private_key, load_private_key_async, KeyError};
pub use client::{fingerprint, ClientHandler, SshClient};
pub use config::{AuthMethod, BastionConfig, KeySource};
pub use error::SshError;
pub use handle_owner::{
    spawn_handle_owner_task, HandleCommand, HandleController, KeepalivePolicy, SessionEnd,
    SessionTransport,
};
pub use session::{
    BastionConnector, IntoByteStream, RemoteSessionManager, SessionConnector, SessionEvent,
    SessionState,
};
