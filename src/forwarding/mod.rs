//! Port Forwarding Module
//!
//! Loopback listeners whose connections are carried to the remote database
//! services over direct-tcpip channels on the bastion session.

mod local;
pub mod manager;

use thiserror::Error;

pub use local::{splice, ForwardChannelSource, ForwardStats, ServiceForward, TunnelEndpoint};
pub use manager::{EndpointStatus, TunnelSet};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
}
