//! Tunnel backend
//!
//! One `open` connects the bastion session and starts both endpoints; one
//! `close` stops both endpoints and the session. The scheduler only sees this
//! trait, which keeps its state machine testable without a bastion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::TunnelError;
use super::RemoteService;
use crate::forwarding::{EndpointStatus, ServiceForward, TunnelSet};
use crate::ssh::{
    BastionConnector, IntoByteStream, RemoteSessionManager, SessionConnector, SessionEvent,
    SessionState, SessionTransport,
};

/// Why an open tunnel stopped working
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TunnelFault {
    /// Transport error, session end/close or keepalive exhaustion
    Session(String),
    /// The failure monitor itself went away
    MonitorLost,
}

impl std::fmt::Display for TunnelFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelFault::Session(error) => write!(f, "session failed: {}", error),
            TunnelFault::MonitorLost => write!(f, "tunnel monitor ended"),
        }
    }
}

/// Session plus endpoints, opened and closed as a unit
#[async_trait]
pub trait TunnelBackend: Send + Sync + 'static {
    /// Bring the whole tunnel up.
    ///
    /// The returned receiver yields when the tunnel breaks. More than one
    /// fault may arrive for the same break.
    async fn open(&self) -> Result<mpsc::Receiver<TunnelFault>, TunnelError>;

    /// Tear down whatever is up. Safe to call when nothing is.
    async fn close(&self);

    /// Session Ready and every endpoint listening
    fn is_up(&self) -> bool;

    /// Bound loopback port for a service while the tunnel is up
    fn local_port(&self, service: RemoteService) -> Option<u16>;

    fn endpoint_status(&self) -> Vec<EndpointStatus> {
        Vec::new()
    }

    fn session_state(&self) -> Option<SessionState> {
        None
    }
}

/// Real backend: bastion session via russh plus loopback endpoints
pub struct SshTunnelBackend<C: SessionConnector = BastionConnector> {
    session: Arc<RemoteSessionManager<C>>,
    forwards: Vec<(RemoteService, ServiceForward)>,
    drain_deadline: Duration,
    tunnels: Mutex<Option<Arc<TunnelSet>>>,
}

impl<C> SshTunnelBackend<C>
where
    C: SessionConnector,
    <C::Transport as SessionTransport>::Channel: IntoByteStream,
{
    pub fn new(
        session: Arc<RemoteSessionManager<C>>,
        forwards: Vec<(RemoteService, ServiceForward)>,
        drain_deadline: Duration,
    ) -> Self {
        Self {
            session,
            forwards,
            drain_deadline,
            tunnels: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<RemoteSessionManager<C>> {
        &self.session
    }

    fn current_tunnels(&self) -> Option<Arc<TunnelSet>> {
        self.tunnels.lock().clone()
    }
}

#[async_trait]
impl<C> TunnelBackend for SshTunnelBackend<C>
where
    C: SessionConnector,
    <C::Transport as SessionTransport>::Channel: IntoByteStream,
{
    async fn open(&self) -> Result<mpsc::Receiver<TunnelFault>, TunnelError> {
        // Subscribe first so a failure right after Ready is not missed
        let mut events = self.session.subscribe();
        let generation = self.session.connect().await?;

        let forwards: Vec<ServiceForward> = self.forwards.iter().map(|(_, f)| f.clone()).collect();
        let tunnels =
            match TunnelSet::start(self.session.clone(), &forwards, self.drain_deadline).await {
                Ok(tunnels) => Arc::new(tunnels),
                Err(e) => {
                    self.session.close().await;
                    return Err(e.into());
                }
            };

        if let Some(previous) = self.tunnels.lock().replace(tunnels) {
            warn!("Replacing a tunnel set that was never closed");
            tokio::spawn(async move { previous.stop().await });
        }

        let (fault_tx, fault_rx) = mpsc::channel(4);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = fault_tx.closed() => break,
                    event = events.recv() => match event {
                        Ok(SessionEvent::Failed { generation: g, error }) if g == generation => {
                            let _ = fault_tx.send(TunnelFault::Session(error)).await;
                            break;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("Tunnel monitor skipped {} session event(s)", skipped);
                        }
                        Err(RecvError::Closed) => {
                            let _ = fault_tx.send(TunnelFault::MonitorLost).await;
                            break;
                        }
                    }
                }
            }
        });

        info!("Tunnel up (session generation {})", generation);
        Ok(fault_rx)
    }

    async fn close(&self) {
        let tunnels = self.tunnels.lock().take();
        if let Some(tunnels) = tunnels {
            tunnels.stop().await;
        }
        self.session.close().await;
    }

    fn is_up(&self) -> bool {
        self.session.is_ready()
            && self
                .current_tunnels()
                .map(|t| t.all_listening())
                .unwrap_or(false)
    }

    fn local_port(&self, service: RemoteService) -> Option<u16> {
        self.current_tunnels()?.local_port(service.name())
    }

    fn endpoint_status(&self) -> Vec<EndpointStatus> {
        self.current_tunnels()
            .map(|t| t.status())
            .unwrap_or_default()
    }

    fn session_state(&self) -> Option<SessionState> {
        Some(self.session.state())
    }
}
