//! Handle Owner Task
//!
//! Only one task owns the SSH `Handle`. Tunnel endpoints and the session
//! manager talk to it through a cloneable `HandleController` that sends
//! commands over an mpsc channel. The same task runs the keepalive probe.
//! Channel opens run in their own tasks so a stalled open never delays the
//! probe or another open.
//!
//! When the task exits it publishes exactly one `SessionEnd` on a watch
//! channel: `Closed` for a requested shutdown, `Failed` for transport errors,
//! server-side close or keepalive exhaustion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Upper bound for a single keepalive round trip
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the owner task stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Disconnect requested, or every controller was dropped
    Closed,
    /// Transport error, session end/close, or keepalive exhaustion
    Failed(String),
}

/// Keepalive schedule for the owner task
#[derive(Debug, Clone, Copy)]
pub struct KeepalivePolicy {
    pub interval: Duration,
    /// Consecutive unanswered probes before the session is declared dead
    pub max_missed: u32,
}

impl Default for KeepalivePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_missed: 5,
        }
    }
}

/// The operations the owner task needs from an SSH connection
///
/// Methods take `&self` so channel opens can run beside the keepalive probe.
#[async_trait]
pub trait SessionTransport: Send + Sync + 'static {
    type Channel: Send + 'static;

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Self::Channel, russh::Error>;

    /// Send one keepalive request and wait for the peer's reply
    async fn keepalive(&self) -> Result<(), russh::Error>;

    fn is_closed(&self) -> bool;

    async fn disconnect(&self);
}

#[async_trait]
impl SessionTransport for Handle<ClientHandler> {
    type Channel = Channel<Msg>;

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, russh::Error> {
        self.channel_open_direct_tcpip(host, port, originator_host, originator_port)
            .await
    }

    async fn keepalive(&self) -> Result<(), russh::Error> {
        // Resolves on the peer's reply, or early when the session loop exits
        self.send_ping().await?;
        if Handle::is_closed(self) {
            return Err(russh::Error::Disconnect);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        Handle::is_closed(self)
    }

    async fn disconnect(&self) {
        let _ = Handle::disconnect(self, russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
    }
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand<C> {
    /// Open a direct-tcpip channel (one per forwarded local connection)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<C, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning only copies the senders; every clone has full control of the
/// session, so controllers must stay inside the process.
pub struct HandleController<C = Channel<Msg>> {
    cmd_tx: mpsc::Sender<HandleCommand<C>>,
    end_rx: watch::Receiver<Option<SessionEnd>>,
}

impl<C> Clone for HandleController<C> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            end_rx: self.end_rx.clone(),
        }
    }
}

impl<C: Send + 'static> HandleController<C> {
    /// Open a direct-tcpip channel
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<C, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Ask the owner task to disconnect. Does not wait for the task to exit.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed() && self.end_rx.borrow().is_none()
    }

    /// Resolves once the owner task has exited, with the reason
    pub async fn wait_for_end(&self) -> SessionEnd {
        let mut rx = self.end_rx.clone();
        loop {
            if let Some(end) = rx.borrow_and_update().clone() {
                return end;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without publishing: task panicked or was aborted
                return rx
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| SessionEnd::Failed("SSH session task ended".into()));
            }
        }
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the transport and returns a controller for sending commands.
pub fn spawn_handle_owner_task<T: SessionTransport>(
    transport: T,
    session_label: String,
    keepalive: KeepalivePolicy,
) -> HandleController<T::Channel> {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand<T::Channel>>(64);
    let (end_tx, end_rx) = watch::channel::<Option<SessionEnd>>(None);

    tokio::spawn(async move {
        let transport = Arc::new(transport);
        // Channel opens in flight; aborted when the session ends
        let mut opens: JoinSet<()> = JoinSet::new();

        info!("Handle owner task started for session {}", session_label);

        let mut ticker = tokio::time::interval(keepalive.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;
        let probe_timeout = PROBE_TIMEOUT.min(keepalive.interval);
        let mut missed: u32 = 0;

        let end = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenDirectTcpip {
                        host,
                        port,
                        originator_host,
                        originator_port,
                        reply_tx,
                    }) => {
                        let transport = Arc::clone(&transport);
                        opens.spawn(async move {
                            let result = transport
                                .open_direct_tcpip(&host, port, &originator_host, originator_port)
                                .await;
                            if reply_tx.send(result).is_err() {
                                // Channel is dropped here, the server closes it
                                warn!("Caller dropped before receiving direct_tcpip result");
                            }
                        });
                    }
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for session {}", session_label);
                        break SessionEnd::Closed;
                    }
                    None => {
                        info!("All controllers dropped for session {}", session_label);
                        break SessionEnd::Closed;
                    }
                },

                Some(_) = opens.join_next(), if !opens.is_empty() => {}

                _ = ticker.tick() => {
                    if transport.is_closed() {
                        warn!("SSH session {} closed by peer", session_label);
                        break SessionEnd::Failed("SSH connection closed".into());
                    }
                    match tokio::time::timeout(probe_timeout, transport.keepalive()).await {
                        Ok(Ok(())) => {
                            debug!("Keepalive OK for session {}", session_label);
                            missed = 0;
                        }
                        Ok(Err(e)) => {
                            warn!("Keepalive transport error for session {}: {}", session_label, e);
                            break SessionEnd::Failed(format!("SSH connection error: {}", e));
                        }
                        Err(_) => {
                            missed += 1;
                            warn!(
                                "Keepalive timeout for session {} ({}/{})",
                                session_label, missed, keepalive.max_missed
                            );
                            if missed >= keepalive.max_missed {
                                break SessionEnd::Failed(format!(
                                    "SSH keepalive exhausted after {} missed probes",
                                    missed
                                ));
                            }
                        }
                    }
                }
            }
        };

        // Publish before draining so subscribers see the reason first
        let _ = end_tx.send(Some(end));

        // Dropping the reply senders reports Disconnected to the callers
        opens.abort_all();
        drain_pending_commands(&mut cmd_rx);

        transport.disconnect().await;
        info!("Handle owner task terminated for session {}", session_label);
    });

    HandleController { cmd_tx, end_rx }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands<C>(cmd_rx: &mut mpsc::Receiver<HandleCommand<C>>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
