//! Remote Session Manager
//!
//! Owns the one authenticated session to the bastion. Callers never see the
//! SSH handle itself: they get a `HandleController` capability from
//! [`RemoteSessionManager::current`] and must expect it to go stale.
//!
//! Every successful connect bumps a generation counter. Lifecycle events carry
//! the generation so late signals from a replaced session can be ignored.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelStream};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::client::{ClientHandler, SshClient};
use super::config::BastionConfig;
use super::error::SshError;
use super::handle_owner::{
    spawn_handle_owner_task, HandleController, KeepalivePolicy, SessionEnd, SessionTransport,
};

/// Session lifecycle as seen by the rest of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

/// Lifecycle signal emitted by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Ready { generation: u64 },
    /// Transport error, session end and session close all land here
    Failed { generation: u64, error: String },
}

/// Produces authenticated transports for the manager
#[async_trait]
pub trait SessionConnector: Send + Sync + 'static {
    type Transport: SessionTransport;

    async fn connect(&self) -> Result<Self::Transport, SshError>;

    fn keepalive(&self) -> KeepalivePolicy;

    /// Human-readable target for logs, never contains credentials
    fn label(&self) -> String;
}

/// Connects to the configured bastion with russh
pub struct BastionConnector {
    config: BastionConfig,
}

impl BastionConnector {
    pub fn new(config: BastionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionConnector for BastionConnector {
    type Transport = Handle<ClientHandler>;

    async fn connect(&self) -> Result<Handle<ClientHandler>, SshError> {
        SshClient::new(self.config.clone()).connect().await
    }

    fn keepalive(&self) -> KeepalivePolicy {
        KeepalivePolicy {
            interval: std::time::Duration::from_secs(self.config.keepalive_interval_secs.max(1)),
            max_missed: self.config.keepalive_max.max(1),
        }
    }

    fn label(&self) -> String {
        format!("{}@{}", self.config.username, self.config.addr())
    }
}

/// Turns an opened channel into a byte stream that can be spliced
pub trait IntoByteStream: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn into_byte_stream(self) -> Self::Stream;
}

impl IntoByteStream for Channel<Msg> {
    type Stream = ChannelStream<Msg>;

    fn into_byte_stream(self) -> ChannelStream<Msg> {
        self.into_stream()
    }
}

type ChannelOf<C> = <<C as SessionConnector>::Transport as SessionTransport>::Channel;

struct SessionSlot<Ch> {
    state: SessionState,
    generation: u64,
    /// Random id of the live connection, for log correlation
    connection_id: Option<String>,
    controller: Option<HandleController<Ch>>,
}

/// Manager for the single bastion session
pub struct RemoteSessionManager<C: SessionConnector = BastionConnector> {
    connector: C,
    slot: Mutex<SessionSlot<ChannelOf<C>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl RemoteSessionManager<BastionConnector> {
    pub fn for_bastion(config: BastionConfig) -> Arc<Self> {
        Self::new(BastionConnector::new(config))
    }
}

impl<C: SessionConnector> RemoteSessionManager<C> {
    pub fn new(connector: C) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            connector,
            slot: Mutex::new(SessionSlot {
                state: SessionState::Disconnected,
                generation: 0,
                connection_id: None,
                controller: None,
            }),
            events,
        })
    }

    /// Open a new session, replacing any previous one.
    ///
    /// Returns the generation of the new session. A call made while another
    /// connect is in flight fails fast with `ConnectInProgress`.
    pub async fn connect(self: &Arc<Self>) -> Result<u64, SshError> {
        let previous = {
            let mut slot = self.slot.lock();
            if slot.state == SessionState::Connecting {
                return Err(SshError::ConnectInProgress);
            }
            slot.state = SessionState::Connecting;
            slot.controller.take()
        };

        let mut guard = ConnectGuard {
            manager: self.as_ref(),
            armed: true,
        };

        if let Some(previous) = previous {
            previous.disconnect().await;
        }

        let label = self.connector.label();
        let result = self.connector.connect().await;
        guard.armed = false;

        match result {
            Ok(transport) => {
                let connection_id = uuid::Uuid::new_v4().to_string();
                let controller = spawn_handle_owner_task(
                    transport,
                    format!("{} [{}]", label, connection_id),
                    self.connector.keepalive(),
                );

                let generation = {
                    let mut slot = self.slot.lock();
                    slot.generation += 1;
                    slot.state = SessionState::Ready;
                    slot.connection_id = Some(connection_id.clone());
                    slot.controller = Some(controller.clone());
                    slot.generation
                };

                self.watch_session(controller, generation);
                info!(
                    "Session {} ready (generation {}, connection {})",
                    label, generation, connection_id
                );
                let _ = self.events.send(SessionEvent::Ready { generation });
                Ok(generation)
            }
            Err(e) => {
                let generation = {
                    let mut slot = self.slot.lock();
                    slot.state = SessionState::Failed;
                    slot.generation
                };
                warn!("Session {} failed to connect: {}", label, e);
                let _ = self.events.send(SessionEvent::Failed {
                    generation,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn watch_session(self: &Arc<Self>, controller: HandleController<ChannelOf<C>>, generation: u64) {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let end = controller.wait_for_end().await;
            if let SessionEnd::Failed(error) = end {
                if let Some(manager) = manager.upgrade() {
                    manager.mark_failed(generation, error);
                }
            }
        });
    }

    fn mark_failed(&self, generation: u64, error: String) {
        {
            let mut slot = self.slot.lock();
            if slot.generation != generation || slot.state != SessionState::Ready {
                return;
            }
            slot.state = SessionState::Failed;
            slot.connection_id = None;
            slot.controller = None;
        }
        warn!("Session generation {} failed: {}", generation, error);
        let _ = self.events.send(SessionEvent::Failed { generation, error });
    }

    /// Close the current session on request. No `Failed` event is emitted.
    pub async fn close(&self) {
        let controller = {
            let mut slot = self.slot.lock();
            if slot.state != SessionState::Connecting {
                slot.state = SessionState::Disconnected;
            }
            slot.connection_id = None;
            slot.controller.take()
        };
        if let Some(controller) = controller {
            info!("Closing session {}", self.connector.label());
            controller.disconnect().await;
        }
    }

    /// Capability for the live session, or None when not Ready
    pub fn current(&self) -> Option<HandleController<ChannelOf<C>>> {
        let slot = self.slot.lock();
        match (&slot.state, &slot.controller) {
            (SessionState::Ready, Some(controller)) if controller.is_connected() => {
                Some(controller.clone())
            }
            _ => None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.slot.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    pub fn connection_id(&self) -> Option<String> {
        self.slot.lock().connection_id.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.current().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Resets `Connecting` if the connect future is dropped mid-handshake
struct ConnectGuard<'a, C: SessionConnector> {
    manager: &'a RemoteSessionManager<C>,
    armed: bool,
}

impl<C: SessionConnector> Drop for ConnectGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            let mut slot = self.manager.slot.lock();
            if slot.state == SessionState::Connecting {
                slot.state = SessionState::Disconnected;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::handle_owner::tests::FakeTransport;
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    /// Hands out scripted results; `Ok` results carry the transport to use
    struct ScriptedConnector {
        script: Mutex<VecDeque<Result<FakeTransport, SshError>>>,
        delay: Duration,
    }

    impl ScriptedConnector {
        fn new(script: Vec<Result<FakeTransport, SshError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl SessionConnector for ScriptedConnector {
        type Transport = FakeTransport;

        async fn connect(&self) -> Result<FakeTransport, SshError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(SshError::ConnectionFailed("script exhausted".into())))
        }

        fn keepalive(&self) -> KeepalivePolicy {
            KeepalivePolicy {
                interval: Duration::from_secs(10),
                max_missed: 5,
            }
        }

        fn label(&self) -> String {
            "fake@bastion:22".into()
        }
    }

    #[tokio::test]
    async fn test_connect_reaches_ready_and_emits_event() {
        let manager = RemoteSessionManager::new(ScriptedConnector::new(vec![Ok(
            FakeTransport::default(),
        )]));
        let mut events = manager.subscribe();

        let generation = manager.connect().await.unwrap();
        assert_eq!(generation, 1);
        assert_eq!(manager.state(), SessionState::Ready);
        assert!(manager.current().is_some());
        assert!(manager.connection_id().is_some());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Ready { generation: 1 }
        );
    }

    #[tokio::test]
    async fn test_connect_error_moves_to_failed() {
        let manager = RemoteSessionManager::new(ScriptedConnector::new(vec![Err(
            SshError::AuthenticationFailed("denied".into()),
        )]));
        let mut events = manager.subscribe();

        assert!(matches!(
            manager.connect().await,
            Err(SshError::AuthenticationFailed(_))
        ));
        assert_eq!(manager.state(), SessionState::Failed);
        assert!(manager.current().is_none());
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Failed { generation: 0, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connect_is_rejected() {
        let mut connector = ScriptedConnector::new(vec![Ok(FakeTransport::default())]);
        connector.delay = Duration::from_secs(1);
        let manager = RemoteSessionManager::new(connector);

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(manager.state(), SessionState::Connecting);
        assert!(matches!(
            manager.connect().await,
            Err(SshError::ConnectInProgress)
        ));

        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(manager.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_emits_failed_with_generation() {
        let transport = FakeTransport::default();
        let closed = transport.closed.clone();
        let manager = RemoteSessionManager::new(ScriptedConnector::new(vec![Ok(transport)]));
        let mut events = manager.subscribe();
        manager.connect().await.unwrap();
        let _ = events.recv().await;

        closed.store(true, Ordering::SeqCst);
        let event = events.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::Failed { generation: 1, .. }));
        assert_eq!(manager.state(), SessionState::Failed);
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn test_close_is_quiet_and_reconnect_bumps_generation() {
        let manager = RemoteSessionManager::new(ScriptedConnector::new(vec![
            Ok(FakeTransport::default()),
            Ok(FakeTransport::default()),
        ]));
        manager.connect().await.unwrap();
        let first_id = manager.connection_id();
        let mut events = manager.subscribe();

        manager.close().await;
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(manager.current().is_none());
        assert!(manager.connection_id().is_none());

        assert_eq!(manager.connect().await.unwrap(), 2);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Ready { generation: 2 }
        );
        assert_ne!(manager.connection_id(), first_id);
    }
}
