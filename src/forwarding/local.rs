//! Tunnel Endpoint
//!
//! Listens on a loopback port and forwards every accepted connection to one
//! remote service through a direct-tcpip channel on the bastion session.
//! Example: 127.0.0.1:5433 -> 10.0.4.12:5432

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::ForwardError;
use crate::ssh::{IntoByteStream, RemoteSessionManager, SessionConnector, SessionTransport, SshError};

/// Source of forwarded channels, normally the Remote Session Manager
#[async_trait]
pub trait ForwardChannelSource: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn open_channel(
        &self,
        remote_host: &str,
        remote_port: u16,
        originator: SocketAddr,
    ) -> Result<Self::Stream, SshError>;
}

#[async_trait]
impl<C> ForwardChannelSource for RemoteSessionManager<C>
where
    C: SessionConnector,
    <C::Transport as SessionTransport>::Channel: IntoByteStream,
{
    type Stream = <<C::Transport as SessionTransport>::Channel as IntoByteStream>::Stream;

    async fn open_channel(
        &self,
        remote_host: &str,
        remote_port: u16,
        originator: SocketAddr,
    ) -> Result<Self::Stream, SshError> {
        // Capability is refreshed per connection; a replaced session is never reused
        let controller = self.current().ok_or(SshError::Disconnected)?;
        let channel = controller
            .open_direct_tcpip(
                remote_host,
                remote_port as u32,
                &originator.ip().to_string(),
                originator.port() as u32,
            )
            .await?;
        Ok(channel.into_byte_stream())
    }
}

/// One forwarded remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceForward {
    /// Name used in logs (e.g. "oracle", "postgres")
    pub name: String,
    /// Loopback port to bind; 0 picks a free port
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ServiceForward {
    pub fn new(
        name: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    pub fn local_addr(&self) -> String {
        format!("127.0.0.1:{}", self.local_port)
    }
}

/// Statistics for a tunnel endpoint
#[derive(Debug, Clone, Default)]
pub struct ForwardStats {
    /// Total connections accepted
    pub connection_count: u64,
    /// Connections currently open
    pub active_connections: u64,
    /// Total bytes sent (local -> remote)
    pub bytes_sent: u64,
    /// Total bytes received (remote -> local)
    pub bytes_received: u64,
}

/// Handle to a running tunnel endpoint
pub struct TunnelEndpoint {
    forward: ServiceForward,
    /// Actual bound address (differs from the request when port was 0)
    bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    /// Dropping the sender stops the accept loop
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RwLock<ForwardStats>>,
}

impl TunnelEndpoint {
    /// Bind the loopback listener and start accepting connections.
    ///
    /// In-flight connections get `drain_deadline` to finish when the endpoint
    /// is stopped; whatever is left after that is aborted.
    pub async fn start<S: ForwardChannelSource>(
        source: Arc<S>,
        forward: ServiceForward,
        drain_deadline: Duration,
    ) -> Result<Self, ForwardError> {
        let local_addr = forward.local_addr();
        let listener = TcpListener::bind(&local_addr)
            .await
            .map_err(|e| bind_error(&local_addr, e))?;

        let bound_addr = listener
            .local_addr()
            .map_err(|e| bind_error(&local_addr, e))?;

        info!(
            "Tunnel endpoint {} listening: {} -> {}:{}",
            forward.name, bound_addr, forward.remote_host, forward.remote_port
        );

        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let stats = Arc::new(RwLock::new(ForwardStats::default()));

        let task = tokio::spawn(accept_loop(
            listener,
            source,
            forward.clone(),
            stop_rx,
            running.clone(),
            stats.clone(),
            drain_deadline,
        ));

        Ok(Self {
            forward,
            bound_addr,
            running,
            stop_tx: Mutex::new(Some(stop_tx)),
            task: Mutex::new(Some(task)),
            stats,
        })
    }

    /// Close the listener and wait for in-flight connections to drain.
    ///
    /// Safe to call more than once.
    pub async fn stop(&self) {
        let stop_tx = self.stop_tx.lock().take();
        let task = self.task.lock().take();
        let Some(task) = task else {
            return;
        };

        info!(
            "Stopping tunnel endpoint {} on {}",
            self.forward.name, self.bound_addr
        );
        drop(stop_tx);
        if let Err(e) = task.await {
            warn!("Tunnel endpoint {} task ended abnormally: {}", self.forward.name, e);
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// True while the listener is accepting connections
    pub fn is_listening(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn forward(&self) -> &ServiceForward {
        &self.forward
    }

    /// Get current statistics
    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }
}

impl Drop for TunnelEndpoint {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

fn bind_error(addr: &str, e: std::io::Error) -> ForwardError {
    let reason = match e.kind() {
        std::io::ErrorKind::AddrInUse => {
            "port already in use, another process may be listening".to_string()
        }
        std::io::ErrorKind::PermissionDenied => {
            "permission denied, ports below 1024 require elevated privileges".to_string()
        }
        std::io::ErrorKind::AddrNotAvailable => "address not available on this system".to_string(),
        _ => e.to_string(),
    };
    ForwardError::Bind {
        addr: addr.to_string(),
        reason,
    }
}

async fn accept_loop<S: ForwardChannelSource>(
    listener: TcpListener,
    source: Arc<S>,
    forward: ServiceForward,
    mut stop_rx: mpsc::Receiver<()>,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<ForwardStats>>,
    drain_deadline: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                debug!("Tunnel endpoint {} stop requested", forward.name);
                break;
            }

            Some(_) = connections.join_next(), if !connections.is_empty() => {}

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }

                        debug!("Accepted {} on tunnel endpoint {}", peer_addr, forward.name);

                        {
                            let mut s = stats.write();
                            s.connection_count += 1;
                            s.active_connections += 1;
                        }

                        let active = ActiveConnection(stats.clone());
                        let source = source.clone();
                        let forward = forward.clone();
                        let stats = stats.clone();
                        connections.spawn(async move {
                            let _active = active;
                            if let Err(e) = handle_forward_connection(
                                source.as_ref(),
                                stream,
                                peer_addr,
                                &forward,
                                &stats,
                            )
                            .await
                            {
                                warn!("Tunnel endpoint {}: {}", forward.name, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error on tunnel endpoint {}: {}", forward.name, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    // No new connections from here on
    drop(listener);
    running.store(false, Ordering::SeqCst);

    if !connections.is_empty() {
        let drained = tokio::time::timeout(drain_deadline, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "Tunnel endpoint {}: force-closing {} connection(s) after {}s drain deadline",
                forward.name,
                connections.len(),
                drain_deadline.as_secs()
            );
            connections.shutdown().await;
        }
    }

    info!("Tunnel endpoint {} closed", forward.name);
}

/// Decrements `active_connections` however the connection task ends
struct ActiveConnection(Arc<RwLock<ForwardStats>>);

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        let mut s = self.0.write();
        s.active_connections = s.active_connections.saturating_sub(1);
    }
}

/// Handle a single forwarded connection
async fn handle_forward_connection<S: ForwardChannelSource>(
    source: &S,
    local_stream: TcpStream,
    peer_addr: SocketAddr,
    forward: &ServiceForward,
    stats: &RwLock<ForwardStats>,
) -> Result<(), SshError> {
    // On failure only this local socket is dropped
    let remote = source
        .open_channel(&forward.remote_host, forward.remote_port, peer_addr)
        .await?;

    debug!(
        "Opened channel for {} to {}:{}",
        peer_addr, forward.remote_host, forward.remote_port
    );

    let (sent, received) = splice(local_stream, remote).await;

    {
        let mut s = stats.write();
        s.bytes_sent += sent;
        s.bytes_received += received;
    }

    debug!(
        "Forward connection {} closed ({} bytes out, {} bytes in)",
        peer_addr, sent, received
    );
    Ok(())
}

/// Copy bytes both ways until both directions finish. EOF on one side is
/// forwarded as a write shutdown to the other, so a half-closed peer still
/// gets its reply. Returns (bytes local -> remote, bytes remote -> local);
/// an I/O error ends both directions and reports no counts.
pub async fn splice<L, R>(mut local: L, mut remote: R) -> (u64, u64)
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok(counts) => counts,
        Err(e) => {
            debug!("Forward splice ended with error: {}", e);
            (0, 0)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Every channel is an in-memory pipe to an echo task
    #[derive(Default)]
    pub(crate) struct EchoSource {
        pub refuse: AtomicBool,
        /// Channels whose echo side never answers or closes
        pub stall: AtomicBool,
        pub opened: AtomicUsize,
    }

    #[async_trait]
    impl ForwardChannelSource for EchoSource {
        type Stream = DuplexStream;

        async fn open_channel(
            &self,
            remote_host: &str,
            remote_port: u16,
            _originator: SocketAddr,
        ) -> Result<DuplexStream, SshError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(SshError::ChannelError(format!(
                    "open refused for {}:{}",
                    remote_host, remote_port
                )));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (near, far) = tokio::io::duplex(4096);
            let stall = self.stall.load(Ordering::SeqCst);
            tokio::spawn(async move {
                if stall {
                    let _far = far;
                    std::future::pending::<()>().await;
                } else {
                    let (mut r, mut w) = tokio::io::split(far);
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                }
            });
            Ok(near)
        }
    }

    fn forward() -> ServiceForward {
        ServiceForward::new("postgres", 0, "10.0.4.12", 5432)
    }

    #[tokio::test]
    async fn test_bytes_are_spliced_both_ways() {
        let source = Arc::new(EchoSource::default());
        let endpoint = TunnelEndpoint::start(source.clone(), forward(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(endpoint.is_listening());

        let mut client = TcpStream::connect(endpoint.bound_addr()).await.unwrap();
        client.write_all(b"SELECT 1").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SELECT 1");
        assert_eq!(endpoint.stats().active_connections, 1);

        drop(client);
        endpoint.stop().await;
        let stats = endpoint.stats();
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.active_connections, 0);
        assert!(!endpoint.is_listening());
    }

    #[tokio::test]
    async fn test_splice_delivers_reply_after_half_close() {
        let (mut client, local) = tokio::io::duplex(64);
        let (remote, mut server) = tokio::io::duplex(64);
        let spliced = tokio::spawn(splice(local, remote));

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        server.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");
        server.write_all(b"late reply").await.unwrap();
        server.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"late reply");
        assert_eq!(spliced.await.unwrap(), (7, 10));
    }

    #[tokio::test]
    async fn test_channel_refusal_closes_only_local_socket() {
        let source = Arc::new(EchoSource::default());
        source.refuse.store(true, Ordering::SeqCst);
        let endpoint = TunnelEndpoint::start(source.clone(), forward(), Duration::from_secs(1))
            .await
            .unwrap();

        let mut client = TcpStream::connect(endpoint.bound_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert!(endpoint.is_listening());

        // Endpoint keeps serving once the remote accepts again
        source.refuse.store(false, Ordering::SeqCst);
        let mut client = TcpStream::connect(endpoint.bound_addr()).await.unwrap();
        client.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        endpoint.stop().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let forward = ServiceForward::new("oracle", port, "10.0.4.20", 1521);

        let result =
            TunnelEndpoint::start(Arc::new(EchoSource::default()), forward, Duration::from_secs(1))
                .await;
        assert!(matches!(result, Err(ForwardError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_stop_force_closes_after_deadline() {
        let source = Arc::new(EchoSource::default());
        source.stall.store(true, Ordering::SeqCst);
        let endpoint =
            TunnelEndpoint::start(source.clone(), forward(), Duration::from_millis(200))
                .await
                .unwrap();

        let mut client = TcpStream::connect(endpoint.bound_addr()).await.unwrap();
        client.write_all(b"hang").await.unwrap();
        while source.opened.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        endpoint.stop().await;
        assert_eq!(endpoint.stats().active_connections, 0);

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_releases_port() {
        let endpoint = TunnelEndpoint::start(
            Arc::new(EchoSource::default()),
            forward(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let addr = endpoint.bound_addr();

        endpoint.stop().await;
        endpoint.stop().await;
        assert!(TcpListener::bind(addr).await.is_ok());
    }
}
