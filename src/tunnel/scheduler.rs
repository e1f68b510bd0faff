//! Reconnection Scheduler
//!
//! Drives the tunnel lifecycle as a whole:
//!
//! ```text
//! Idle -> Establishing -> Active -> Recovering(delay) -> Establishing -> ...
//! Idle -> Establishing -> Failed            (invalid configuration only)
//! ```
//!
//! Startup uses a short linear retry budget and surfaces the last error when
//! it runs out. Once the tunnel has been Active, a single supervisor task owns
//! every later recovery cycle and never gives up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::backend::{TunnelBackend, TunnelFault};
use super::backoff::{startup_delay, BackoffState};
use super::error::TunnelError;
use super::RemoteService;

/// Reconnect tuning
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// First recovery delay
    pub base_delay: Duration,
    /// Recovery delay cap
    pub max_delay: Duration,
    /// Startup connect attempts before the error is surfaced
    pub max_initial_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5000),
            max_delay: Duration::from_millis(30_000),
            max_initial_attempts: 3,
        }
    }
}

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Establishing,
    Active,
    /// Waiting `delay_ms` before the next attempt
    Recovering { delay_ms: u64 },
    /// Configuration can never work; terminal
    Failed,
}

/// Read side consumed by the pool registry
pub trait TunnelProbe: Send + Sync {
    /// True iff the tunnel is Active, the session Ready and both endpoints listening
    fn is_tunnel_active(&self) -> bool;

    /// Loopback port serving `service`, only while the tunnel is active
    fn local_port(&self, service: RemoteService) -> Option<u16>;
}

/// Backoff state machine over a [`TunnelBackend`]
pub struct ReconnectScheduler<B: TunnelBackend> {
    backend: Arc<B>,
    config: ReconnectConfig,
    state: Mutex<SchedulerState>,
    transitions: broadcast::Sender<SchedulerState>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<B: TunnelBackend> ReconnectScheduler<B> {
    pub fn new(backend: Arc<B>, config: ReconnectConfig) -> Arc<Self> {
        let (transitions, _) = broadcast::channel(64);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            backend,
            config,
            state: Mutex::new(SchedulerState::Idle),
            transitions,
            shutdown_tx,
            started: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    /// Every state change, in order
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerState> {
        self.transitions.subscribe()
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn set_state(&self, next: SchedulerState) {
        {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            *state = next;
        }
        let _ = self.transitions.send(next);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Bring the tunnel up with the startup retry policy.
    ///
    /// Returns once the tunnel is Active, or with the error that ended
    /// startup. A configuration error fails on the first attempt and moves
    /// the scheduler to `Failed`.
    pub async fn start(self: &Arc<Self>) -> Result<(), TunnelError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::AlreadyStarted);
        }

        let max_attempts = self.config.max_initial_attempts.max(1);
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if self.is_shutting_down() {
                return Err(TunnelError::ShuttingDown);
            }

            info!("Tunnel startup attempt {}/{}", attempt, max_attempts);
            self.set_state(SchedulerState::Establishing);

            match self.backend.open().await {
                Ok(faults) => {
                    self.set_state(SchedulerState::Active);
                    info!("Tunnel active after {} startup attempt(s)", attempt);
                    let supervisor = tokio::spawn(self.clone().supervise(faults));
                    *self.supervisor.lock() = Some(supervisor);
                    if self.is_shutting_down() {
                        // shutdown() ran while we were opening
                        self.stop_supervisor().await;
                        self.backend.close().await;
                        return Err(TunnelError::ShuttingDown);
                    }
                    return Ok(());
                }
                Err(e) if e.is_terminal() => {
                    error!("Tunnel configuration invalid, not retrying: {}", e);
                    self.set_state(SchedulerState::Failed);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Tunnel startup attempt {} failed: {}", attempt, e);
                    self.backend.close().await;
                    last_error = e.to_string();
                    self.set_state(SchedulerState::Idle);

                    if attempt < max_attempts {
                        let delay = startup_delay(attempt);
                        info!("Retrying tunnel startup in {}ms", delay.as_millis());
                        if !sleep_unless_shutdown(delay, &mut shutdown).await {
                            return Err(TunnelError::ShuttingDown);
                        }
                    }
                }
            }
        }

        error!(
            "Tunnel startup gave up after {} attempt(s); continuing without tunnel",
            max_attempts
        );
        Err(TunnelError::StartupExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Steady-state loop: wait for a fault, then recover until Active again
    async fn supervise(self: Arc<Self>, mut faults: mpsc::Receiver<TunnelFault>) {
        let mut backoff = BackoffState::new(self.config.base_delay, self.config.max_delay);
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            let fault = tokio::select! {
                fault = faults.recv() => fault.unwrap_or(TunnelFault::MonitorLost),
                _ = wait_for_shutdown(&mut shutdown) => return,
            };
            warn!("Tunnel lost: {}", fault);
            // Later faults for the same break are dropped with the receiver
            drop(faults);

            faults = loop {
                let delay = backoff.next_delay();
                self.set_state(SchedulerState::Recovering {
                    delay_ms: delay.as_millis() as u64,
                });
                self.backend.close().await;

                info!(
                    "Reconnecting tunnel in {}ms (attempt {})",
                    delay.as_millis(),
                    backoff.attempt()
                );
                if !sleep_unless_shutdown(delay, &mut shutdown).await {
                    return;
                }

                self.set_state(SchedulerState::Establishing);
                match self.backend.open().await {
                    Ok(faults) => {
                        backoff.reset();
                        self.set_state(SchedulerState::Active);
                        info!("Tunnel re-established");
                        break faults;
                    }
                    Err(e) => {
                        warn!("Tunnel reconnect failed: {}", e);
                    }
                }
            };
        }
    }

    async fn stop_supervisor(&self) {
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.abort();
            let _ = supervisor.await;
        }
    }

    /// Stop recovery and tear the tunnel down. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("Shutting down tunnel");
        self.stop_supervisor().await;
        self.backend.close().await;
        if self.state() != SchedulerState::Failed {
            self.set_state(SchedulerState::Idle);
        }
    }
}

impl<B: TunnelBackend> TunnelProbe for ReconnectScheduler<B> {
    fn is_tunnel_active(&self) -> bool {
        self.state() == SchedulerState::Active && self.backend.is_up()
    }

    fn local_port(&self, service: RemoteService) -> Option<u16> {
        if self.is_tunnel_active() {
            self.backend.local_port(service)
        } else {
            None
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Returns false when shutdown was requested before the delay elapsed
async fn sleep_unless_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = wait_for_shutdown(shutdown) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    /// Scripted backend: each `open` pops the next outcome
    struct FakeBackend {
        script: Mutex<VecDeque<Result<(), TunnelError>>>,
        opens: AtomicU32,
        closes: AtomicU32,
        up: AtomicBool,
        fault_tx: Mutex<Option<mpsc::Sender<TunnelFault>>>,
    }

    impl FakeBackend {
        fn new(script: Vec<Result<(), TunnelError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                opens: AtomicU32::new(0),
                closes: AtomicU32::new(0),
                up: AtomicBool::new(false),
                fault_tx: Mutex::new(None),
            })
        }

        fn push(&self, outcome: Result<(), TunnelError>) {
            self.script.lock().push_back(outcome);
        }

        /// Simulate the session dying under an active tunnel
        async fn kill_session(&self) {
            self.up.store(false, Ordering::SeqCst);
            let tx = self.fault_tx.lock().clone();
            if let Some(tx) = tx {
                let _ = tx.send(TunnelFault::Session("connection reset".into())).await;
                let _ = tx.send(TunnelFault::Session("channel closed".into())).await;
            }
        }
    }

    fn session_error() -> TunnelError {
        TunnelError::Session(crate::ssh::SshError::ConnectionFailed("refused".into()))
    }

    #[async_trait]
    impl TunnelBackend for FakeBackend {
        async fn open(&self) -> Result<mpsc::Receiver<TunnelFault>, TunnelError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let outcome = self.script.lock().pop_front().unwrap_or_else(|| Err(session_error()));
            outcome?;
            let (tx, rx) = mpsc::channel(4);
            *self.fault_tx.lock() = Some(tx);
            self.up.store(true, Ordering::SeqCst);
            Ok(rx)
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.up.store(false, Ordering::SeqCst);
            self.fault_tx.lock().take();
        }

        fn is_up(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        fn local_port(&self, service: RemoteService) -> Option<u16> {
            match service {
                RemoteService::Oracle => Some(15210),
                RemoteService::Postgres => Some(15432),
            }
        }
    }

    async fn next_state(rx: &mut broadcast::Receiver<SchedulerState>) -> SchedulerState {
        rx.recv().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_succeeds_first_try() {
        let backend = FakeBackend::new(vec![Ok(())]);
        let scheduler = ReconnectScheduler::new(backend.clone(), ReconnectConfig::default());

        scheduler.start().await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Active);
        assert!(scheduler.is_tunnel_active());
        assert_eq!(scheduler.local_port(RemoteService::Oracle), Some(15210));
        assert_eq!(scheduler.local_port(RemoteService::Postgres), Some(15432));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_fails_twice_then_succeeds() {
        let backend = FakeBackend::new(vec![Err(session_error()), Err(session_error()), Ok(())]);
        let scheduler = ReconnectScheduler::new(backend.clone(), ReconnectConfig::default());

        let started = tokio::time::Instant::now();
        scheduler.start().await.unwrap();

        assert_eq!(scheduler.state(), SchedulerState::Active);
        assert_eq!(backend.opens.load(Ordering::SeqCst), 3);
        // 2000ms after attempt 1, 4000ms after attempt 2
        assert_eq!(started.elapsed(), Duration::from_millis(6000));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_budget_exhausted_is_surfaced() {
        let backend = FakeBackend::new(vec![]);
        let scheduler = ReconnectScheduler::new(backend.clone(), ReconnectConfig::default());

        let err = scheduler.start().await.unwrap_err();
        assert!(matches!(err, TunnelError::StartupExhausted { attempts: 3, .. }));
        assert_eq!(backend.opens.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(!scheduler.is_tunnel_active());
        assert!(scheduler.local_port(RemoteService::Postgres).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_error_is_terminal() {
        let backend = FakeBackend::new(vec![Err(TunnelError::Config("no credentials".into()))]);
        let scheduler = ReconnectScheduler::new(backend.clone(), ReconnectConfig::default());

        let err = scheduler.start().await.unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), SchedulerState::Failed);

        scheduler.shutdown().await;
        assert_eq!(scheduler.state(), SchedulerState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_kill_enters_recovering_with_base_delay() {
        let backend = FakeBackend::new(vec![Ok(())]);
        let scheduler = ReconnectScheduler::new(backend.clone(), ReconnectConfig::default());
        scheduler.start().await.unwrap();
        let mut states = scheduler.subscribe();

        backend.push(Ok(()));
        backend.kill_session().await;
        assert!(!scheduler.is_tunnel_active());

        assert_eq!(
            next_state(&mut states).await,
            SchedulerState::Recovering { delay_ms: 5000 }
        );
        assert!(!scheduler.is_tunnel_active());
        assert_eq!(next_state(&mut states).await, SchedulerState::Establishing);
        assert_eq!(next_state(&mut states).await, SchedulerState::Active);
        assert!(scheduler.is_tunnel_active());

        // Duplicate fault was coalesced into one recovery cycle
        assert_eq!(backend.opens.load(Ordering::SeqCst), 2);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_backoff_grows_then_resets() {
        let backend = FakeBackend::new(vec![Ok(())]);
        let scheduler = ReconnectScheduler::new(backend.clone(), ReconnectConfig::default());
        scheduler.start().await.unwrap();
        let mut states = scheduler.subscribe();

        for _ in 0..4 {
            backend.push(Err(session_error()));
        }
        backend.push(Ok(()));
        backend.kill_session().await;

        let mut delays = Vec::new();
        loop {
            match next_state(&mut states).await {
                SchedulerState::Recovering { delay_ms } => delays.push(delay_ms),
                SchedulerState::Active => break,
                _ => {}
            }
        }
        assert_eq!(delays, vec![5000, 10_000, 20_000, 30_000, 30_000]);

        // Next failure starts again from the base delay
        backend.push(Ok(()));
        backend.kill_session().await;
        assert_eq!(
            next_state(&mut states).await,
            SchedulerState::Recovering { delay_ms: 5000 }
        );
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent_and_stops_recovery() {
        let backend = FakeBackend::new(vec![Ok(())]);
        let scheduler = ReconnectScheduler::new(backend.clone(), ReconnectConfig::default());
        scheduler.start().await.unwrap();

        backend.kill_session().await;
        tokio::task::yield_now().await;

        scheduler.shutdown().await;
        scheduler.shutdown().await;
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(!scheduler.is_tunnel_active());

        let opens = backend.opens.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(backend.opens.load(Ordering::SeqCst), opens);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected() {
        let backend = FakeBackend::new(vec![Ok(())]);
        let scheduler = ReconnectScheduler::new(backend, ReconnectConfig::default());
        scheduler.start().await.unwrap();
        assert!(matches!(
            scheduler.start().await,
            Err(TunnelError::AlreadyStarted)
        ));
        scheduler.shutdown().await;
    }
}
