//! Tunnel Set
//!
//! The two service endpoints are started and stopped as a unit: callers only
//! ever see both listening or neither.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use super::local::{ForwardChannelSource, ServiceForward, TunnelEndpoint};
use super::ForwardError;

/// Per-endpoint status (for logs and the status report)
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub local_port: u16,
    pub remote: String,
    pub listening: bool,
    pub connection_count: u64,
    pub active_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A started pair of tunnel endpoints
pub struct TunnelSet {
    endpoints: Vec<TunnelEndpoint>,
}

impl TunnelSet {
    /// Start every forward, or none.
    ///
    /// If any endpoint fails to bind, the ones already started are stopped
    /// before the error is returned.
    pub async fn start<S: ForwardChannelSource>(
        source: Arc<S>,
        forwards: &[ServiceForward],
        drain_deadline: Duration,
    ) -> Result<Self, ForwardError> {
        let mut endpoints = Vec::with_capacity(forwards.len());

        for forward in forwards {
            match TunnelEndpoint::start(source.clone(), forward.clone(), drain_deadline).await {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => {
                    warn!(
                        "Tunnel endpoint {} failed to start, rolling back {} started endpoint(s)",
                        forward.name,
                        endpoints.len()
                    );
                    for endpoint in &endpoints {
                        endpoint.stop().await;
                    }
                    return Err(e);
                }
            }
        }

        info!("Tunnel set started with {} endpoint(s)", endpoints.len());
        Ok(Self { endpoints })
    }

    /// True only when every endpoint is listening
    pub fn all_listening(&self) -> bool {
        !self.endpoints.is_empty() && self.endpoints.iter().all(|e| e.is_listening())
    }

    /// Bound loopback port of the named endpoint
    pub fn local_port(&self, name: &str) -> Option<u16> {
        self.endpoints
            .iter()
            .find(|e| e.forward().name == name)
            .map(|e| e.bound_addr().port())
    }

    /// Stop every endpoint, each with its own drain deadline
    pub async fn stop(&self) {
        for endpoint in &self.endpoints {
            endpoint.stop().await;
        }
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.endpoints
            .iter()
            .map(|e| {
                let stats = e.stats();
                let forward = e.forward();
                EndpointStatus {
                    name: forward.name.clone(),
                    local_port: e.bound_addr().port(),
                    remote: format!("{}:{}", forward.remote_host, forward.remote_port),
                    listening: e.is_listening(),
                    connection_count: stats.connection_count,
                    active_connections: stats.active_connections,
                    bytes_sent: stats.bytes_sent,
                    bytes_received: stats.bytes_received,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::local::tests::EchoSource;
    use tokio::net::TcpListener;

    fn forwards() -> Vec<ServiceForward> {
        vec![
            ServiceForward::new("oracle", 0, "10.0.4.20", 1521),
            ServiceForward::new("postgres", 0, "10.0.4.12", 5432),
        ]
    }

    #[tokio::test]
    async fn test_both_endpoints_start_together() {
        let set = TunnelSet::start(Arc::new(EchoSource::default()), &forwards(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(set.all_listening());
        assert!(set.local_port("oracle").is_some());
        assert!(set.local_port("postgres").is_some());
        assert_ne!(set.local_port("oracle"), set.local_port("postgres"));
        assert_eq!(set.status().len(), 2);

        set.stop().await;
        assert!(!set.all_listening());
        set.stop().await;
    }

    #[tokio::test]
    async fn test_second_bind_failure_rolls_back_first() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let first_port = probe.local_addr().unwrap().port();
        drop(probe);

        let forwards = vec![
            ServiceForward::new("oracle", first_port, "10.0.4.20", 1521),
            ServiceForward::new("postgres", taken_port, "10.0.4.12", 5432),
        ];
        let result =
            TunnelSet::start(Arc::new(EchoSource::default()), &forwards, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ForwardError::Bind { .. })));

        // First endpoint was released
        assert!(TcpListener::bind(("127.0.0.1", first_port)).await.is_ok());
    }
}
