//! Shared helpers for ganglion integration tests
#![allow(dead_code)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use ganglion::config::{ClientConfig, FleetConfig, PortRange, ReadinessMode, SupervisorConfig};
use ganglion::rpc::RetryPolicy;
use ganglion::worker::{WorkerConfig, WorkerHandle, WorkerServer};

/// Path of the reference worker built alongside the tests
pub fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ganglion-worker"))
}

/// A port nobody listens on right now
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A small range starting at a currently free port
pub fn port_range(len: u16) -> PortRange {
    let start = free_port();
    PortRange::new(start, start.saturating_add(len - 1))
}

/// Client settings with short deadlines
pub fn client_config() -> ClientConfig {
    ClientConfig {
        request_timeout: Duration::from_secs(5),
        message_timeout: Duration::from_secs(10),
        connect_retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
        },
        ..ClientConfig::default()
    }
}

/// Supervisor settings that run the reference worker
pub fn worker_supervisor_config(range: PortRange, max_instances: usize) -> SupervisorConfig {
    SupervisorConfig {
        binary: worker_binary(),
        port_range: range,
        max_instances,
        readiness: ReadinessMode::Rpc,
        startup_timeout: Duration::from_secs(15),
        grace_period: Duration::from_secs(3),
        default_model: "echo".to_string(),
        default_provider: "local".to_string(),
        ..SupervisorConfig::default()
    }
}

/// Fleet settings built around the reference worker
pub fn fleet_config(max_instances: usize) -> FleetConfig {
    let mut config = FleetConfig::default();
    config.supervisor = worker_supervisor_config(port_range(16), max_instances);
    config.client = client_config();
    config
}

/// In-process reference worker on an ephemeral port
pub async fn start_worker() -> WorkerHandle {
    start_worker_with(WorkerConfig::default()).await
}

pub async fn start_worker_with(config: WorkerConfig) -> WorkerHandle {
    WorkerServer::bind(config).await.unwrap().spawn()
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
