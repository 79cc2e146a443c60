//! Health probing
//!
//! A probe is a fresh connect + `ping` bounded by a short timeout. Status
//! follows the consecutive-failure count:
//!
//! | consecutive failures        | status        |
//! |-----------------------------|---------------|
//! | 0 (last probe succeeded)    | `healthy`     |
//! | 1 .. threshold-1            | `degraded`    |
//! | threshold and more          | `unreachable` |

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::instance::HealthStatus;
use crate::error::Result;
use crate::rpc;

/// Checks whether an endpoint answers
#[async_trait]
pub trait Prober: Send + Sync {
    /// Returns the round-trip latency on success
    async fn probe(&self, endpoint: &str, timeout: Duration) -> Result<Duration>;
}

/// Probes over the worker RPC protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct RpcProber;

#[async_trait]
impl Prober for RpcProber {
    async fn probe(&self, endpoint: &str, timeout: Duration) -> Result<Duration> {
        rpc::ping(endpoint, timeout).await
    }
}

/// Status and failure count after one probe
pub fn next_health(failures_before: u32, success: bool, unreachable_after: u32) -> (HealthStatus, u32) {
    if success {
        return (HealthStatus::Healthy, 0);
    }
    let failures = failures_before.saturating_add(1);
    if failures >= unreachable_after {
        (HealthStatus::Unreachable, failures)
    } else {
        (HealthStatus::Degraded, failures)
    }
}

/// Background task running a health round at a fixed interval
pub struct HealthMonitor {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Run `round` every `interval` until stopped or until it returns `false`
    pub fn start<F, Fut>(interval: Duration, round: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !round().await {
                    break;
                }
            }
            debug!("Health monitor stopped");
        });

        Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .handle
                .lock()
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_hysteresis() {
        let (status, failures) = next_health(0, false, 3);
        assert_eq!(status, HealthStatus::Degraded);
        let (status, failures) = next_health(failures, false, 3);
        assert_eq!(status, HealthStatus::Degraded);
        let (status, failures) = next_health(failures, false, 3);
        assert_eq!(status, HealthStatus::Unreachable);
        assert_eq!(failures, 3);

        let (status, failures) = next_health(failures, true, 3);
        assert_eq!(status, HealthStatus::Healthy);
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn test_monitor_runs_rounds_until_stopped() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let counter = rounds.clone();
        let monitor = HealthMonitor::start(Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(monitor.is_running());
        monitor.stop();
        let seen = rounds.load(Ordering::SeqCst);
        assert!(seen >= 2, "only {} rounds", seen);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!monitor.is_running());
        assert!(rounds.load(Ordering::SeqCst) <= seen + 1);
    }

    #[tokio::test]
    async fn test_monitor_stops_when_round_says_so() {
        let monitor = HealthMonitor::start(Duration::from_millis(5), || async { false });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!monitor.is_running());
    }
}
