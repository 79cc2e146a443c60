//! Worker process handle and lifecycle state

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::output::OutputBuffer;
use crate::types::ProcessId;

/// Lifecycle state of a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Forked, readiness not yet confirmed
    Starting,

    /// Ready to serve requests
    Running,

    /// Stop requested, waiting for exit
    Stopping,

    /// Exited after a stop request
    Stopped,

    /// Exited without being asked to
    Crashed,
}

impl ProcessState {
    /// Whether the process is gone
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }

    /// Whether moving from `self` to `to` is a legal transition
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        use ProcessState::*;
        match (self, to) {
            (Starting, Running) | (Starting, Stopping) | (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            (from, Crashed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Requests sent to the task that owns the child handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Ask the worker to exit (SIGTERM)
    Terminate,
    /// Kill the worker unconditionally (SIGKILL)
    Kill,
}

/// Read-only snapshot of a worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: ProcessId,
    pub pid: Option<u32>,
    pub port: u16,
    pub endpoint: String,
    pub working_directory: PathBuf,
    pub model: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub state: ProcessState,
    pub exit: Option<ExitInfo>,
    pub spawned_at: DateTime<Utc>,
    pub uptime_ms: u64,
    pub output_lines: usize,
}

/// One supervised OS process.
///
/// Owned by exactly one [`Supervisor`](super::Supervisor); the child handle
/// itself lives in the supervisor's monitor task and is reached via
/// [`Control`] messages.
pub struct WorkerProcess {
    pub(crate) id: ProcessId,
    pub(crate) pid: Option<u32>,
    pub(crate) port: u16,
    pub(crate) endpoint: String,
    pub(crate) working_directory: PathBuf,
    pub(crate) environment: HashMap<String, String>,
    pub(crate) model: String,
    pub(crate) provider: String,
    pub(crate) capabilities: Vec<String>,
    pub(crate) spawned_at: DateTime<Utc>,
    pub(crate) started: Instant,
    pub(crate) output: OutputBuffer,
    pub(crate) stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pub(crate) control_tx: mpsc::UnboundedSender<Control>,
    pub(crate) cancel: CancellationToken,
    state_tx: watch::Sender<ProcessState>,
    stop_requested: Mutex<bool>,
    cancel_reason: Mutex<Option<String>>,
    exit: Mutex<Option<ExitInfo>>,
}

impl WorkerProcess {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ProcessId,
        pid: Option<u32>,
        port: u16,
        endpoint: String,
        working_directory: PathBuf,
        environment: HashMap<String, String>,
        model: String,
        provider: String,
        capabilities: Vec<String>,
        output_capacity: usize,
        stdin: Option<ChildStdin>,
        control_tx: mpsc::UnboundedSender<Control>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ProcessState::Starting);
        Self {
            id,
            pid,
            port,
            endpoint,
            working_directory,
            environment,
            model,
            provider,
            capabilities,
            spawned_at: Utc::now(),
            started: Instant::now(),
            output: OutputBuffer::new(output_capacity),
            stdin: tokio::sync::Mutex::new(stdin),
            control_tx,
            cancel: CancellationToken::new(),
            state_tx,
            stop_requested: Mutex::new(false),
            cancel_reason: Mutex::new(None),
            exit: Mutex::new(None),
        }
    }

    /// Process identifier
    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    /// Allocated port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// RPC endpoint of the worker
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        *self.state_tx.borrow()
    }

    /// Environment the worker was started with
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    /// Apply a legal state transition; illegal ones are ignored
    pub(crate) fn transition(&self, to: ProcessState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(to) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Mark a stop as requested and move to `stopping`
    pub(crate) fn begin_stop(&self, reason: &str) {
        *self.stop_requested.lock() = true;
        self.cancel_calls(reason);
        self.transition(ProcessState::Stopping);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        *self.stop_requested.lock()
    }

    /// Interrupt every in-flight call bound to this process
    pub(crate) fn cancel_calls(&self, reason: &str) {
        {
            let mut slot = self.cancel_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        self.cancel.cancel();
    }

    pub(crate) fn cancel_reason(&self) -> String {
        self.cancel_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "process gone".to_string())
    }

    /// Terminal state an exit right now would lead to
    pub(crate) fn exit_state(&self) -> ProcessState {
        if self.stop_requested() {
            ProcessState::Stopped
        } else {
            ProcessState::Crashed
        }
    }

    /// Store the exit status and move to the terminal `state`
    pub(crate) fn record_exit(&self, exit: ExitInfo, state: ProcessState) {
        *self.exit.lock() = Some(exit);
        if state == ProcessState::Stopped {
            self.transition(ProcessState::Stopping);
            self.transition(ProcessState::Stopped);
        } else {
            self.transition(ProcessState::Crashed);
        }
    }

    /// Send a control request to the owning task
    pub(crate) fn signal(&self, control: Control) {
        let _ = self.control_tx.send(control);
    }

    /// Wait until the process reaches a terminal state or `limit` elapses.
    /// Returns `true` if it exited in time.
    pub(crate) async fn wait_exit(&self, limit: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(limit, rx.wait_for(|s| s.is_terminal()))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Snapshot for read-only views
    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            pid: self.pid,
            port: self.port,
            endpoint: self.endpoint.clone(),
            working_directory: self.working_directory.clone(),
            model: self.model.clone(),
            provider: self.provider.clone(),
            capabilities: self.capabilities.clone(),
            state: self.state(),
            exit: *self.exit.lock(),
            spawned_at: self.spawned_at,
            uptime_ms: self.started.elapsed().as_millis() as u64,
            output_lines: self.output.len(),
        }
    }
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("port", &self.port)
            .field("state", &self.state())
            .finish()
    }
}
