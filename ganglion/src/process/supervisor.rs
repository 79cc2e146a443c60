//! Process supervisor
//!
//! Spawns worker processes on allocated ports and owns them until they are
//! gone. Each child is held by a monitor task that waits for exit and applies
//! stop signals; everything else talks to the process through its
//! [`WorkerProcess`] handle.
//!
//! # Lifecycle
//!
//! ```text
//! spawn ──► starting ──ready──► running ──kill──► stopping ──exit──► stopped
//!              │                   │                  │
//!              └──── unexpected exit ─────────────────┴──────────► crashed
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use super::output::{OutputLine, OutputStream};
use super::port::PortAllocator;
use super::worker::{Control, ExitInfo, ProcessState, WorkerInfo, WorkerProcess};
use crate::config::{ClientConfig, ReadinessMode, SupervisorConfig};
use crate::error::{Error, Result};
use crate::events::{EventBus, FleetEvent};
use crate::registry::{InstanceOrigin, InstanceSpawner, InstanceSpec, SpawnRequest};
use crate::rpc::{self, Client, RetryPolicy, protocol};
use crate::types::{InstanceId, ProcessId, SessionId};

/// Exited processes remembered for `status` and `list_by_status`
const HISTORY_LIMIT: usize = 64;

/// Output lines kept with an exited process
const EXIT_OUTPUT_TAIL: usize = 100;

/// How long to wait for the OS to reap a killed child
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest captured output line
const MAX_OUTPUT_LINE: usize = 64 * 1024;

/// Lag-tolerant stream of captured output
pub type OutputLineStream = Pin<Box<dyn Stream<Item = OutputLine> + Send + 'static>>;

/// Parameters of a single spawn. Unset fields fall back to [`SupervisorConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Process id; generated when absent
    pub id: Option<ProcessId>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub working_directory: Option<PathBuf>,
    /// Extra environment, merged over the configured one
    pub environment: HashMap<String, String>,
    /// Capability tags advertised for the instance
    pub capabilities: Vec<String>,
    /// Executable overriding the configured binary
    pub program: Option<PathBuf>,
    /// Argument template overriding the configured one
    pub args: Option<Vec<String>>,
}

impl SpawnConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Run `program` with a literal argument template
    pub fn with_command(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.program = Some(program.into());
        self.args = Some(args);
        self
    }
}

/// Command forwarded to a running worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecCommand {
    /// RPC request on the worker's endpoint
    Call {
        method: String,
        #[serde(default)]
        session_id: Option<SessionId>,
        #[serde(default)]
        params: Value,
    },
    /// One line written to the worker's stdin
    Stdin { line: String },
}

impl ExecCommand {
    pub fn call(method: impl Into<String>, params: Value) -> Self {
        Self::Call {
            method: method.into(),
            session_id: None,
            params,
        }
    }

    pub fn stdin(line: impl Into<String>) -> Self {
        Self::Stdin { line: line.into() }
    }
}

/// Outcome of [`Supervisor::exec`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub process_id: ProcessId,
    pub output: Value,
    pub elapsed_ms: u64,
}

/// Counters and gauges of a supervisor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorStats {
    pub total_spawned: u64,
    pub total_crashed: u64,
    pub active: usize,
    pub starting: usize,
    pub running: usize,
    pub stopping: usize,
    pub max_instances: usize,
    pub ports_in_use: Vec<u16>,
}

#[derive(Debug, Clone)]
struct ExitedProcess {
    info: WorkerInfo,
    output: Vec<OutputLine>,
}

struct SupervisorInner {
    config: SupervisorConfig,
    client_config: ClientConfig,
    ports: Arc<PortAllocator>,
    events: EventBus,
    processes: DashMap<ProcessId, Arc<WorkerProcess>>,
    history: Mutex<VecDeque<ExitedProcess>>,
    clients: DashMap<ProcessId, Client>,
    output_tx: broadcast::Sender<OutputLine>,
    slots: AtomicUsize,
    total_spawned: AtomicU64,
    total_crashed: AtomicU64,
    disposed: AtomicBool,
}

/// Spawns and owns worker processes. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Create a supervisor publishing lifecycle events on `events`
    pub fn new(config: SupervisorConfig, client_config: ClientConfig, events: EventBus) -> Self {
        let ports = Arc::new(PortAllocator::from_config(&config));
        Self::with_ports(config, client_config, events, ports)
    }

    /// Create a supervisor drawing ports from an allocator shared with
    /// other supervisors, so their workers never receive the same port
    pub fn with_ports(
        config: SupervisorConfig,
        client_config: ClientConfig,
        events: EventBus,
        ports: Arc<PortAllocator>,
    ) -> Self {
        let (output_tx, _) = broadcast::channel(config.output_buffer_lines.max(16));
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                client_config,
                ports,
                events,
                processes: DashMap::new(),
                history: Mutex::new(VecDeque::new()),
                clients: DashMap::new(),
                output_tx,
                slots: AtomicUsize::new(0),
                total_spawned: AtomicU64::new(0),
                total_crashed: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Start a worker and wait until it is ready.
    ///
    /// The instance cap is checked before a port is allocated. A worker that
    /// exits or misses the startup deadline is torn down and reported as
    /// [`Error::Spawn`].
    pub async fn spawn(&self, config: SpawnConfig) -> Result<WorkerInfo> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(Error::spawn("supervisor has been disposed"));
        }
        self.inner.reserve_slot()?;

        let port = match self.inner.ports.allocate() {
            Ok(port) => port,
            Err(e) => {
                self.inner.release_slot();
                return Err(e);
            }
        };

        let process = match self.launch(config, port) {
            Ok(process) => process,
            Err(e) => {
                self.inner.ports.release(port);
                self.inner.release_slot();
                return Err(e);
            }
        };

        // dispose() may have snapshotted the process table before the insert
        if self.inner.disposed.load(Ordering::SeqCst) {
            self.kill(&process.id, true).await?;
            return Err(Error::spawn("supervisor was disposed during spawn"));
        }

        let startup = self.inner.config.startup_timeout;
        let readiness = tokio::time::timeout(startup, self.wait_ready(&process)).await;
        let failure = match readiness {
            Ok(Ok(())) => {
                if process.transition(ProcessState::Running) {
                    info!(
                        "Worker {} ready on {} (model {})",
                        process.id, process.endpoint, process.model
                    );
                    self.inner.events.publish(FleetEvent::ProcessReady {
                        process_id: process.id.clone(),
                        endpoint: process.endpoint.clone(),
                        model: Some(process.model.clone()),
                        capabilities: process.capabilities.clone(),
                        rpc: self.inner.config.readiness == ReadinessMode::Rpc,
                    });
                    return Ok(process.info());
                }
                Error::spawn(format!(
                    "worker {} was stopped during startup",
                    process.id
                ))
            }
            Ok(Err(e)) => e,
            Err(_) => Error::spawn(format!(
                "worker {} not ready within {:?}",
                process.id, startup
            )),
        };

        warn!("Worker {} failed to start: {}", process.id, failure);
        self.kill(&process.id, true).await?;
        Err(failure)
    }

    fn launch(&self, config: SpawnConfig, port: u16) -> Result<Arc<WorkerProcess>> {
        let settings = &self.inner.config;
        let id = config.id.unwrap_or_else(ProcessId::generate);
        if self.inner.processes.contains_key(&id) {
            return Err(Error::spawn(format!("process id {} already in use", id)));
        }

        let model = config.model.unwrap_or_else(|| settings.default_model.clone());
        let provider = config
            .provider
            .unwrap_or_else(|| settings.default_provider.clone());
        let cwd = config
            .working_directory
            .or_else(|| settings.working_directory.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        let program = config.program.unwrap_or_else(|| settings.binary.clone());
        let template = config.args.unwrap_or_else(|| settings.args.clone());
        let args = render_args(&template, port, &model, &provider, &cwd);

        let mut environment = settings.environment.clone();
        environment.extend(config.environment);
        environment.insert("GANGLION_PROCESS_ID".to_string(), id.to_string());
        environment.insert("GANGLION_PORT".to_string(), port.to_string());

        debug!("Launching {} {:?} in {}", program.display(), args, cwd.display());

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&cwd)
            .envs(&environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| Error::Spawn {
            reason: format!("failed to start {}: {}", program.display(), e),
            source: Some(e),
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let process = Arc::new(WorkerProcess::new(
            id.clone(),
            pid,
            port,
            protocol::endpoint_for(&settings.host, port),
            cwd,
            environment,
            model,
            provider,
            config.capabilities,
            settings.output_buffer_lines,
            stdin,
            control_tx,
        ));

        self.inner.processes.insert(id.clone(), process.clone());
        self.inner.total_spawned.fetch_add(1, Ordering::Relaxed);
        info!("Spawned worker {} (pid {:?}) on port {}", id, pid, port);
        self.inner.events.publish(FleetEvent::ProcessStarted {
            process_id: id,
            pid,
            port,
        });

        if let Some(stdout) = stdout {
            tokio::spawn(capture_output(
                process.clone(),
                OutputStream::Stdout,
                stdout,
                self.inner.output_tx.clone(),
            ));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(capture_output(
                process.clone(),
                OutputStream::Stderr,
                stderr,
                self.inner.output_tx.clone(),
            ));
        }
        tokio::spawn(monitor(
            Arc::downgrade(&self.inner),
            process.clone(),
            child,
            control_rx,
        ));

        Ok(process)
    }

    async fn wait_ready(&self, process: &WorkerProcess) -> Result<()> {
        let exited = || {
            Error::spawn(format!(
                "worker {} exited during startup",
                process.id
            ))
        };

        match self.inner.config.readiness {
            ReadinessMode::Liveness => {
                if process.wait_exit(self.inner.config.liveness_settle).await {
                    return Err(exited());
                }
                Ok(())
            }
            ReadinessMode::Rpc => {
                let backoff = RetryPolicy {
                    max_attempts: u32::MAX,
                    initial_backoff: Duration::from_millis(50),
                    max_backoff: Duration::from_millis(500),
                    multiplier: 2.0,
                };
                let probe_timeout = self.inner.client_config.request_timeout.min(Duration::from_secs(2));
                let mut attempt = 0u32;
                loop {
                    if process.state().is_terminal() {
                        return Err(exited());
                    }
                    match rpc::ping(&process.endpoint, probe_timeout).await {
                        Ok(latency) => {
                            debug!("Worker {} answered ping in {:?}", process.id, latency);
                            return Ok(());
                        }
                        Err(e) => debug!("Worker {} not ready yet: {}", process.id, e),
                    }
                    attempt = attempt.saturating_add(1);
                    if process.wait_exit(backoff.calculate_delay(attempt)).await {
                        return Err(exited());
                    }
                }
            }
        }
    }

    /// Forward a command to a running worker.
    ///
    /// Fails with [`Error::Cancelled`] if the process is killed or crashes
    /// while the command is in flight.
    pub async fn exec(&self, id: &ProcessId, command: ExecCommand) -> Result<ExecResult> {
        let process = match self.process(id) {
            Ok(process) => process,
            Err(e) => {
                return Err(match self.status(id) {
                    Some(exited) => Error::NotRunning {
                        id: id.to_string(),
                        state: exited.state.to_string(),
                    },
                    None => e,
                });
            }
        };
        let state = process.state();
        if state != ProcessState::Running {
            return Err(Error::NotRunning {
                id: id.to_string(),
                state: state.to_string(),
            });
        }

        let started = Instant::now();
        let work = async {
            match command {
                ExecCommand::Call {
                    method,
                    session_id,
                    params,
                } => {
                    let client = self.client_for(&process).await?;
                    client.request(&method, session_id.as_ref(), params).await
                }
                ExecCommand::Stdin { line } => {
                    let mut stdin = process.stdin.lock().await;
                    let pipe = stdin.as_mut().ok_or_else(|| {
                        Error::Io(std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            "worker stdin is closed",
                        ))
                    })?;
                    pipe.write_all(line.as_bytes()).await?;
                    pipe.write_all(b"\n").await?;
                    pipe.flush().await?;
                    Ok(json!({ "written": line.len() + 1 }))
                }
            }
        };

        let output = tokio::select! {
            biased;
            _ = process.cancel.cancelled() => Err(Error::Cancelled(process.cancel_reason())),
            result = work => result,
        }?;

        Ok(ExecResult {
            process_id: id.clone(),
            output,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// RPC client connected to a managed worker. Its calls fail with
    /// [`Error::Cancelled`] once the worker is killed.
    pub async fn client_for_process(&self, id: &ProcessId) -> Result<Client> {
        let process = self.process(id)?;
        self.client_for(&process).await
    }

    async fn client_for(&self, process: &WorkerProcess) -> Result<Client> {
        if let Some(client) = self.inner.clients.get(&process.id) {
            if client.is_connected() {
                return Ok(client.clone());
            }
        }
        let client = Client::scoped(
            InstanceId::from(&process.id),
            process.endpoint.clone(),
            self.inner.client_config.clone(),
            process.cancel.child_token(),
        );
        client.connect().await?;
        self.inner.clients.insert(process.id.clone(), client.clone());
        Ok(client)
    }

    /// Stop a worker.
    ///
    /// Sends SIGTERM and waits up to the grace period before killing; `force`
    /// kills immediately. Unknown or already exited processes are a no-op.
    pub async fn kill(&self, id: &ProcessId, force: bool) -> Result<()> {
        let Some(process) = self.inner.processes.get(id).map(|e| e.value().clone()) else {
            debug!("Kill requested for unmanaged process {}", id);
            return Ok(());
        };
        if process.state().is_terminal() {
            return Ok(());
        }

        process.begin_stop(if force { "process killed" } else { "process stopping" });

        if !force {
            let grace = self.inner.config.grace_period;
            info!("Stopping worker {} (grace period {:?})", id, grace);
            process.signal(Control::Terminate);
            if process.wait_exit(grace).await {
                return Ok(());
            }
            warn!("Worker {} did not exit gracefully, killing", id);
        }

        process.signal(Control::Kill);
        if !process.wait_exit(KILL_REAP_TIMEOUT).await {
            warn!("Worker {} was not reaped {:?} after kill", id, KILL_REAP_TIMEOUT);
        }
        Ok(())
    }

    /// Snapshot of a managed or recently exited process
    pub fn status(&self, id: &ProcessId) -> Option<WorkerInfo> {
        if let Some(process) = self.inner.processes.get(id) {
            return Some(process.info());
        }
        self.inner
            .history
            .lock()
            .iter()
            .rev()
            .find(|p| &p.info.id == id)
            .map(|p| p.info.clone())
    }

    /// Managed processes, oldest first
    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut list: Vec<WorkerInfo> = self
            .inner
            .processes
            .iter()
            .map(|e| e.value().info())
            .collect();
        list.sort_by_key(|info| info.spawned_at);
        list
    }

    /// Managed and recently exited processes in `state`
    pub fn list_by_status(&self, state: ProcessState) -> Vec<WorkerInfo> {
        if state.is_terminal() {
            return self
                .inner
                .history
                .lock()
                .iter()
                .filter(|p| p.info.state == state)
                .map(|p| p.info.clone())
                .collect();
        }
        self.list()
            .into_iter()
            .filter(|info| info.state == state)
            .collect()
    }

    pub fn stats(&self) -> SupervisorStats {
        let mut stats = SupervisorStats {
            total_spawned: self.inner.total_spawned.load(Ordering::Relaxed),
            total_crashed: self.inner.total_crashed.load(Ordering::Relaxed),
            max_instances: self.inner.config.max_instances,
            ..SupervisorStats::default()
        };
        for entry in self.inner.processes.iter() {
            stats.active += 1;
            stats.ports_in_use.push(entry.value().port);
            match entry.value().state() {
                ProcessState::Starting => stats.starting += 1,
                ProcessState::Running => stats.running += 1,
                ProcessState::Stopping => stats.stopping += 1,
                ProcessState::Stopped | ProcessState::Crashed => {}
            }
        }
        stats.ports_in_use.sort_unstable();
        stats
    }

    /// Most recent `limit` output lines of a process, exited ones included
    pub fn output(&self, id: &ProcessId, limit: usize) -> Result<Vec<OutputLine>> {
        if let Some(process) = self.inner.processes.get(id) {
            return Ok(process.output.tail(limit));
        }
        self.inner
            .history
            .lock()
            .iter()
            .rev()
            .find(|p| &p.info.id == id)
            .map(|p| {
                let start = p.output.len().saturating_sub(limit);
                p.output[start..].to_vec()
            })
            .ok_or_else(|| Error::not_found("process", id))
    }

    /// Live output of every worker. Slow subscribers skip lines.
    pub fn subscribe_output(&self) -> OutputLineStream {
        let rx = self.inner.output_tx.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|item| async move {
            match item {
                Ok(line) => Some(line),
                Err(e) => {
                    debug!("Output subscriber lagging: {}", e);
                    None
                }
            }
        }))
    }

    /// Stop every worker (graceful, then forced) and release their ports.
    /// Later spawns are refused.
    pub async fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        let ids: Vec<ProcessId> = self
            .inner
            .processes
            .iter()
            .map(|e| e.key().clone())
            .collect();
        if !ids.is_empty() {
            info!("Disposing supervisor: stopping {} workers", ids.len());
        }

        let results = join_all(ids.iter().map(|id| self.kill(id, false))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to stop worker {}: {}", id, e);
            }
        }

        let clients: Vec<Client> = self.inner.clients.iter().map(|e| e.value().clone()).collect();
        self.inner.clients.clear();
        join_all(clients.iter().map(|c| c.disconnect())).await;

        // Only ports of workers that were never reaped are still held here
        for entry in self.inner.processes.iter() {
            if self.inner.ports.release(entry.value().port) {
                warn!(
                    "Released port {} of unreaped worker {}",
                    entry.value().port,
                    entry.key()
                );
            }
        }
    }

    /// Dispose on SIGINT/SIGTERM
    pub fn install_signal_handlers(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            super::wait_for_termination().await;
            info!("Termination signal received, stopping workers");
            supervisor.dispose().await;
        })
    }

    fn process(&self, id: &ProcessId) -> Result<Arc<WorkerProcess>> {
        self.inner
            .processes
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found("process", id))
    }
}

impl SupervisorInner {
    fn reserve_slot(&self) -> Result<()> {
        let limit = self.config.max_instances;
        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| Error::MaxInstances { limit })
    }

    fn release_slot(&self) {
        let _ = self
            .slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn on_exit(&self, process: &WorkerProcess, exit: ExitInfo, state: ProcessState) {
        if self.processes.remove(&process.id).is_none() {
            return;
        }
        self.ports.release(process.port);
        self.release_slot();

        if state == ProcessState::Crashed {
            self.total_crashed.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Worker {} crashed (code {:?}, signal {:?})",
                process.id, exit.code, exit.signal
            );
        } else {
            info!("Worker {} stopped (code {:?})", process.id, exit.code);
        }

        if let Some((_, client)) = self.clients.remove(&process.id) {
            tokio::spawn(async move { client.disconnect().await });
        }

        let mut info = process.info();
        info.state = state;
        info.exit = Some(exit);
        {
            let mut history = self.history.lock();
            history.push_back(ExitedProcess {
                info,
                output: process.output.tail(EXIT_OUTPUT_TAIL),
            });
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }

        self.events.publish(FleetEvent::ProcessExited {
            process_id: process.id.clone(),
            code: exit.code,
            signal: exit.signal,
            state,
        });
    }
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        for entry in self.processes.iter() {
            entry.value().signal(Control::Kill);
        }
    }
}

#[async_trait]
impl InstanceSpawner for Supervisor {
    async fn spawn_instance(&self, request: SpawnRequest) -> Result<InstanceSpec> {
        let info = self
            .spawn(SpawnConfig {
                model: request.model,
                provider: request.provider,
                capabilities: request.capabilities,
                ..SpawnConfig::default()
            })
            .await?;

        Ok(InstanceSpec::new(info.endpoint.clone())
            .with_id(InstanceId::from(&info.id))
            .with_origin(InstanceOrigin::AutoSpawned)
            .with_model(info.model.clone())
            .with_capabilities(info.capabilities.clone())
            .with_process(info.id))
    }
}

/// Owns the child: waits for exit and applies stop requests
async fn monitor(
    supervisor: Weak<SupervisorInner>,
    process: Arc<WorkerProcess>,
    mut child: Child,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(control) = control_rx.recv() => match control {
                Control::Terminate => terminate(&mut child, process.pid),
                Control::Kill => {
                    if let Err(e) = child.start_kill() {
                        debug!("Kill of worker {} failed: {}", process.id, e);
                    }
                }
            },
        }
    };

    let exit = match status {
        Ok(status) => exit_info(status),
        Err(e) => {
            warn!("Failed to reap worker {}: {}", process.id, e);
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    };

    let state = process.exit_state();
    process.cancel_calls(if state == ProcessState::Crashed {
        "process crashed"
    } else {
        "process stopped"
    });
    if let Some(supervisor) = supervisor.upgrade() {
        supervisor.on_exit(&process, exit, state);
    }
    process.record_exit(exit, state);
}

#[cfg(unix)]
fn terminate(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match pid {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to {} failed: {}", pid, e);
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

fn exit_info(status: ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
        code: status.code(),
        signal,
    }
}

async fn capture_output<R>(
    process: Arc<WorkerProcess>,
    stream: OutputStream,
    reader: R,
    tx: broadcast::Sender<OutputLine>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_OUTPUT_LINE));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                debug!("[{}] {}", process.id, line);
                let entry = process.output.push(&process.id, stream, line);
                let _ = tx.send(entry);
            }
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                debug!("Worker {} wrote an oversized line", process.id);
            }
            Err(LinesCodecError::Io(e)) => {
                debug!("Output pipe of {} failed: {}", process.id, e);
                break;
            }
        }
    }
}

/// Substitute `{port}`, `{model}`, `{provider}` and `{cwd}` in an argument template
pub fn render_args(
    template: &[String],
    port: u16,
    model: &str,
    provider: &str,
    cwd: &std::path::Path,
) -> Vec<String> {
    let port = port.to_string();
    let cwd = cwd.display().to_string();
    template
        .iter()
        .map(|arg| {
            arg.replace("{port}", &port)
                .replace("{model}", model)
                .replace("{provider}", provider)
                .replace("{cwd}", &cwd)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use std::net::TcpListener;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn sleeper_config(range: PortRange, max_instances: usize) -> SupervisorConfig {
        SupervisorConfig {
            binary: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
            port_range: range,
            max_instances,
            readiness: ReadinessMode::Liveness,
            liveness_settle: Duration::from_millis(50),
            grace_period: Duration::from_secs(2),
            ..SupervisorConfig::default()
        }
    }

    #[test]
    fn test_render_args() {
        let args = render_args(
            &[
                "--port".to_string(),
                "{port}".to_string(),
                "--model={model}".to_string(),
                "{provider}@{cwd}".to_string(),
            ],
            9100,
            "m1",
            "p1",
            std::path::Path::new("/tmp/w"),
        );
        assert_eq!(args, vec!["--port", "9100", "--model=m1", "p1@/tmp/w"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_max_instances_checked_before_ports() {
        let port = free_port();
        let supervisor = Supervisor::new(
            sleeper_config(PortRange::new(port, port), 1),
            ClientConfig::default(),
            EventBus::new(),
        );

        let first = supervisor.spawn(SpawnConfig::default()).await.unwrap();
        let err = supervisor.spawn(SpawnConfig::default()).await.unwrap_err();
        assert!(matches!(err, Error::MaxInstances { limit: 1 }));

        supervisor.kill(&first.id, true).await.unwrap();
        assert!(supervisor.stats().ports_in_use.is_empty());
        supervisor.dispose().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let port = free_port();
        let mut config = sleeper_config(PortRange::new(port, port), 2);
        config.binary = PathBuf::from("/nonexistent/ganglion-worker-binary");
        let supervisor = Supervisor::new(config, ClientConfig::default(), EventBus::new());

        let err = supervisor.spawn(SpawnConfig::default()).await.unwrap_err();
        assert!(matches!(err, Error::Spawn { source: Some(_), .. }));
        assert!(supervisor.stats().ports_in_use.is_empty());
        assert_eq!(supervisor.stats().active, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_on_unknown_process() {
        let supervisor = Supervisor::new(
            SupervisorConfig::default(),
            ClientConfig::default(),
            EventBus::new(),
        );
        let err = supervisor
            .exec(&ProcessId::new("ghost"), ExecCommand::stdin("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        supervisor.kill(&ProcessId::new("ghost"), false).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_on_exited_process_is_not_running() {
        let port = free_port();
        let supervisor = Supervisor::new(
            sleeper_config(PortRange::new(port, port), 1),
            ClientConfig::default(),
            EventBus::new(),
        );
        let info = supervisor.spawn(SpawnConfig::default()).await.unwrap();
        supervisor.kill(&info.id, true).await.unwrap();

        let err = supervisor
            .exec(&info.id, ExecCommand::stdin("hi"))
            .await
            .unwrap_err();
        match err {
            Error::NotRunning { state, .. } => assert_eq!(state, ProcessState::Stopped.to_string()),
            other => panic!("expected NotRunning, got {:?}", other),
        }
        supervisor.dispose().await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_spawn_racing_dispose_leaves_nothing_running() {
        for _ in 0..8 {
            let start = free_port();
            let supervisor = Supervisor::new(
                sleeper_config(PortRange::new(start, start.saturating_add(8)), 4),
                ClientConfig::default(),
                EventBus::new(),
            );

            let spawns: Vec<_> = (0..3)
                .map(|_| {
                    let supervisor = supervisor.clone();
                    tokio::spawn(async move { supervisor.spawn(SpawnConfig::default()).await })
                })
                .collect();
            tokio::task::yield_now().await;
            supervisor.dispose().await;

            for spawn in spawns {
                let _ = spawn.await.unwrap();
            }
            // Every child was stopped either by dispose or by its own spawn
            assert!(supervisor.list().is_empty());
            assert!(supervisor.stats().ports_in_use.is_empty());
        }
    }
}
