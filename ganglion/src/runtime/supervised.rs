//! Runtimes backed by a process supervisor

use async_trait::async_trait;
use std::sync::Arc;

use super::{Runtime, RuntimeKind};
use crate::config::{FleetConfig, ReadinessMode, SupervisorConfig};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::process::{
    ExecCommand, ExecResult, PortAllocator, SpawnConfig, Supervisor, WorkerInfo,
};
use crate::rpc::Client;
use crate::types::ProcessId;

/// A [`Runtime`] delegating to its own [`Supervisor`]
#[derive(Clone)]
pub struct SupervisedRuntime {
    kind: RuntimeKind,
    supervisor: Supervisor,
}

impl SupervisedRuntime {
    /// RPC agent workers, ready once they answer `ping`
    pub fn pi(supervisor: Supervisor) -> Self {
        Self {
            kind: RuntimeKind::Pi,
            supervisor,
        }
    }

    /// Plain commands, ready once they survive the settle delay
    pub fn command(supervisor: Supervisor) -> Self {
        Self {
            kind: RuntimeKind::Command,
            supervisor,
        }
    }

    /// Build the runtime of `kind` from fleet configuration, drawing ports
    /// from `ports`
    pub fn from_config(
        kind: RuntimeKind,
        config: &FleetConfig,
        events: EventBus,
        ports: Arc<PortAllocator>,
    ) -> Self {
        match kind {
            RuntimeKind::Pi => Self::pi(Supervisor::with_ports(
                config.supervisor.clone(),
                config.client.clone(),
                events,
                ports,
            )),
            RuntimeKind::Command => Self::command(Supervisor::with_ports(
                command_config(&config.supervisor),
                config.client.clone(),
                events,
                ports,
            )),
        }
    }

    /// Every built-in runtime, in [`RuntimeKind::all`] order, sharing one
    /// port allocator
    pub fn all_from_config(config: &FleetConfig, events: EventBus) -> Vec<Self> {
        let ports = Arc::new(PortAllocator::from_config(&config.supervisor));
        RuntimeKind::all()
            .into_iter()
            .map(|kind| Self::from_config(kind, config, events.clone(), ports.clone()))
            .collect()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }
}

/// Supervisor settings for the command runtime
fn command_config(base: &SupervisorConfig) -> SupervisorConfig {
    SupervisorConfig {
        readiness: ReadinessMode::Liveness,
        args: Vec::new(),
        ..base.clone()
    }
}

#[async_trait]
impl Runtime for SupervisedRuntime {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    async fn spawn(&self, config: SpawnConfig) -> Result<WorkerInfo> {
        if self.kind == RuntimeKind::Command && config.program.is_none() {
            return Err(Error::spawn("command runtime needs a program to run"));
        }
        self.supervisor.spawn(config).await
    }

    async fn exec(&self, id: &ProcessId, command: ExecCommand) -> Result<ExecResult> {
        if self.kind == RuntimeKind::Command && matches!(command, ExecCommand::Call { .. }) {
            return Err(Error::Protocol(
                "command runtime only accepts stdin commands".to_string(),
            ));
        }
        self.supervisor.exec(id, command).await
    }

    async fn kill(&self, id: &ProcessId, force: bool) -> Result<()> {
        self.supervisor.kill(id, force).await
    }

    fn status(&self, id: &ProcessId) -> Option<WorkerInfo> {
        self.supervisor.status(id)
    }

    fn list(&self) -> Vec<WorkerInfo> {
        self.supervisor.list()
    }

    async fn client(&self, id: &ProcessId) -> Result<Client> {
        match self.kind {
            RuntimeKind::Pi => self.supervisor.client_for_process(id).await,
            RuntimeKind::Command => Err(Error::Protocol(format!(
                "process {} does not speak RPC",
                id
            ))),
        }
    }

    async fn dispose(&self) {
        self.supervisor.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use std::time::Duration;

    fn command_runtime() -> SupervisedRuntime {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = FleetConfig::default();
        config.supervisor.port_range = PortRange::new(port, port);
        config.supervisor.liveness_settle = Duration::from_millis(50);
        config.supervisor.grace_period = Duration::from_secs(2);
        let ports = Arc::new(PortAllocator::from_config(&config.supervisor));
        SupervisedRuntime::from_config(RuntimeKind::Command, &config, EventBus::new(), ports)
    }

    #[test]
    fn test_command_config_uses_liveness() {
        let config = command_config(&SupervisorConfig::default());
        assert_eq!(config.readiness, ReadinessMode::Liveness);
        assert!(config.args.is_empty());
    }

    #[tokio::test]
    async fn test_command_runtime_requires_program() {
        let runtime = command_runtime();
        let err = runtime.spawn(SpawnConfig::default()).await.unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runtime_stdin_exec() {
        let runtime = command_runtime();
        let info = runtime
            .spawn(SpawnConfig::default().with_command("cat", Vec::new()))
            .await
            .unwrap();

        let result = runtime
            .exec(&info.id, ExecCommand::stdin("hello"))
            .await
            .unwrap();
        assert_eq!(result.output["written"], 6);

        let refused = runtime
            .exec(&info.id, ExecCommand::call("ping", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(refused, Error::Protocol(_)));

        // cat echoes the line back on stdout
        let mut echoed = false;
        for _ in 0..50 {
            let lines = runtime.supervisor().output(&info.id, 10).unwrap();
            if lines.iter().any(|l| l.line == "hello") {
                echoed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(echoed);

        runtime.kill(&info.id, false).await.unwrap();
        assert!(runtime.list().is_empty());
    }
}
