//! Runtime abstraction
//!
//! A runtime pairs a [`Supervisor`](crate::process::Supervisor) with the
//! way its workers are reached. Callers go through [`RuntimeRegistry`] and
//! never pick a supervisor directly:
//!
//! ```rust,no_run
//! # use ganglion::runtime::RuntimeRegistry;
//! # use ganglion::process::SpawnConfig;
//! # async fn example(runtimes: &RuntimeRegistry) -> ganglion::Result<()> {
//! let runtime = runtimes.get("pi")?;
//! let worker = runtime.spawn(SpawnConfig::default().with_model("claude-sonnet-4")).await?;
//! runtime.kill(&worker.id, false).await?;
//! # Ok(())
//! # }
//! ```

pub mod registry;
pub mod supervised;

pub use registry::RuntimeRegistry;
pub use supervised::SupervisedRuntime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::process::{ExecCommand, ExecResult, SpawnConfig, WorkerInfo};
use crate::rpc::Client;
use crate::types::ProcessId;

/// Built-in runtime kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Agent workers speaking the RPC protocol
    Pi,
    /// Arbitrary commands driven through stdin
    Command,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pi => "pi",
            Self::Command => "command",
        }
    }

    pub fn all() -> [RuntimeKind; 2] {
        [Self::Pi, Self::Command]
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pi" => Ok(Self::Pi),
            "command" => Ok(Self::Command),
            _ => Err(Error::UnknownRuntime(s.to_string())),
        }
    }
}

/// Uniform spawn/exec/kill/status/list contract over a kind of worker
#[async_trait]
pub trait Runtime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Start a worker and wait until it is ready
    async fn spawn(&self, config: SpawnConfig) -> Result<WorkerInfo>;

    /// Forward a command to a running worker
    async fn exec(&self, id: &ProcessId, command: ExecCommand) -> Result<ExecResult>;

    /// Stop a worker. Unknown or already exited ids are a no-op.
    async fn kill(&self, id: &ProcessId, force: bool) -> Result<()>;

    fn status(&self, id: &ProcessId) -> Option<WorkerInfo>;

    fn list(&self) -> Vec<WorkerInfo>;

    /// RPC client for a worker, if this runtime speaks RPC
    async fn client(&self, id: &ProcessId) -> Result<Client>;

    /// Stop every worker of this runtime
    async fn dispose(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_kind_parsing() {
        assert_eq!("pi".parse::<RuntimeKind>().unwrap(), RuntimeKind::Pi);
        assert_eq!(" Command ".parse::<RuntimeKind>().unwrap(), RuntimeKind::Command);
        assert!(matches!(
            "docker".parse::<RuntimeKind>(),
            Err(Error::UnknownRuntime(id)) if id == "docker"
        ));
    }

    #[test]
    fn test_runtime_kind_display_round_trips() {
        for kind in RuntimeKind::all() {
            assert_eq!(kind.to_string().parse::<RuntimeKind>().unwrap(), kind);
        }
    }
}
