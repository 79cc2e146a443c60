//! Instance catalog entries and selection criteria

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::circuit::CircuitState;
use crate::error::Result;
use crate::types::{InstanceId, ProcessId};

/// Where an instance came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceOrigin {
    /// Listed in configuration
    Static,
    /// Reported by the gateway
    Discovered,
    /// Started by the supervisor
    AutoSpawned,
}

/// Health as seen by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Not probed yet
    #[default]
    Unknown,
    Healthy,
    /// Some recent probes failed
    Degraded,
    Unreachable,
}

impl HealthStatus {
    /// Whether selection may route to an instance in this status.
    /// Unprobed instances are routable; the breaker guards them.
    pub fn is_routable(self) -> bool {
        !matches!(self, Self::Unreachable)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// Snapshot of one registered worker endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub endpoint: String,
    pub origin: InstanceOrigin,
    pub model: Option<String>,
    pub capabilities: Vec<String>,
    /// Backing process for supervisor-started instances
    pub process_id: Option<ProcessId>,
    pub health: HealthStatus,
    pub consecutive_failures: u32,
    pub circuit: CircuitState,
    pub session_count: usize,
    pub last_health_check: Option<DateTime<Utc>>,
    /// Registration order, used to break selection ties
    pub registration_seq: u64,
    pub registered_at: DateTime<Utc>,
}

impl Instance {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// What is needed to register an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Defaults to the endpoint when absent
    pub id: Option<InstanceId>,
    pub endpoint: String,
    pub origin: InstanceOrigin,
    pub model: Option<String>,
    pub capabilities: Vec<String>,
    pub process_id: Option<ProcessId>,
}

impl InstanceSpec {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            id: None,
            endpoint: endpoint.into(),
            origin: InstanceOrigin::Static,
            model: None,
            capabilities: Vec::new(),
            process_id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<InstanceId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_origin(mut self, origin: InstanceOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_process(mut self, process_id: ProcessId) -> Self {
        self.process_id = Some(process_id);
        self
    }

    /// Identifier the instance will be registered under
    pub fn instance_id(&self) -> InstanceId {
        self.id
            .clone()
            .unwrap_or_else(|| InstanceId::new(self.endpoint.clone()))
    }
}

/// Filter applied by `select_instance`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionCriteria {
    pub model: Option<String>,
    /// Every listed capability must be present
    pub capabilities: Vec<String>,
    pub origin: Option<InstanceOrigin>,
    pub exclude: Vec<InstanceId>,
}

impl SelectionCriteria {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn excluding(mut self, id: InstanceId) -> Self {
        self.exclude.push(id);
        self
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        if self.exclude.contains(&instance.id) {
            return false;
        }
        if let Some(origin) = self.origin {
            if instance.origin != origin {
                return false;
            }
        }
        if let Some(model) = &self.model {
            if instance.model.as_ref() != Some(model) {
                return false;
            }
        }
        self.capabilities.iter().all(|c| instance.has_capability(c))
    }
}

/// Request passed to an [`InstanceSpawner`] when selection comes up empty
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub model: Option<String>,
    pub provider: Option<String>,
    pub capabilities: Vec<String>,
}

/// Something that can bring a new instance into existence
#[async_trait]
pub trait InstanceSpawner: Send + Sync {
    async fn spawn_instance(&self, request: SpawnRequest) -> Result<InstanceSpec>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(model: Option<&str>, capabilities: &[&str]) -> Instance {
        Instance {
            id: InstanceId::new("i-1"),
            endpoint: "tcp://127.0.0.1:9100".into(),
            origin: InstanceOrigin::Static,
            model: model.map(String::from),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            process_id: None,
            health: HealthStatus::Unknown,
            consecutive_failures: 0,
            circuit: CircuitState::Closed,
            session_count: 0,
            last_health_check: None,
            registration_seq: 1,
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn test_criteria_matching() {
        let inst = instance(Some("sonnet"), &["code", "web"]);

        assert!(SelectionCriteria::any().matches(&inst));
        assert!(SelectionCriteria::any().with_model("sonnet").matches(&inst));
        assert!(!SelectionCriteria::any().with_model("opus").matches(&inst));
        assert!(
            SelectionCriteria::any()
                .with_capability("code")
                .with_capability("web")
                .matches(&inst)
        );
        assert!(!SelectionCriteria::any().with_capability("shell").matches(&inst));
        assert!(
            !SelectionCriteria::any()
                .excluding(InstanceId::new("i-1"))
                .matches(&inst)
        );
    }

    #[test]
    fn test_routable_statuses() {
        assert!(HealthStatus::Unknown.is_routable());
        assert!(HealthStatus::Healthy.is_routable());
        assert!(HealthStatus::Degraded.is_routable());
        assert!(!HealthStatus::Unreachable.is_routable());
    }

    #[test]
    fn test_spec_defaults_id_to_endpoint() {
        let spec = InstanceSpec::new("tcp://10.0.0.5:9100");
        assert_eq!(spec.instance_id().as_str(), "tcp://10.0.0.5:9100");
        let spec = spec.with_id("worker-a");
        assert_eq!(spec.instance_id().as_str(), "worker-a");
    }
}
