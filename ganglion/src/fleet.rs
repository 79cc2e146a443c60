//! Wiring of the fleet components from one configuration

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::FleetConfig;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::process::Supervisor;
use crate::registry::{DiscoveryReport, InstanceRegistry};
use crate::runtime::{Runtime, RuntimeKind, RuntimeRegistry, SupervisedRuntime};

/// Runtimes and the instance registry sharing one event bus.
///
/// Selection auto-spawns through the `pi` runtime's supervisor, and the
/// registry follows that supervisor's process events.
pub struct Fleet {
    config: FleetConfig,
    events: EventBus,
    runtimes: RuntimeRegistry,
    registry: InstanceRegistry,
    supervisors: Vec<Supervisor>,
}

impl Fleet {
    /// Validate `config` and build every component. Must run inside a tokio runtime.
    pub fn new(config: FleetConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new();

        let built = SupervisedRuntime::all_from_config(&config, events.clone());
        let supervisors: Vec<Supervisor> = built.iter().map(|r| r.supervisor().clone()).collect();
        let pi = built
            .iter()
            .find(|r| r.kind() == RuntimeKind::Pi)
            .ok_or_else(|| Error::UnknownRuntime(RuntimeKind::Pi.to_string()))?;
        let spawner = Arc::new(pi.supervisor().clone());

        let mut runtimes = RuntimeRegistry::new();
        for runtime in built {
            runtimes.register(Arc::new(runtime));
        }
        if let Some(default) = &config.runtimes.default {
            runtimes.set_default(default.parse()?);
        }

        let registry = InstanceRegistry::from_config(&config, events.clone())?;
        registry.set_spawner(spawner);
        registry.start_event_listener();

        info!("Fleet ready with runtimes {:?}", runtimes.kinds());
        Ok(Self {
            config,
            events,
            runtimes,
            registry,
            supervisors,
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn runtimes(&self) -> &RuntimeRegistry {
        &self.runtimes
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Discover configured instances and start health monitoring
    pub async fn start(&self) -> DiscoveryReport {
        let report = self.registry.discover_instances().await;
        if !report.is_clean() {
            warn!("Discovery finished with errors: {:?}", report.errors);
        }
        self.registry.start_health_monitoring();
        report
    }

    /// Stop every worker once SIGINT or SIGTERM arrives
    pub fn install_signal_handlers(&self) -> Vec<JoinHandle<()>> {
        self.supervisors
            .iter()
            .map(Supervisor::install_signal_handlers)
            .collect()
    }

    /// Stop monitoring, drop every instance and stop every worker
    pub async fn shutdown(&self) {
        self.registry.dispose().await;
        self.runtimes.dispose().await;
        info!("Fleet shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fleet_wiring() {
        let fleet = Fleet::new(FleetConfig::default()).unwrap();
        assert_eq!(
            fleet.runtimes().kinds(),
            vec![RuntimeKind::Pi, RuntimeKind::Command]
        );
        assert!(fleet.registry().is_empty());
        assert!(fleet.start().await.is_clean());

        let handlers = fleet.install_signal_handlers();
        assert_eq!(handlers.len(), 2);
        for handler in handlers {
            handler.abort();
        }
        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn test_fleet_rejects_bad_config() {
        let mut config = FleetConfig::default();
        config.supervisor.max_instances = 0;
        assert!(Fleet::new(config).is_err());
    }
}
