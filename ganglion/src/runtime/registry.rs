//! Runtime lookup table

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Runtime, RuntimeKind, SupervisedRuntime};
use crate::config::FleetConfig;
use crate::error::{Error, Result};
use crate::events::EventBus;

/// Maps runtime identifiers to their implementations
pub struct RuntimeRegistry {
    runtimes: HashMap<RuntimeKind, Arc<dyn Runtime>>,
    default: Option<RuntimeKind>,
}

impl RuntimeRegistry {
    /// Empty registry without a configured default
    pub fn new() -> Self {
        Self {
            runtimes: HashMap::new(),
            default: None,
        }
    }

    /// Registry with both built-in runtimes, sharing `events`
    pub fn from_config(config: &FleetConfig, events: EventBus) -> Result<Self> {
        let mut registry = Self::new();
        for runtime in SupervisedRuntime::all_from_config(config, events) {
            registry.register(Arc::new(runtime));
        }
        if let Some(default) = &config.runtimes.default {
            registry.set_default(default.parse()?);
        }
        Ok(registry)
    }

    /// Add or replace the runtime for its kind
    pub fn register(&mut self, runtime: Arc<dyn Runtime>) -> Option<Arc<dyn Runtime>> {
        let kind = runtime.kind();
        debug!("Registering runtime {}", kind);
        self.runtimes.insert(kind, runtime)
    }

    pub fn set_default(&mut self, kind: RuntimeKind) {
        self.default = Some(kind);
    }

    /// Look up a runtime by identifier
    pub fn get(&self, id: &str) -> Result<Arc<dyn Runtime>> {
        let kind: RuntimeKind = id.parse()?;
        self.get_kind(kind)
    }

    pub fn get_kind(&self, kind: RuntimeKind) -> Result<Arc<dyn Runtime>> {
        self.runtimes
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::UnknownRuntime(kind.to_string()))
    }

    /// The configured default runtime, else `pi`
    pub fn default_runtime(&self) -> Result<Arc<dyn Runtime>> {
        self.get_kind(self.default.unwrap_or(RuntimeKind::Pi))
    }

    /// Registered kinds in a stable order
    pub fn kinds(&self) -> Vec<RuntimeKind> {
        RuntimeKind::all()
            .into_iter()
            .filter(|k| self.runtimes.contains_key(k))
            .collect()
    }

    /// Dispose every registered runtime
    pub async fn dispose(&self) {
        join_all(self.runtimes.values().map(|r| r.dispose())).await;
        info!("Disposed {} runtimes", self.runtimes.len());
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_by_identifier() {
        let registry = RuntimeRegistry::from_config(&FleetConfig::default(), EventBus::new()).unwrap();

        assert_eq!(registry.get("pi").unwrap().kind(), RuntimeKind::Pi);
        assert_eq!(registry.get("COMMAND").unwrap().kind(), RuntimeKind::Command);
        assert!(matches!(registry.get("lambda"), Err(Error::UnknownRuntime(_))));
        assert_eq!(registry.kinds(), vec![RuntimeKind::Pi, RuntimeKind::Command]);
    }

    #[tokio::test]
    async fn test_default_runtime() {
        let registry = RuntimeRegistry::from_config(&FleetConfig::default(), EventBus::new()).unwrap();
        assert_eq!(registry.default_runtime().unwrap().kind(), RuntimeKind::Pi);

        let mut config = FleetConfig::default();
        config.runtimes.default = Some("command".into());
        let registry = RuntimeRegistry::from_config(&config, EventBus::new()).unwrap();
        assert_eq!(registry.default_runtime().unwrap().kind(), RuntimeKind::Command);

        config.runtimes.default = Some("nope".into());
        assert!(RuntimeRegistry::from_config(&config, EventBus::new()).is_err());
    }

    #[test]
    fn test_registered_but_missing_kind() {
        let registry = RuntimeRegistry::new();
        assert!(matches!(registry.get("pi"), Err(Error::UnknownRuntime(_))));
        assert!(registry.default_runtime().is_err());
    }
}
