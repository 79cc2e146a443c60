//! Instance catalog, health probing and circuit breaking
//!
//! The [`InstanceRegistry`] is the routing layer between callers and worker
//! endpoints. Instances enter it from three places: configuration, a
//! gateway query, and supervisor events for auto-spawned workers.

pub mod circuit;
pub mod discovery;
pub mod health;
pub mod instance;
pub mod instance_registry;

pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitState, Transition};
pub use discovery::{DiscoveryReport, DiscoverySource, GatewaySource, StaticSource};
pub use health::{HealthMonitor, Prober, RpcProber, next_health};
pub use instance::{
    HealthStatus, Instance, InstanceOrigin, InstanceSpawner, InstanceSpec, SelectionCriteria,
    SpawnRequest,
};
pub use instance_registry::InstanceRegistry;
