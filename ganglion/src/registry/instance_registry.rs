//! Instance registry
//!
//! Catalog of worker endpoints regardless of origin. Each entry carries its
//! own circuit breaker and session count; selection picks the least loaded
//! routable instance and falls back to auto-spawning when nothing matches.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::circuit::{CircuitBreaker, CircuitSnapshot, CircuitState, Transition};
use super::discovery::{DiscoveryReport, DiscoverySource, GatewaySource, StaticSource};
use super::health::{HealthMonitor, Prober, RpcProber, next_health};
use super::instance::{
    HealthStatus, Instance, InstanceOrigin, InstanceSpawner, InstanceSpec, SelectionCriteria,
    SpawnRequest,
};
use crate::config::{CircuitBreakerConfig, ClientConfig, FleetConfig, HealthConfig, RegistryConfig};
use crate::error::{Error, Result};
use crate::events::{EventBus, FleetEvent};
use crate::rpc::Client;
use crate::session::{Session, SessionConfig};
use crate::types::{InstanceId, SessionId};

// ============================================================================
// Entries
// ============================================================================

struct RegistryEntry {
    instance: Mutex<Instance>,
    breaker: CircuitBreaker,
    sessions: AtomicUsize,
}

impl RegistryEntry {
    fn snapshot(&self) -> Instance {
        let mut instance = self.instance.lock().clone();
        instance.circuit = self.breaker.state();
        instance.session_count = self.sessions.load(Ordering::SeqCst);
        instance
    }
}

struct RegistryInner {
    config: RegistryConfig,
    health_config: HealthConfig,
    breaker_config: CircuitBreakerConfig,
    client_config: ClientConfig,
    events: EventBus,
    instances: DashMap<InstanceId, Arc<RegistryEntry>>,
    clients: DashMap<InstanceId, Client>,
    sessions: DashMap<SessionId, InstanceId>,
    sources: RwLock<Vec<Arc<dyn DiscoverySource>>>,
    spawner: RwLock<Option<Arc<dyn InstanceSpawner>>>,
    prober: RwLock<Arc<dyn Prober>>,
    spawn_lock: tokio::sync::Mutex<()>,
    next_seq: AtomicU64,
    monitor: Mutex<Option<HealthMonitor>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

// ============================================================================
// Registry
// ============================================================================

/// Catalog of worker instances with per-instance circuit breakers
#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<RegistryInner>,
}

impl InstanceRegistry {
    pub fn new(
        config: RegistryConfig,
        health_config: HealthConfig,
        breaker_config: CircuitBreakerConfig,
        client_config: ClientConfig,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                health_config,
                breaker_config,
                client_config,
                events,
                instances: DashMap::new(),
                clients: DashMap::new(),
                sessions: DashMap::new(),
                sources: RwLock::new(Vec::new()),
                spawner: RwLock::new(None),
                prober: RwLock::new(Arc::new(RpcProber)),
                spawn_lock: tokio::sync::Mutex::new(()),
                next_seq: AtomicU64::new(1),
                monitor: Mutex::new(None),
                listener: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Build a registry with the static and gateway sources from `config`
    pub fn from_config(config: &FleetConfig, events: EventBus) -> Result<Self> {
        let registry = Self::new(
            config.registry.clone(),
            config.health.clone(),
            config.circuit_breaker.clone(),
            config.client.clone(),
            events,
        );

        if !config.registry.static_instances.is_empty() {
            registry.add_source(Arc::new(StaticSource::new(
                config.registry.static_instances.clone(),
            )));
        }
        if let Some(url) = &config.registry.gateway_url {
            registry.add_source(Arc::new(GatewaySource::new(
                url.clone(),
                config.registry.gateway_timeout,
            )?));
        }

        Ok(registry)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Spawner used when selection finds nothing
    pub fn set_spawner(&self, spawner: Arc<dyn InstanceSpawner>) {
        *self.inner.spawner.write() = Some(spawner);
    }

    /// Replace the health prober
    pub fn set_prober(&self, prober: Arc<dyn Prober>) {
        *self.inner.prober.write() = prober;
    }

    pub fn add_source(&self, source: Arc<dyn DiscoverySource>) {
        self.inner.sources.write().push(source);
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Add an instance, or update it in place if the id is already known
    pub fn register(&self, spec: InstanceSpec) -> Instance {
        let id = spec.instance_id();

        match self.inner.instances.entry(id.clone()) {
            MapEntry::Occupied(occupied) => {
                let entry = occupied.get().clone();
                drop(occupied);

                let endpoint_changed = {
                    let mut instance = entry.instance.lock();
                    let changed = instance.endpoint != spec.endpoint;
                    instance.endpoint = spec.endpoint;
                    instance.origin = spec.origin;
                    if spec.model.is_some() {
                        instance.model = spec.model;
                    }
                    if !spec.capabilities.is_empty() {
                        instance.capabilities = spec.capabilities;
                    }
                    if spec.process_id.is_some() {
                        instance.process_id = spec.process_id;
                    }
                    changed
                };

                if endpoint_changed {
                    if let Some((_, client)) = self.inner.clients.remove(&id) {
                        tokio::spawn(async move { client.disconnect().await });
                    }
                }
                debug!("Instance {} updated", id);
                entry.snapshot()
            }
            MapEntry::Vacant(vacant) => {
                let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
                let instance = Instance {
                    id: id.clone(),
                    endpoint: spec.endpoint,
                    origin: spec.origin,
                    model: spec.model,
                    capabilities: spec.capabilities,
                    process_id: spec.process_id,
                    health: HealthStatus::Unknown,
                    consecutive_failures: 0,
                    circuit: CircuitState::Closed,
                    session_count: 0,
                    last_health_check: None,
                    registration_seq: seq,
                    registered_at: chrono::Utc::now(),
                };
                let entry = Arc::new(RegistryEntry {
                    instance: Mutex::new(instance),
                    breaker: CircuitBreaker::new(self.inner.breaker_config.clone()),
                    sessions: AtomicUsize::new(0),
                });
                vacant.insert(entry.clone());

                let snapshot = entry.snapshot();
                info!(
                    "Registered instance {} at {} ({:?})",
                    snapshot.id, snapshot.endpoint, snapshot.origin
                );
                self.inner.events.publish(FleetEvent::InstanceRegistered {
                    instance_id: snapshot.id.clone(),
                    endpoint: snapshot.endpoint.clone(),
                    origin: snapshot.origin,
                });
                snapshot
            }
        }
    }

    /// Remove an instance.
    ///
    /// Every session bound to it is closed: outstanding calls fail with
    /// [`Error::Cancelled`] and a `SessionClosed` event is published per
    /// session. Returns `false` if the id was unknown.
    pub async fn unregister(&self, id: &InstanceId) -> bool {
        if self.inner.instances.remove(id).is_none() {
            return false;
        }

        let orphaned: Vec<SessionId> = self
            .inner
            .sessions
            .iter()
            .filter(|e| e.value() == id)
            .map(|e| e.key().clone())
            .collect();
        let client = self.inner.clients.remove(id).map(|(_, c)| c);

        for session_id in &orphaned {
            self.inner.sessions.remove(session_id);
            if let Some(client) = &client {
                client.cancel_session_calls(session_id);
            }
            self.inner.events.publish(FleetEvent::SessionClosed {
                session_id: session_id.clone(),
                instance_id: id.clone(),
                reason: "instance unregistered".to_string(),
            });
        }

        if let Some(client) = client {
            client.disconnect().await;
        }

        info!(
            "Unregistered instance {} ({} sessions closed)",
            id,
            orphaned.len()
        );
        self.inner.events.publish(FleetEvent::InstanceUnregistered {
            instance_id: id.clone(),
        });
        true
    }

    pub fn get_instance(&self, id: &InstanceId) -> Option<Instance> {
        self.inner.instances.get(id).map(|e| e.value().snapshot())
    }

    /// Every instance, in registration order
    pub fn all_instances(&self) -> Vec<Instance> {
        let mut all: Vec<Instance> = self
            .inner
            .instances
            .iter()
            .map(|e| e.value().snapshot())
            .collect();
        all.sort_by_key(|i| i.registration_seq);
        all
    }

    /// Instances whose last probe succeeded or only partly failed
    pub fn healthy_instances(&self) -> Vec<Instance> {
        self.all_instances()
            .into_iter()
            .filter(|i| matches!(i.health, HealthStatus::Healthy | HealthStatus::Degraded))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.instances.is_empty()
    }

    pub fn circuit(&self, id: &InstanceId) -> Option<CircuitSnapshot> {
        self.inner.instances.get(id).map(|e| e.value().breaker.snapshot())
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Pick the least loaded routable instance matching `criteria`.
    ///
    /// Ties go to the earliest registration. Instances behind an open
    /// circuit are skipped without any network traffic. When nothing
    /// matches and auto-spawn is enabled, exactly one instance is spawned,
    /// registered and returned.
    pub async fn select_instance(&self, criteria: &SelectionCriteria) -> Result<Instance> {
        if let Some(instance) = self.pick(criteria) {
            return Ok(instance);
        }

        let spawner = self.inner.spawner.read().clone();
        let spawner = match spawner {
            Some(spawner) if self.inner.config.auto_spawn.enabled => spawner,
            _ => {
                return Err(Error::NoAvailableInstance(describe(criteria)));
            }
        };

        let _guard = self.inner.spawn_lock.lock().await;
        // another selection may have spawned while we waited
        if let Some(instance) = self.pick(criteria) {
            return Ok(instance);
        }

        let request = SpawnRequest {
            model: criteria
                .model
                .clone()
                .or_else(|| self.inner.config.auto_spawn.model.clone()),
            provider: self.inner.config.auto_spawn.provider.clone(),
            capabilities: criteria.capabilities.clone(),
        };
        info!("No instance matches {}, auto-spawning", describe(criteria));

        let spec = spawner.spawn_instance(request).await.map_err(|e| match e {
            Error::MaxInstances { limit } => Error::NoAvailableInstance(format!(
                "{} and instance limit {} reached",
                describe(criteria),
                limit
            )),
            other => other,
        })?;

        Ok(self.register(spec.with_origin(InstanceOrigin::AutoSpawned)))
    }

    fn pick(&self, criteria: &SelectionCriteria) -> Option<Instance> {
        self.inner
            .instances
            .iter()
            .filter(|e| e.value().breaker.would_allow())
            .map(|e| e.value().snapshot())
            .filter(|i| i.health.is_routable() && criteria.matches(i))
            .min_by_key(|i| (i.session_count, i.registration_seq))
    }

    // ========================================================================
    // Circuit breaker accounting
    // ========================================================================

    pub fn record_success(&self, id: &InstanceId) {
        if let Some(entry) = self.entry(id) {
            let transition = entry.breaker.record_success();
            self.publish_circuit(id, transition);
        }
    }

    pub fn record_failure(&self, id: &InstanceId) {
        if let Some(entry) = self.entry(id) {
            let transition = entry.breaker.record_failure();
            self.publish_circuit(id, transition);
        }
    }

    /// Feed a call outcome to the breaker.
    ///
    /// Transport failures count against the instance; worker-reported
    /// errors prove it is alive. Cancellations are ignored.
    pub fn record_call_result<T>(&self, id: &InstanceId, result: &Result<T>) {
        match result {
            Ok(_) => self.record_success(id),
            Err(e) if e.counts_as_instance_failure() => self.record_failure(id),
            Err(Error::Remote { .. }) | Err(Error::SessionNotFound(_)) => self.record_success(id),
            Err(_) => {}
        }
    }

    /// Run `call` against an instance's client under its circuit breaker.
    ///
    /// An open circuit fails with [`Error::NoAvailableInstance`] before
    /// any connection is attempted.
    pub async fn call_guarded<T, F, Fut>(&self, id: &InstanceId, call: F) -> Result<T>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let entry = self
            .entry(id)
            .ok_or_else(|| Error::not_found("instance", id))?;

        let (allowed, transition) = entry.breaker.try_acquire();
        self.publish_circuit(id, transition);
        if !allowed {
            debug!("Circuit open for {}, refusing call", id);
            return Err(Error::NoAvailableInstance(format!(
                "circuit open for instance {}",
                id
            )));
        }

        let result = match self.client_for(id).await {
            Ok(client) => call(client).await,
            Err(e) => Err(e),
        };
        self.record_call_result(id, &result);
        result
    }

    fn publish_circuit(&self, id: &InstanceId, transition: Option<Transition>) {
        if let Some(t) = transition {
            info!("Circuit for {}: {} -> {}", id, t.from, t.to);
            self.inner.events.publish(FleetEvent::CircuitChanged {
                instance_id: id.clone(),
                from: t.from,
                to: t.to,
            });
        }
    }

    // ========================================================================
    // Clients and sessions
    // ========================================================================

    /// Connected client for an instance, created on first use
    pub async fn client_for(&self, id: &InstanceId) -> Result<Client> {
        let entry = self
            .entry(id)
            .ok_or_else(|| Error::not_found("instance", id))?;
        let endpoint = entry.instance.lock().endpoint.clone();

        let client = self
            .inner
            .clients
            .entry(id.clone())
            .or_insert_with(|| {
                Client::for_instance(id.clone(), endpoint, self.inner.client_config.clone())
            })
            .clone();
        client.connect().await?;
        Ok(client)
    }

    /// Select an instance, open a session on it and bind the two
    pub async fn acquire_session(
        &self,
        criteria: &SelectionCriteria,
        config: SessionConfig,
    ) -> Result<(Client, Session)> {
        let instance = self.select_instance(criteria).await?;
        let (client, session) = self
            .call_guarded(&instance.id, |client| async move {
                let session = client.init_session(config).await?;
                Ok((client, session))
            })
            .await?;
        self.track_session(&session.id, &instance.id)?;
        Ok((client, session))
    }

    /// Close a tracked session on its owning instance. Unknown ids are a no-op.
    pub async fn close_session(&self, session_id: &SessionId) -> Result<()> {
        let owner = match self.release_session(session_id) {
            Some(owner) => owner,
            None => return Ok(()),
        };

        let client = self.inner.clients.get(&owner).map(|c| c.value().clone());
        let result = match client {
            Some(client) => client.close_session(session_id).await,
            None => Ok(()),
        };

        self.inner.events.publish(FleetEvent::SessionClosed {
            session_id: session_id.clone(),
            instance_id: owner,
            reason: "closed".to_string(),
        });
        result
    }

    /// Bind a session to its owning instance.
    ///
    /// Rebinding to the same owner is a no-op; a different owner is refused.
    pub fn track_session(&self, session_id: &SessionId, instance_id: &InstanceId) -> Result<()> {
        let entry = self
            .entry(instance_id)
            .ok_or_else(|| Error::not_found("instance", instance_id))?;

        match self.inner.sessions.entry(session_id.clone()) {
            MapEntry::Occupied(occupied) => {
                if occupied.get() == instance_id {
                    Ok(())
                } else {
                    Err(Error::Protocol(format!(
                        "Session {} already belongs to instance {}",
                        session_id,
                        occupied.get()
                    )))
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(instance_id.clone());
                entry.sessions.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Forget a session binding, returning its former owner
    pub fn release_session(&self, session_id: &SessionId) -> Option<InstanceId> {
        let (_, owner) = self.inner.sessions.remove(session_id)?;
        if let Some(entry) = self.entry(&owner) {
            let _ = entry
                .sessions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
        Some(owner)
    }

    pub fn session_owner(&self, session_id: &SessionId) -> Option<InstanceId> {
        self.inner.sessions.get(session_id).map(|e| e.value().clone())
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Query every source and merge the results into the catalog.
    ///
    /// Instances of other origins are never touched. A source that answers
    /// successfully also prunes its own discovered instances that it no
    /// longer lists.
    pub async fn discover_instances(&self) -> DiscoveryReport {
        let sources = self.inner.sources.read().clone();
        let mut report = DiscoveryReport::default();

        for source in sources {
            let origin = source.origin();
            let specs = match source.discover().await {
                Ok(specs) => specs,
                Err(e) => {
                    warn!("Discovery source {} failed: {}", source.name(), e);
                    report.errors.push(format!("{}: {}", source.name(), e));
                    continue;
                }
            };

            let mut seen = Vec::with_capacity(specs.len());
            for spec in specs {
                let spec = spec.with_origin(origin);
                let id = spec.instance_id();
                let known = self.inner.instances.contains_key(&id);
                self.register(spec);
                if known {
                    report.updated.push(id.clone());
                } else {
                    report.added.push(id.clone());
                }
                seen.push(id);
            }

            if origin == InstanceOrigin::Discovered {
                let stale: Vec<InstanceId> = self
                    .inner
                    .instances
                    .iter()
                    .filter(|e| e.value().instance.lock().origin == origin)
                    .map(|e| e.key().clone())
                    .filter(|id| !seen.contains(id))
                    .collect();
                for id in stale {
                    if self.unregister(&id).await {
                        report.removed.push(id);
                    }
                }
            }
        }

        debug!(
            "Discovery: {} added, {} updated, {} removed, {} errors",
            report.added.len(),
            report.updated.len(),
            report.removed.len(),
            report.errors.len()
        );
        report
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Probe one instance and apply the result
    pub async fn check_health(&self, id: &InstanceId) -> Result<HealthStatus> {
        let entry = self
            .entry(id)
            .ok_or_else(|| Error::not_found("instance", id))?;
        let endpoint = entry.instance.lock().endpoint.clone();
        let prober = self.inner.prober.read().clone();

        let outcome = prober
            .probe(&endpoint, self.inner.health_config.probe_timeout)
            .await;
        let success = outcome.is_ok();

        let (from, to) = {
            let mut instance = entry.instance.lock();
            let from = instance.health;
            let (to, failures) = next_health(
                instance.consecutive_failures,
                success,
                self.inner.health_config.unreachable_after,
            );
            instance.health = to;
            instance.consecutive_failures = failures;
            instance.last_health_check = Some(chrono::Utc::now());
            (from, to)
        };

        let transition = if success {
            entry.breaker.record_success()
        } else {
            entry.breaker.record_failure()
        };
        self.publish_circuit(id, transition);

        if from != to {
            match &outcome {
                Ok(_) => info!("Instance {} health: {} -> {}", id, from, to),
                Err(e) => warn!("Instance {} health: {} -> {} ({})", id, from, to, e),
            }
            self.inner.events.publish(FleetEvent::HealthChanged {
                instance_id: id.clone(),
                from,
                to,
            });
        }
        Ok(to)
    }

    /// Probe every registered instance concurrently
    pub async fn check_all(&self) {
        let ids: Vec<InstanceId> = self.inner.instances.iter().map(|e| e.key().clone()).collect();
        join_all(ids.iter().map(|id| self.check_health(id))).await;
    }

    /// Start periodic probing. Calling again while running is a no-op.
    pub fn start_health_monitoring(&self) {
        let mut slot = self.inner.monitor.lock();
        if slot.as_ref().is_some_and(|m| m.is_running()) {
            return;
        }

        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.health_config.interval;
        *slot = Some(HealthMonitor::start(interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        InstanceRegistry { inner }.check_all().await;
                        true
                    }
                    None => false,
                }
            }
        }));
        info!("Health monitoring started (every {:?})", interval);
    }

    pub fn stop_health_monitoring(&self) {
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.stop();
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Follow supervisor events: ready RPC workers are registered, exited
    /// ones unregistered. Calling again while listening is a no-op.
    pub fn start_event_listener(&self) {
        let mut slot = self.inner.listener.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let mut rx = self.inner.events.subscribe();
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);

        *slot = Some(tokio::spawn(async move {
            loop {
                let envelope = match rx.recv().await {
                    Ok(envelope) => envelope,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Registry event listener lagged by {} events", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else { break };
                let registry = InstanceRegistry { inner };

                match envelope.event {
                    FleetEvent::ProcessReady {
                        process_id,
                        endpoint,
                        model,
                        capabilities,
                        rpc: true,
                    } => {
                        let mut spec = InstanceSpec::new(endpoint)
                            .with_id(InstanceId::from(&process_id))
                            .with_origin(InstanceOrigin::AutoSpawned)
                            .with_capabilities(capabilities)
                            .with_process(process_id);
                        spec.model = model;
                        registry.register(spec);
                    }
                    FleetEvent::ProcessExited { process_id, .. } => {
                        registry.unregister(&InstanceId::from(&process_id)).await;
                    }
                    _ => {}
                }
            }
            debug!("Registry event listener stopped");
        }));
    }

    /// Stop background tasks and unregister every instance
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_health_monitoring();
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }

        let ids: Vec<InstanceId> = self.inner.instances.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.unregister(&id).await;
        }
        info!("Instance registry disposed");
    }

    fn entry(&self, id: &InstanceId) -> Option<Arc<RegistryEntry>> {
        self.inner.instances.get(id).map(|e| e.value().clone())
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.inner.instances.len())
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

fn describe(criteria: &SelectionCriteria) -> String {
    let mut parts = Vec::new();
    if let Some(model) = &criteria.model {
        parts.push(format!("model={}", model));
    }
    if !criteria.capabilities.is_empty() {
        parts.push(format!("capabilities={}", criteria.capabilities.join(",")));
    }
    if let Some(origin) = criteria.origin {
        parts.push(format!("origin={:?}", origin));
    }
    if parts.is_empty() {
        "any instance".to_string()
    } else {
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn registry() -> InstanceRegistry {
        InstanceRegistry::new(
            RegistryConfig::default(),
            HealthConfig::default(),
            CircuitBreakerConfig {
                failure_threshold: 2,
                window: Duration::from_secs(60),
                cooldown: Duration::from_secs(60),
                max_cooldown: Duration::from_secs(120),
            },
            ClientConfig::default(),
            EventBus::new(),
        )
    }

    /// Prober answering from a fixed set of healthy endpoints
    struct FixedProber {
        up: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, endpoint: &str, timeout: Duration) -> Result<Duration> {
            if self.up.lock().contains(endpoint) {
                Ok(Duration::from_millis(1))
            } else {
                Err(Error::timeout("probe", timeout))
            }
        }
    }

    /// Spawner that counts calls and hands out made-up endpoints
    struct CountingSpawner {
        calls: AtomicUsize,
        limit: usize,
    }

    #[async_trait]
    impl InstanceSpawner for CountingSpawner {
        async fn spawn_instance(&self, request: SpawnRequest) -> Result<InstanceSpec> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.limit {
                return Err(Error::MaxInstances { limit: self.limit });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut spec = InstanceSpec::new(format!("tcp://127.0.0.1:{}", 9300 + n))
                .with_id(format!("spawned-{}", n));
            spec.model = request.model;
            Ok(spec)
        }
    }

    fn auto_spawning(limit: usize) -> (InstanceRegistry, Arc<CountingSpawner>) {
        let registry = InstanceRegistry::new(
            RegistryConfig {
                auto_spawn: crate::config::AutoSpawnConfig {
                    enabled: true,
                    ..Default::default()
                },
                ..RegistryConfig::default()
            },
            HealthConfig::default(),
            CircuitBreakerConfig::default(),
            ClientConfig::default(),
            EventBus::new(),
        );
        let spawner = Arc::new(CountingSpawner {
            calls: AtomicUsize::new(0),
            limit,
        });
        registry.set_spawner(spawner.clone());
        (registry, spawner)
    }

    #[tokio::test]
    async fn test_concurrent_selection_spawns_once() {
        let (registry, spawner) = auto_spawning(8);
        let criteria = SelectionCriteria::any().with_model("m1");

        let picks = join_all((0..6).map(|_| registry.select_instance(&criteria))).await;
        let ids: HashSet<InstanceId> = picks.into_iter().map(|p| p.unwrap().id).collect();

        assert_eq!(ids.len(), 1);
        assert_eq!(spawner.calls.load(Ordering::SeqCst), 1);
        let instance = registry.all_instances().pop().unwrap();
        assert_eq!(instance.origin, InstanceOrigin::AutoSpawned);
        assert_eq!(instance.model.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_spawn_limit_reports_no_instance() {
        let (registry, _) = auto_spawning(0);
        let err = registry
            .select_instance(&SelectionCriteria::any())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAvailableInstance(ref why) if why.contains("limit 0")));
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = registry();
        let mut rx = registry.events().subscribe();

        let first = registry.register(InstanceSpec::new("tcp://127.0.0.1:9100").with_id("a"));
        let second = registry.register(
            InstanceSpec::new("tcp://127.0.0.1:9100")
                .with_id("a")
                .with_model("sonnet"),
        );

        assert_eq!(registry.len(), 1);
        assert_eq!(first.registration_seq, second.registration_seq);
        assert_eq!(second.model.as_deref(), Some("sonnet"));

        assert!(matches!(
            rx.try_recv().unwrap().event,
            FleetEvent::InstanceRegistered { .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_selection_prefers_least_loaded_then_oldest() {
        let registry = registry();
        let a = registry.register(InstanceSpec::new("tcp://127.0.0.1:9101").with_id("a"));
        let b = registry.register(InstanceSpec::new("tcp://127.0.0.1:9102").with_id("b"));

        let picked = registry.select_instance(&SelectionCriteria::any()).await.unwrap();
        assert_eq!(picked.id, a.id);

        registry.track_session(&SessionId::new("s1"), &a.id).unwrap();
        let picked = registry.select_instance(&SelectionCriteria::any()).await.unwrap();
        assert_eq!(picked.id, b.id);

        registry.release_session(&SessionId::new("s1"));
        let picked = registry.select_instance(&SelectionCriteria::any()).await.unwrap();
        assert_eq!(picked.id, a.id);
    }

    #[tokio::test]
    async fn test_selection_without_match_fails() {
        let registry = registry();
        registry.register(
            InstanceSpec::new("tcp://127.0.0.1:9101")
                .with_id("a")
                .with_model("haiku"),
        );

        let err = registry
            .select_instance(&SelectionCriteria::any().with_model("opus"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAvailableInstance(_)));
    }

    #[tokio::test]
    async fn test_open_circuit_refuses_without_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());

        let registry = registry();
        let instance = registry.register(InstanceSpec::new(endpoint).with_id("a"));
        registry.record_failure(&instance.id);
        registry.record_failure(&instance.id);
        assert_eq!(
            registry.get_instance(&instance.id).unwrap().circuit,
            CircuitState::Open
        );

        let err = registry
            .call_guarded(&instance.id, |client| async move { client.ping().await })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAvailableInstance(_)));

        // nothing ever dialed the listener
        let accepted =
            tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err());

        // and selection skips it
        assert!(registry.select_instance(&SelectionCriteria::any()).await.is_err());
    }

    #[tokio::test]
    async fn test_health_hysteresis_through_registry() {
        let registry = registry();
        let prober = Arc::new(FixedProber {
            up: Mutex::new(HashSet::new()),
        });
        registry.set_prober(prober.clone());
        let id = registry
            .register(InstanceSpec::new("tcp://127.0.0.1:9200").with_id("a"))
            .id;

        assert_eq!(registry.check_health(&id).await.unwrap(), HealthStatus::Degraded);
        assert_eq!(registry.check_health(&id).await.unwrap(), HealthStatus::Degraded);
        assert_eq!(registry.check_health(&id).await.unwrap(), HealthStatus::Unreachable);
        assert!(registry.healthy_instances().is_empty());

        prober.up.lock().insert("tcp://127.0.0.1:9200".into());
        assert_eq!(registry.check_health(&id).await.unwrap(), HealthStatus::Healthy);
        assert_eq!(registry.healthy_instances().len(), 1);
    }

    #[test]
    fn test_session_owner_never_changes() {
        let registry = registry();
        let a = registry.register(InstanceSpec::new("tcp://127.0.0.1:9101").with_id("a")).id;
        let b = registry.register(InstanceSpec::new("tcp://127.0.0.1:9102").with_id("b")).id;
        let session = SessionId::new("s1");

        registry.track_session(&session, &a).unwrap();
        registry.track_session(&session, &a).unwrap();
        assert_eq!(registry.get_instance(&a).unwrap().session_count, 1);

        assert!(matches!(
            registry.track_session(&session, &b),
            Err(Error::Protocol(_))
        ));
        assert_eq!(registry.session_owner(&session), Some(a));
    }

    #[tokio::test]
    async fn test_unregister_closes_sessions() {
        let registry = registry();
        let mut rx = registry.events().subscribe();
        let a = registry.register(InstanceSpec::new("tcp://127.0.0.1:9101").with_id("a")).id;
        registry.track_session(&SessionId::new("s1"), &a).unwrap();
        registry.track_session(&SessionId::new("s2"), &a).unwrap();

        assert!(registry.unregister(&a).await);
        assert!(!registry.unregister(&a).await);
        assert!(registry.session_owner(&SessionId::new("s1")).is_none());

        let mut closed = 0;
        let mut unregistered = 0;
        while let Ok(envelope) = rx.try_recv() {
            match envelope.event {
                FleetEvent::SessionClosed { .. } => closed += 1,
                FleetEvent::InstanceUnregistered { .. } => unregistered += 1,
                _ => {}
            }
        }
        assert_eq!(closed, 2);
        assert_eq!(unregistered, 1);
    }

    #[tokio::test]
    async fn test_discovery_keeps_other_origins() {
        let registry = registry();
        registry.register(
            InstanceSpec::new("tcp://127.0.0.1:9300")
                .with_id("spawned")
                .with_origin(InstanceOrigin::AutoSpawned),
        );
        registry.add_source(Arc::new(StaticSource::new(vec![
            crate::config::StaticInstance {
                id: "static-1".into(),
                endpoint: "tcp://127.0.0.1:9301".into(),
                model: None,
                capabilities: Vec::new(),
            },
        ])));

        let report = registry.discover_instances().await;
        assert!(report.is_clean());
        assert_eq!(report.added, vec![InstanceId::new("static-1")]);
        assert_eq!(registry.len(), 2);

        let report = registry.discover_instances().await;
        assert_eq!(report.updated, vec![InstanceId::new("static-1")]);
        assert!(registry.get_instance(&InstanceId::new("spawned")).is_some());
    }
}
