//! Instance registry routing over real and unreachable workers
#![cfg(unix)]

mod common;

use futures::future::join_all;
use std::collections::HashSet;
use std::time::Duration;

use ganglion::config::{CircuitBreakerConfig, HealthConfig, RegistryConfig};
use ganglion::events::FleetEvent;
use ganglion::registry::{CircuitState, InstanceOrigin, InstanceRegistry, InstanceSpec};
use ganglion::{Error, EventBus, Fleet, InstanceId, SelectionCriteria, SessionConfig};

fn auto_spawning_fleet(max_instances: usize) -> Fleet {
    let mut config = common::fleet_config(max_instances);
    config.registry.auto_spawn.enabled = true;
    Fleet::new(config).unwrap()
}

#[tokio::test]
async fn test_concurrent_selection_spawns_once() {
    let fleet = auto_spawning_fleet(4);
    let criteria = SelectionCriteria::any();

    let picks = join_all((0..5).map(|_| fleet.registry().select_instance(&criteria))).await;
    let ids: HashSet<InstanceId> = picks.into_iter().map(|p| p.unwrap().id).collect();
    assert_eq!(ids.len(), 1);

    let pi = fleet.runtimes().get("pi").unwrap();
    assert_eq!(pi.list().len(), 1);

    let instance = fleet.registry().all_instances().pop().unwrap();
    assert_eq!(instance.origin, InstanceOrigin::AutoSpawned);
    assert!(instance.process_id.is_some());
    fleet.shutdown().await;
}

#[tokio::test]
async fn test_spawn_cap_means_no_instance() {
    let fleet = auto_spawning_fleet(1);

    fleet
        .registry()
        .select_instance(&SelectionCriteria::any().with_model("echo"))
        .await
        .unwrap();
    let err = fleet
        .registry()
        .select_instance(&SelectionCriteria::any().with_model("other"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoAvailableInstance(_)));
    fleet.shutdown().await;
}

#[tokio::test]
async fn test_worker_exit_closes_its_sessions() {
    let fleet = auto_spawning_fleet(2);
    let mut events = fleet.events().subscribe();

    let (client, session) = fleet
        .registry()
        .acquire_session(&SelectionCriteria::any(), SessionConfig::default())
        .await
        .unwrap();
    let reply = client.send_message(&session.id, "ping me").await.unwrap();
    assert_eq!(reply.text, "echo: ping me");

    let owner = fleet.registry().session_owner(&session.id).unwrap();
    assert_eq!(owner, session.instance_id);
    assert_eq!(
        fleet.registry().get_instance(&owner).unwrap().session_count,
        1
    );

    let process_id = fleet
        .registry()
        .get_instance(&owner)
        .and_then(|i| i.process_id)
        .unwrap();
    fleet
        .runtimes()
        .get("pi")
        .unwrap()
        .kill(&process_id, false)
        .await
        .unwrap();

    let registry = fleet.registry().clone();
    assert!(common::eventually(Duration::from_secs(5), || registry.is_empty()).await);
    assert!(registry.session_owner(&session.id).is_none());

    let mut closed = false;
    while let Ok(envelope) = events.try_recv() {
        if let FleetEvent::SessionClosed { session_id, .. } = envelope.event {
            closed |= session_id == session.id;
        }
    }
    assert!(closed);
    fleet.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_instance_trips_the_breaker() {
    let registry = InstanceRegistry::new(
        RegistryConfig::default(),
        HealthConfig::default(),
        CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(60),
            ..CircuitBreakerConfig::default()
        },
        common::client_config(),
        EventBus::new(),
    );
    let endpoint = format!("tcp://127.0.0.1:{}", common::free_port());
    let instance = registry.register(
        InstanceSpec::new(endpoint).with_id(InstanceId::new("dead")),
    );

    for _ in 0..2 {
        let err = registry
            .call_guarded(&instance.id, |client| async move { client.ping().await })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }
    assert_eq!(registry.circuit(&instance.id).unwrap().state, CircuitState::Open);

    let refused = registry
        .call_guarded(&instance.id, |client| async move { client.ping().await })
        .await
        .unwrap_err();
    assert!(matches!(refused, Error::NoAvailableInstance(_)));

    let err = registry
        .select_instance(&SelectionCriteria::any())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoAvailableInstance(_)));
    registry.dispose().await;
}

#[tokio::test]
async fn test_health_check_against_live_worker() {
    let worker = common::start_worker().await;
    let registry = InstanceRegistry::new(
        RegistryConfig::default(),
        HealthConfig::default(),
        CircuitBreakerConfig::default(),
        common::client_config(),
        EventBus::new(),
    );
    let instance = registry.register(
        InstanceSpec::new(worker.endpoint()).with_id(InstanceId::new("live")),
    );

    let status = registry.check_health(&instance.id).await.unwrap();
    assert!(status.is_routable());
    assert_eq!(registry.healthy_instances().len(), 1);

    worker.shutdown().await;
    registry.check_health(&instance.id).await.unwrap();
    let degraded = registry.get_instance(&instance.id).unwrap();
    assert_eq!(degraded.consecutive_failures, 1);
    registry.dispose().await;
}
