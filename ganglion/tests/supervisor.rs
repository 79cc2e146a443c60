//! Process supervision with the reference worker binary
#![cfg(unix)]

mod common;

use futures::StreamExt;
use std::collections::HashSet;
use std::time::Duration;

use ganglion::config::PortRange;
use ganglion::events::FleetEvent;
use ganglion::process::{ExecCommand, ProcessState, SpawnConfig, Supervisor};
use ganglion::session::SessionConfig;
use ganglion::{Error, EventBus, Fleet, Runtime};

fn supervisor(range: PortRange, max_instances: usize) -> (Supervisor, EventBus) {
    let events = EventBus::new();
    let supervisor = Supervisor::new(
        common::worker_supervisor_config(range, max_instances),
        common::client_config(),
        events.clone(),
    );
    (supervisor, events)
}

#[tokio::test]
async fn test_spawned_workers_get_unique_ports() {
    let (supervisor, _) = supervisor(common::port_range(16), 3);

    let mut ports = HashSet::new();
    for _ in 0..3 {
        let info = supervisor.spawn(SpawnConfig::default()).await.unwrap();
        assert_eq!(info.state, ProcessState::Running);
        assert!(ports.insert(info.port), "port {} handed out twice", info.port);
    }

    let stats = supervisor.stats();
    assert_eq!(stats.active, 3);
    assert_eq!(stats.running, 3);
    assert_eq!(stats.total_spawned, 3);
    assert_eq!(stats.ports_in_use.len(), 3);

    let err = supervisor.spawn(SpawnConfig::default()).await.unwrap_err();
    assert!(matches!(err, Error::MaxInstances { limit: 3 }));

    supervisor.dispose().await;
    assert!(supervisor.list().is_empty());
    assert!(supervisor.stats().ports_in_use.is_empty());
}

#[tokio::test]
async fn test_single_port_range_is_exhausted() {
    let (supervisor, _) = supervisor(common::port_range(1), 4);

    let first = supervisor.spawn(SpawnConfig::default()).await.unwrap();
    let err = supervisor.spawn(SpawnConfig::default()).await.unwrap_err();
    assert!(matches!(err, Error::PortAllocation { .. }));

    // A failed allocation gives its slot back
    assert_eq!(supervisor.stats().active, 1);

    supervisor.kill(&first.id, false).await.unwrap();
    let second = supervisor.spawn(SpawnConfig::default()).await.unwrap();
    assert_eq!(second.port, first.port);
    supervisor.dispose().await;
}

#[tokio::test]
async fn test_graceful_kill_is_idempotent() {
    let (supervisor, events) = supervisor(common::port_range(4), 2);
    let mut rx = events.subscribe();

    let info = supervisor.spawn(SpawnConfig::default().with_model("m9")).await.unwrap();
    assert_eq!(info.model, "m9");

    supervisor.kill(&info.id, false).await.unwrap();
    supervisor.kill(&info.id, false).await.unwrap();
    supervisor.kill(&info.id, true).await.unwrap();

    let status = supervisor.status(&info.id).expect("exited process kept in history");
    assert_eq!(status.state, ProcessState::Stopped);
    assert!(supervisor.list().is_empty());
    assert!(supervisor.list_by_status(ProcessState::Running).is_empty());
    let stopped = supervisor.list_by_status(ProcessState::Stopped);
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].id, info.id);

    let mut seen = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        seen.push(envelope.event);
    }
    assert!(matches!(seen.first(), Some(FleetEvent::ProcessStarted { .. })));
    assert!(seen.iter().any(|e| matches!(e, FleetEvent::ProcessReady { .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        FleetEvent::ProcessExited { state: ProcessState::Stopped, .. }
    )));
    supervisor.dispose().await;
}

#[tokio::test]
async fn test_unrequested_exit_is_a_crash() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let (supervisor, _) = supervisor(common::port_range(4), 2);
    let info = supervisor.spawn(SpawnConfig::default()).await.unwrap();
    let pid = info.pid.expect("spawned process has a pid");

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    let crashed = common::eventually(Duration::from_secs(5), || {
        supervisor
            .status(&info.id)
            .is_some_and(|s| s.state == ProcessState::Crashed)
    })
    .await;
    assert!(crashed);
    assert_eq!(supervisor.stats().total_crashed, 1);
    assert!(supervisor.stats().ports_in_use.is_empty());
    assert_eq!(
        supervisor.status(&info.id).unwrap().exit.unwrap().signal,
        Some(Signal::SIGKILL as i32)
    );
    supervisor.dispose().await;
}

#[tokio::test]
async fn test_output_tail_and_rpc_exec() {
    let (supervisor, _) = supervisor(common::port_range(4), 1);
    let mut live = supervisor.subscribe_output();
    let info = supervisor.spawn(SpawnConfig::default()).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), live.next())
        .await
        .expect("no output streamed")
        .unwrap();
    assert_eq!(first.process_id, info.id);

    let result = supervisor
        .exec(&info.id, ExecCommand::call("ping", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(result.output["pong"], true);

    let logged = common::eventually(Duration::from_secs(3), || {
        supervisor
            .output(&info.id, 50)
            .unwrap()
            .iter()
            .any(|l| l.line.contains("serving"))
    })
    .await;
    assert!(logged);

    supervisor.kill(&info.id, false).await.unwrap();

    // Output survives the process
    assert!(!supervisor.output(&info.id, 50).unwrap().is_empty());
    assert!(matches!(
        supervisor.output(&ganglion::ProcessId::new("ghost"), 10),
        Err(Error::NotFound { .. })
    ));
    supervisor.dispose().await;
}

#[tokio::test]
async fn test_disposed_supervisor_refuses_spawns() {
    let (supervisor, _) = supervisor(common::port_range(2), 1);
    supervisor.dispose().await;
    let err = supervisor.spawn(SpawnConfig::default()).await.unwrap_err();
    assert!(matches!(err, Error::Spawn { .. }));
}

#[tokio::test]
async fn test_kill_cancels_calls_in_flight() {
    let (supervisor, _) = supervisor(common::port_range(4), 1);
    let info = supervisor.spawn(SpawnConfig::default()).await.unwrap();

    let client = supervisor.client_for_process(&info.id).await.unwrap();
    let session = client.init_session(SessionConfig::default()).await.unwrap();
    let sender = client.clone();
    let id = session.id.clone();
    let pending = tokio::spawn(async move { sender.send_message(&id, "sleep:8000 slow").await });
    assert!(common::eventually(Duration::from_secs(2), || client.pending_calls() == 1).await);

    supervisor.kill(&info.id, false).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("pending message outlived the process")
        .unwrap();
    assert!(matches!(outcome, Err(Error::Cancelled(_))), "got {:?}", outcome);
    supervisor.dispose().await;
}

#[tokio::test]
async fn test_runtimes_never_share_a_port() {
    let mut config = common::fleet_config(2);
    config.supervisor.port_range = common::port_range(1);
    config.supervisor.liveness_settle = Duration::from_millis(50);
    let fleet = Fleet::new(config).unwrap();

    let command = fleet.runtimes().get("command").unwrap();
    let sleeper = command
        .spawn(SpawnConfig::default().with_command("sleep", vec!["30".to_string()]))
        .await
        .unwrap();

    let pi = fleet.runtimes().get("pi").unwrap();
    let err = pi.spawn(SpawnConfig::default()).await.unwrap_err();
    assert!(matches!(err, Error::PortAllocation { .. }), "got {:?}", err);

    command.kill(&sleeper.id, true).await.unwrap();
    let worker = pi.spawn(SpawnConfig::default()).await.unwrap();
    assert_eq!(worker.port, sleeper.port);
    fleet.shutdown().await;
}
