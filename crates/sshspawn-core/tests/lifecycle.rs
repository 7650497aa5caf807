mod common;

use std::sync::Arc;

use sshspawn_core::error::{SpawnerError, TimeoutPhase};
use sshspawn_core::models::{Liveness, ServerStatus, Signal, SpawnedServerRecord};
use sshspawn_core::services::{liveness, HostPool, SshSpawner};

use common::{test_config, Behavior, FakeConnector, FakeRemote};

fn spawner(remote: &Arc<FakeRemote>, hosts: &[&str]) -> SshSpawner<FakeConnector> {
    let config = test_config(hosts);
    let pool = HostPool::new(config.hosts.clone());
    SshSpawner::new(config, pool, FakeConnector(Arc::clone(remote)))
}

#[tokio::test]
async fn poll_reports_running_server() {
    let remote = FakeRemote::new();
    let spawner = spawner(&remote, &["node-1"]);
    let mut record = spawner.start(&spawner.request_for("alice")).await.unwrap();

    assert!(spawner.poll(&mut record).await.unwrap());
    assert_eq!(record.status, ServerStatus::Running);
    assert_eq!(remote.opens(), remote.closes());
}

#[tokio::test]
async fn poll_after_crash_is_dead_and_marks_failure() {
    let remote = FakeRemote::new();
    let spawner = spawner(&remote, &["node-1"]);
    let mut record = spawner.start(&spawner.request_for("alice")).await.unwrap();
    remote.crash("node-1", record.pid);

    assert!(!spawner.poll(&mut record).await.unwrap());
    assert_eq!(record.status, ServerStatus::Failed);
}

#[tokio::test]
async fn poll_of_unknown_pid_is_dead_not_error() {
    let remote = FakeRemote::new();
    let connector = FakeConnector(remote.clone());
    let config = test_config(&["node-1"]);
    let record = SpawnedServerRecord::new("node-1", "alice", 99999);

    let liveness = liveness::poll(&connector, &config, &record).await.unwrap();
    assert_eq!(liveness, Liveness::Dead);
    assert_eq!(remote.closes(), 1);
}

#[tokio::test]
async fn other_probe_failures_are_session_errors() {
    let remote = FakeRemote::new();
    remote.set_behavior(
        "node-1",
        Behavior {
            probe_denied: true,
            ..Default::default()
        },
    );
    let connector = FakeConnector(remote.clone());
    let config = test_config(&["node-1"]);
    let record = SpawnedServerRecord::new("node-1", "alice", 4242);

    let err = liveness::poll(&connector, &config, &record).await.unwrap_err();
    assert!(matches!(err, SpawnerError::Session { .. }));
    assert_eq!(remote.closes(), 1);
}

#[tokio::test]
async fn poll_of_unreachable_host_is_an_error() {
    let remote = FakeRemote::new();
    let spawner = spawner(&remote, &["node-1"]);
    let mut record = spawner.start(&spawner.request_for("alice")).await.unwrap();
    remote.set_behavior(
        "node-1",
        Behavior {
            unreachable: true,
            ..Default::default()
        },
    );

    let err = spawner.poll(&mut record).await.unwrap_err();
    assert!(matches!(err, SpawnerError::Unreachable { .. }));
    assert_eq!(record.status, ServerStatus::Running);
}

#[tokio::test]
async fn stop_terminates_and_releases_host() {
    let remote = FakeRemote::new();
    let spawner = spawner(&remote, &["node-1"]);
    let mut record = spawner.start(&spawner.request_for("alice")).await.unwrap();
    let host = spawner.pool().host("node-1").unwrap();
    assert_eq!(host.session_count(), 1);

    spawner.stop(&mut record).await.unwrap();

    assert_eq!(record.status, ServerStatus::Stopped);
    assert!(!remote.is_running("node-1", record.pid));
    assert_eq!(host.session_count(), 0);
    assert_eq!(remote.opens(), remote.closes());
    assert!(!spawner.poll(&mut record).await.unwrap());
}

#[tokio::test]
async fn stop_timeout_does_not_claim_stopped() {
    let remote = FakeRemote::new();
    let spawner = spawner(&remote, &["node-1"]);
    let mut record = spawner.start(&spawner.request_for("alice")).await.unwrap();
    remote.set_behavior(
        "node-1",
        Behavior {
            ignore_term: true,
            ..Default::default()
        },
    );
    let host = spawner.pool().host("node-1").unwrap();

    let err = spawner.stop(&mut record).await.unwrap_err();
    assert!(matches!(err, SpawnerError::TerminationTimeout { .. }));
    assert_eq!(record.status, ServerStatus::Stopping);
    assert!(remote.is_running("node-1", record.pid));
    assert_eq!(host.session_count(), 1);

    spawner
        .stop_with_signal(&mut record, Signal::Kill)
        .await
        .unwrap();
    assert_eq!(record.status, ServerStatus::Stopped);
    assert_eq!(host.session_count(), 0);
    assert_eq!(remote.opens(), remote.closes());
}

#[tokio::test]
async fn stopping_a_crashed_server_releases_host() {
    let remote = FakeRemote::new();
    let spawner = spawner(&remote, &["node-1"]);
    let mut record = spawner.start(&spawner.request_for("alice")).await.unwrap();
    remote.crash("node-1", record.pid);
    assert!(!spawner.poll(&mut record).await.unwrap());

    spawner.stop(&mut record).await.unwrap();
    assert_eq!(record.status, ServerStatus::Stopped);
    assert_eq!(spawner.pool().host("node-1").unwrap().session_count(), 0);
}

#[tokio::test]
async fn counter_never_goes_negative() {
    let remote = FakeRemote::new();
    let spawner = spawner(&remote, &["node-1"]);
    let mut record = spawner.start(&spawner.request_for("alice")).await.unwrap();
    let host = spawner.pool().host("node-1").unwrap();
    host.decrement();

    spawner.stop(&mut record).await.unwrap();
    assert_eq!(host.session_count(), 0);
}

#[tokio::test]
async fn stored_state_survives_a_restart() {
    let remote = FakeRemote::new();
    let first = spawner(&remote, &["node-1", "node-2"]);
    let record = first.start(&first.request_for("alice")).await.unwrap();
    let state = record.to_state().unwrap();
    drop(first);

    let second = spawner(&remote, &["node-1", "node-2"]);
    let mut restored = SpawnedServerRecord::from_state(&state).unwrap();
    second.pool().restore([&restored]);
    assert_eq!(
        second.pool().host(&restored.hostname).unwrap().session_count(),
        1
    );

    assert!(second.poll(&mut restored).await.unwrap());
    second.stop(&mut restored).await.unwrap();
    assert_eq!(
        second.pool().host(&restored.hostname).unwrap().session_count(),
        0
    );
}

#[tokio::test]
async fn hung_probe_times_out_and_closes_session() {
    let remote = FakeRemote::new();
    let spawner = spawner(&remote, &["node-1"]);
    let mut record = spawner.start(&spawner.request_for("alice")).await.unwrap();
    remote.set_behavior(
        "node-1",
        Behavior {
            hang_on: Some("kill -0".into()),
            ..Default::default()
        },
    );

    let err = spawner.poll(&mut record).await.unwrap_err();
    assert!(matches!(
        err,
        SpawnerError::Timeout { phase: TimeoutPhase::Exec, .. }
    ));
    assert_eq!(record.status, ServerStatus::Running);
    assert_eq!(remote.opens(), remote.closes());
}

#[tokio::test]
async fn hung_signal_times_out_without_releasing_host() {
    let remote = FakeRemote::new();
    let spawner = spawner(&remote, &["node-1"]);
    let mut record = spawner.start(&spawner.request_for("alice")).await.unwrap();
    remote.set_behavior(
        "node-1",
        Behavior {
            hang_on: Some("kill -s".into()),
            ..Default::default()
        },
    );

    let err = spawner.stop(&mut record).await.unwrap_err();
    assert!(matches!(
        err,
        SpawnerError::Timeout { phase: TimeoutPhase::Exec, .. }
    ));
    assert_eq!(record.status, ServerStatus::Stopping);
    assert_eq!(spawner.pool().host("node-1").unwrap().session_count(), 1);
    assert_eq!(remote.opens(), remote.closes());
}

#[tokio::test]
async fn connect_timeout_on_stop_keeps_counter() {
    let remote = FakeRemote::new();
    let spawner = spawner(&remote, &["node-1"]);
    let mut record = spawner.start(&spawner.request_for("alice")).await.unwrap();
    remote.set_behavior(
        "node-1",
        Behavior {
            connect_hangs: true,
            ..Default::default()
        },
    );

    let err = spawner.stop(&mut record).await.unwrap_err();
    assert!(matches!(
        err,
        SpawnerError::Timeout { phase: TimeoutPhase::Connect, .. }
    ));
    assert_eq!(spawner.pool().host("node-1").unwrap().session_count(), 1);
    assert_eq!(remote.opens(), remote.closes());
}

#[tokio::test]
async fn localized_remote_still_reports_dead_and_stopped() {
    let remote = FakeRemote::new();
    let spawner = spawner(&remote, &["node-1"]);
    let mut record = spawner.start(&spawner.request_for("alice")).await.unwrap();
    remote.set_behavior(
        "node-1",
        Behavior {
            localized: true,
            ..Default::default()
        },
    );
    remote.crash("node-1", record.pid);

    assert!(!spawner.poll(&mut record).await.unwrap());
    assert_eq!(record.status, ServerStatus::Failed);
    spawner.stop(&mut record).await.unwrap();
    assert_eq!(record.status, ServerStatus::Stopped);
    assert!(remote
        .commands()
        .iter()
        .filter(|(_, c)| c.contains("kill "))
        .all(|(_, c)| c.starts_with("LC_ALL=C ")));
}
