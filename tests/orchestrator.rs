//! Startup ordering, rollback and serve-loop tests for the orchestrator.

use std::time::Duration;

use engine_daemon::config::DaemonConfig;
use engine_daemon::lifecycle::StartupStep;
use engine_daemon::observability::LogHandle;
use engine_daemon::{ConfigSource, DaemonError, FlagOverrides, Orchestrator, RunState};

mod common;

use common::{orchestrator, spawn, test_config, test_options, Fail, FakePlatform};

/// Run to completion and return the error together with the journal, minus
/// the host bookkeeping entry.
async fn fails_with(fail: Option<Fail>, config: DaemonConfig) -> (DaemonError, Vec<String>) {
    let platform = FakePlatform::new(fail);
    let err = orchestrator(platform.clone(), config)
        .run()
        .await
        .expect_err("startup should fail");
    let journal = platform
        .journal
        .entries()
        .into_iter()
        .filter(|e| !e.starts_with("core:hosts:"))
        .collect();
    (err, journal)
}

#[tokio::test]
async fn step_1_invalid_config_starts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig {
        log_level: "chatty".into(),
        ..test_config(dir.path())
    };
    let platform = FakePlatform::new(None);
    let orchestrator = Orchestrator::new(
        platform.clone(),
        ConfigSource::flags_only(FlagOverrides::default()),
        config,
        LogHandle::detached(false),
    )
    .with_options(test_options());

    let err = orchestrator.run().await.unwrap_err();
    assert_eq!(err.step(), StartupStep::Config);
    assert!(platform.journal.entries().is_empty());
    assert!(!dir.path().join("engine.pid").exists());
    assert!(!dir.path().join("lib").exists());
}

#[tokio::test]
async fn step_2_bind_failure_releases_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig {
        hosts: vec![format!("unix://{}", dir.path().join("missing/engine.sock").display())],
        ..test_config(dir.path())
    };
    let (err, journal) = fails_with(None, config).await;

    assert_eq!(err.step(), StartupStep::Listeners);
    assert!(err.to_string().starts_with("failed to load listeners"));
    assert!(journal.is_empty());
    assert!(!dir.path().join("engine.pid").exists());
}

#[tokio::test]
async fn step_3_supervisor_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (err, journal) = fails_with(Some(Fail::Launch), test_config(dir.path())).await;

    assert_eq!(err.step(), StartupStep::Supervisor);
    assert_eq!(journal, ["supervisor:launch"]);
    assert!(!dir.path().join("engine.pid").exists());
}

#[tokio::test]
async fn step_4_middleware_failure_stops_supervisor() {
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig {
        min_api_version: Some("1.0".into()),
        ..test_config(dir.path())
    };
    let (err, journal) = fails_with(None, config).await;

    assert_eq!(err.step(), StartupStep::Middleware);
    assert!(err.to_string().starts_with("failed to start API server"));
    assert_eq!(journal, ["supervisor:launch", "supervisor:terminate"]);
}

#[tokio::test]
async fn step_5_bad_device_spec_dir() {
    let dir = tempfile::tempdir().unwrap();
    let not_a_dir = dir.path().join("cdi-file");
    std::fs::write(&not_a_dir, "{}").unwrap();
    let config = DaemonConfig {
        cdi_spec_dirs: Some(vec![not_a_dir]),
        ..test_config(dir.path())
    };
    let (err, journal) = fails_with(None, config).await;

    assert_eq!(err.step(), StartupStep::Devices);
    assert_eq!(journal, ["supervisor:launch", "supervisor:terminate"]);
}

#[tokio::test]
async fn step_6_core_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (err, journal) = fails_with(Some(Fail::Core), test_config(dir.path())).await;

    assert_eq!(err.step(), StartupStep::Core);
    assert!(err.to_string().starts_with("failed to start daemon"));
    assert_eq!(journal, ["supervisor:launch", "core:new", "supervisor:terminate"]);
}

#[tokio::test]
async fn step_7_unknown_authz_plugin_shuts_core_down() {
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig {
        authorization_plugins: vec!["opa".into()],
        ..test_config(dir.path())
    };
    let (err, journal) = fails_with(None, config).await;

    assert_eq!(err.step(), StartupStep::Authz);
    assert_eq!(
        journal,
        ["supervisor:launch", "core:new", "core:shutdown", "supervisor:terminate"]
    );
}

#[tokio::test]
async fn step_8_metrics_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let config = DaemonConfig {
        metrics_address: Some(taken.local_addr().unwrap().to_string()),
        ..test_config(dir.path())
    };
    let (err, journal) = fails_with(None, config).await;

    assert_eq!(err.step(), StartupStep::Metrics);
    assert!(!journal.iter().any(|e| e.starts_with("cluster:")));
    assert_eq!(
        journal,
        ["supervisor:launch", "core:new", "core:shutdown", "supervisor:terminate"]
    );
}

#[tokio::test]
async fn step_9_cluster_failure_skips_reconciliation() {
    let dir = tempfile::tempdir().unwrap();
    let (err, journal) = fails_with(Some(Fail::Cluster), test_config(dir.path())).await;

    assert_eq!(err.step(), StartupStep::Cluster);
    assert!(err.to_string().starts_with("failed to start cluster component: "));
    assert_eq!(
        journal,
        [
            "supervisor:launch",
            "core:new",
            "cluster:new",
            "cluster:start",
            "core:shutdown",
            "supervisor:terminate",
        ]
    );
}

#[tokio::test]
async fn step_10_builder_failure_cleans_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let (err, journal) = fails_with(Some(Fail::Builder), test_config(dir.path())).await;

    assert_eq!(err.step(), StartupStep::Builder);
    assert_eq!(
        journal,
        [
            "supervisor:launch",
            "core:new",
            "cluster:new",
            "cluster:start",
            "core:restart-swarm-containers",
            "builder:new",
            "cluster:cleanup",
            "core:shutdown",
            "supervisor:terminate",
        ]
    );
}

#[tokio::test]
async fn step_11_route_conflict_closes_builder() {
    let dir = tempfile::tempdir().unwrap();
    let (err, journal) = fails_with(Some(Fail::DuplicateRoute), test_config(dir.path())).await;

    assert_eq!(err.step(), StartupStep::Routes);
    assert_eq!(
        &journal[journal.len() - 4..],
        ["builder:close", "cluster:cleanup", "core:shutdown", "supervisor:terminate"]
    );
    assert!(!dir.path().join("engine.pid").exists());
}

#[tokio::test]
async fn adopted_supervisor_is_not_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    std::fs::create_dir_all(config.runtime.socket.parent().unwrap()).unwrap();
    std::fs::write(&config.runtime.socket, b"").unwrap();

    let (err, journal) = fails_with(Some(Fail::Core), config).await;
    assert_eq!(err.step(), StartupStep::Core);
    assert_eq!(journal, ["core:new"]);
}

#[tokio::test]
async fn serves_until_stopped_then_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let platform = FakePlatform::new(None);
    let mut running = spawn(orchestrator(platform.clone(), test_config(dir.path())));

    let addresses = running.serving().await;
    assert_eq!(addresses, [format!("unix://{}", dir.path().join("engine.sock").display())]);
    assert!(dir.path().join("engine.pid").exists());
    assert!(platform.journal.contains("core:restart-swarm-containers"));

    running.stop.fire();
    let mut states = running.states.clone();
    running.finish().await.unwrap();
    assert_eq!(*states.borrow_and_update(), RunState::Stopped);

    let journal = platform.journal.entries();
    let teardown: Vec<&str> = journal
        .iter()
        .map(String::as_str)
        .skip_while(|e| *e != "builder:new")
        .skip(1)
        .collect();
    assert_eq!(
        teardown,
        ["builder:close", "cluster:cleanup", "core:shutdown", "supervisor:terminate"]
    );
    assert!(!dir.path().join("engine.pid").exists());
    assert!(!dir.path().join("engine.sock").exists());
}

#[tokio::test]
async fn cluster_events_reach_the_core() {
    let dir = tempfile::tempdir().unwrap();
    let platform = FakePlatform::new(None);
    let mut running = spawn(orchestrator(platform.clone(), test_config(dir.path())));
    running.serving().await;

    let events = platform.cluster_events().unwrap();
    events
        .send(engine_daemon::daemon::ClusterEvent {
            kind: "service".into(),
            action: "create".into(),
            id: "svc-1".into(),
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !platform.journal.contains("core:event:svc-1") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    running.stop.fire();
    running.finish().await.unwrap();
}
