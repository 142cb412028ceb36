//! Shared utilities for orchestrator integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::routing::get;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use engine_daemon::config::loader::finalize;
use engine_daemon::config::DaemonConfig;
use engine_daemon::daemon::{
    BuildBackend, BuildOptions, Cluster, ClusterEvent, ClusterOptions, CollaboratorError, CoreContext, DaemonCore,
    Platform,
};
use engine_daemon::http::ApiRouter;
use engine_daemon::net::listener::DeterrentDelays;
use engine_daemon::observability::LogHandle;
use engine_daemon::supervisor::{RuntimeLauncher, RuntimeProcess, StartOptions, SupervisorError};
use engine_daemon::{ConfigSource, DaemonError, FlagOverrides, Orchestrator, OrchestratorOptions, RunState};

/// Ordered record of collaborator calls.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == entry)
    }
}

/// Where the fake platform should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fail {
    Launch,
    Core,
    Cluster,
    Builder,
    DuplicateRoute,
}

pub struct FakeCore {
    journal: Journal,
    config: ArcSwap<DaemonConfig>,
    shutdown_delay: Duration,
    reload_fails: bool,
}

impl FakeCore {
    pub fn new(journal: Journal, config: DaemonConfig) -> Self {
        Self {
            journal,
            config: ArcSwap::from_pointee(config),
            shutdown_delay: Duration::ZERO,
            reload_fails: false,
        }
    }

    pub fn with_shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay = delay;
        self
    }

    pub fn with_failing_reload(mut self) -> Self {
        self.reload_fails = true;
        self
    }
}

#[async_trait]
impl DaemonCore for FakeCore {
    fn id(&self) -> String {
        "fake-core".into()
    }

    fn config(&self) -> DaemonConfig {
        self.config.load().as_ref().clone()
    }

    fn store_hosts(&self, hosts: Vec<String>) {
        self.journal.record(format!("core:hosts:{}", hosts.join(",")));
    }

    fn has_experimental(&self) -> bool {
        self.config.load().experimental
    }

    fn features(&self) -> BTreeMap<String, bool> {
        self.config.load().features.clone()
    }

    fn shutdown_timeout(&self) -> i64 {
        self.config.load().shutdown_timeout
    }

    async fn shutdown(&self, cancel: CancellationToken) {
        self.journal.record("core:shutdown");
        tokio::select! {
            _ = tokio::time::sleep(self.shutdown_delay) => {}
            _ = cancel.cancelled() => self.journal.record("core:shutdown-cancelled"),
        }
    }

    async fn reload(&self, config: &DaemonConfig) -> Result<(), CollaboratorError> {
        self.journal.record("core:reload");
        if self.reload_fails {
            return Err("reload refused".into());
        }
        self.config.store(Arc::new(config.clone()));
        Ok(())
    }

    async fn restart_swarm_containers(&self) {
        self.journal.record("core:restart-swarm-containers");
    }

    async fn process_cluster_event(&self, event: ClusterEvent) {
        self.journal.record(format!("core:event:{}", event.id));
    }

    fn routers(&self) -> Vec<ApiRouter> {
        vec![ApiRouter::new("system").route("/_ping", get(|| async { "OK" }))]
    }
}

struct FakeCluster {
    journal: Journal,
    fail: bool,
    stream: Mutex<Option<mpsc::Receiver<ClusterEvent>>>,
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn start(&self) -> Result<(), CollaboratorError> {
        self.journal.record("cluster:start");
        if self.fail {
            return Err("raft store unavailable".into());
        }
        Ok(())
    }

    async fn cleanup(&self) {
        self.journal.record("cluster:cleanup");
    }

    fn take_watch_stream(&self) -> Option<mpsc::Receiver<ClusterEvent>> {
        self.stream.lock().unwrap().take()
    }

    fn routers(&self) -> Vec<ApiRouter> {
        vec![ApiRouter::new("swarm").route("/swarm", get(|| async { "inactive" }))]
    }
}

struct FakeBuilder {
    journal: Journal,
    duplicate_route: bool,
}

#[async_trait]
impl BuildBackend for FakeBuilder {
    async fn close(&self) -> Result<(), CollaboratorError> {
        self.journal.record("builder:close");
        Ok(())
    }

    fn routers(&self) -> Vec<ApiRouter> {
        let mut router = ApiRouter::new("build").route("/session", get(|| async { "session" }));
        if self.duplicate_route {
            router = router.route("/_ping", get(|| async { "shadow" }));
        }
        vec![router]
    }
}

/// Listens on the runtime socket on launch and runs until terminated.
struct FakeLauncher {
    journal: Journal,
    fail: bool,
}

struct FakeProcess {
    journal: Journal,
    exit: Option<oneshot::Receiver<()>>,
    _keep: oneshot::Sender<()>,
    _socket: std::os::unix::net::UnixListener,
}

#[async_trait]
impl RuntimeProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn wait(&mut self) -> Result<String, SupervisorError> {
        match self.exit.as_mut() {
            Some(rx) => {
                let _ = rx.await;
                Ok("terminated".into())
            }
            None => Ok("terminated".into()),
        }
    }

    fn terminate(&mut self) -> Result<(), SupervisorError> {
        self.journal.record("supervisor:terminate");
        self.exit = None;
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), SupervisorError> {
        Ok(())
    }
}

#[async_trait]
impl RuntimeLauncher for FakeLauncher {
    async fn launch(&self, options: &StartOptions) -> Result<Box<dyn RuntimeProcess>, SupervisorError> {
        self.journal.record("supervisor:launch");
        if self.fail {
            return Err(SupervisorError::Options("launch refused".into()));
        }
        std::fs::create_dir_all(&options.state).unwrap();
        let socket = std::os::unix::net::UnixListener::bind(options.address()).unwrap();
        let (keep, exit) = oneshot::channel();
        Ok(Box::new(FakeProcess {
            journal: self.journal.clone(),
            exit: Some(exit),
            _keep: keep,
            _socket: socket,
        }))
    }
}

/// Platform whose collaborators record every call and fail on request.
pub struct FakePlatform {
    pub journal: Journal,
    pub fail: Option<Fail>,
    pub events: Mutex<Option<mpsc::Sender<ClusterEvent>>>,
}

impl FakePlatform {
    pub fn new(fail: Option<Fail>) -> Arc<Self> {
        Arc::new(Self {
            journal: Journal::default(),
            fail,
            events: Mutex::new(None),
        })
    }

    /// Sender feeding the cluster watch stream, once the cluster exists.
    pub fn cluster_events(&self) -> Option<mpsc::Sender<ClusterEvent>> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Platform for FakePlatform {
    fn supervisor_launcher(&self) -> Arc<dyn RuntimeLauncher> {
        Arc::new(FakeLauncher {
            journal: self.journal.clone(),
            fail: self.fail == Some(Fail::Launch),
        })
    }

    async fn new_core(&self, ctx: CoreContext) -> Result<Arc<dyn DaemonCore>, CollaboratorError> {
        self.journal.record("core:new");
        if self.fail == Some(Fail::Core) {
            return Err("restore failed".into());
        }
        Ok(Arc::new(FakeCore::new(self.journal.clone(), ctx.config)))
    }

    async fn new_cluster(&self, _options: ClusterOptions) -> Result<Arc<dyn Cluster>, CollaboratorError> {
        self.journal.record("cluster:new");
        let (tx, rx) = mpsc::channel(8);
        *self.events.lock().unwrap() = Some(tx);
        Ok(Arc::new(FakeCluster {
            journal: self.journal.clone(),
            fail: self.fail == Some(Fail::Cluster),
            stream: Mutex::new(Some(rx)),
        }))
    }

    async fn new_build_backend(&self, options: BuildOptions) -> Result<Arc<dyn BuildBackend>, CollaboratorError> {
        self.journal.record("builder:new");
        if self.fail == Some(Fail::Builder) {
            return Err("snapshotter missing".into());
        }
        assert!(options.supervisor_address.ends_with("containerd.sock"));
        Ok(Arc::new(FakeBuilder {
            journal: self.journal.clone(),
            duplicate_route: self.fail == Some(Fail::DuplicateRoute),
        }))
    }
}

/// A valid configuration rooted in `dir`, listening on a unix socket there.
pub fn test_config(dir: &Path) -> DaemonConfig {
    let mut config = DaemonConfig {
        hosts: vec![format!("unix://{}", dir.join("engine.sock").display())],
        root: dir.join("lib"),
        exec_root: dir.join("run"),
        pidfile: Some(dir.join("engine.pid")),
        socket_group: String::new(),
        cdi_spec_dirs: Some(vec![dir.join("cdi")]),
        shutdown_timeout: 2,
        ..DaemonConfig::default()
    };
    config.runtime.socket = dir.join("system/containerd.sock");
    config.runtime.ready_timeout_secs = 5;
    config
}

/// Test options: no deterrent pauses, no OS signal handlers.
pub fn test_options() -> OrchestratorOptions {
    OrchestratorOptions {
        deterrents: DeterrentDelays {
            unverified: Duration::ZERO,
            insecure: Duration::ZERO,
        },
        grace: Duration::from_millis(200),
        ..OrchestratorOptions::default()
    }
}

/// Build an orchestrator over `platform` with an already finalised config.
pub fn orchestrator(platform: Arc<FakePlatform>, config: DaemonConfig) -> Orchestrator {
    let config = finalize(config).unwrap();
    Orchestrator::new(
        platform,
        ConfigSource::flags_only(FlagOverrides::default()),
        config,
        LogHandle::detached(false),
    )
    .with_options(test_options())
}

pub struct Running {
    pub task: JoinHandle<Result<(), DaemonError>>,
    pub states: watch::Receiver<RunState>,
    pub stop: engine_daemon::ShutdownSignal,
}

pub fn spawn(orchestrator: Orchestrator) -> Running {
    let states = orchestrator.subscribe();
    let stop = orchestrator.shutdown_signal();
    Running {
        task: tokio::spawn(orchestrator.run()),
        states,
        stop,
    }
}

impl Running {
    /// Wait until the daemon serves, returning the bound addresses.
    pub async fn serving(&mut self) -> Vec<String> {
        let state = tokio::time::timeout(
            Duration::from_secs(10),
            self.states.wait_for(|s| matches!(s, RunState::Serving { .. })),
        )
        .await
        .expect("daemon never started serving")
        .expect("orchestrator dropped its state");
        match &*state {
            RunState::Serving { addresses } => addresses.clone(),
            _ => unreachable!(),
        }
    }

    pub async fn finish(self) -> Result<(), DaemonError> {
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("orchestrator did not return")
            .expect("orchestrator panicked")
    }
}
