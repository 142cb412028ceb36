//! Daemon startup, serving and teardown.
//!
//! # Data Flow
//! ```text
//! run()
//!     → start(): steps 1..=11, each success pushes its inverse
//!         config → [root dirs, pid file] → listeners → supervisor
//!         → [API server + shutdown watch] → middleware → devices → core
//!         → authz → metrics → cluster → builder → routes
//!     → serve(): step 12, ListenerPool until every listener returns
//!     → cancel background work, finalise the API server
//!     → TeardownStack::unwind() (same path for failure and shutdown)
//! ```

pub mod error;
pub mod paths;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::RecommendedWatcher;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::loader::{ConfigError, ConfigSource};
use crate::config::schema::DaemonConfig;
use crate::config::validation::validate_config;
use crate::config::watcher::ConfigWatcher;
use crate::daemon::devices::register_cdi_driver;
use crate::daemon::{
    cdi_enabled, validate_authz_plugins, BuildManager, BuildOptions, ClusterOptions, CollaboratorError, CoreContext,
    Platform,
    SessionManager,
};
use crate::http::router::compose;
use crate::http::{ListenerPool, MiddlewareChain};
use crate::lifecycle::shutdown::DEFAULT_GRACE_EXTENSION;
use crate::lifecycle::signals::spawn_signal_handlers;
use crate::lifecycle::startup::timed;
use crate::lifecycle::{
    reload_gate, shutdown_core, Notifier, Readiness, ReloadController, ReloadGate, ReloadRequests, ShutdownCoordinator,
    ShutdownSignal, StartupStep,
};
use crate::net::listener::DeterrentDelays;
use crate::net::{ApiListener, ListenerResolver, PortAllocator, SecurityPolicy};
use crate::observability::metrics::set_api_listeners;
use crate::observability::{LogHandle, MetricsServer};
use crate::supervisor;

pub use error::DaemonError;
pub use state::{OrchestratorState, RunState};

use paths::{create_daemon_root, PidFile};

/// Knobs that differ between the binary and tests.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub deterrents: DeterrentDelays,
    /// Extra time in-flight requests get after the stop signal.
    pub grace: Duration,
    pub notifier: Notifier,
    /// Install SIGINT/SIGTERM/SIGHUP handlers.
    pub signal_handlers: bool,
    /// Reload when the config file changes.
    pub watch_config: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            deterrents: DeterrentDelays::default(),
            grace: DEFAULT_GRACE_EXTENSION,
            notifier: Notifier::disabled(),
            signal_handlers: false,
            watch_config: false,
        }
    }
}

/// Brings the daemon up, serves, and tears it down.
pub struct Orchestrator {
    platform: Arc<dyn Platform>,
    source: ConfigSource,
    log: LogHandle,
    options: OrchestratorOptions,
    stop: ShutdownSignal,
    reload: ReloadGate,
    requests: Option<ReloadRequests>,
    live: Arc<ArcSwap<DaemonConfig>>,
    ports: Arc<PortAllocator>,
    run_state: Arc<watch::Sender<RunState>>,
    signals: Option<JoinHandle<()>>,
    watcher: Option<RecommendedWatcher>,
}

impl Orchestrator {
    /// `config` is the configuration already loaded from `source`; reloads
    /// read `source` again.
    pub fn new(platform: Arc<dyn Platform>, source: ConfigSource, config: DaemonConfig, log: LogHandle) -> Self {
        let (reload, requests) = reload_gate();
        let (run_state, _) = watch::channel(RunState::Starting);
        Self {
            platform,
            source,
            log,
            options: OrchestratorOptions::default(),
            stop: ShutdownSignal::new(),
            reload,
            requests: Some(requests),
            live: Arc::new(ArcSwap::from_pointee(config)),
            ports: Arc::new(PortAllocator::new()),
            run_state: Arc::new(run_state),
            signals: None,
            watcher: None,
        }
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.stop.clone()
    }

    pub fn reload_gate(&self) -> ReloadGate {
        self.reload.clone()
    }

    /// The configuration in force. Replaced only by a successful reload.
    pub fn live_config(&self) -> Arc<ArcSwap<DaemonConfig>> {
        Arc::clone(&self.live)
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.run_state.subscribe()
    }

    /// Run the daemon to completion.
    pub async fn run(mut self) -> Result<(), DaemonError> {
        let mut state = OrchestratorState::new(
            Arc::clone(&self.live),
            self.stop.clone(),
            self.reload.clone(),
            Arc::clone(&self.ports),
            Arc::clone(&self.run_state),
        );
        state.set_run_state(RunState::Starting);

        let result = match self.start(&mut state).await {
            Ok(listeners) => self.serve(&state, listeners).await,
            Err(e) => {
                tracing::error!(step = %e.step(), error = %e, "Startup failed");
                Err(e)
            }
        };

        state.background.cancel();
        self.watcher.take();
        if let Some(coordinator) = state.coordinator.take() {
            coordinator.finish().await;
        }
        // Strict reverse of startup: builder, cluster, metrics, core,
        // supervisor, pid file. The builder closes before the core it uses.
        std::mem::take(&mut state.teardown).unwind().await;
        if let Some(signals) = self.signals.take() {
            signals.abort();
        }

        state.set_run_state(RunState::Stopped);
        if result.is_ok() {
            tracing::info!("Daemon shutdown complete");
        }
        result
    }

    async fn start(&mut self, state: &mut OrchestratorState) -> Result<Vec<ApiListener>, DaemonError> {
        tracing::info!("Starting up");
        let config = state.config();

        // 1. configuration, TLS policy, reload gate
        let policy = timed(StartupStep::Config, async {
            validate_config(&config).map_err(|e| DaemonError::Config(ConfigError::Validation(e)))?;
            SecurityPolicy::from_config(&config).map_err(DaemonError::from)
        })
        .await?;
        tracing::debug!(class = ?policy.class(), "API security policy");
        state.policy = Some(policy.clone());

        if self.options.signal_handlers {
            let handlers = spawn_signal_handlers(state.stop.clone(), state.reload.clone()).map_err(DaemonError::Signals)?;
            self.signals = Some(handlers);
        }
        if self.options.watch_config {
            if let Some(path) = self.source.file() {
                match ConfigWatcher::new(path, state.reload.clone()).run() {
                    Ok(watcher) => self.watcher = Some(watcher),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "Cannot watch config file"),
                }
            }
        }

        create_daemon_root(&config)?;
        if let Some(path) = &config.pidfile {
            let pidfile = PidFile::write(path)?;
            state.teardown.push("pidfile", move || async move { pidfile.remove() });
        }
        if config.rootless {
            tracing::warn!("Running in rootless mode. This mode has feature limitations.");
        }
        if config.experimental {
            tracing::warn!("Running with experimental features enabled");
        }

        // 2. listeners
        let resolver = ListenerResolver::new(Arc::clone(&state.ports), config.socket_group.clone())
            .with_delays(self.options.deterrents);
        let resolution = timed(StartupStep::Listeners, resolver.resolve(&config.hosts, &policy))
            .await
            .map_err(DaemonError::Listeners)?;
        state.hosts = resolution.hosts.clone();
        let listeners = resolution.listeners;

        // 3. runtime supervisor
        let handle = timed(
            StartupStep::Supervisor,
            supervisor::bootstrap(&config, self.platform.supervisor_launcher()),
        )
        .await
        .map_err(DaemonError::Supervisor)?;
        let supervisor_address = handle.address().to_path_buf();
        state.supervisor_address = Some(supervisor_address.clone());
        if handle.is_managed() {
            state.teardown.push("supervisor", move || handle.stop());
        }

        state.coordinator = Some(ShutdownCoordinator::spawn(
            state.stop.clone(),
            Arc::clone(&state.server),
            self.options.grace,
        ));
        self.options.notifier.notify_or_log(Readiness::Starting).await;

        // 4. middleware
        let chain = timed(StartupStep::Middleware, async {
            MiddlewareChain::new(&config, Arc::clone(&state.plugins))
        })
        .await
        .map_err(DaemonError::Middleware)?;

        // 5. device drivers
        let cdi = timed(StartupStep::Devices, async {
            if !cdi_enabled(&config) {
                return Ok(None);
            }
            let dirs = config.cdi_spec_dirs.clone().unwrap_or_default();
            register_cdi_driver(&state.devices, &dirs).map(Some)
        })
        .await
        .map_err(DaemonError::Devices)?;

        // 6. daemon core
        let ctx = CoreContext {
            config: (*config).clone(),
            supervisor_address: supervisor_address.clone(),
            plugins: Arc::clone(&state.plugins),
            authz: chain.authz(),
            devices: Arc::clone(&state.devices),
            ports: Arc::clone(&state.ports),
        };
        let core = timed(StartupStep::Core, self.platform.new_core(ctx))
            .await
            .map_err(DaemonError::Core)?;
        core.store_hosts(state.hosts.clone());
        state.core = Some(Arc::clone(&core));
        {
            let core = Arc::clone(&core);
            state.teardown.push("core", move || async move {
                shutdown_core(core, CancellationToken::new()).await;
            });
        }

        if let Some(requests) = self.requests.take() {
            let controller = ReloadController::new(
                self.source.clone(),
                Arc::clone(&core),
                Arc::clone(&state.plugins),
                chain.authz(),
                self.log.clone(),
                Arc::clone(&state.live),
            );
            controller.spawn(requests, state.background.clone());
        }

        // 7. authorization plugins, after the core restored its plugins
        timed(StartupStep::Authz, async {
            validate_authz_plugins(&config.authorization_plugins, &state.plugins)
        })
        .await
        .map_err(DaemonError::Authz)?;

        // 8. metrics
        if let Some(address) = &config.metrics_address {
            let metrics = timed(StartupStep::Metrics, MetricsServer::start(address))
                .await
                .map_err(DaemonError::Metrics)?;
            state.teardown.push("metrics", move || metrics.stop());
        }

        // 9. cluster
        let swarm = config.swarm.clone();
        let options = ClusterOptions {
            root: config.root.join("swarm"),
            run_root: swarm.run_root.clone().unwrap_or_else(|| config.exec_root.join("swarm")),
            swarm,
            backend: Arc::clone(&core),
        };
        let cluster = timed(StartupStep::Cluster, async {
            let cluster = self.platform.new_cluster(options).await?;
            cluster.start().await?;
            Ok::<_, CollaboratorError>(cluster)
        })
        .await
        .map_err(DaemonError::Cluster)?;
        state.cluster = Some(Arc::clone(&cluster));
        {
            let cluster = Arc::clone(&cluster);
            state.teardown.push("cluster", move || async move { cluster.cleanup().await });
        }
        core.restart_swarm_containers().await;
        if let Some(mut events) = cluster.take_watch_stream() {
            let core = Arc::clone(&core);
            let cancel = state.background.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.recv() => match event {
                            Some(event) => core.process_cluster_event(event).await,
                            None => break,
                        },
                    }
                }
            });
        }

        // 10. build backend
        let options = BuildOptions {
            root: config.root.join("builder"),
            core: Arc::clone(&core),
            cluster: Arc::clone(&cluster),
            sessions: Arc::new(SessionManager::new()),
            builds: Arc::new(BuildManager::new()),
            supervisor_address,
            cdi,
        };
        let builder = timed(StartupStep::Builder, self.platform.new_build_backend(options))
            .await
            .map_err(DaemonError::Builder)?;
        state.builder = Some(Arc::clone(&builder));
        {
            let builder = Arc::clone(&builder);
            state.teardown.push("builder", move || async move {
                if let Err(e) = builder.close().await {
                    tracing::error!(error = %e, "Failed to close build backend");
                }
            });
        }

        // 11. routes
        let handler = timed(StartupStep::Routes, async {
            let mut routers = core.routers();
            routers.extend(cluster.routers());
            routers.extend(builder.routers());
            compose(routers, core.has_experimental()).map(|routes| chain.wrap(routes))
        })
        .await
        .map_err(DaemonError::Routes)?;

        // 12. install the handler; serving starts in serve()
        state.server.set_handler(handler);
        Ok(listeners)
    }

    async fn serve(&self, state: &OrchestratorState, listeners: Vec<ApiListener>) -> Result<(), DaemonError> {
        let addresses = listeners
            .iter()
            .map(|l| match l.local_addr() {
                Some(addr) => format!("tcp://{addr}"),
                None => l.spec().canonical(),
            })
            .collect();
        set_api_listeners(listeners.len());

        self.options.notifier.notify_or_log(Readiness::Ready).await;
        tracing::info!("Daemon has completed initialization");
        state.set_run_state(RunState::Serving { addresses });

        let server = Arc::clone(&state.server);
        let failed = ListenerPool::run(listeners, &state.stop, move |listener| {
            let server = Arc::clone(&server);
            async move { server.serve(listener).await }
        })
        .await;

        state.set_run_state(RunState::Stopping);
        set_api_listeners(0);
        self.options.notifier.notify_or_log(Readiness::Stopping).await;

        match failed {
            Some(e) => Err(DaemonError::Serve(e)),
            None => Ok(()),
        }
    }
}
