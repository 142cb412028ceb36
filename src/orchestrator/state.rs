//! The single value holding everything the orchestrator started.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::schema::DaemonConfig;
use crate::daemon::{BuildBackend, Cluster, DaemonCore, DeviceRegistry, PluginStore};
use crate::http::ApiServer;
use crate::lifecycle::{ReloadGate, ShutdownCoordinator, ShutdownSignal, TeardownStack};
use crate::net::{PortAllocator, SecurityPolicy};

/// Externally observable progress of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Starting,
    /// Handler installed, listeners about to serve. Tcp addresses carry the
    /// port actually bound.
    Serving { addresses: Vec<String> },
    Stopping,
    Stopped,
}

/// Process-wide orchestrator state. Subsystem handles are written only by
/// the orchestrator task, during startup and teardown.
pub struct OrchestratorState {
    pub live: Arc<ArcSwap<DaemonConfig>>,
    pub policy: Option<SecurityPolicy>,
    pub hosts: Vec<String>,
    pub supervisor_address: Option<PathBuf>,
    pub plugins: Arc<PluginStore>,
    pub devices: Arc<DeviceRegistry>,
    pub ports: Arc<PortAllocator>,
    pub server: Arc<ApiServer>,
    /// Finalised before the teardown stack unwinds.
    pub coordinator: Option<ShutdownCoordinator>,
    pub core: Option<Arc<dyn DaemonCore>>,
    pub cluster: Option<Arc<dyn Cluster>>,
    pub builder: Option<Arc<dyn BuildBackend>>,
    pub stop: ShutdownSignal,
    pub reload: ReloadGate,
    /// Cancelled once serving ends; stops background fan-out and reloads.
    pub background: CancellationToken,
    pub teardown: TeardownStack,
    pub run_state: Arc<watch::Sender<RunState>>,
}

impl std::fmt::Debug for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorState")
            .field("hosts", &self.hosts)
            .field("supervisor_address", &self.supervisor_address)
            .field("core", &self.core.as_ref().map(|c| c.id()))
            .field("cluster", &self.cluster.is_some())
            .field("builder", &self.builder.is_some())
            .field("teardown", &self.teardown)
            .finish_non_exhaustive()
    }
}

impl OrchestratorState {
    pub fn new(
        live: Arc<ArcSwap<DaemonConfig>>,
        stop: ShutdownSignal,
        reload: ReloadGate,
        ports: Arc<PortAllocator>,
        run_state: Arc<watch::Sender<RunState>>,
    ) -> Self {
        Self {
            live,
            policy: None,
            hosts: Vec::new(),
            supervisor_address: None,
            plugins: Arc::new(PluginStore::new()),
            devices: Arc::new(DeviceRegistry::new()),
            ports,
            server: Arc::new(ApiServer::new()),
            coordinator: None,
            core: None,
            cluster: None,
            builder: None,
            stop,
            reload,
            background: CancellationToken::new(),
            teardown: TeardownStack::new(),
            run_state,
        }
    }

    /// Snapshot of the live configuration.
    pub fn config(&self) -> Arc<DaemonConfig> {
        self.live.load_full()
    }

    pub fn set_run_state(&self, state: RunState) {
        self.run_state.send_replace(state);
    }
}
