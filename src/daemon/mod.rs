//! Daemon collaborators.
//!
//! # Data Flow
//! ```text
//! Platform (factory, one per process)
//!     → new_core(CoreContext)            daemon core: containers, images, networks
//!     → new_cluster(ClusterOptions)      cluster membership, backed by the core
//!     → new_build_backend(BuildOptions)  image builds, wired to core + supervisor
//!
//! plugins.rs: authorization plugin registry
//! devices.rs: device-injection drivers (CDI)
//! build.rs:   build sessions and build requests
//! ```
//!
//! The orchestrator only talks to these traits, so the same startup and
//! teardown sequence drives the embedded implementations and test doubles.

pub mod build;
pub mod devices;
pub mod plugins;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::schema::{DaemonConfig, SwarmConfig};
use crate::http::middleware::AuthzMiddleware;
use crate::http::router::ApiRouter;
use crate::net::PortAllocator;
use crate::supervisor::RuntimeLauncher;

pub use build::{BuildManager, SessionManager};
pub use devices::{cdi_enabled, CdiCache, DeviceRegistry};
pub use plugins::{validate_authz_plugins, PluginStore};

/// Errors reported by collaborators. They are opaque to the orchestrator,
/// which only wraps them with the step that failed.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// A cluster notification forwarded to the daemon core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub kind: String,
    pub action: String,
    pub id: String,
}

/// Everything the daemon core is constructed with.
#[derive(Clone)]
pub struct CoreContext {
    pub config: DaemonConfig,
    /// Control socket of the container runtime supervisor.
    pub supervisor_address: PathBuf,
    pub plugins: Arc<PluginStore>,
    pub authz: Arc<AuthzMiddleware>,
    pub devices: Arc<DeviceRegistry>,
    pub ports: Arc<PortAllocator>,
}

pub struct ClusterOptions {
    pub root: PathBuf,
    pub run_root: PathBuf,
    pub swarm: SwarmConfig,
    pub backend: Arc<dyn DaemonCore>,
}

pub struct BuildOptions {
    pub root: PathBuf,
    pub core: Arc<dyn DaemonCore>,
    pub cluster: Arc<dyn Cluster>,
    pub sessions: Arc<SessionManager>,
    pub builds: Arc<BuildManager>,
    pub supervisor_address: PathBuf,
    pub cdi: Option<Arc<CdiCache>>,
}

/// The privileged daemon core.
#[async_trait]
pub trait DaemonCore: Send + Sync {
    fn id(&self) -> String;

    /// The configuration currently applied to the core.
    fn config(&self) -> DaemonConfig;

    /// Record the normalised API host list.
    fn store_hosts(&self, hosts: Vec<String>);

    fn has_experimental(&self) -> bool;

    fn features(&self) -> BTreeMap<String, bool>;

    /// Seconds the core may take to shut down; negative means unbounded.
    fn shutdown_timeout(&self) -> i64;

    /// Stop the core. Implementations should return early once `cancel` fires.
    async fn shutdown(&self, cancel: CancellationToken);

    /// Apply a validated configuration to the running core.
    async fn reload(&self, config: &DaemonConfig) -> Result<(), CollaboratorError>;

    /// Restart workloads that depend on cluster networking.
    async fn restart_swarm_containers(&self);

    async fn process_cluster_event(&self, event: ClusterEvent);

    fn routers(&self) -> Vec<ApiRouter>;
}

/// Cluster membership.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn start(&self) -> Result<(), CollaboratorError>;

    /// Leave the cluster and release its resources.
    async fn cleanup(&self);

    /// The notification stream. Only the first call gets it.
    fn take_watch_stream(&self) -> Option<mpsc::Receiver<ClusterEvent>>;

    fn routers(&self) -> Vec<ApiRouter>;
}

/// The image build backend.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    async fn close(&self) -> Result<(), CollaboratorError>;

    fn routers(&self) -> Vec<ApiRouter>;
}

/// Factory for every collaborator the orchestrator starts.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Launcher used when no system-wide runtime supervisor is running.
    fn supervisor_launcher(&self) -> Arc<dyn RuntimeLauncher>;

    async fn new_core(&self, ctx: CoreContext) -> Result<Arc<dyn DaemonCore>, CollaboratorError>;

    async fn new_cluster(&self, options: ClusterOptions) -> Result<Arc<dyn Cluster>, CollaboratorError>;

    async fn new_build_backend(&self, options: BuildOptions) -> Result<Arc<dyn BuildBackend>, CollaboratorError>;
}
