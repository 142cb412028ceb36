//! In-process collaborators used by the `engined` binary.
//!
//! These implement just enough of the daemon core, cluster and build
//! backend contracts for the orchestrator to run end to end: system routes,
//! an inactive swarm, and build session bookkeeping.

pub mod builder;
pub mod cluster;
pub mod core;

use std::sync::Arc;

use async_trait::async_trait;

use crate::daemon::{
    BuildBackend, BuildOptions, Cluster, ClusterOptions, CollaboratorError, CoreContext, DaemonCore, Platform,
};
use crate::supervisor::{ProcessLauncher, RuntimeLauncher};

pub use self::builder::EmbeddedBuilder;
pub use self::cluster::EmbeddedCluster;
pub use self::core::EmbeddedCore;

/// Platform wiring the embedded collaborators to a real supervisor launcher.
pub struct EmbeddedPlatform {
    launcher: Arc<dyn RuntimeLauncher>,
}

impl EmbeddedPlatform {
    pub fn new() -> Self {
        Self::with_launcher(Arc::new(ProcessLauncher))
    }

    pub fn with_launcher(launcher: Arc<dyn RuntimeLauncher>) -> Self {
        Self { launcher }
    }
}

impl Default for EmbeddedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for EmbeddedPlatform {
    fn supervisor_launcher(&self) -> Arc<dyn RuntimeLauncher> {
        Arc::clone(&self.launcher)
    }

    async fn new_core(&self, ctx: CoreContext) -> Result<Arc<dyn DaemonCore>, CollaboratorError> {
        Ok(Arc::new(EmbeddedCore::new(ctx)))
    }

    async fn new_cluster(&self, options: ClusterOptions) -> Result<Arc<dyn Cluster>, CollaboratorError> {
        Ok(Arc::new(EmbeddedCluster::new(options)))
    }

    async fn new_build_backend(&self, options: BuildOptions) -> Result<Arc<dyn BuildBackend>, CollaboratorError> {
        Ok(Arc::new(EmbeddedBuilder::new(options).await?))
    }
}
