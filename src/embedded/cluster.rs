//! Cluster component that never joins a swarm.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::routing::{any, MethodRouter};
use tokio::sync::mpsc;

use crate::daemon::{Cluster, ClusterEvent, ClusterOptions, CollaboratorError, DaemonCore};
use crate::http::middleware::error_response;
use crate::http::router::ApiRouter;

pub const NOT_A_MANAGER: &str = "This node is not a swarm manager. Use \"engine swarm init\" or \"engine swarm join\" to connect this node to swarm and try again.";

const SWARM_PATHS: [&str; 6] = ["/swarm", "/nodes", "/services", "/tasks", "/secrets", "/configs"];

/// Inactive cluster. Owns the watch stream so the orchestrator's fan-out task
/// has something to drain.
pub struct EmbeddedCluster {
    root: PathBuf,
    run_root: PathBuf,
    backend: Arc<dyn DaemonCore>,
    events: mpsc::Sender<ClusterEvent>,
    stream: Mutex<Option<mpsc::Receiver<ClusterEvent>>>,
}

impl EmbeddedCluster {
    pub fn new(options: ClusterOptions) -> Self {
        let (events, stream) = mpsc::channel(32);
        Self {
            root: options.root,
            run_root: options.run_root,
            backend: options.backend,
            events,
            stream: Mutex::new(Some(stream)),
        }
    }

    /// Sender for cluster notifications.
    pub fn events(&self) -> mpsc::Sender<ClusterEvent> {
        self.events.clone()
    }
}

fn not_a_manager() -> MethodRouter {
    any(|| async { error_response(StatusCode::SERVICE_UNAVAILABLE, NOT_A_MANAGER) })
}

#[async_trait]
impl Cluster for EmbeddedCluster {
    async fn start(&self) -> Result<(), CollaboratorError> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::create_dir_all(&self.run_root).await?;
        tracing::info!(
            root = %self.root.display(),
            backend = %self.backend.id(),
            "Cluster component inactive, node is not part of a swarm"
        );
        Ok(())
    }

    async fn cleanup(&self) {
        tracing::debug!("Cluster component stopped");
    }

    fn take_watch_stream(&self) -> Option<mpsc::Receiver<ClusterEvent>> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn routers(&self) -> Vec<ApiRouter> {
        let router = SWARM_PATHS
            .iter()
            .fold(ApiRouter::new("swarm"), |router, path| router.route(*path, not_a_manager()));
        vec![router]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedded::core::EmbeddedCore;
    use crate::daemon::{CoreContext, DeviceRegistry, PluginStore};
    use crate::config::schema::{DaemonConfig, SwarmConfig};
    use crate::http::middleware::AuthzMiddleware;
    use crate::net::PortAllocator;

    fn cluster(dir: &std::path::Path) -> EmbeddedCluster {
        let plugins = Arc::new(PluginStore::new());
        let core = EmbeddedCore::new(CoreContext {
            config: DaemonConfig::default(),
            supervisor_address: PathBuf::from("/run/containerd/containerd.sock"),
            authz: Arc::new(AuthzMiddleware::new(Vec::new(), Arc::clone(&plugins))),
            plugins,
            devices: Arc::new(DeviceRegistry::new()),
            ports: Arc::new(PortAllocator::new()),
        });
        EmbeddedCluster::new(ClusterOptions {
            root: dir.join("swarm"),
            run_root: dir.join("run/swarm"),
            swarm: SwarmConfig::default(),
            backend: Arc::new(core),
        })
    }

    #[tokio::test]
    async fn start_creates_state_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster(dir.path());
        cluster.start().await.unwrap();
        assert!(dir.path().join("swarm").is_dir());
        assert!(dir.path().join("run/swarm").is_dir());
    }

    #[tokio::test]
    async fn watch_stream_is_handed_out_once() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster(dir.path());
        let mut stream = cluster.take_watch_stream().unwrap();
        assert!(cluster.take_watch_stream().is_none());

        let event = ClusterEvent {
            kind: "node".into(),
            action: "update".into(),
            id: "n1".into(),
        };
        cluster.events().send(event.clone()).await.unwrap();
        assert_eq!(stream.recv().await, Some(event));
    }
}
