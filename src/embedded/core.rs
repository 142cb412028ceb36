//! In-process daemon core answering the system routes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::routing::get;
use axum::Json;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::schema::DaemonConfig;
use crate::daemon::{ClusterEvent, CollaboratorError, CoreContext, DaemonCore, DeviceRegistry};
use crate::http::middleware::{DEFAULT_API_VERSION, MIN_SUPPORTED_API_VERSION};
use crate::http::router::ApiRouter;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionInfo {
    pub version: &'static str,
    #[serde(rename = "ApiVersion")]
    pub api_version: String,
    #[serde(rename = "MinAPIVersion")]
    pub min_api_version: String,
    pub os: &'static str,
    pub arch: &'static str,
    pub experimental: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemInfo {
    #[serde(rename = "ID")]
    pub id: String,
    pub debug: bool,
    pub experimental: bool,
    pub hosts: Vec<String>,
    pub containerd_address: String,
    pub authorization_plugins: Vec<String>,
    pub device_drivers: Vec<String>,
    pub features: BTreeMap<String, bool>,
}

struct Inner {
    id: String,
    config: ArcSwap<DaemonConfig>,
    hosts: ArcSwap<Vec<String>>,
    supervisor_address: PathBuf,
    devices: Arc<DeviceRegistry>,
}

/// Minimal daemon core. Holds the applied configuration and nothing else.
#[derive(Clone)]
pub struct EmbeddedCore {
    inner: Arc<Inner>,
}

impl EmbeddedCore {
    pub fn new(ctx: CoreContext) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::info!(id = %id, containerd = %ctx.supervisor_address.display(), "Daemon core created");
        Self {
            inner: Arc::new(Inner {
                id,
                config: ArcSwap::from_pointee(ctx.config),
                hosts: ArcSwap::from_pointee(Vec::new()),
                supervisor_address: ctx.supervisor_address,
                devices: ctx.devices,
            }),
        }
    }

    pub fn version(&self) -> VersionInfo {
        let config = self.inner.config.load();
        VersionInfo {
            version: env!("CARGO_PKG_VERSION"),
            api_version: DEFAULT_API_VERSION.to_string(),
            min_api_version: config
                .min_api_version
                .clone()
                .unwrap_or_else(|| MIN_SUPPORTED_API_VERSION.to_string()),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            experimental: config.experimental,
        }
    }

    pub fn info(&self) -> SystemInfo {
        let config = self.inner.config.load();
        SystemInfo {
            id: self.inner.id.clone(),
            debug: config.debug_enabled(),
            experimental: config.experimental,
            hosts: self.inner.hosts.load().as_ref().clone(),
            containerd_address: self.inner.supervisor_address.display().to_string(),
            authorization_plugins: config.authorization_plugins.clone(),
            device_drivers: self.inner.devices.names(),
            features: config.features.clone(),
        }
    }
}

#[async_trait]
impl DaemonCore for EmbeddedCore {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn config(&self) -> DaemonConfig {
        self.inner.config.load().as_ref().clone()
    }

    fn store_hosts(&self, hosts: Vec<String>) {
        self.inner.hosts.store(Arc::new(hosts));
    }

    fn has_experimental(&self) -> bool {
        self.inner.config.load().experimental
    }

    fn features(&self) -> BTreeMap<String, bool> {
        self.inner.config.load().features.clone()
    }

    fn shutdown_timeout(&self) -> i64 {
        self.inner.config.load().shutdown_timeout
    }

    async fn shutdown(&self, cancel: CancellationToken) {
        if cancel.is_cancelled() {
            tracing::warn!("Daemon core shutdown cancelled");
            return;
        }
        tracing::info!(id = %self.inner.id, "Daemon core stopped");
    }

    async fn reload(&self, config: &DaemonConfig) -> Result<(), CollaboratorError> {
        self.inner.config.store(Arc::new(config.clone()));
        Ok(())
    }

    async fn restart_swarm_containers(&self) {
        tracing::debug!("No cluster-attached containers to restart");
    }

    async fn process_cluster_event(&self, event: ClusterEvent) {
        tracing::debug!(kind = %event.kind, action = %event.action, id = %event.id, "Cluster event");
    }

    fn routers(&self) -> Vec<ApiRouter> {
        let version = self.clone();
        let info = self.clone();
        vec![ApiRouter::new("system")
            .route("/_ping", get(|| async { "OK" }).head(|| async {}))
            .route(
                "/version",
                get(move || {
                    let core = version.clone();
                    async move { Json(core.version()) }
                }),
            )
            .route(
                "/info",
                get(move || {
                    let core = info.clone();
                    async move { Json(core.info()) }
                }),
            )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::PluginStore;
    use crate::http::middleware::AuthzMiddleware;
    use crate::net::PortAllocator;

    fn core(config: DaemonConfig) -> EmbeddedCore {
        let plugins = Arc::new(PluginStore::new());
        EmbeddedCore::new(CoreContext {
            config,
            supervisor_address: PathBuf::from("/run/containerd/containerd.sock"),
            authz: Arc::new(AuthzMiddleware::new(Vec::new(), Arc::clone(&plugins))),
            plugins,
            devices: Arc::new(DeviceRegistry::new()),
            ports: Arc::new(PortAllocator::new()),
        })
    }

    #[tokio::test]
    async fn reload_replaces_config() {
        let core = core(DaemonConfig::default());
        assert!(!core.has_experimental());

        let updated = DaemonConfig {
            experimental: true,
            shutdown_timeout: 3,
            ..DaemonConfig::default()
        };
        core.reload(&updated).await.unwrap();
        assert!(core.has_experimental());
        assert_eq!(core.shutdown_timeout(), 3);
        assert_eq!(core.config(), updated);
    }

    #[test]
    fn info_reports_stored_hosts() {
        let core = core(DaemonConfig::default());
        core.store_hosts(vec!["unix:///var/run/engine.sock".into()]);
        let info = core.info();
        assert_eq!(info.hosts, ["unix:///var/run/engine.sock"]);
        assert_eq!(info.containerd_address, "/run/containerd/containerd.sock");
        assert_eq!(info.id, core.id());
    }

    #[test]
    fn version_uses_configured_minimum() {
        let core = core(DaemonConfig {
            min_api_version: Some("1.40".into()),
            ..DaemonConfig::default()
        });
        let version = core.version();
        assert_eq!(version.min_api_version, "1.40");
        assert_eq!(version.api_version, DEFAULT_API_VERSION.to_string());
    }
}
