//! Top-level daemon errors. Every startup failure names the step it came
//! from.

use std::io;

use thiserror::Error;

use crate::config::loader::ConfigError;
use crate::daemon::devices::DeviceError;
use crate::daemon::plugins::PluginError;
use crate::daemon::CollaboratorError;
use crate::http::middleware::MiddlewareError;
use crate::http::router::RouteError;
use crate::http::server::ServeError;
use crate::lifecycle::StartupStep;
use crate::net::tls::TlsError;
use crate::net::ListenerError;
use crate::observability::metrics::MetricsError;
use crate::orchestrator::paths::PathError;
use crate::supervisor::SupervisorError;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] TlsError),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),

    #[error(transparent)]
    Paths(#[from] PathError),

    #[error("failed to load listeners: {0}")]
    Listeners(#[source] ListenerError),

    #[error("failed to start containerd: {0}")]
    Supervisor(#[source] SupervisorError),

    #[error("failed to start API server: {0}")]
    Middleware(#[source] MiddlewareError),

    #[error("failed to register device drivers: {0}")]
    Devices(#[source] DeviceError),

    #[error("failed to start daemon: {0}")]
    Core(#[source] CollaboratorError),

    #[error("failed to validate authorization plugin: {0}")]
    Authz(#[source] PluginError),

    #[error("failed to start metrics server: {0}")]
    Metrics(#[source] MetricsError),

    #[error("failed to start cluster component: {0}")]
    Cluster(#[source] CollaboratorError),

    #[error("error initializing build backend: {0}")]
    Builder(#[source] CollaboratorError),

    #[error("failed to compose API routes: {0}")]
    Routes(#[source] RouteError),

    #[error("shutting down due to ServeAPI error: {0}")]
    Serve(#[source] ServeError),
}

impl DaemonError {
    /// The startup step that failed.
    pub fn step(&self) -> StartupStep {
        match self {
            DaemonError::Config(_) | DaemonError::Tls(_) | DaemonError::Signals(_) | DaemonError::Paths(_) => {
                StartupStep::Config
            }
            DaemonError::Listeners(_) => StartupStep::Listeners,
            DaemonError::Supervisor(_) => StartupStep::Supervisor,
            DaemonError::Middleware(_) => StartupStep::Middleware,
            DaemonError::Devices(_) => StartupStep::Devices,
            DaemonError::Core(_) => StartupStep::Core,
            DaemonError::Authz(_) => StartupStep::Authz,
            DaemonError::Metrics(_) => StartupStep::Metrics,
            DaemonError::Cluster(_) => StartupStep::Cluster,
            DaemonError::Builder(_) => StartupStep::Builder,
            DaemonError::Routes(_) => StartupStep::Routes,
            DaemonError::Serve(_) => StartupStep::Serve,
        }
    }
}
