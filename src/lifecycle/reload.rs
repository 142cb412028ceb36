//! Configuration hot-reload.
//!
//! # Responsibilities
//! - Carry reload requests from signals and the file watcher to one consumer
//! - Re-load and re-validate the configuration, then the authorization plugins
//! - Apply to the daemon core, and only then to the plugin list and debug mode
//!
//! # Design Decisions
//! - All-or-nothing: any failure leaves the previous configuration in force
//! - Requests arriving while one is pending coalesce into it

use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::loader::{ConfigError, ConfigSource};
use crate::config::schema::DaemonConfig;
use crate::daemon::plugins::{validate_authz_plugins, PluginError, PluginStore};
use crate::daemon::{CollaboratorError, DaemonCore};
use crate::http::middleware::AuthzMiddleware;
use crate::observability::metrics::record_reload;
use crate::observability::LogHandle;

/// What asked for a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTrigger {
    Signal,
    FileChanged,
    Manual,
}

impl std::fmt::Display for ReloadTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReloadTrigger::Signal => write!(f, "signal"),
            ReloadTrigger::FileChanged => write!(f, "file"),
            ReloadTrigger::Manual => write!(f, "manual"),
        }
    }
}

/// Sending side of the reload channel.
#[derive(Debug, Clone)]
pub struct ReloadGate {
    tx: mpsc::Sender<ReloadTrigger>,
}

/// Receiving side of the reload channel.
#[derive(Debug)]
pub struct ReloadRequests {
    rx: mpsc::Receiver<ReloadTrigger>,
}

/// Create the reload channel.
pub fn reload_gate() -> (ReloadGate, ReloadRequests) {
    let (tx, rx) = mpsc::channel(1);
    (ReloadGate { tx }, ReloadRequests { rx })
}

impl ReloadGate {
    /// Queue a reload. Returns `false` if one was already pending or the
    /// consumer is gone.
    pub fn request(&self, trigger: ReloadTrigger) -> bool {
        match self.tx.try_send(trigger) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(%trigger, "Reload already pending");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl ReloadRequests {
    pub async fn next(&mut self) -> Option<ReloadTrigger> {
        self.rx.recv().await
    }
}

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to validate authorization plugin: {0}")]
    Authz(#[from] PluginError),

    #[error("failed to apply configuration: {0}")]
    Core(CollaboratorError),
}

/// Applies reloads against the running daemon.
pub struct ReloadController {
    source: ConfigSource,
    core: Arc<dyn DaemonCore>,
    plugins: Arc<PluginStore>,
    authz: Arc<AuthzMiddleware>,
    log: LogHandle,
    live: Arc<ArcSwap<DaemonConfig>>,
}

impl ReloadController {
    pub fn new(
        source: ConfigSource,
        core: Arc<dyn DaemonCore>,
        plugins: Arc<PluginStore>,
        authz: Arc<AuthzMiddleware>,
        log: LogHandle,
        live: Arc<ArcSwap<DaemonConfig>>,
    ) -> Self {
        Self {
            source,
            core,
            plugins,
            authz,
            log,
            live,
        }
    }

    /// Load and apply the configuration once.
    pub async fn reload(&self) -> Result<(), ReloadError> {
        let config = self.source.load()?;
        validate_authz_plugins(&config.authorization_plugins, &self.plugins)?;

        self.core.reload(&config).await.map_err(ReloadError::Core)?;

        self.authz.set_plugins(config.authorization_plugins.clone());
        if let Some(debug) = config.debug {
            if debug != self.log.debug_enabled() {
                match self.log.set_debug(debug) {
                    Ok(()) if debug => tracing::debug!("Enabling debug logging"),
                    Ok(()) => tracing::info!("Disabling debug logging"),
                    Err(e) => tracing::warn!(error = %e, "Failed to toggle debug logging"),
                }
            }
        }

        let applied = serde_json::to_string(&self.core.config()).unwrap_or_default();
        self.live.store(Arc::new(config));
        tracing::info!(config = %applied, "Reloaded configuration");
        Ok(())
    }

    /// Consume reload requests until `cancel` fires or every gate is dropped.
    pub fn spawn(self, mut requests: ReloadRequests, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let trigger = tokio::select! {
                    _ = cancel.cancelled() => return,
                    trigger = requests.next() => match trigger {
                        Some(trigger) => trigger,
                        None => return,
                    },
                };
                tracing::info!(%trigger, "Reloading configuration");
                match self.reload().await {
                    Ok(()) => record_reload("applied"),
                    Err(e) => {
                        record_reload("rejected");
                        tracing::error!(error = %e, "Error reconfiguring the daemon");
                    }
                }
            }
        })
    }
}
