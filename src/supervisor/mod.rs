//! Container runtime supervisor bootstrap.
//!
//! # Data Flow
//! ```text
//! bootstrap()
//!     → system socket present (lstat)?  → SupervisorHandle::External
//!     → otherwise StartOptions::from_config
//!         → ManagedSupervisor::start (launch, await socket, monitor)
//!         → SupervisorHandle::Managed
//! ```
//!
//! Runs before the daemon core exists, because the core reconciles its
//! persisted workloads against the runtime while it starts.

pub mod managed;
pub mod options;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::schema::DaemonConfig;

pub use managed::{ManagedSupervisor, ProcessLauncher, RuntimeLauncher, RuntimeProcess};
pub use options::StartOptions;

/// Bound on how long a managed supervisor gets to exit after SIGTERM.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("could not determine whether the system containerd is running: no user runtime directory")]
    NoRuntimeDir,

    #[error("failed to generate containerd options: {0}")]
    Options(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for containerd: {0}")]
    Wait(#[source] io::Error),

    #[error("failed to signal containerd: {0}")]
    Signal(String),

    #[error("containerd exited before it was ready: {0}")]
    ExitedEarly(String),

    #[error("timeout waiting for containerd socket {address} after {timeout:?}")]
    NotReady { address: PathBuf, timeout: Duration },
}

/// The runtime supervisor the daemon talks to.
#[derive(Debug)]
pub enum SupervisorHandle {
    /// A system-wide instance; the daemon does not own it.
    External { address: PathBuf },
    /// An instance started and stopped by this daemon.
    Managed(ManagedSupervisor),
}

impl SupervisorHandle {
    pub fn address(&self) -> &Path {
        match self {
            SupervisorHandle::External { address } => address,
            SupervisorHandle::Managed(managed) => managed.address(),
        }
    }

    pub fn is_managed(&self) -> bool {
        matches!(self, SupervisorHandle::Managed(_))
    }

    /// Stop the supervisor if this daemon owns it.
    pub async fn stop(self) {
        if let SupervisorHandle::Managed(managed) = self {
            managed.stop().await;
        }
    }
}

/// Where a system-wide runtime would listen, and whether it is there.
pub fn system_runtime_running(config: &DaemonConfig) -> Result<(PathBuf, bool), SupervisorError> {
    let address = if config.rootless {
        dirs::runtime_dir()
            .ok_or(SupervisorError::NoRuntimeDir)?
            .join("containerd")
            .join("containerd.sock")
    } else {
        config.runtime.socket.clone()
    };
    let running = std::fs::symlink_metadata(&address).is_ok();
    Ok((address, running))
}

/// Adopt a running system supervisor, or start a managed one.
pub async fn bootstrap(
    config: &DaemonConfig,
    launcher: Arc<dyn RuntimeLauncher>,
) -> Result<SupervisorHandle, SupervisorError> {
    let (address, running) = system_runtime_running(config)?;
    if running {
        tracing::info!(address = %address.display(), "Using system containerd");
        return Ok(SupervisorHandle::External { address });
    }

    tracing::info!("containerd not running, starting managed containerd");
    let options = StartOptions::from_config(config);
    let managed = ManagedSupervisor::start(launcher, options, STOP_TIMEOUT).await?;
    Ok(SupervisorHandle::Managed(managed))
}
