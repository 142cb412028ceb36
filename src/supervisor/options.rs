//! Start options for a managed runtime supervisor.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::config::schema::{DaemonConfig, LogFormat};

/// Name of the CRI plugin disabled unless explicitly requested.
pub const CRI_PLUGIN: &str = "io.containerd.grpc.v1.cri";

const SOCKET_NAME: &str = "containerd.sock";
const CONFIG_NAME: &str = "containerd.toml";

/// How a managed runtime supervisor is started.
#[derive(Debug, Clone, PartialEq)]
pub struct StartOptions {
    /// Binary to run. May be replaced by one found next to the daemon.
    pub binary: PathBuf,
    /// Persistent state, `<root>/containerd`.
    pub root: PathBuf,
    /// Runtime state holding the control socket, `<exec_root>/containerd`.
    pub state: PathBuf,
    pub log_level: String,
    pub log_format: Option<LogFormat>,
    pub cri_disabled: bool,
    /// Prefer a runtime binary shipped alongside the daemon executable.
    pub detect_local_binary: bool,
    pub ready_timeout: Duration,
}

impl StartOptions {
    pub fn from_config(config: &DaemonConfig) -> Self {
        let log_level = if config.debug_enabled() {
            "debug".to_string()
        } else {
            config.log_level.clone()
        };
        Self {
            binary: config.runtime.binary.clone(),
            root: config.root.join("containerd"),
            state: config.exec_root.join("containerd"),
            log_level,
            log_format: Some(config.log_format),
            cri_disabled: !config.runtime.cri_containerd,
            detect_local_binary: true,
            ready_timeout: Duration::from_secs(config.runtime.ready_timeout_secs),
        }
    }

    /// Control socket the managed instance listens on.
    pub fn address(&self) -> PathBuf {
        self.state.join(SOCKET_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.state.join(CONFIG_NAME)
    }

    /// The runtime's own TOML configuration.
    pub fn render_config(&self) -> Result<String, toml::ser::Error> {
        let disabled_plugins = if self.cri_disabled {
            vec![CRI_PLUGIN.to_string()]
        } else {
            Vec::new()
        };
        let file = RuntimeConfigFile {
            version: 2,
            root: &self.root,
            state: &self.state,
            disabled_plugins,
            grpc: GrpcSection {
                address: self.address(),
            },
            debug: DebugSection {
                level: &self.log_level,
                format: self.log_format.map(|f| f.to_string()),
            },
        };
        toml::to_string(&file)
    }

    pub fn args(&self) -> Vec<OsString> {
        vec![OsString::from("--config"), self.config_path().into_os_string()]
    }

    /// Binary to execute, preferring one next to the current executable when
    /// detection is on and the configured binary is a bare name.
    pub fn resolve_binary(&self) -> PathBuf {
        if self.detect_local_binary && self.binary.components().count() == 1 {
            let local = std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join(&self.binary)));
            if let Some(local) = local.filter(|p| p.is_file()) {
                return local;
            }
        }
        self.binary.clone()
    }
}

#[derive(Serialize)]
struct RuntimeConfigFile<'a> {
    version: u32,
    root: &'a Path,
    state: &'a Path,
    disabled_plugins: Vec<String>,
    grpc: GrpcSection,
    debug: DebugSection<'a>,
}

#[derive(Serialize)]
struct GrpcSection {
    address: PathBuf,
}

#[derive(Serialize)]
struct DebugSection<'a> {
    level: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
}
