//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the daemon.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default `shutdown_timeout` in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT: i64 = 15;

/// Root configuration for the daemon.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// API listen addresses (`proto://addr`). Normalised at load time.
    pub hosts: Vec<String>,

    /// Serve the API over TLS. `None` means "not set".
    pub tls: Option<bool>,

    /// Require and verify client certificates. Setting it at all forces TLS on.
    #[serde(rename = "tlsverify")]
    pub tls_verify: Option<bool>,

    /// Certificate material for the API listeners.
    pub tls_options: TlsOptions,

    /// Debug mode. `None` means "not set", which matters on reload.
    pub debug: Option<bool>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable experimental API routes.
    pub experimental: bool,

    /// Seconds to wait for the daemon core to stop. Negative means unbounded.
    pub shutdown_timeout: i64,

    /// Oldest API version clients may negotiate.
    pub min_api_version: Option<String>,

    /// Authorization plugins consulted for every API request, in order.
    pub authorization_plugins: Vec<String>,

    /// Feature toggles (e.g. `cdi`).
    pub features: BTreeMap<String, bool>,

    /// Persistent state directory.
    pub root: PathBuf,

    /// Runtime state directory (sockets, pid files of children).
    pub exec_root: PathBuf,

    /// Pid file location. `None` disables the pid file.
    pub pidfile: Option<PathBuf>,

    /// Group owning unix API sockets. Empty skips the chown.
    pub socket_group: String,

    /// Prometheus metrics listen address. `None` disables the endpoint.
    pub metrics_address: Option<String>,

    /// Run as an unprivileged user (paths rebased under `$XDG_RUNTIME_DIR`).
    pub rootless: bool,

    /// Container device interface spec directories.
    pub cdi_spec_dirs: Option<Vec<PathBuf>>,

    /// Container runtime supervisor settings.
    pub runtime: RuntimeConfig,

    /// Cluster membership tuning.
    pub swarm: SwarmConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            tls: None,
            tls_verify: None,
            tls_options: TlsOptions::default(),
            debug: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            experimental: false,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            min_api_version: None,
            authorization_plugins: Vec::new(),
            features: BTreeMap::new(),
            root: PathBuf::from("/var/lib/engine"),
            exec_root: PathBuf::from("/var/run/engine"),
            pidfile: Some(PathBuf::from("/var/run/engine.pid")),
            socket_group: "engine".to_string(),
            metrics_address: None,
            rootless: false,
            cdi_spec_dirs: None,
            runtime: RuntimeConfig::default(),
            swarm: SwarmConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Whether debug mode is on.
    pub fn debug_enabled(&self) -> bool {
        self.debug.unwrap_or(false)
    }

    /// Whether the named feature is explicitly toggled, and to what.
    pub fn feature(&self, name: &str) -> Option<bool> {
        self.features.get(name).copied()
    }
}

/// TLS certificate material paths.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TlsOptions {
    /// Trust roots used to verify client certificates (PEM).
    #[serde(rename = "tlscacert")]
    pub ca_file: Option<PathBuf>,

    /// Server certificate chain (PEM).
    #[serde(rename = "tlscert")]
    pub cert_file: Option<PathBuf>,

    /// Server private key (PEM).
    #[serde(rename = "tlskey")]
    pub key_file: Option<PathBuf>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Container runtime supervisor configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Control socket of a system-wide runtime, if one is already running.
    pub socket: PathBuf,

    /// Binary launched when no system runtime is found.
    pub binary: PathBuf,

    /// Enable the runtime's CRI plugin in the managed instance.
    pub cri_containerd: bool,

    /// Seconds to wait for a managed runtime to create its socket.
    pub ready_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/run/containerd/containerd.sock"),
            binary: PathBuf::from("containerd"),
            cri_containerd: false,
            ready_timeout_secs: 60,
        }
    }
}

/// Cluster membership tuning.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SwarmConfig {
    /// Address advertised to other members when none is given on join.
    pub default_advertise_addr: Option<String>,

    /// Raft heartbeat interval in ticks.
    pub raft_heartbeat_tick: u32,

    /// Raft election timeout in ticks. Must exceed the heartbeat tick.
    pub raft_election_tick: u32,

    /// Runtime directory for cluster state. Defaults to `<exec_root>/swarm`.
    pub run_root: Option<PathBuf>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            default_advertise_addr: None,
            raft_heartbeat_tick: 1,
            raft_election_tick: 10,
            run_root: None,
        }
    }
}
