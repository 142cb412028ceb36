//! API listener resolution and binding.
//!
//! # Responsibilities
//! - Turn the normalised host list into bound sockets
//! - Warn about (and slow down) insecure tcp postures before binding
//! - Reserve tcp ports in the daemon's port table before binding
//! - Apply ownership and permissions to unix sockets
//!
//! # Design Decisions
//! - Resolution fails fast: the first bad spec or bind error aborts the whole
//!   set and anything already bound is dropped (and therefore closed)
//! - The deterrent pauses are deliberate friction; their lengths live on the
//!   resolver so tests can shorten them, but they are never skipped

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsAcceptor;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};

use crate::net::address::{AddressError, ListenerSpec, Transport};
use crate::net::ports::{PortAllocator, PortError};
use crate::net::tls::SecurityPolicy;

/// Socket group used when the configuration does not name one.
pub const DEFAULT_SOCKET_GROUP: &str = "engine";

/// Errors raised while resolving listeners.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("no hosts configured")]
    NoHosts,

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("failed to resolve {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare socket {path}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("group {0} not found")]
    UnknownGroup(String),
}

/// Any stream the API server can speak HTTP over.
pub trait ApiIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ApiIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased accepted connection.
pub type BoxedIo = Box<dyn ApiIo>;

/// A bound API listener.
pub enum ApiListener {
    Tcp {
        spec: ListenerSpec,
        inner: TcpListener,
        acceptor: Option<RustlsAcceptor>,
    },
    Unix {
        spec: ListenerSpec,
        inner: UnixListener,
        path: PathBuf,
    },
}

impl ApiListener {
    pub fn spec(&self) -> &ListenerSpec {
        match self {
            ApiListener::Tcp { spec, .. } | ApiListener::Unix { spec, .. } => spec,
        }
    }

    /// Bound tcp address, if this is a tcp listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ApiListener::Tcp { inner, .. } => inner.local_addr().ok(),
            ApiListener::Unix { .. } => None,
        }
    }

    /// TLS acceptor for connections on this listener.
    pub fn acceptor(&self) -> Option<RustlsAcceptor> {
        match self {
            ApiListener::Tcp { acceptor, .. } => acceptor.clone(),
            ApiListener::Unix { .. } => None,
        }
    }

    /// Accept one raw connection. TLS, if any, is negotiated by the caller.
    pub async fn accept(&self) -> io::Result<(BoxedIo, String)> {
        match self {
            ApiListener::Tcp { inner, .. } => {
                let (stream, peer) = inner.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), peer.to_string()))
            }
            ApiListener::Unix { inner, path, .. } => {
                let (stream, _) = inner.accept().await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
        }
    }
}

impl fmt::Debug for ApiListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiListener::Tcp { spec, inner, acceptor } => f
                .debug_struct("Tcp")
                .field("spec", spec)
                .field("local_addr", &inner.local_addr().ok())
                .field("tls", &acceptor.is_some())
                .finish(),
            ApiListener::Unix { spec, path, .. } => f
                .debug_struct("Unix")
                .field("spec", spec)
                .field("path", path)
                .finish(),
        }
    }
}

impl Drop for ApiListener {
    fn drop(&mut self) {
        if let ApiListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// How loudly a plain tcp listener was warned about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeterrentLevel {
    /// No client verification.
    Unverified,
    /// No client verification, no explicit opt-out, and a non-loopback host.
    Insecure,
}

/// A deterrent warning emitted during resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterrentWarning {
    pub host: String,
    pub level: DeterrentLevel,
}

/// Pause lengths applied to insecure tcp listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeterrentDelays {
    pub unverified: Duration,
    pub insecure: Duration,
}

impl Default for DeterrentDelays {
    fn default() -> Self {
        Self {
            unverified: Duration::from_secs(1),
            insecure: Duration::from_secs(15),
        }
    }
}

/// Output of a successful resolution.
#[derive(Debug)]
pub struct Resolution {
    pub listeners: Vec<ApiListener>,
    /// Canonical, deduplicated, sorted host list.
    pub hosts: Vec<String>,
    pub warnings: Vec<DeterrentWarning>,
}

/// Turns host specifications into bound listeners under a security policy.
#[derive(Debug, Clone)]
pub struct ListenerResolver {
    ports: Arc<PortAllocator>,
    socket_group: String,
    delays: DeterrentDelays,
}

impl ListenerResolver {
    pub fn new(ports: Arc<PortAllocator>, socket_group: impl Into<String>) -> Self {
        Self {
            ports,
            socket_group: socket_group.into(),
            delays: DeterrentDelays::default(),
        }
    }

    pub fn with_delays(mut self, delays: DeterrentDelays) -> Self {
        self.delays = delays;
        self
    }

    /// Resolve and bind every host.
    pub async fn resolve(&self, hosts: &[String], policy: &SecurityPolicy) -> Result<Resolution, ListenerError> {
        if hosts.is_empty() {
            return Err(ListenerError::NoHosts);
        }

        let mut specs = BTreeSet::new();
        for host in hosts {
            specs.insert(ListenerSpec::parse(host)?);
        }

        let mut reserved = Vec::new();
        let result = self.bind_all(specs, policy, &mut reserved).await;
        if result.is_err() {
            for addr in reserved {
                self.ports.release_port(Transport::Tcp, addr.ip(), addr.port());
            }
        }
        result
    }

    /// Bind every spec in order. Ports reserved along the way are recorded in
    /// `reserved` so a failed resolution can give them back.
    async fn bind_all(
        &self,
        specs: BTreeSet<ListenerSpec>,
        policy: &SecurityPolicy,
        reserved: &mut Vec<SocketAddr>,
    ) -> Result<Resolution, ListenerError> {
        let mut resolution = Resolution {
            listeners: Vec::new(),
            hosts: Vec::with_capacity(specs.len()),
            warnings: Vec::new(),
        };

        for spec in specs {
            let tls = spec.proto.is_network() && policy.tls_enabled();
            let spec = spec.with_tls(tls);
            match spec.proto {
                Transport::Tcp => {
                    let addrs = self.lookup(&spec).await?;
                    self.deter(&spec, &addrs, policy, &mut resolution.warnings).await?;
                    for addr in &addrs {
                        self.ports.request_port(Transport::Tcp, addr.ip(), addr.port())?;
                        reserved.push(*addr);
                    }
                    let bound = bind_tcp(&spec, &addrs, policy).await?;
                    resolution.listeners.extend(bound);
                }
                Transport::Unix => {
                    let listener = bind_unix(&spec, &self.socket_group)?;
                    resolution.listeners.push(listener);
                }
            }
            tracing::debug!(proto = %spec.proto, address = %spec.address, "Listener created for HTTP");
            resolution.hosts.push(spec.canonical());
        }

        Ok(resolution)
    }

    async fn lookup(&self, spec: &ListenerSpec) -> Result<Vec<SocketAddr>, ListenerError> {
        let (host, port) = spec.host_port()?;
        let found = tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| ListenerError::Lookup {
                host: host.to_string(),
                source,
            })?;
        let addrs: BTreeSet<SocketAddr> = found.collect();
        if addrs.is_empty() {
            return Err(ListenerError::Lookup {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            });
        }
        Ok(addrs.into_iter().collect())
    }

    async fn deter(
        &self,
        spec: &ListenerSpec,
        addrs: &[SocketAddr],
        policy: &SecurityPolicy,
        warnings: &mut Vec<DeterrentWarning>,
    ) -> Result<(), ListenerError> {
        if policy.verify_required() {
            return Ok(());
        }

        let host = spec.canonical();
        tracing::warn!(host = %host, "Binding to IP address without --tlsverify is insecure and gives root access on this machine to everyone who has access to your network.");
        tracing::warn!(host = %host, "Binding to an IP address, even on localhost, can also give access to scripts run in a browser.");
        tracing::warn!(host = %host, "In future versions this will be a hard failure preventing the daemon from starting.");
        warnings.push(DeterrentWarning {
            host: host.clone(),
            level: DeterrentLevel::Unverified,
        });
        tokio::time::sleep(self.delays.unverified).await;

        if policy.is_explicit() {
            return Ok(());
        }
        let (name, _) = spec.host_port()?;
        if is_loopback(name, addrs) {
            return Ok(());
        }

        tracing::warn!(host = %host, "Binding to an IP address without --tlsverify is deprecated. Startup is intentionally being slowed down to show this message");
        tracing::warn!(host = %host, "Generate TLS certificates with client validation to avoid exposing unauthenticated root access to your network");
        tracing::warn!(host = %host, "Override this by explicitly specifying '--tls=false' or '--tlsverify=false'");
        tracing::warn!(host = %host, "Listening on tcp without authentication or an explicit opt-out will stop being supported");
        warnings.push(DeterrentWarning {
            host,
            level: DeterrentLevel::Insecure,
        });
        tokio::time::sleep(self.delays.insecure).await;
        Ok(())
    }
}

/// Literal `localhost` is loopback without a lookup; otherwise every resolved
/// address must be loopback.
fn is_loopback(name: &str, addrs: &[SocketAddr]) -> bool {
    if name == "localhost" {
        return true;
    }
    if let Ok(ip) = name.parse::<IpAddr>() {
        return ip.is_loopback();
    }
    !addrs.is_empty() && addrs.iter().all(|a| a.ip().is_loopback())
}

async fn bind_tcp(
    spec: &ListenerSpec,
    addrs: &[SocketAddr],
    policy: &SecurityPolicy,
) -> Result<Vec<ApiListener>, ListenerError> {
    let acceptor = policy.acceptor();
    let mut bound = Vec::with_capacity(addrs.len());
    let mut last_err = None;

    for addr in addrs {
        match TcpListener::bind(addr).await {
            Ok(inner) => {
                tracing::info!(address = %addr, tls = acceptor.is_some(), "API listener bound");
                bound.push(ApiListener::Tcp {
                    spec: spec.clone(),
                    inner,
                    acceptor: acceptor.clone(),
                });
            }
            // A name resolving to both families is usable as long as one binds.
            Err(source) if addrs.len() > 1 && source.kind() == io::ErrorKind::AddrNotAvailable => {
                tracing::warn!(address = %addr, error = %source, "Skipping unavailable address");
                last_err = Some(source);
            }
            Err(source) => {
                return Err(ListenerError::Bind {
                    address: addr.to_string(),
                    source,
                })
            }
        }
    }

    match (bound.is_empty(), last_err) {
        (true, Some(source)) => Err(ListenerError::Bind {
            address: spec.canonical(),
            source,
        }),
        _ => Ok(bound),
    }
}

fn bind_unix(spec: &ListenerSpec, group: &str) -> Result<ApiListener, ListenerError> {
    let path = PathBuf::from(&spec.address);
    let socket_err = |source| ListenerError::Socket {
        path: path.clone(),
        source,
    };

    match std::fs::symlink_metadata(&path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(&path).map_err(socket_err)?,
        Ok(_) => {
            return Err(socket_err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "path exists and is not a socket",
            )))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(socket_err(e)),
    }

    let inner = UnixListener::bind(&path).map_err(|source| ListenerError::Bind {
        address: spec.canonical(),
        source,
    })?;
    let listener = ApiListener::Unix {
        spec: spec.clone(),
        inner,
        path: path.clone(),
    };

    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o660)).map_err(socket_err)?;
    apply_socket_group(&path, group)?;

    tracing::info!(path = %path.display(), "API listener bound");
    Ok(listener)
}

fn apply_socket_group(path: &Path, group: &str) -> Result<(), ListenerError> {
    if group.is_empty() {
        return Ok(());
    }
    let gid = match group.parse::<u32>() {
        Ok(raw) => Some(nix::unistd::Gid::from_raw(raw)),
        Err(_) => nix::unistd::Group::from_name(group)
            .map_err(|e| ListenerError::Socket {
                path: path.to_path_buf(),
                source: io::Error::from(e),
            })?
            .map(|g| g.gid),
    };

    let Some(gid) = gid else {
        if group == DEFAULT_SOCKET_GROUP {
            tracing::warn!(group, path = %path.display(), "Socket group not found, leaving socket owned by the daemon's group");
            return Ok(());
        }
        return Err(ListenerError::UnknownGroup(group.to_string()));
    };

    nix::unistd::chown(path, None, Some(gid)).map_err(|e| ListenerError::Socket {
        path: path.to_path_buf(),
        source: io::Error::from(e),
    })
}
