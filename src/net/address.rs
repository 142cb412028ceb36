//! API address specifications.
//!
//! # Responsibilities
//! - Parse `proto://addr` listener specifications
//! - Normalise user-supplied hosts (default host, default port, dedup, sort)
//!
//! # Design Decisions
//! - Normalisation is lenient (bare `host:port` means tcp) and runs at config
//!   load time; [`ListenerSpec::parse`] is strict and runs at bind time
//! - The canonical string form is what gets reported to the rest of the system

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Host used when a tcp address leaves the host part empty.
pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";

/// Port used for plain tcp listeners when none is given.
pub const DEFAULT_HTTP_PORT: u16 = 2375;

/// Port used for TLS tcp listeners when none is given.
pub const DEFAULT_TLS_HTTP_PORT: u16 = 2376;

/// Unix socket used when no host is configured.
pub const DEFAULT_UNIX_SOCKET: &str = "/var/run/engine.sock";

/// Errors raised while parsing address specifications.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("bad format {0}, expected PROTO://ADDR")]
    BadFormat(String),

    #[error("invalid bind address protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("invalid bind address ({0}): should not contain a path element")]
    PathElement(String),

    #[error("invalid bind address format: {0}")]
    InvalidAddress(String),

    #[error("invalid port in bind address: {0}")]
    InvalidPort(String),

    #[error("could not determine the user runtime directory; set XDG_RUNTIME_DIR")]
    NoRuntimeDir,
}

/// Transport protocol of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Transport {
    /// Raw network transport.
    Tcp,
    /// Local unix domain socket.
    Unix,
}

impl Transport {
    /// Whether this transport is reachable over the network.
    pub fn is_network(&self) -> bool {
        matches!(self, Transport::Tcp)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Unix => write!(f, "unix"),
        }
    }
}

impl FromStr for Transport {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Transport::Tcp),
            "unix" => Ok(Transport::Unix),
            other => Err(AddressError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// A single resolved listener specification. Immutable after resolution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerSpec {
    pub proto: Transport,
    pub address: String,
    pub tls: bool,
}

impl ListenerSpec {
    /// Parse a strict `proto://addr` specification.
    pub fn parse(spec: &str) -> Result<Self, AddressError> {
        let (proto, address) = spec
            .split_once("://")
            .ok_or_else(|| AddressError::BadFormat(spec.to_string()))?;
        let proto: Transport = proto
            .parse()
            .map_err(|_| AddressError::UnsupportedProtocol(spec.to_string()))?;
        if address.is_empty() {
            return Err(AddressError::InvalidAddress(spec.to_string()));
        }
        if proto == Transport::Tcp {
            split_host_port(address)?;
        }
        Ok(Self {
            proto,
            address: address.to_string(),
            tls: false,
        })
    }

    /// Mark whether connections on this listener are TLS-wrapped.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Host and port of a tcp specification.
    pub fn host_port(&self) -> Result<(&str, u16), AddressError> {
        let (host, port) = split_host_port(&self.address)?;
        let port = port
            .ok_or_else(|| AddressError::InvalidPort(self.canonical()))?
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(self.canonical()))?;
        Ok((host, port))
    }

    /// Canonical `proto://addr` form used for reporting.
    pub fn canonical(&self) -> String {
        format!("{}://{}", self.proto, self.address)
    }
}

impl fmt::Display for ListenerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.proto, self.address)
    }
}

/// Normalise a single user-supplied host into canonical `proto://addr` form.
///
/// An empty value yields the default host: the TLS tcp port on localhost when
/// TLS is on, the user runtime socket when `honor_xdg` is set, otherwise the
/// system unix socket. A value without `://` is treated as tcp.
pub fn parse_host(default_to_tls: bool, honor_xdg: bool, value: &str) -> Result<String, AddressError> {
    let value = value.trim();
    if value.is_empty() {
        return default_host(default_to_tls, honor_xdg);
    }

    let (proto, addr) = match value.split_once("://") {
        Some((proto, addr)) => (proto, addr),
        None => ("tcp", value),
    };
    let default_port = if default_to_tls {
        DEFAULT_TLS_HTTP_PORT
    } else {
        DEFAULT_HTTP_PORT
    };

    match proto {
        "tcp" => parse_tcp_addr(addr, default_port),
        "unix" => {
            if addr.is_empty() {
                Ok(format!("unix://{}", default_unix_socket(honor_xdg)?))
            } else {
                Ok(format!("unix://{addr}"))
            }
        }
        _ => Err(AddressError::UnsupportedProtocol(value.to_string())),
    }
}

/// Normalise, deduplicate and sort a host list.
///
/// An empty list is treated as a single empty entry so the default host is
/// used.
pub fn normalize_hosts(hosts: &[String], use_tls: bool, honor_xdg: bool) -> Result<Vec<String>, AddressError> {
    let fallback = [String::new()];
    let hosts = if hosts.is_empty() { &fallback[..] } else { hosts };

    let mut seen = BTreeSet::new();
    for host in hosts {
        seen.insert(parse_host(use_tls, honor_xdg, host)?);
    }
    Ok(seen.into_iter().collect())
}

fn default_host(tls: bool, honor_xdg: bool) -> Result<String, AddressError> {
    if tls {
        return Ok(format!("tcp://localhost:{DEFAULT_TLS_HTTP_PORT}"));
    }
    Ok(format!("unix://{}", default_unix_socket(honor_xdg)?))
}

fn default_unix_socket(honor_xdg: bool) -> Result<String, AddressError> {
    if !honor_xdg {
        return Ok(DEFAULT_UNIX_SOCKET.to_string());
    }
    let runtime_dir = dirs::runtime_dir().ok_or(AddressError::NoRuntimeDir)?;
    Ok(runtime_dir.join("engine.sock").display().to_string())
}

fn parse_tcp_addr(addr: &str, default_port: u16) -> Result<String, AddressError> {
    if addr.contains('/') {
        return Err(AddressError::PathElement(format!("tcp://{addr}")));
    }
    let (host, port) = split_host_port(addr)?;
    let host = if host.is_empty() { DEFAULT_HTTP_HOST } else { host };
    let port = match port {
        None | Some("") => default_port,
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(format!("tcp://{addr}")))?,
    };
    Ok(format!("tcp://{}", join_host_port(host, port)))
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
fn split_host_port(addr: &str) -> Result<(&str, Option<&str>), AddressError> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| AddressError::InvalidAddress(addr.to_string()))?;
        return match after {
            "" => Ok((host, None)),
            after => after
                .strip_prefix(':')
                .map(|port| (host, Some(port)))
                .ok_or_else(|| AddressError::InvalidAddress(addr.to_string())),
        };
    }
    match addr.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Err(AddressError::InvalidAddress(addr.to_string())),
        Some((host, port)) => Ok((host, Some(port))),
        None => Ok((addr, None)),
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_requires_scheme_separator() {
        assert_eq!(
            ListenerSpec::parse("127.0.0.1:2375"),
            Err(AddressError::BadFormat("127.0.0.1:2375".into()))
        );
    }

    #[test]
    fn parse_rejects_unknown_protocol() {
        assert!(matches!(
            ListenerSpec::parse("udp://127.0.0.1:53"),
            Err(AddressError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn parse_tcp_spec() {
        let spec = ListenerSpec::parse("tcp://0.0.0.0:2375").unwrap();
        assert_eq!(spec.proto, Transport::Tcp);
        assert_eq!(spec.host_port().unwrap(), ("0.0.0.0", 2375));
        assert_eq!(spec.canonical(), "tcp://0.0.0.0:2375");
    }

    #[test]
    fn parse_ipv6_spec() {
        let spec = ListenerSpec::parse("tcp://[::1]:2376").unwrap();
        assert_eq!(spec.host_port().unwrap(), ("::1", 2376));
    }

    #[test]
    fn host_defaults_fill_in_missing_parts() {
        assert_eq!(parse_host(false, false, "").unwrap(), "unix:///var/run/engine.sock");
        assert_eq!(parse_host(true, false, "").unwrap(), "tcp://localhost:2376");
        assert_eq!(parse_host(false, false, "tcp://").unwrap(), "tcp://127.0.0.1:2375");
        assert_eq!(parse_host(false, false, "tcp://:4243").unwrap(), "tcp://127.0.0.1:4243");
        assert_eq!(parse_host(true, false, "tcp://10.0.0.1").unwrap(), "tcp://10.0.0.1:2376");
        assert_eq!(parse_host(false, false, "0.0.0.0:80").unwrap(), "tcp://0.0.0.0:80");
        assert_eq!(parse_host(false, false, "unix://").unwrap(), "unix:///var/run/engine.sock");
        assert_eq!(parse_host(false, false, "tcp://::1").unwrap_err(), AddressError::InvalidAddress("::1".into()));
        assert_eq!(parse_host(false, false, "tcp://[::1]").unwrap(), "tcp://[::1]:2375");
    }

    #[test]
    fn host_rejects_paths_and_bad_ports() {
        assert!(matches!(
            parse_host(false, false, "tcp://127.0.0.1:2375/path"),
            Err(AddressError::PathElement(_))
        ));
        assert!(matches!(
            parse_host(false, false, "tcp://127.0.0.1:http"),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            parse_host(false, false, "fd://3"),
            Err(AddressError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn normalize_dedups_and_sorts() {
        let hosts = vec![
            "unix:///run/b.sock".to_string(),
            "tcp://127.0.0.1:2375".to_string(),
            "127.0.0.1:2375".to_string(),
            "unix:///run/a.sock".to_string(),
        ];
        assert_eq!(
            normalize_hosts(&hosts, false, false).unwrap(),
            vec![
                "tcp://127.0.0.1:2375".to_string(),
                "unix:///run/a.sock".to_string(),
                "unix:///run/b.sock".to_string(),
            ]
        );
    }

    #[test]
    fn normalize_empty_uses_default_host() {
        assert_eq!(
            normalize_hosts(&[], false, false).unwrap(),
            vec!["unix:///var/run/engine.sock".to_string()]
        );
    }
}
