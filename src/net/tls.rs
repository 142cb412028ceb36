//! API security policy and TLS configuration loading.
//!
//! The policy is derived once from configuration and is immutable afterwards.
//! Verification implies TLS, and an explicit `tlsverify` setting forces TLS on.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;

use crate::config::schema::{DaemonConfig, TlsOptions};

/// TLS default when the configuration leaves `tls` unset.
pub const DEFAULT_TLS: bool = false;

/// Errors raised while loading TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS is enabled but no {0} is configured")]
    MissingMaterial(&'static str),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid trust root in {path}: {source}")]
    TrustRoot {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },

    #[error("client verifier error: {0}")]
    Verifier(#[from] VerifierBuilderError),

    #[error("server config error: {0}")]
    Config(#[from] rustls::Error),
}

/// Listener security classes, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityClass {
    /// Plain text.
    TlsDisabled,
    /// TLS without client certificate verification.
    TlsOptionalVerify,
    /// Mutual TLS. The only supported posture for non-loopback binds.
    TlsVerified,
}

/// Derived TLS / authentication policy for the API listeners.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    tls: bool,
    verify: bool,
    explicit: bool,
    ca_file: Option<PathBuf>,
    server_config: Option<Arc<ServerConfig>>,
}

impl SecurityPolicy {
    /// Derive the policy from configuration, loading certificate material
    /// when TLS is on.
    pub fn from_config(config: &DaemonConfig) -> Result<Self, TlsError> {
        let tls = config.tls.unwrap_or(DEFAULT_TLS) || config.tls_verify.is_some();
        let verify = tls && config.tls_verify != Some(false);

        let server_config = if tls {
            Some(Arc::new(build_server_config(&config.tls_options, verify)?))
        } else {
            None
        };

        Ok(Self {
            tls,
            verify,
            explicit: tls_choice_is_explicit(config),
            ca_file: config.tls_options.ca_file.clone(),
            server_config,
        })
    }

    /// Plain-text policy with no explicit administrator choice.
    pub fn insecure() -> Self {
        Self {
            tls: false,
            verify: false,
            explicit: false,
            ca_file: None,
            server_config: None,
        }
    }

    /// Plain-text policy chosen explicitly (`tls = false`).
    pub fn explicitly_insecure() -> Self {
        Self {
            explicit: true,
            ..Self::insecure()
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls
    }

    /// Whether client certificates are required and verified.
    pub fn verify_required(&self) -> bool {
        self.verify
    }

    /// Whether the administrator made an explicit TLS choice. A plain-text
    /// tcp listener without one gets the long deterrent.
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    pub fn ca_file(&self) -> Option<&Path> {
        self.ca_file.as_deref()
    }

    pub fn class(&self) -> SecurityClass {
        match (self.tls, self.verify) {
            (false, _) => SecurityClass::TlsDisabled,
            (true, false) => SecurityClass::TlsOptionalVerify,
            (true, true) => SecurityClass::TlsVerified,
        }
    }

    /// Per-connection TLS acceptor, when TLS is on.
    pub fn acceptor(&self) -> Option<RustlsAcceptor> {
        self.server_config
            .clone()
            .map(|config| RustlsAcceptor::new(RustlsConfig::from_config(config)))
    }
}

/// Whether `tls`/`tlsverify` were set explicitly. An explicit `tls = false`
/// is the administrator opt-out; an explicit `tlsverify` of either value is a
/// deliberate choice as well.
fn tls_choice_is_explicit(config: &DaemonConfig) -> bool {
    if config.tls_verify.is_some() {
        return true;
    }
    match config.tls {
        None => DEFAULT_TLS,
        Some(false) => true,
        Some(true) => false,
    }
}

fn build_server_config(options: &TlsOptions, verify: bool) -> Result<ServerConfig, TlsError> {
    let cert_path = options
        .cert_file
        .as_deref()
        .ok_or(TlsError::MissingMaterial("certificate (tlscert)"))?;
    let key_path = options
        .key_file
        .as_deref()
        .ok_or(TlsError::MissingMaterial("private key (tlskey)"))?;

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;

    let builder = if verify {
        let ca_path = options
            .ca_file
            .as_deref()
            .ok_or(TlsError::MissingMaterial("CA certificate (tlscacert)"))?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots.add(cert).map_err(|source| TlsError::TrustRoot {
                path: ca_path.to_path_buf(),
                source,
            })?;
        }
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider).build()?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let mut config = builder.with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}
