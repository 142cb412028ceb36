//! Configuration loading from disk and command-line flags.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::{DaemonConfig, LogFormat};
use crate::config::validation::{validate_config, ValidationError};
use crate::daemon::devices::normalize_cdi_spec_dirs;
use crate::http::middleware::VersionPolicy;
use crate::net::address::{normalize_hosts, AddressError};
use crate::net::tls::DEFAULT_TLS;

/// Config file read when none is given on the command line.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/engine/daemon.toml";

/// Overrides the minimum API version, within the supported range.
pub const MIN_API_VERSION_ENV: &str = "ENGINE_MIN_API_VERSION";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to configure the daemon with file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to configure the daemon with file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("the following directives are specified both as a flag and in the configuration file: {}", .0.join(", "))]
    Conflict(Vec<&'static str>),

    #[error("invalid ENGINE_MIN_API_VERSION: {0}")]
    MinApiVersion(String),

    #[error(transparent)]
    Hosts(#[from] AddressError),

    #[error("{}", ValidationErrors(.0))]
    Validation(Vec<ValidationError>),
}

struct ValidationErrors<'a>(&'a [ValidationError]);

impl fmt::Display for ValidationErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: ")?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

/// Settings given on the command line. `None` / empty means "not given".
#[derive(Debug, Clone, Default)]
pub struct FlagOverrides {
    pub hosts: Vec<String>,
    pub tls: Option<bool>,
    pub tls_verify: Option<bool>,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub debug: Option<bool>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub experimental: Option<bool>,
}

impl FlagOverrides {
    /// Keys of the config file this overlay would also set.
    fn keys(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if !self.hosts.is_empty() {
            keys.push("hosts");
        }
        let set = [
            ("tls", self.tls.is_some()),
            ("tlsverify", self.tls_verify.is_some()),
            ("debug", self.debug.is_some()),
            ("log_level", self.log_level.is_some()),
            ("log_format", self.log_format.is_some()),
            ("experimental", self.experimental.is_some()),
        ];
        keys.extend(set.into_iter().filter(|(_, set)| *set).map(|(key, _)| key));
        keys
    }

    fn tls_option_keys(&self) -> Vec<&'static str> {
        [
            ("tlscacert", self.ca_file.is_some()),
            ("tlscert", self.cert_file.is_some()),
            ("tlskey", self.key_file.is_some()),
        ]
        .into_iter()
        .filter(|(_, set)| *set)
        .map(|(key, _)| key)
        .collect()
    }

    fn apply(&self, config: &mut DaemonConfig) {
        if !self.hosts.is_empty() {
            config.hosts = self.hosts.clone();
        }
        if let Some(tls) = self.tls {
            config.tls = Some(tls);
        }
        if let Some(verify) = self.tls_verify {
            config.tls_verify = Some(verify);
            config.tls = Some(true);
        }
        if let Some(ca) = &self.ca_file {
            config.tls_options.ca_file = Some(ca.clone());
        }
        if let Some(cert) = &self.cert_file {
            config.tls_options.cert_file = Some(cert.clone());
        }
        if let Some(key) = &self.key_file {
            config.tls_options.key_file = Some(key.clone());
        }
        if let Some(debug) = self.debug {
            config.debug = Some(debug);
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(experimental) = self.experimental {
            config.experimental = experimental;
        }
    }
}

/// Where the configuration comes from. Kept for the daemon's lifetime so a
/// reload re-reads the same file and re-applies the same flags.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    file: Option<PathBuf>,
    file_explicit: bool,
    overrides: FlagOverrides,
}

impl ConfigSource {
    /// `file` is the `--config-file` value; without one the default file is
    /// read if it exists.
    pub fn new(file: Option<PathBuf>, overrides: FlagOverrides) -> Self {
        let file_explicit = file.is_some();
        Self {
            file: file.or_else(|| Some(PathBuf::from(DEFAULT_CONFIG_FILE))),
            file_explicit,
            overrides,
        }
    }

    /// Flags only, no config file.
    pub fn flags_only(overrides: FlagOverrides) -> Self {
        Self {
            file: None,
            file_explicit: false,
            overrides,
        }
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Load, merge, normalise and validate the configuration.
    pub fn load(&self) -> Result<DaemonConfig, ConfigError> {
        let mut config = match self.read_file()? {
            Some((path, contents)) => self.merge_file(&path, &contents)?,
            None => DaemonConfig::default(),
        };
        self.overrides.apply(&mut config);

        if let Ok(version) = std::env::var(MIN_API_VERSION_ENV) {
            if !version.is_empty() {
                VersionPolicy::new(Some(&version)).map_err(|e| ConfigError::MinApiVersion(e.to_string()))?;
                config.min_api_version = Some(version);
            }
        }

        finalize(config)
    }

    fn read_file(&self) -> Result<Option<(PathBuf, String)>, ConfigError> {
        let Some(path) = &self.file else {
            return Ok(None);
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Some((path.clone(), contents))),
            Err(e) if e.kind() == io::ErrorKind::NotFound && !self.file_explicit => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(None)
            }
            Err(source) => Err(ConfigError::Read {
                path: path.clone(),
                source,
            }),
        }
    }

    fn merge_file(&self, path: &Path, contents: &str) -> Result<DaemonConfig, ConfigError> {
        let parse_err = |source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        };
        let table: toml::Table = contents.parse().map_err(parse_err)?;

        let mut conflicts: Vec<&'static str> = self
            .overrides
            .keys()
            .into_iter()
            .filter(|key| table.contains_key(*key))
            .collect();
        if let Some(toml::Value::Table(tls_options)) = table.get("tls_options") {
            conflicts.extend(
                self.overrides
                    .tls_option_keys()
                    .into_iter()
                    .filter(|key| tls_options.contains_key(*key)),
            );
        }
        if !conflicts.is_empty() {
            return Err(ConfigError::Conflict(conflicts));
        }

        toml::from_str(contents).map_err(parse_err)
    }
}

/// Normalise hosts, validate, and settle the TLS flags.
pub fn finalize(mut config: DaemonConfig) -> Result<DaemonConfig, ConfigError> {
    let use_tls = config.tls.unwrap_or(DEFAULT_TLS);
    config.hosts = normalize_hosts(&config.hosts, use_tls, config.rootless)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    // Setting tlsverify at all turns TLS on.
    if config.tls_verify.is_some() {
        config.tls = Some(true);
    }
    if config.tls_verify.is_none() && config.tls.is_some() {
        config.tls_verify = config.tls;
    }

    normalize_cdi_spec_dirs(&mut config);
    Ok(config)
}
