//! Device-injection driver registry.
//!
//! Drivers are registered before the daemon core is constructed, because the
//! core may restore workloads whose device bindings go through them. The only
//! driver shipped here is the container device interface (CDI) cache, which
//! indexes the JSON spec files found in its spec directories.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;

use crate::config::schema::DaemonConfig;

/// Spec directories used when the configuration does not name any.
pub const DEFAULT_CDI_SPEC_DIRS: [&str; 2] = ["/etc/cdi", "/var/run/cdi"];

pub const CDI_DRIVER_NAME: &str = "cdi";

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("CDI spec dir {path} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("failed to read CDI spec dir {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A device-injection driver.
pub trait DeviceDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Fully qualified device names this driver can inject.
    fn devices(&self) -> Vec<String>;
}

/// Registry of device drivers by name.
#[derive(Default)]
pub struct DeviceRegistry {
    drivers: DashMap<String, Arc<dyn DeviceDriver>>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry").field("drivers", &self.names()).finish()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, driver: Arc<dyn DeviceDriver>) {
        let name = driver.name().to_string();
        tracing::info!(driver = %name, "Device driver registered");
        self.drivers.insert(name, driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DeviceDriver>> {
        self.drivers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Whether device injection through CDI is on.
///
/// CDI is linux-only; there it is on unless the `cdi` feature is explicitly
/// disabled.
pub fn cdi_enabled(config: &DaemonConfig) -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }
    config.feature("cdi").unwrap_or(true)
}

/// Apply the spec directory defaults: unset means the default directories, a
/// single empty entry means none, and an explicitly disabled feature clears
/// the list.
pub fn normalize_cdi_spec_dirs(config: &mut DaemonConfig) {
    match &config.cdi_spec_dirs {
        None => {
            config.cdi_spec_dirs = Some(DEFAULT_CDI_SPEC_DIRS.iter().map(PathBuf::from).collect());
        }
        Some(dirs) if dirs.len() == 1 && dirs[0].as_os_str().is_empty() => {
            config.cdi_spec_dirs = None;
        }
        Some(_) => {}
    }
    if config.feature("cdi") == Some(false) {
        config.cdi_spec_dirs = None;
    }
}

#[derive(Debug, Deserialize)]
struct SpecFile {
    kind: String,
    #[serde(default)]
    devices: Vec<SpecDevice>,
}

#[derive(Debug, Deserialize)]
struct SpecDevice {
    name: String,
}

/// CDI spec cache.
#[derive(Debug)]
pub struct CdiCache {
    spec_dirs: Vec<PathBuf>,
    devices: RwLock<BTreeMap<String, PathBuf>>,
}

impl CdiCache {
    pub fn new(spec_dirs: Vec<PathBuf>) -> Self {
        Self {
            spec_dirs,
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn spec_dirs(&self) -> &[PathBuf] {
        &self.spec_dirs
    }

    /// Rescan the spec directories. Missing directories are skipped; a path
    /// that exists but is not a directory is an error. Unparseable spec files
    /// are logged and skipped.
    pub fn refresh(&self) -> Result<usize, DeviceError> {
        let mut found = BTreeMap::new();
        for dir in &self.spec_dirs {
            scan_dir(dir, &mut found)?;
        }
        let count = found.len();
        *self.devices.write().unwrap_or_else(|e| e.into_inner()) = found;
        Ok(count)
    }

    /// Spec file declaring a qualified device (`vendor.com/class=name`).
    pub fn spec_for(&self, device: &str) -> Option<PathBuf> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device)
            .cloned()
    }
}

impl DeviceDriver for CdiCache {
    fn name(&self) -> &str {
        CDI_DRIVER_NAME
    }

    fn devices(&self) -> Vec<String> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

fn scan_dir(dir: &Path, found: &mut BTreeMap<String, PathBuf>) -> Result<(), DeviceError> {
    let meta = match std::fs::metadata(dir) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(DeviceError::Read {
                path: dir.to_path_buf(),
                source,
            })
        }
    };
    if !meta.is_dir() {
        return Err(DeviceError::NotADirectory {
            path: dir.to_path_buf(),
        });
    }

    let entries = std::fs::read_dir(dir).map_err(|source| DeviceError::Read {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let parsed = std::fs::read(&path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice::<SpecFile>(&bytes).map_err(|e| e.to_string()));
        match parsed {
            Ok(spec) => {
                for device in spec.devices {
                    found.insert(format!("{}={}", spec.kind, device.name), path.clone());
                }
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping invalid CDI spec"),
        }
    }
    Ok(())
}

/// Build the CDI cache for the configured spec directories and register it.
pub fn register_cdi_driver(registry: &DeviceRegistry, spec_dirs: &[PathBuf]) -> Result<Arc<CdiCache>, DeviceError> {
    let cache = Arc::new(CdiCache::new(spec_dirs.to_vec()));
    let count = cache.refresh()?;
    tracing::debug!(spec_dirs = ?spec_dirs, devices = count, "CDI spec cache loaded");
    registry.register(Arc::clone(&cache) as Arc<dyn DeviceDriver>);
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn with_features(features: &[(&str, bool)]) -> DaemonConfig {
        DaemonConfig {
            features: features
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
            ..DaemonConfig::default()
        }
    }

    #[test]
    fn spec_dirs_default_and_clear() {
        let mut config = DaemonConfig::default();
        normalize_cdi_spec_dirs(&mut config);
        assert_eq!(
            config.cdi_spec_dirs,
            Some(vec![PathBuf::from("/etc/cdi"), PathBuf::from("/var/run/cdi")])
        );

        let mut config = DaemonConfig {
            cdi_spec_dirs: Some(vec![PathBuf::new()]),
            ..DaemonConfig::default()
        };
        normalize_cdi_spec_dirs(&mut config);
        assert_eq!(config.cdi_spec_dirs, None);

        let mut config = with_features(&[("cdi", false)]);
        normalize_cdi_spec_dirs(&mut config);
        assert_eq!(config.cdi_spec_dirs, None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn cdi_follows_feature_toggle() {
        assert!(cdi_enabled(&DaemonConfig::default()));
        assert!(!cdi_enabled(&with_features(&[("cdi", false)])));
    }

    #[test]
    fn cache_indexes_json_specs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("vendor.json"),
            r#"{"cdiVersion":"0.6.0","kind":"vendor.com/gpu","devices":[{"name":"0"},{"name":"1"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();

        let registry = DeviceRegistry::new();
        let cache = register_cdi_driver(&registry, &[dir.path().to_path_buf(), PathBuf::from("/nonexistent/cdi")]).unwrap();

        assert_eq!(cache.devices(), vec!["vendor.com/gpu=0".to_string(), "vendor.com/gpu=1".to_string()]);
        assert!(cache.spec_for("vendor.com/gpu=1").is_some());
        assert_eq!(registry.names(), vec![CDI_DRIVER_NAME.to_string()]);
    }

    #[test]
    fn file_as_spec_dir_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = register_cdi_driver(&DeviceRegistry::new(), &[file.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, DeviceError::NotADirectory { .. }));
    }
}
