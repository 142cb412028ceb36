//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::lifecycle::reload::{ReloadGate, ReloadTrigger};

/// Monitors the configuration file and asks for a reload when it changes.
///
/// Loading and validation happen in the reload controller, not here, so a
/// file change and SIGHUP go through the same path.
pub struct ConfigWatcher {
    path: PathBuf,
    gate: ReloadGate,
}

impl ConfigWatcher {
    pub fn new(path: &Path, gate: ReloadGate) -> Self {
        Self {
            path: path.to_path_buf(),
            gate,
        }
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let gate = self.gate.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!("Config file change detected");
                        gate.request(ReloadTrigger::FileChanged);
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::reload::reload_gate;

    #[tokio::test]
    async fn file_change_requests_reload() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let (gate, mut requests) = reload_gate();
        let _watcher = ConfigWatcher::new(file.path(), gate).run().unwrap();

        std::fs::write(file.path(), "debug = true\n").unwrap();

        let trigger = tokio::time::timeout(Duration::from_secs(5), requests.next())
            .await
            .expect("watcher should request a reload");
        assert_eq!(trigger, Some(ReloadTrigger::FileChanged));
    }

    #[test]
    fn missing_file_cannot_be_watched() {
        let (gate, _requests) = reload_gate();
        assert!(ConfigWatcher::new(Path::new("/nonexistent/daemon.toml"), gate).run().is_err());
    }
}
