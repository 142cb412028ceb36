//! Daemon root directories and the pid file.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;

use crate::config::schema::DaemonConfig;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("failed to create {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start daemon, ensure the engine is not running or delete {path}: {message}")]
    PidFile { path: PathBuf, message: String },
}

/// Create the daemon root (0711) and exec root (0700).
pub fn create_daemon_root(config: &DaemonConfig) -> Result<(), PathError> {
    create_dir(&config.root, 0o711)?;
    create_dir(&config.exec_root, 0o700)
}

fn create_dir(path: &Path, mode: u32) -> Result<(), PathError> {
    let err = |source| PathError::Create {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(path).map_err(err)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(err)
}

fn process_alive(pid: i32) -> bool {
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// A written pid file, removed by [`PidFile::remove`].
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current pid. Refuses when the file names another live
    /// process.
    pub fn write(path: &Path) -> Result<Self, PathError> {
        let pid_err = |message: String| PathError::PidFile {
            path: path.to_path_buf(),
            message,
        };

        if let Ok(contents) = fs::read_to_string(path) {
            if let Ok(pid) = contents.trim().parse::<i32>() {
                if pid != std::process::id() as i32 && pid > 0 && process_alive(pid) {
                    return Err(pid_err(format!("process with PID {pid} is still running")));
                }
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| pid_err(format!("failed to create pidfile directory: {e}")))?;
        }
        fs::write(path, format!("{}\n", std::process::id())).map_err(|e| pid_err(e.to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remove(self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to remove pid file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            root: dir.path().join("lib"),
            exec_root: dir.path().join("run"),
            ..DaemonConfig::default()
        };
        create_daemon_root(&config).unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&config.root), 0o711);
        assert_eq!(mode(&config.exec_root), 0o700);
    }

    #[test]
    fn pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/engine.pid");
        let pidfile = PidFile::write(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            std::process::id().to_string()
        );
        pidfile.remove();
        assert!(!path.exists());
    }

    #[test]
    fn live_pid_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.pid");
        // pid 1 is always alive
        fs::write(&path, "1\n").unwrap();
        let err = PidFile::write(&path).unwrap_err();
        assert!(matches!(err, PathError::PidFile { .. }));
    }

    #[test]
    fn stale_pid_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.pid");
        fs::write(&path, "garbage\n").unwrap();
        assert!(PidFile::write(&path).is_ok());
    }
}
