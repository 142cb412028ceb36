//! Managed runtime supervisor process.
//!
//! # Responsibilities
//! - Launch the runtime binary rooted under the daemon's state directories
//! - Wait until its control socket accepts connections
//! - Restart it with backoff if it exits while the daemon runs
//! - Stop it with SIGTERM, escalating to SIGKILL after a bound

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::observability::metrics::record_supervisor_restart;
use crate::resilience::Backoff;
use crate::supervisor::options::StartOptions;
use crate::supervisor::SupervisorError;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Starts runtime supervisor processes.
#[async_trait]
pub trait RuntimeLauncher: Send + Sync {
    async fn launch(&self, options: &StartOptions) -> Result<Box<dyn RuntimeProcess>, SupervisorError>;
}

/// A running runtime supervisor process.
#[async_trait]
pub trait RuntimeProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit. Returns a description of how it exited.
    async fn wait(&mut self) -> Result<String, SupervisorError>;

    /// Ask the process to exit.
    fn terminate(&mut self) -> Result<(), SupervisorError>;

    /// Kill the process and reap it.
    async fn kill(&mut self) -> Result<(), SupervisorError>;
}

/// Launches the runtime binary as a child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl RuntimeLauncher for ProcessLauncher {
    async fn launch(&self, options: &StartOptions) -> Result<Box<dyn RuntimeProcess>, SupervisorError> {
        prepare_dir(&options.root)?;
        prepare_dir(&options.state)?;

        let rendered = options.render_config().map_err(|e| SupervisorError::Options(e.to_string()))?;
        let config_path = options.config_path();
        tokio::fs::write(&config_path, rendered)
            .await
            .map_err(|source| SupervisorError::Io {
                path: config_path.clone(),
                source,
            })?;

        let binary = options.resolve_binary();
        let child = Command::new(&binary)
            .args(options.args())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                binary: binary.clone(),
                source,
            })?;

        tracing::info!(binary = %binary.display(), pid = ?child.id(), "Started runtime supervisor process");
        Ok(Box::new(ChildProcess { child }))
    }
}

fn prepare_dir(path: &Path) -> Result<(), SupervisorError> {
    let io_err = |source| SupervisorError::Io {
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(path).map_err(io_err)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o711)).map_err(io_err)
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl RuntimeProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<String, SupervisorError> {
        let status = self.child.wait().await.map_err(SupervisorError::Wait)?;
        Ok(status.to_string())
    }

    fn terminate(&mut self) -> Result<(), SupervisorError> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| SupervisorError::Signal(e.to_string()))
    }

    async fn kill(&mut self) -> Result<(), SupervisorError> {
        self.child.kill().await.map_err(SupervisorError::Wait)
    }
}

/// A runtime supervisor owned by this daemon.
pub struct ManagedSupervisor {
    address: std::path::PathBuf,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ManagedSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedSupervisor")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl ManagedSupervisor {
    /// Launch the supervisor, wait until its socket is ready and start the
    /// restart monitor.
    pub async fn start(
        launcher: Arc<dyn RuntimeLauncher>,
        options: StartOptions,
        stop_timeout: Duration,
    ) -> Result<Self, SupervisorError> {
        let process = launch_ready(launcher.as_ref(), &options).await?;
        let address = options.address();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor(launcher, options, process, cancel.clone(), stop_timeout));
        Ok(Self {
            address,
            cancel,
            task,
        })
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Stop the process and wait for the monitor to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Runtime supervisor monitor failed");
        }
    }
}

async fn launch_ready(
    launcher: &dyn RuntimeLauncher,
    options: &StartOptions,
) -> Result<Box<dyn RuntimeProcess>, SupervisorError> {
    let address = options.address();
    remove_stale_socket(&address).await?;
    let mut process = launcher.launch(options).await?;

    let ready = async {
        loop {
            if accepts_connections(&address).await {
                return;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    };

    let outcome = tokio::select! {
        _ = tokio::time::timeout(options.ready_timeout, ready) => None,
        exit = process.wait() => Some(exit),
    };
    match outcome {
        Some(exit) => {
            let status = exit.unwrap_or_else(|e| e.to_string());
            Err(SupervisorError::ExitedEarly(status))
        }
        None if accepts_connections(&address).await => {
            tracing::info!(address = %address.display(), "Runtime supervisor ready");
            Ok(process)
        }
        None => {
            stop_process(process.as_mut(), Duration::ZERO).await;
            Err(SupervisorError::NotReady {
                address,
                timeout: options.ready_timeout,
            })
        }
    }
}

/// A socket left by a previous process would pass the readiness check before
/// the new process listens.
async fn remove_stale_socket(address: &Path) -> Result<(), SupervisorError> {
    match tokio::fs::remove_file(address).await {
        Ok(()) => {
            tracing::debug!(address = %address.display(), "Removed stale runtime supervisor socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SupervisorError::Io {
            path: address.to_path_buf(),
            source,
        }),
    }
}

async fn accepts_connections(address: &Path) -> bool {
    UnixStream::connect(address).await.is_ok()
}

async fn monitor(
    launcher: Arc<dyn RuntimeLauncher>,
    options: StartOptions,
    mut process: Box<dyn RuntimeProcess>,
    cancel: CancellationToken,
    stop_timeout: Duration,
) {
    let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                stop_process(process.as_mut(), stop_timeout).await;
                return;
            }
            exit = process.wait() => {
                match exit {
                    Ok(status) => tracing::warn!(%status, "Runtime supervisor exited, restarting"),
                    Err(e) => tracing::warn!(error = %e, "Lost runtime supervisor process, restarting"),
                }
            }
        }

        loop {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            record_supervisor_restart();
            match launch_ready(launcher.as_ref(), &options).await {
                Ok(restarted) => {
                    process = restarted;
                    backoff.reset();
                    break;
                }
                Err(e) => tracing::error!(error = %e, attempt = backoff.attempts(), "Failed to restart runtime supervisor"),
            }
        }
    }
}

/// SIGTERM, then SIGKILL if the process outlives `timeout`.
async fn stop_process(process: &mut dyn RuntimeProcess, timeout: Duration) {
    let pid = process.pid();
    if let Err(e) = process.terminate() {
        tracing::warn!(error = %e, ?pid, "Failed to signal runtime supervisor");
    }
    match tokio::time::timeout(timeout, process.wait()).await {
        Ok(_) => tracing::info!(?pid, "Runtime supervisor stopped"),
        Err(_) => {
            tracing::warn!(?pid, timeout_secs = timeout.as_secs(), "Runtime supervisor did not stop in time, killing");
            if let Err(e) = process.kill().await {
                tracing::error!(error = %e, ?pid, "Failed to kill runtime supervisor");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    /// Listens on the socket on launch and exits when told to.
    struct FakeLauncher {
        launches: AtomicUsize,
        create_socket: bool,
        exits: std::sync::Mutex<Vec<oneshot::Sender<()>>>,
    }

    impl FakeLauncher {
        fn new(create_socket: bool) -> Self {
            Self {
                launches: AtomicUsize::new(0),
                create_socket,
                exits: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn crash_latest(&self) {
            if let Some(tx) = self.exits.lock().unwrap().pop() {
                let _ = tx.send(());
            }
        }
    }

    struct FakeProcess {
        exit: Option<oneshot::Receiver<()>>,
        terminated: bool,
        _socket: Option<std::os::unix::net::UnixListener>,
    }

    #[async_trait]
    impl RuntimeProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        async fn wait(&mut self) -> Result<String, SupervisorError> {
            if self.terminated {
                return Ok("terminated".into());
            }
            match self.exit.as_mut() {
                Some(rx) => {
                    let _ = rx.await;
                    self.exit = None;
                    Ok("exit status: 1".into())
                }
                None => std::future::pending().await,
            }
        }

        fn terminate(&mut self) -> Result<(), SupervisorError> {
            self.terminated = true;
            Ok(())
        }

        async fn kill(&mut self) -> Result<(), SupervisorError> {
            Ok(())
        }
    }

    #[async_trait]
    impl RuntimeLauncher for FakeLauncher {
        async fn launch(&self, options: &StartOptions) -> Result<Box<dyn RuntimeProcess>, SupervisorError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let socket = self.create_socket.then(|| {
                std::fs::create_dir_all(&options.state).unwrap();
                std::os::unix::net::UnixListener::bind(options.address()).unwrap()
            });
            let (tx, rx) = oneshot::channel();
            self.exits.lock().unwrap().push(tx);
            Ok(Box::new(FakeProcess {
                exit: Some(rx),
                terminated: false,
                _socket: socket,
            }))
        }
    }

    fn options(dir: &Path) -> StartOptions {
        StartOptions {
            binary: "containerd".into(),
            root: dir.join("root"),
            state: dir.join("state"),
            log_level: "info".into(),
            log_format: None,
            cri_disabled: true,
            detect_local_binary: false,
            ready_timeout: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn restarts_after_unexpected_exit() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(true));
        let supervisor = ManagedSupervisor::start(launcher.clone(), options(dir.path()), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(supervisor.address(), dir.path().join("state/containerd.sock"));

        launcher.crash_latest();
        tokio::time::timeout(Duration::from_secs(2), async {
            while launcher.launches.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("supervisor should be relaunched");

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn missing_socket_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(false));
        let err = ManagedSupervisor::start(launcher, options(dir.path()), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::NotReady { .. }));
    }

    #[tokio::test]
    async fn leftover_socket_file_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path());
        std::fs::create_dir_all(&options.state).unwrap();
        std::fs::write(options.address(), b"").unwrap();

        let launcher = Arc::new(FakeLauncher::new(false));
        let err = ManagedSupervisor::start(launcher, options.clone(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::NotReady { .. }));
        assert!(!options.address().exists());
    }

    #[tokio::test]
    async fn leftover_socket_is_replaced_on_launch() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path());
        std::fs::create_dir_all(&options.state).unwrap();
        drop(std::os::unix::net::UnixListener::bind(options.address()).unwrap());

        let launcher = Arc::new(FakeLauncher::new(true));
        let supervisor = ManagedSupervisor::start(launcher, options, Duration::from_millis(50))
            .await
            .unwrap();
        supervisor.stop().await;
    }
}
