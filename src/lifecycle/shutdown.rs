//! Shutdown coordination.
//!
//! # Responsibilities
//! - Provide the single-fire stop signal shared by signal handlers, startup
//!   failure paths and tests
//! - Drain the API server once the signal fires, inside its own drain scope
//! - Finalise the API server at teardown (grace extension or immediate close)
//! - Bound the daemon core's shutdown by its configured timeout
//!
//! # Design Decisions
//! - The drain token is never derived from another token, so cancelling the
//!   process-wide scope cannot cut the grace window short
//! - Immediate close (startup failed before any stop) and graceful drain are
//!   separate code paths

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::daemon::DaemonCore;
use crate::http::ApiServer;

/// Extra time granted to in-flight requests after the stop signal, once the
/// rest of the daemon has shut down.
pub const DEFAULT_GRACE_EXTENSION: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct SignalInner {
    fired: AtomicBool,
    token: CancellationToken,
}

/// Single-fire "stop requested" notification.
///
/// Firing is idempotent and safe to race: exactly one caller observes the
/// transition.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Returns `true` only for the call that made the
    /// transition.
    pub fn fire(&self) -> bool {
        let won = self
            .inner
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            tracing::info!("Shutdown requested");
            self.inner.token.cancel();
        }
        won
    }

    pub fn is_requested(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested. Resolves immediately for
    /// observers attached after the fact.
    pub async fn requested(&self) {
        self.inner.token.cancelled().await;
    }
}

/// Shutdown progress as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    ShutdownRequested,
    Draining,
    Stopped,
}

/// Watches the stop signal and drives the API server through its drain.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    signal: ShutdownSignal,
    server: Arc<ApiServer>,
    drain: CancellationToken,
    phase: Arc<watch::Sender<ShutdownPhase>>,
    task: JoinHandle<()>,
    grace: Duration,
}

impl ShutdownCoordinator {
    /// Spawn the watch task. The signal may already have fired, in which case
    /// the server is drained as soon as the task runs.
    pub fn spawn(signal: ShutdownSignal, server: Arc<ApiServer>, grace: Duration) -> Self {
        let (tx, _) = watch::channel(ShutdownPhase::Running);
        let phase = Arc::new(tx);
        let drain = CancellationToken::new();

        let task = tokio::spawn(watch_signal(
            signal.clone(),
            Arc::clone(&server),
            drain.clone(),
            Arc::clone(&phase),
        ));

        Self {
            signal,
            server,
            drain,
            phase,
            task,
            grace,
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Finalise the API server.
    ///
    /// If stop was requested, wait for the drain to finish, cancelling it once
    /// the grace extension has elapsed. Otherwise startup ended without a stop
    /// and the server is closed with no grace period.
    pub async fn finish(mut self) {
        if self.signal.is_requested() {
            if tokio::time::timeout(self.grace, &mut self.task).await.is_err() {
                tracing::warn!(
                    grace_secs = self.grace.as_secs_f64(),
                    active = self.server.active_connections(),
                    "Grace period expired, cancelling API server shutdown"
                );
                self.drain.cancel();
                let _ = (&mut self.task).await;
            }
        } else {
            self.server.close();
            self.task.abort();
            let _ = (&mut self.task).await;
            self.phase.send_replace(ShutdownPhase::Stopped);
            tracing::debug!("API server closed without grace period");
        }
    }
}

async fn watch_signal(
    signal: ShutdownSignal,
    server: Arc<ApiServer>,
    drain: CancellationToken,
    phase: Arc<watch::Sender<ShutdownPhase>>,
) {
    signal.requested().await;
    phase.send_replace(ShutdownPhase::ShutdownRequested);

    tracing::info!("Stopping API server");
    phase.send_replace(ShutdownPhase::Draining);
    if let Err(e) = server.shutdown(&drain).await {
        tracing::error!(error = %e, "Error shutting down API server");
    }

    phase.send_replace(ShutdownPhase::Stopped);
}

/// How the daemon core's shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The core returned, or the caller cancelled explicitly.
    Clean,
    /// The core's shutdown timeout elapsed.
    Forced,
}

/// Shut the daemon core down, bounded by its own timeout.
///
/// A non-negative timeout is a deadline; a negative one waits until the core
/// returns or `cancel` is cancelled by the caller.
pub async fn shutdown_core(core: Arc<dyn DaemonCore>, cancel: CancellationToken) -> ShutdownOutcome {
    let timeout = core.shutdown_timeout();
    let task = {
        let core = Arc::clone(&core);
        let cancel = cancel.clone();
        tokio::spawn(async move { core.shutdown(cancel).await })
    };

    let finished = async {
        tokio::select! {
            _ = task => {}
            _ = cancel.cancelled() => {}
        }
    };

    let outcome = if timeout >= 0 {
        match tokio::time::timeout(Duration::from_secs(timeout as u64), finished).await {
            Ok(()) => ShutdownOutcome::Clean,
            Err(_) => {
                cancel.cancel();
                ShutdownOutcome::Forced
            }
        }
    } else {
        finished.await;
        ShutdownOutcome::Clean
    };

    match outcome {
        ShutdownOutcome::Forced => tracing::error!(timeout_secs = timeout, "Force shutdown daemon"),
        ShutdownOutcome::Clean => tracing::debug!("Clean shutdown succeeded"),
    }
    outcome
}
