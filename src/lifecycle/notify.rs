//! Service manager readiness notifications.
//!
//! Speaks the `sd_notify` datagram protocol when `NOTIFY_SOCKET` is set and
//! does nothing otherwise.

use std::io;
use std::path::PathBuf;

use tokio::net::UnixDatagram;

pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

/// Daemon state reported to the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Listeners are bound; the daemon is still starting.
    Starting,
    Ready,
    Stopping,
}

impl Readiness {
    fn message(self) -> &'static str {
        match self {
            Readiness::Starting => "STATUS=starting",
            Readiness::Ready => "READY=1",
            Readiness::Stopping => "STOPPING=1",
        }
    }
}

/// Sends readiness notifications to a service manager.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    socket: Option<PathBuf>,
}

impl Notifier {
    pub fn from_env() -> Self {
        let socket = std::env::var_os(NOTIFY_SOCKET_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Self { socket }
    }

    pub fn with_socket(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: Some(socket.into()),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub async fn notify(&self, state: Readiness) -> io::Result<()> {
        let Some(path) = &self.socket else {
            return Ok(());
        };
        let socket = UnixDatagram::unbound()?;
        socket.send_to(state.message().as_bytes(), path).await?;
        Ok(())
    }

    /// Notify, logging instead of failing.
    pub async fn notify_or_log(&self, state: Readiness) {
        if let Err(e) = self.notify(state).await {
            tracing::warn!(error = %e, ?state, "Failed to notify service manager");
        }
    }
}
