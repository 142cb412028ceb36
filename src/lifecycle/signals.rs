//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to internal events
//! - Trigger appropriate actions (shutdown, reload)
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Signals only feed the stop signal and the reload gate; they never call
//!   into the daemon directly
//! - A third SIGTERM/SIGINT exits the process immediately
//! - SIGHUP triggers config reload, not shutdown

use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::lifecycle::reload::{ReloadGate, ReloadTrigger};
use crate::lifecycle::shutdown::ShutdownSignal;

/// Interrupts after which the process exits without waiting for shutdown.
pub const FORCE_EXIT_INTERRUPTS: u32 = 3;

/// What to do about an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// First interrupt: request graceful shutdown.
    Stop,
    /// Shutdown already requested; keep waiting.
    Wait,
    /// Give up on graceful shutdown.
    ForceExit,
}

/// Counts stop-type signals.
#[derive(Debug, Default)]
pub struct InterruptCounter {
    received: u32,
}

impl InterruptCounter {
    pub fn record(&mut self) -> InterruptAction {
        self.received += 1;
        match self.received {
            1 => InterruptAction::Stop,
            n if n >= FORCE_EXIT_INTERRUPTS => InterruptAction::ForceExit,
            _ => InterruptAction::Wait,
        }
    }
}

/// Install the handlers. Must be called from within a Tokio runtime.
pub fn spawn_signal_handlers(stop: ShutdownSignal, reload: ReloadGate) -> io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        let mut counter = InterruptCounter::default();
        loop {
            let signo = tokio::select! {
                Some(()) = interrupt.recv() => nix::libc::SIGINT,
                Some(()) = terminate.recv() => nix::libc::SIGTERM,
                Some(()) = hangup.recv() => {
                    tracing::info!("Received SIGHUP");
                    reload.request(ReloadTrigger::Signal);
                    continue;
                }
                else => return,
            };

            match counter.record() {
                InterruptAction::Stop => {
                    tracing::info!(signal = signo, "Processing signal");
                    stop.fire();
                }
                InterruptAction::Wait => {
                    tracing::info!(signal = signo, "Shutdown in progress, repeat to force exit");
                }
                InterruptAction::ForceExit => {
                    tracing::warn!(signal = signo, "Forcing exit");
                    std::process::exit(128 + signo);
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn third_interrupt_forces_exit() {
        let mut counter = InterruptCounter::default();
        assert_eq!(counter.record(), InterruptAction::Stop);
        assert_eq!(counter.record(), InterruptAction::Wait);
        assert_eq!(counter.record(), InterruptAction::ForceExit);
    }
}
