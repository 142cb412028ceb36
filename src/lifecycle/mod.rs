//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     StartupStep sequence → each success pushes onto the TeardownStack
//!
//! Shutdown (shutdown.rs):
//!     ShutdownSignal fired → drain API server → finalise (grace / close)
//!     → daemon core shutdown bounded by its timeout
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → ShutdownSignal
//!     SIGHUP → ReloadGate
//!
//! Reload (reload.rs):
//!     ReloadGate → ReloadController → validate → core → plugins → debug
//!
//! Readiness (notify.rs):
//!     Starting / Ready / Stopping → service manager
//! ```

pub mod notify;
pub mod reload;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use notify::{Notifier, Readiness};
pub use reload::{reload_gate, ReloadController, ReloadGate, ReloadRequests, ReloadTrigger};
pub use shutdown::{shutdown_core, ShutdownCoordinator, ShutdownOutcome, ShutdownPhase, ShutdownSignal};
pub use startup::{StartupStep, TeardownStack};
