//! Container engine daemon: lifecycle and API listener orchestration.
//!
//! The [`Orchestrator`] prepares the daemon's filesystem state, attaches to
//! or spawns the container runtime supervisor, binds the API listeners under
//! a TLS policy, starts the daemon core, cluster and build backend in order
//! with rollback, serves until told to stop, and tears everything down.

pub mod config;
pub mod daemon;
pub mod embedded;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod orchestrator;
pub mod resilience;
pub mod supervisor;

pub use config::{ConfigSource, DaemonConfig, FlagOverrides};
pub use daemon::Platform;
pub use embedded::EmbeddedPlatform;
pub use lifecycle::{ReloadGate, ShutdownSignal};
pub use orchestrator::{DaemonError, Orchestrator, OrchestratorOptions, RunState};
