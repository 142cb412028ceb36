//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + command-line flags
//!     → loader.rs (parse, conflict check, flag overlay, host normalisation)
//!     → validation.rs (semantic checks)
//!     → DaemonConfig (validated)
//!     → held in an ArcSwap by the orchestrator
//!
//! On reload request (SIGHUP, or watcher.rs when enabled):
//!     → loader.rs reloads through the same ConfigSource
//!     → reload controller validates and applies
//!     → atomic swap of the live DaemonConfig
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - `None` distinguishes "not set" where it matters (tls, tlsverify, debug)
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{ConfigError, ConfigSource, FlagOverrides};
pub use schema::{DaemonConfig, LogFormat};
pub use watcher::ConfigWatcher;
