//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (ticks, timeouts, addresses)
//! - Reject paths and names the daemon cannot use
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: DaemonConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system, at start and on reload

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::schema::DaemonConfig;

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "fatal"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("log level is not valid: {0}")]
    LogLevel(String),

    #[error("{field} must be an absolute path: {path}")]
    RelativePath { field: &'static str, path: PathBuf },

    #[error("invalid metrics address {address}: {message}")]
    MetricsAddress { address: String, message: String },

    #[error("authorization plugin names must not be empty")]
    EmptyAuthzPlugin,

    #[error("swarm raft election tick ({election}) must be greater than the heartbeat tick ({heartbeat})")]
    RaftTicks { heartbeat: u32, election: u32 },

    #[error("swarm raft heartbeat tick must be at least 1")]
    RaftHeartbeat,

    #[error("runtime ready timeout must be at least one second")]
    ReadyTimeout,
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &DaemonConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !LOG_LEVELS.contains(&config.log_level.as_str()) {
        errors.push(ValidationError::LogLevel(config.log_level.clone()));
    }

    for (field, path) in [("data-root", &config.root), ("exec-root", &config.exec_root)] {
        if !path.is_absolute() {
            errors.push(ValidationError::RelativePath {
                field,
                path: path.clone(),
            });
        }
    }
    if let Some(pidfile) = &config.pidfile {
        if !pidfile.is_absolute() {
            errors.push(ValidationError::RelativePath {
                field: "pidfile",
                path: pidfile.clone(),
            });
        }
    }

    if let Some(address) = &config.metrics_address {
        if let Err(e) = address.parse::<SocketAddr>() {
            errors.push(ValidationError::MetricsAddress {
                address: address.clone(),
                message: e.to_string(),
            });
        }
    }

    if config.authorization_plugins.iter().any(|name| name.trim().is_empty()) {
        errors.push(ValidationError::EmptyAuthzPlugin);
    }

    let swarm = &config.swarm;
    if swarm.raft_heartbeat_tick == 0 {
        errors.push(ValidationError::RaftHeartbeat);
    } else if swarm.raft_election_tick <= swarm.raft_heartbeat_tick {
        errors.push(ValidationError::RaftTicks {
            heartbeat: swarm.raft_heartbeat_tick,
            election: swarm.raft_election_tick,
        });
    }

    if config.runtime.ready_timeout_secs == 0 {
        errors.push(ValidationError::ReadyTimeout);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&DaemonConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = DaemonConfig {
            log_level: "loud".into(),
            root: PathBuf::from("relative/root"),
            metrics_address: Some("not-an-address".into()),
            authorization_plugins: vec![String::new()],
            ..DaemonConfig::default()
        };
        config.swarm.raft_election_tick = 1;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 5);
        assert_eq!(errors[0], ValidationError::LogLevel("loud".into()));
        assert!(errors.contains(&ValidationError::RaftTicks {
            heartbeat: 1,
            election: 1
        }));
    }
}
