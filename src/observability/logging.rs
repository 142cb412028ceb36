//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global tracing subscriber
//! - Select text or JSON output from configuration
//! - Toggle debug logging at runtime (config reload)
//!
//! # Design Decisions
//! - The level filter sits behind a `reload` layer so it can be swapped
//!   without reinstalling the subscriber
//! - `RUST_LOG` wins over the configured level at start

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::schema::{DaemonConfig, LogFormat};

/// Errors raised while configuring logging.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {filter:?}: {message}")]
    Filter { filter: String, message: String },

    #[error("failed to install log subscriber: {0}")]
    Install(String),

    #[error("failed to swap log filter: {0}")]
    Reload(String),
}

#[derive(Debug)]
struct Inner {
    filter: Option<reload::Handle<EnvFilter, Registry>>,
    base_level: String,
    debug: AtomicBool,
}

/// Handle onto the installed subscriber's level filter.
#[derive(Debug, Clone)]
pub struct LogHandle {
    inner: Arc<Inner>,
}

impl LogHandle {
    /// A handle that only tracks the debug flag. Used when another subscriber
    /// is already installed (tests, embedding).
    pub fn detached(debug: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                filter: None,
                base_level: "info".to_string(),
                debug: AtomicBool::new(debug),
            }),
        }
    }

    pub fn debug_enabled(&self) -> bool {
        self.inner.debug.load(Ordering::SeqCst)
    }

    /// Switch debug logging on or off.
    pub fn set_debug(&self, enabled: bool) -> Result<(), LoggingError> {
        if let Some(handle) = &self.inner.filter {
            let level = if enabled { "debug" } else { self.inner.base_level.as_str() };
            let filter = parse_filter(level)?;
            handle
                .reload(filter)
                .map_err(|e| LoggingError::Reload(e.to_string()))?;
        }
        self.inner.debug.store(enabled, Ordering::SeqCst);
        tracing::info!(debug = enabled, "Debug logging toggled");
        Ok(())
    }
}

/// Install the global subscriber.
pub fn init_logging(config: &DaemonConfig) -> Result<LogHandle, LoggingError> {
    let debug = config.debug_enabled();
    let level = if debug { "debug" } else { config.log_level.as_str() };

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(level)?,
    };
    let (filter, handle) = reload::Layer::new(filter);

    let (json, text) = match config.log_format {
        LogFormat::Json => (Some(fmt::layer().json().with_target(true)), None),
        LogFormat::Text => (None, Some(fmt::layer().with_target(true))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
        .map_err(|e| LoggingError::Install(e.to_string()))?;

    Ok(LogHandle {
        inner: Arc::new(Inner {
            filter: Some(handle),
            base_level: config.log_level.clone(),
            debug: AtomicBool::new(debug),
        }),
    })
}

fn parse_filter(filter: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(filter).map_err(|e| LoggingError::Filter {
        filter: filter.to_string(),
        message: e.to_string(),
    })
}
