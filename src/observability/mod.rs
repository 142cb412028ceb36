//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, runtime debug toggle)
//!     → metrics.rs (startup timings, listener gauge, reload/restart counters)
//!
//! Consumers:
//!     → stderr (text or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogHandle};
pub use metrics::MetricsServer;
