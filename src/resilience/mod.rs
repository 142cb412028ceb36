//! Resilience subsystem.
//!
//! # Design Decisions
//! - Retry loops back off exponentially with jitter so a burst of failures
//!   (fd exhaustion, a crashing child) does not turn into a busy loop

pub mod backoff;

pub use backoff::{calculate_backoff, Backoff};
