//! Startup sequencing primitives.
//!
//! # Responsibilities
//! - Name the fixed startup steps
//! - Hold the teardown stack: each step that succeeds pushes its own inverse
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Nothing is pushed speculatively; a step that fails leaves no entry
//! - Failure unwind and normal shutdown pop the same stack

use std::future::Future;
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::observability::metrics::record_startup_step;

/// The fixed startup sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StartupStep {
    Config,
    Listeners,
    Supervisor,
    Middleware,
    Devices,
    Core,
    Authz,
    Metrics,
    Cluster,
    Builder,
    Routes,
    Serve,
}

impl StartupStep {
    pub const ALL: [StartupStep; 12] = [
        StartupStep::Config,
        StartupStep::Listeners,
        StartupStep::Supervisor,
        StartupStep::Middleware,
        StartupStep::Devices,
        StartupStep::Core,
        StartupStep::Authz,
        StartupStep::Metrics,
        StartupStep::Cluster,
        StartupStep::Builder,
        StartupStep::Routes,
        StartupStep::Serve,
    ];

    /// 1-based position in the sequence.
    pub fn number(self) -> usize {
        self as usize + 1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StartupStep::Config => "config",
            StartupStep::Listeners => "listeners",
            StartupStep::Supervisor => "supervisor",
            StartupStep::Middleware => "middleware",
            StartupStep::Devices => "devices",
            StartupStep::Core => "core",
            StartupStep::Authz => "authz",
            StartupStep::Metrics => "metrics",
            StartupStep::Cluster => "cluster",
            StartupStep::Builder => "builder",
            StartupStep::Routes => "routes",
            StartupStep::Serve => "serve",
        }
    }
}

impl std::fmt::Display for StartupStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run one startup step, recording how long it took.
pub async fn timed<T, E, Fut>(step: StartupStep, fut: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let result = fut.await;
    let elapsed = started.elapsed();
    record_startup_step(step.as_str(), elapsed);
    match &result {
        Ok(_) => tracing::debug!(step = %step, elapsed_ms = elapsed.as_millis() as u64, "Startup step complete"),
        Err(_) => tracing::debug!(step = %step, "Startup step failed"),
    }
    result
}

type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + Sync>;

/// LIFO stack of named inverse operations.
#[derive(Default)]
pub struct TeardownStack {
    entries: Vec<(&'static str, Teardown)>,
}

impl std::fmt::Debug for TeardownStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl TeardownStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the inverse of a step that just succeeded.
    pub fn push<F, Fut>(&mut self, name: &'static str, teardown: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.entries.push((name, Box::new(move || teardown().boxed())));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry names, oldest first.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(name, _)| *name).collect()
    }

    /// Run every entry, newest first. Entries handle their own errors.
    pub async fn unwind(mut self) {
        while let Some((name, teardown)) = self.entries.pop() {
            tracing::debug!(entry = name, "Tearing down");
            teardown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn unwinds_newest_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = TeardownStack::new();
        for name in ["pidfile", "supervisor", "core"] {
            let order = Arc::clone(&order);
            stack.push(name, move || async move {
                order.lock().unwrap().push(name);
            });
        }
        assert_eq!(stack.names(), ["pidfile", "supervisor", "core"]);

        stack.unwind().await;
        assert_eq!(*order.lock().unwrap(), ["core", "supervisor", "pidfile"]);
    }

    #[test]
    fn steps_are_numbered_in_order() {
        assert_eq!(StartupStep::Config.number(), 1);
        assert_eq!(StartupStep::Serve.number(), 12);
        assert!(StartupStep::ALL.windows(2).all(|w| w[0] < w[1]));
    }
}
