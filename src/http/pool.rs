//! API listener pool.
//!
//! One task per bound listener. The first fatal serve error is kept (later
//! ones are logged and dropped) and triggers an orderly shutdown of the whole
//! daemon. The pool returns only after every listener task has returned.

use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::http::server::ServeError;
use crate::lifecycle::ShutdownSignal;
use crate::net::ApiListener;

/// Runs the serve loops for a set of listeners.
#[derive(Debug, Default)]
pub struct ListenerPool;

impl ListenerPool {
    /// Serve every listener with `serve` and wait for all of them.
    ///
    /// Returns the first fatal error, if any. [`ServeError::Closed`] is the
    /// normal result of a deliberate shutdown and is not reported.
    pub async fn run<F, Fut>(listeners: Vec<ApiListener>, stop: &ShutdownSignal, serve: F) -> Option<ServeError>
    where
        F: Fn(ApiListener) -> Fut,
        Fut: Future<Output = Result<(), ServeError>> + Send + 'static,
    {
        let (first_error, mut errors) = mpsc::channel::<ServeError>(1);
        let mut tasks = JoinSet::new();

        for listener in listeners {
            let name = listener.spec().canonical();
            let served = serve(listener);
            let first_error = first_error.clone();
            let stop = stop.clone();

            tasks.spawn(async move {
                tracing::info!(listener = %name, "API listen started");
                match served.await {
                    Ok(()) | Err(ServeError::Closed) => {}
                    Err(e) => {
                        tracing::error!(listener = %name, error = %e, "ServeAPI error");
                        if let Err(mpsc::error::TrySendError::Full(dropped)) = first_error.try_send(e) {
                            tracing::debug!(listener = %name, error = %dropped, "Dropping later serve error");
                        }
                        stop.fire();
                    }
                }
                tracing::debug!(listener = %name, "API listener returned");
            });
        }
        drop(first_error);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "API listener task panicked");
                stop.fire();
            }
        }

        errors.try_recv().ok()
    }
}
