//! Metrics collection and exposition.
//!
//! # Metrics
//! - `engine_startup_step_seconds` (histogram): duration of each startup step, by `step`
//! - `engine_api_listeners` (gauge): bound API listeners
//! - `engine_config_reloads_total` (counter): reload attempts, by `outcome`
//! - `engine_supervisor_restarts_total` (counter): managed runtime restarts
//!
//! # Design Decisions
//! - One global Prometheus recorder per process, installed on first use
//! - The scrape endpoint is a small axum router on its own listener

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Errors raised by the metrics endpoint.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to install metrics recorder: {0}")]
    Recorder(String),

    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

static RECORDER: OnceLock<Result<PrometheusHandle, String>> = OnceLock::new();

/// Install the global recorder (once) and return its render handle.
pub fn install_recorder() -> Result<PrometheusHandle, MetricsError> {
    RECORDER
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| e.to_string())
        })
        .clone()
        .map_err(MetricsError::Recorder)
}

pub fn record_startup_step(step: &'static str, elapsed: Duration) {
    metrics::histogram!("engine_startup_step_seconds", "step" => step).record(elapsed.as_secs_f64());
}

pub fn set_api_listeners(count: usize) {
    metrics::gauge!("engine_api_listeners").set(count as f64);
}

pub fn record_reload(outcome: &'static str) {
    metrics::counter!("engine_config_reloads_total", "outcome" => outcome).increment(1);
}

pub fn record_supervisor_restart() {
    metrics::counter!("engine_supervisor_restarts_total").increment(1);
}

/// Running `/metrics` endpoint.
#[derive(Debug)]
pub struct MetricsServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MetricsServer {
    /// Bind the scrape endpoint. Binding is synchronous with the caller so a
    /// bad address fails startup.
    pub async fn start(address: &str) -> Result<Self, MetricsError> {
        let handle = install_recorder()?;
        let listener = TcpListener::bind(address).await.map_err(|source| MetricsError::Bind {
            address: address.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| MetricsError::Bind {
            address: address.to_string(),
            source,
        })?;

        let router = Router::new().route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Metrics endpoint failed");
            }
        });

        tracing::info!(address = %local_addr, "Metrics endpoint listening");
        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop serving and wait for the endpoint task.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Metrics endpoint task ended abnormally");
        }
    }
}
