//! Build backend front: session attach and build cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;

use crate::daemon::devices::DeviceDriver;
use crate::daemon::{BuildBackend, BuildManager, BuildOptions, CollaboratorError, SessionManager};
use crate::http::middleware::error_response;
use crate::http::router::ApiRouter;

pub struct EmbeddedBuilder {
    root: PathBuf,
    sessions: Arc<SessionManager>,
    builds: Arc<BuildManager>,
}

impl EmbeddedBuilder {
    pub async fn new(options: BuildOptions) -> Result<Self, CollaboratorError> {
        tokio::fs::create_dir_all(&options.root).await?;
        if let Some(cdi) = &options.cdi {
            tracing::debug!(devices = cdi.devices().len(), "Build backend sees CDI devices");
        }
        tracing::debug!(
            root = %options.root.display(),
            containerd = %options.supervisor_address.display(),
            "Build backend initialised"
        );
        Ok(Self {
            root: options.root,
            sessions: options.sessions,
            builds: options.builds,
        })
    }
}

async fn open_session(sessions: Arc<SessionManager>, params: HashMap<String, String>) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    let name = params.get("name").cloned().unwrap_or_default();
    (StatusCode::CREATED, Json(sessions.open(id, name))).into_response()
}

async fn cancel_build(builds: Arc<BuildManager>, params: HashMap<String, String>) -> Response {
    let Some(id) = params.get("id") else {
        return error_response(StatusCode::BAD_REQUEST, "build ID not provided");
    };
    if builds.cancel(id) {
        StatusCode::OK.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, format!("no such build: {id}"))
    }
}

#[async_trait]
impl BuildBackend for EmbeddedBuilder {
    async fn close(&self) -> Result<(), CollaboratorError> {
        let builds = self.builds.cancel_all();
        let sessions = self.sessions.close_all();
        tracing::debug!(root = %self.root.display(), builds, sessions, "Build backend closed");
        Ok(())
    }

    fn routers(&self) -> Vec<ApiRouter> {
        let open = Arc::clone(&self.sessions);
        let list = Arc::clone(&self.sessions);
        let builds = Arc::clone(&self.builds);
        vec![ApiRouter::new("build")
            .route(
                "/session",
                post(move |Query(params): Query<HashMap<String, String>>| open_session(Arc::clone(&open), params)),
            )
            .route(
                "/build/cancel",
                post(move |Query(params): Query<HashMap<String, String>>| cancel_build(Arc::clone(&builds), params)),
            )
            .experimental_route(
                "/session/list",
                get(move || {
                    let sessions = Arc::clone(&list);
                    async move { Json(sessions.list()) }
                }),
            )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn cancel_build_by_id() {
        let builds = Arc::new(BuildManager::new());
        let token = builds.register("b1");

        let response = cancel_build(Arc::clone(&builds), params(&[("id", "b1")])).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(token.is_cancelled());

        let response = cancel_build(Arc::clone(&builds), params(&[("id", "b1")])).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = cancel_build(builds, params(&[])).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn session_is_registered() {
        let sessions = Arc::new(SessionManager::new());
        let response = open_session(Arc::clone(&sessions), params(&[("name", "cli")])).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(sessions.list().len(), 1);
        assert_eq!(sessions.list()[0].name, "cli");
    }
}
