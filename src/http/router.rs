//! Route table composition.
//!
//! Every subsystem contributes an [`ApiRouter`]; the orchestrator composes
//! them into one axum [`Router`]. Experimental routes are only mounted when
//! the daemon core runs in experimental mode.

use std::collections::BTreeSet;

use axum::http::StatusCode;
use axum::routing::MethodRouter;
use axum::Router;
use thiserror::Error;

use crate::http::middleware::error_response;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("route {path} registered by both {first} and {second}")]
    Duplicate {
        path: String,
        first: String,
        second: String,
    },
}

/// A single route contributed by a subsystem.
pub struct Route {
    pub path: String,
    pub handler: MethodRouter,
    pub experimental: bool,
}

/// Named group of routes owned by one subsystem.
pub struct ApiRouter {
    name: String,
    routes: Vec<Route>,
}

impl ApiRouter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
        }
    }

    pub fn route(mut self, path: impl Into<String>, handler: MethodRouter) -> Self {
        self.routes.push(Route {
            path: path.into(),
            handler,
            experimental: false,
        });
        self
    }

    /// A route only reachable when experimental features are on.
    pub fn experimental_route(mut self, path: impl Into<String>, handler: MethodRouter) -> Self {
        self.routes.push(Route {
            path: path.into(),
            handler,
            experimental: true,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.path.as_str())
    }
}

impl std::fmt::Debug for ApiRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRouter")
            .field("name", &self.name)
            .field("paths", &self.paths().collect::<Vec<_>>())
            .finish()
    }
}

/// Compose subsystem routers into the full route table.
pub fn compose(routers: Vec<ApiRouter>, experimental: bool) -> Result<Router, RouteError> {
    let mut router = Router::new();
    let mut owners: Vec<(String, String)> = Vec::new();
    let mut seen = BTreeSet::new();
    let mut mounted = 0usize;

    for api in routers {
        for route in api.routes {
            if route.experimental && !experimental {
                tracing::debug!(router = %api.name, path = %route.path, "Skipping experimental route");
                continue;
            }
            if !seen.insert(route.path.clone()) {
                let first = owners
                    .iter()
                    .find(|(path, _)| *path == route.path)
                    .map(|(_, owner)| owner.clone())
                    .unwrap_or_default();
                return Err(RouteError::Duplicate {
                    path: route.path,
                    first,
                    second: api.name,
                });
            }
            owners.push((route.path.clone(), api.name.clone()));
            router = router.route(&route.path, route.handler);
            mounted += 1;
        }
    }

    tracing::debug!(routes = mounted, experimental, "Route table composed");
    Ok(router.fallback(|| async { error_response(StatusCode::NOT_FOUND, "page not found") }))
}
