//! API middleware chain.
//!
//! # Responsibilities
//! - Tag responses when experimental features are on
//! - Negotiate the API version from the `/vX.Y` path prefix
//! - Consult the configured authorization plugins for every request
//! - Attach request IDs and request tracing
//!
//! # Design Decisions
//! - The chain wraps the composed route table as a fallback service, so the
//!   version prefix is stripped before routing
//! - The authorization plugin list is swapped atomically on reload

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, StatusCode, Uri};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use thiserror::Error;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::schema::DaemonConfig;
use crate::daemon::plugins::{AuthzRequest, PluginStore};

/// Newest API version this daemon speaks, and the default for unversioned
/// requests.
pub const DEFAULT_API_VERSION: ApiVersion = ApiVersion::new(1, 48);

/// Oldest API version that may be configured as the minimum.
pub const MIN_SUPPORTED_API_VERSION: ApiVersion = ApiVersion::new(1, 24);

pub const EXPERIMENTAL_HEADER: &str = "engine-experimental";
pub const API_VERSION_HEADER: &str = "api-version";

/// Errors raised while building the chain.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MiddlewareError {
    #[error("invalid API version {0:?}")]
    InvalidVersion(String),

    #[error("minimum API version {requested} is below the oldest supported version {oldest}")]
    MinimumTooOld { requested: ApiVersion, oldest: ApiVersion },

    #[error("minimum API version {requested} is newer than the current version {current}")]
    MinimumTooNew { requested: ApiVersion, current: ApiVersion },
}

/// `major.minor` API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ApiVersion {
    type Err = MiddlewareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MiddlewareError::InvalidVersion(s.to_string());
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

/// Accepted API version range.
#[derive(Debug, Clone)]
pub struct VersionPolicy {
    pub server: String,
    pub current: ApiVersion,
    pub minimum: ApiVersion,
}

impl VersionPolicy {
    pub fn new(min_api_version: Option<&str>) -> Result<Self, MiddlewareError> {
        let minimum = match min_api_version {
            Some(v) => v.parse()?,
            None => MIN_SUPPORTED_API_VERSION,
        };
        if minimum < MIN_SUPPORTED_API_VERSION {
            return Err(MiddlewareError::MinimumTooOld {
                requested: minimum,
                oldest: MIN_SUPPORTED_API_VERSION,
            });
        }
        if minimum > DEFAULT_API_VERSION {
            return Err(MiddlewareError::MinimumTooNew {
                requested: minimum,
                current: DEFAULT_API_VERSION,
            });
        }
        Ok(Self {
            server: format!("Engine/{} ({})", env!("CARGO_PKG_VERSION"), std::env::consts::OS),
            current: DEFAULT_API_VERSION,
            minimum,
        })
    }
}

/// Authorization middleware state. The plugin list is replaced on reload.
#[derive(Debug)]
pub struct AuthzMiddleware {
    plugins: ArcSwap<Vec<String>>,
    store: Arc<PluginStore>,
}

impl AuthzMiddleware {
    pub fn new(plugins: Vec<String>, store: Arc<PluginStore>) -> Self {
        Self {
            plugins: ArcSwap::from_pointee(plugins),
            store,
        }
    }

    pub fn set_plugins(&self, plugins: Vec<String>) {
        tracing::debug!(plugins = ?plugins, "Authorization plugins updated");
        self.plugins.store(Arc::new(plugins));
    }

    pub fn plugins(&self) -> Vec<String> {
        self.plugins.load().as_ref().clone()
    }
}

/// The experimental / version / authorization chain in front of every route.
#[derive(Debug, Clone)]
pub struct MiddlewareChain {
    experimental: bool,
    versions: Arc<VersionPolicy>,
    authz: Arc<AuthzMiddleware>,
}

impl MiddlewareChain {
    pub fn new(config: &DaemonConfig, store: Arc<PluginStore>) -> Result<Self, MiddlewareError> {
        let versions = VersionPolicy::new(config.min_api_version.as_deref())?;
        tracing::debug!(current = %versions.current, minimum = %versions.minimum, "API version range");
        Ok(Self {
            experimental: config.experimental,
            versions: Arc::new(versions),
            authz: Arc::new(AuthzMiddleware::new(config.authorization_plugins.clone(), store)),
        })
    }

    pub fn authz(&self) -> Arc<AuthzMiddleware> {
        Arc::clone(&self.authz)
    }

    /// Put the chain in front of the composed route table.
    pub fn wrap(&self, routes: Router) -> Router {
        Router::new()
            .fallback_service(routes)
            .layer(from_fn_with_state(Arc::clone(&self.authz), authorize))
            .layer(from_fn_with_state(Arc::clone(&self.versions), negotiate_version))
            .layer(from_fn_with_state(self.experimental, tag_experimental))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
    }
}

/// JSON error body used by every API error.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "message": message.into() });
    (status, Json(body)).into_response()
}

async fn tag_experimental(State(experimental): State<bool>, req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    if experimental {
        response
            .headers_mut()
            .insert(EXPERIMENTAL_HEADER, HeaderValue::from_static("true"));
    }
    response
}

async fn negotiate_version(State(policy): State<Arc<VersionPolicy>>, mut req: Request<Body>, next: Next) -> Response {
    let requested = match split_version(req.uri().path()) {
        Some((version, rest)) => {
            let Ok(version) = version.parse::<ApiVersion>() else {
                return error_response(StatusCode::NOT_FOUND, "page not found");
            };
            if let Some(uri) = rewrite_path(req.uri(), &rest) {
                *req.uri_mut() = uri;
            }
            version
        }
        None => policy.current,
    };

    if requested < policy.minimum {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!(
                "client version {requested} is too old. Minimum supported API version is {}, please upgrade your client to a newer version",
                policy.minimum
            ),
        );
    }
    if requested > policy.current {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!(
                "client version {requested} is too new. Maximum supported API version is {}",
                policy.current
            ),
        );
    }

    req.extensions_mut().insert(requested);
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    if let Ok(server) = HeaderValue::from_str(&policy.server) {
        headers.insert(axum::http::header::SERVER, server);
    }
    if let Ok(current) = HeaderValue::from_str(&policy.current.to_string()) {
        headers.insert(API_VERSION_HEADER, current);
    }
    response
}

async fn authorize(State(authz): State<Arc<AuthzMiddleware>>, req: Request<Body>, next: Next) -> Response {
    let plugins = authz.plugins.load_full();
    if plugins.is_empty() {
        return next.run(req).await;
    }

    let request = AuthzRequest {
        method: req.method().to_string(),
        uri: req.uri().to_string(),
        user: None,
    };
    for name in plugins.iter() {
        let plugin = match authz.store.authz(name) {
            Ok(plugin) => plugin,
            Err(e) => {
                tracing::error!(plugin = %name, error = %e, "Authorization plugin unavailable");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
        };
        let verdict = plugin.authorize(&request).await;
        if !verdict.allow {
            tracing::info!(plugin = %name, uri = %request.uri, "Request denied by authorization plugin");
            return error_response(
                StatusCode::FORBIDDEN,
                format!("authorization denied by plugin {name}: {}", verdict.message),
            );
        }
    }
    next.run(req).await
}

/// Split `/vX.Y/rest` into `("X.Y", "/rest")`.
fn split_version(path: &str) -> Option<(&str, String)> {
    let rest = path.strip_prefix("/v")?;
    let (version, tail) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    if version.is_empty() || !version.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some((version, tail))
}

fn rewrite_path(uri: &Uri, path: &str) -> Option<Uri> {
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse().ok()?);
    Uri::from_parts(parts).ok()
}
