//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection (net::listener)
//!     → server.rs (TLS handshake, HTTP/1 + HTTP/2 via hyper-util)
//!     → middleware.rs (request ID, experimental tag, version, authz)
//!     → router.rs (composed subsystem routes)
//!
//! pool.rs: one serve loop per listener, first fatal error wins
//! ```

pub mod middleware;
pub mod pool;
pub mod router;
pub mod server;

pub use middleware::{AuthzMiddleware, MiddlewareChain};
pub use pool::ListenerPool;
pub use router::{compose, ApiRouter};
pub use server::{ApiServer, ServeError, ServerPhase};
