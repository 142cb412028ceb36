//! Shared API server object.
//!
//! # Responsibilities
//! - Hold the composed handler (set once, before any listener serves)
//! - Run the accept loop for one listener at a time (`serve`)
//! - Drive every open connection through graceful shutdown or hard close
//!
//! # Design Decisions
//! - One server object is shared by all listeners; its phase is a `watch`
//!   channel every accept loop and connection task observes
//! - Transient accept errors back off and retry; anything else is fatal to
//!   that listener
//! - Serving after shutdown returns [`ServeError::Closed`] immediately
//! - A connection still in its TLS handshake carries no request, so it is
//!   dropped as soon as the server stops serving
//! - TLS handshakes and request headers share one read deadline

use std::io;
use std::sync::OnceLock;
use std::time::Duration;

use axum::Router;
use axum_server::accept::Accept;
use axum_server::tls_rustls::RustlsAcceptor;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::net::connection::ConnectionTracker;
use crate::net::listener::{ApiListener, BoxedIo};
use crate::resilience::Backoff;

/// Time a client gets to finish its TLS handshake, and then to send the
/// headers of each request.
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Errors returned by the server object.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The server was shut down or closed. Not a failure.
    #[error("API server closed")]
    Closed,

    #[error("API server has no handler")]
    NoHandler,

    #[error("accept failed on {listener}: {source}")]
    Accept {
        listener: String,
        #[source]
        source: io::Error,
    },

    #[error("graceful shutdown cancelled with {active} connections still open")]
    DrainCancelled { active: u64 },
}

/// Lifecycle of the server object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    /// Accepting connections.
    Serving,
    /// No new connections; in-flight requests finishing.
    Draining,
    /// All connections dropped.
    Closed,
}

/// The one API server shared by every listener.
#[derive(Debug)]
pub struct ApiServer {
    handler: OnceLock<Router>,
    phase: watch::Sender<ServerPhase>,
    connections: ConnectionTracker,
    read_header_timeout: Duration,
}

impl Default for ApiServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiServer {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(ServerPhase::Serving);
        Self {
            handler: OnceLock::new(),
            phase,
            connections: ConnectionTracker::new(),
            read_header_timeout: DEFAULT_READ_HEADER_TIMEOUT,
        }
    }

    pub fn with_read_header_timeout(mut self, timeout: Duration) -> Self {
        self.read_header_timeout = timeout;
        self
    }

    /// Install the composed handler. Returns `false` if one was already set.
    pub fn set_handler(&self, handler: Router) -> bool {
        self.handler.set(handler).is_ok()
    }

    pub fn phase(&self) -> ServerPhase {
        *self.phase.borrow()
    }

    pub fn active_connections(&self) -> u64 {
        self.connections.active_count()
    }

    /// Accept and serve connections from `listener` until the server leaves
    /// the serving phase or accept fails fatally.
    pub async fn serve(&self, listener: ApiListener) -> Result<(), ServeError> {
        let router = self.handler.get().cloned().ok_or(ServeError::NoHandler)?;
        if self.phase() != ServerPhase::Serving {
            return Err(ServeError::Closed);
        }

        let name = listener.spec().canonical();
        let acceptor = listener.acceptor();
        let stopped = wait_not_serving(self.phase.subscribe());
        tokio::pin!(stopped);
        let mut backoff = Backoff::new(Duration::from_millis(5), Duration::from_secs(1));

        loop {
            let accepted = tokio::select! {
                biased;
                _ = &mut stopped => return Err(ServeError::Closed),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((io, peer)) => {
                    backoff.reset();
                    self.spawn_connection(io, peer, router.clone(), acceptor.clone());
                }
                Err(e) if is_transient(&e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(listener = %name, error = %e, retry_ms = delay.as_millis() as u64, "Accept error, retrying");
                    tokio::select! {
                        _ = &mut stopped => return Err(ServeError::Closed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(source) => {
                    return Err(ServeError::Accept {
                        listener: name,
                        source,
                    })
                }
            }
        }
    }

    /// Stop accepting, let in-flight connections finish, and close.
    ///
    /// Cancelling `drain` abandons the wait and drops whatever is still open.
    pub async fn shutdown(&self, drain: &CancellationToken) -> Result<(), ServeError> {
        self.phase.send_if_modified(|phase| {
            if *phase == ServerPhase::Serving {
                *phase = ServerPhase::Draining;
                true
            } else {
                false
            }
        });

        let result = tokio::select! {
            _ = self.connections.wait_idle() => Ok(()),
            _ = drain.cancelled() => Err(ServeError::DrainCancelled {
                active: self.connections.active_count(),
            }),
        };
        self.phase.send_replace(ServerPhase::Closed);
        result
    }

    /// Close immediately: stop accepting and drop every open connection.
    pub fn close(&self) {
        self.phase.send_replace(ServerPhase::Closed);
    }

    fn spawn_connection(&self, io: BoxedIo, peer: String, router: Router, acceptor: Option<RustlsAcceptor>) {
        let guard = self.connections.track();
        let mut phase = self.phase.subscribe();
        let read_header_timeout = self.read_header_timeout;

        tokio::spawn(async move {
            let id = guard.id();
            tracing::trace!(connection_id = %id, peer = %peer, "Connection accepted");

            let io: BoxedIo = match acceptor {
                Some(acceptor) => {
                    let handshake = tokio::time::timeout(read_header_timeout, acceptor.accept(io, ()));
                    tokio::select! {
                        _ = phase.wait_for(|p| *p != ServerPhase::Serving) => {
                            tracing::debug!(connection_id = %id, peer = %peer, "Dropping connection during TLS handshake");
                            return;
                        }
                        handshake = handshake => match handshake {
                            Ok(Ok((stream, ()))) => Box::new(stream),
                            Ok(Err(e)) => {
                                tracing::debug!(connection_id = %id, peer = %peer, error = %e, "TLS handshake failed");
                                return;
                            }
                            Err(_) => {
                                tracing::debug!(connection_id = %id, peer = %peer, "TLS handshake timed out");
                                return;
                            }
                        },
                    }
                }
                None => io,
            };

            let mut builder = auto::Builder::new(TokioExecutor::new());
            builder
                .http1()
                .timer(TokioTimer::new())
                .header_read_timeout(read_header_timeout);
            let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), TowerToHyperService::new(router));
            tokio::pin!(conn);

            let mut draining = false;
            let mut current = *phase.borrow_and_update();
            loop {
                match current {
                    ServerPhase::Closed => break,
                    ServerPhase::Draining if !draining => {
                        draining = true;
                        conn.as_mut().graceful_shutdown();
                    }
                    _ => {}
                }

                tokio::select! {
                    served = conn.as_mut() => {
                        if let Err(e) = served {
                            tracing::debug!(connection_id = %id, error = %e, "Connection error");
                        }
                        break;
                    }
                    changed = phase.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        current = *phase.borrow_and_update();
                    }
                }
            }

            drop(guard);
        });
    }
}

async fn wait_not_serving(mut phase: watch::Receiver<ServerPhase>) {
    let _ = phase.wait_for(|p| *p != ServerPhase::Serving).await;
}

/// Accept errors that concern a single connection or momentary resource
/// pressure rather than the listener itself.
fn is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) {
        return true;
    }
    matches!(e.raw_os_error(), Some(code) if code == nix::libc::EMFILE || code == nix::libc::ENFILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::routing::get;
    use axum_server::tls_rustls::RustlsConfig;
    use rustls::pki_types::PrivateKeyDer;

    use crate::net::ListenerSpec;

    fn tls_listener(inner: tokio::net::TcpListener) -> ApiListener {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], PrivateKeyDer::Pkcs8(key.serialize_der().into()))
            .unwrap();
        ApiListener::Tcp {
            spec: ListenerSpec::parse("tcp://127.0.0.1:0").unwrap(),
            inner,
            acceptor: Some(RustlsAcceptor::new(RustlsConfig::from_config(Arc::new(config)))),
        }
    }

    /// Serve TLS on an ephemeral port and open a client that never speaks.
    async fn idle_tls_client(
        server: &Arc<ApiServer>,
    ) -> (tokio::task::JoinHandle<Result<(), ServeError>>, tokio::net::TcpStream) {
        server.set_handler(Router::new().route("/_ping", get(|| async { "OK" })));
        let inner = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = inner.local_addr().unwrap();
        let serving = {
            let server = Arc::clone(server);
            tokio::spawn(async move { server.serve(tls_listener(inner)).await })
        };

        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.active_connections() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection was never accepted");
        (serving, client)
    }

    #[tokio::test]
    async fn idle_tls_handshake_does_not_hold_up_shutdown() {
        let server = Arc::new(ApiServer::new());
        let (serving, _client) = idle_tls_client(&server).await;

        tokio::time::timeout(Duration::from_secs(1), server.shutdown(&CancellationToken::new()))
            .await
            .expect("shutdown waited on a connection with no request")
            .unwrap();
        assert_eq!(server.active_connections(), 0);
        assert!(matches!(serving.await.unwrap(), Err(ServeError::Closed)));
    }

    #[tokio::test]
    async fn stalled_tls_handshake_times_out() {
        let server = Arc::new(ApiServer::new().with_read_header_timeout(Duration::from_millis(100)));
        let (serving, _client) = idle_tls_client(&server).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while server.active_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stalled handshake was never dropped");
        assert_eq!(server.phase(), ServerPhase::Serving);

        server.close();
        assert!(matches!(serving.await.unwrap(), Err(ServeError::Closed)));
    }

    #[test]
    fn fd_exhaustion_is_transient() {
        assert!(is_transient(&io::Error::from_raw_os_error(nix::libc::EMFILE)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[test]
    fn handler_is_set_once() {
        let server = ApiServer::new();
        assert!(server.set_handler(Router::new()));
        assert!(!server.set_handler(Router::new()));
    }

    #[tokio::test]
    async fn serve_after_close_returns_closed() {
        let server = ApiServer::new();
        server.set_handler(Router::new().route("/_ping", get(|| async { "OK" })));
        server.close();

        let inner = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = ApiListener::Tcp {
            spec: ListenerSpec::parse("tcp://127.0.0.1:0").unwrap(),
            inner,
            acceptor: None,
        };
        assert!(matches!(server.serve(listener).await, Err(ServeError::Closed)));
    }

    #[tokio::test]
    async fn shutdown_with_no_connections_closes() {
        let server = ApiServer::new();
        server.shutdown(&CancellationToken::new()).await.unwrap();
        assert_eq!(server.phase(), ServerPhase::Closed);
    }
}
