//! Bound listeners and their accept loops
//!
//! A [`SiteServer`] owns one socket. Binding happens in [`SiteServer::bind`]
//! so callers learn about port conflicts and TLS problems right away; the
//! accept loop then runs on its own task until [`SiteServer::stop`].

use crate::error::{GatewayError, Result};
use crate::router::{ConnInfo, RequestHandler};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Pause after the process runs out of descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Running,
    Stopped,
    Failed,
}

/// Whether a listener belongs to one site or multiplexes many by host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Dedicated,
    Shared,
}

pub struct SiteServer {
    name: String,
    addr: SocketAddr,
    kind: ListenerKind,
    tls: bool,
    state: Arc<Mutex<ServerState>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl SiteServer {
    /// Bind `addr` and start serving it with `handler`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn bind(
        name: &str,
        addr: SocketAddr,
        kind: ListenerKind,
        handler: Arc<dyn RequestHandler>,
        tls: Option<TlsAcceptor>,
        shutdown_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let bind_error = |source| GatewayError::Bind {
            site: name.to_string(),
            addr,
            source,
        };

        let std_listener = std::net::TcpListener::bind(addr).map_err(bind_error)?;
        std_listener.set_nonblocking(true).map_err(bind_error)?;
        let listener = TcpListener::from_std(std_listener).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(ServerState::Starting));
        let server = Arc::new(Self {
            name: name.to_string(),
            addr: local_addr,
            kind,
            tls: tls.is_some(),
            state: Arc::clone(&state),
            shutdown_tx,
            task: Mutex::new(None),
        });

        let protocol = if tls.is_some() { "HTTPS" } else { "HTTP" };
        info!(site = %name, addr = %local_addr, protocol, kind = ?kind, "Listening");

        let accept = AcceptLoop {
            name: name.to_string(),
            listener,
            handler,
            tls,
            state,
            shutdown_rx,
            shutdown_timeout,
        };
        *server.state.lock() = ServerState::Running;
        *server.task.lock() = Some(tokio::spawn(accept.run()));

        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Actual bound address; differs from the requested one for port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Put the server in the state a broken listening socket leaves it in
    #[cfg(test)]
    pub(crate) fn force_failed(&self) {
        *self.state.lock() = ServerState::Failed;
        self.shutdown_tx.send_replace(true);
    }

    /// Stop accepting, let in-flight connections finish, then return.
    ///
    /// Returns `ShutdownTimeout` when connections had to be aborted.
    /// Calling it again after the first stop is a no-op.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown_tx.send_replace(true);

        let task = self.task.lock().take();
        let result = match task {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(site = %self.name, error = %e, "Accept loop panicked");
                    Ok(())
                }
            },
            None => Ok(()),
        };

        let mut state = self.state.lock();
        if *state != ServerState::Failed {
            *state = ServerState::Stopped;
        }
        result
    }
}

impl Drop for SiteServer {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Debug for SiteServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteServer")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("kind", &self.kind)
            .field("tls", &self.tls)
            .field("state", &self.state())
            .finish()
    }
}

struct AcceptLoop {
    name: String,
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    tls: Option<TlsAcceptor>,
    state: Arc<Mutex<ServerState>>,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_timeout: Duration,
}

impl AcceptLoop {
    async fn run(self) -> Result<()> {
        let AcceptLoop {
            name,
            listener,
            handler,
            tls,
            state,
            mut shutdown_rx,
            shutdown_timeout,
        } = self;
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            let handler = Arc::clone(&handler);
                            let tls = tls.clone();
                            let shutdown_rx = shutdown_rx.clone();

                            connections.spawn(async move {
                                if let Some(acceptor) = tls {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            let conn = ConnInfo { remote_addr, is_tls: true };
                                            serve_connection(tls_stream, conn, handler, shutdown_rx).await;
                                        }
                                        Err(e) => {
                                            debug!(addr = %remote_addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else {
                                    let conn = ConnInfo { remote_addr, is_tls: false };
                                    serve_connection(stream, conn, handler, shutdown_rx).await;
                                }
                            });
                        }
                        Err(e) => match classify_accept_error(&e) {
                            AcceptFailure::Transient => {
                                debug!(site = %name, error = %e, "Failed to accept connection");
                            }
                            AcceptFailure::Exhausted => {
                                warn!(site = %name, error = %e, "Out of sockets, pausing accept");
                                tokio::time::sleep(ACCEPT_BACKOFF).await;
                            }
                            AcceptFailure::Fatal => {
                                error!(site = %name, error = %e, "Listener failed, no longer accepting");
                                *state.lock() = ServerState::Failed;
                                break;
                            }
                        },
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_signalled(&mut shutdown_rx) => {
                    debug!(site = %name, "Accept loop shutting down");
                    break;
                }
            }
        }

        // Unbind before draining so new clients are refused right away
        drop(listener);

        let in_flight = connections.len();
        if in_flight > 0 {
            debug!(site = %name, connections = in_flight, "Draining connections");
        }

        let drained = tokio::time::timeout(shutdown_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            let remaining = connections.len();
            connections.abort_all();
            warn!(
                site = %name,
                remaining,
                timeout_secs = shutdown_timeout.as_secs(),
                "Graceful shutdown timed out, aborting connections"
            );
            return Err(GatewayError::ShutdownTimeout {
                site: name,
                timeout: shutdown_timeout,
            });
        }

        info!(site = %name, "Listener stopped");
        Ok(())
    }
}

/// How an `accept()` error affects the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// The peer went away before the accept finished
    Transient,
    /// Descriptor or buffer limits; retry after a pause
    Exhausted,
    /// The listening socket itself is broken
    Fatal,
}

fn classify_accept_error(e: &io::Error) -> AcceptFailure {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => AcceptFailure::Transient,
        io::ErrorKind::OutOfMemory => AcceptFailure::Exhausted,
        _ if is_resource_exhausted(e) => AcceptFailure::Exhausted,
        _ => AcceptFailure::Fatal,
    }
}

#[cfg(unix)]
fn is_resource_exhausted(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhausted(_e: &io::Error) -> bool {
    false
}

/// Resolves once shutdown is requested or the server is gone
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Serve one connection until it closes. Once shutdown is signalled the
/// connection finishes its current requests and closes.
async fn serve_connection<S>(
    stream: S,
    conn: ConnInfo,
    handler: Arc<dyn RequestHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler.handle(req, conn).await) }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);

    let connection = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown_signalled(&mut shutdown_rx) => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        debug!(addr = %conn.remote_addr, error = %e, "Connection error");
    }
}
