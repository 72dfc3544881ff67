//! Server lifecycle.
//!
//! ```text
//! Initializing -> NegotiatingSandbox -> Serving -> ShuttingDown -> Stopped
//!        \________________\_________________\__________________> Failed
//! ```
//!
//! The sandbox is negotiated before the listener is bound. Once serving, the
//! accept loop runs while [`Server::run`] waits on whichever comes first: the
//! shutdown trigger or the accept loop failing. After the trigger wins, the
//! listener is dropped and open connections get `shutdown_timeout` to drain;
//! connections still open after that are aborted and the stop is reported as
//! [`Shutdown::Ungraceful`].

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, Request};
use burrow_sandbox::{Negotiator, Sandbox};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, check_directory};
use crate::error::ServerError;
use crate::logging::Logging;
use crate::middleware::{self, RequestLog};
use crate::routes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    NegotiatingSandbox,
    /// Accepting connections on the bound address.
    Serving(SocketAddr),
    ShuttingDown,
    Stopped,
    Failed,
}

/// How a stop after a shutdown trigger went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Every in-flight connection finished within the timeout.
    Graceful,
    /// The timeout elapsed with connections still open; they were aborted.
    Ungraceful,
}

/// Source of incoming connections.
pub trait Listener: Send + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Io = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

pub struct Server {
    config: Arc<ServerConfig>,
    app: Router,
    log: RequestLog,
    logging: Logging,
    phase: watch::Sender<Phase>,
}

impl Server {
    /// Server for `config.directory`.
    pub fn new(config: ServerConfig, logging: Logging) -> Self {
        let app = routes::static_files(&config.directory);
        Self::with_app(config, logging, app)
    }

    /// Server running `app` as the inner handler instead of the file service.
    pub fn with_app(config: ServerConfig, logging: Logging, app: Router) -> Self {
        let (phase, _) = watch::channel(Phase::Initializing);
        Self {
            config: Arc::new(config),
            app,
            log: RequestLog::new(logging.clone()),
            logging,
            phase,
        }
    }

    /// Watch lifecycle transitions. `Serving` carries the bound address.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Run on a TCP listener until `shutdown` resolves or the server fails.
    ///
    /// Once `shutdown` has been selected, later listener errors are logged but
    /// do not change the outcome.
    pub async fn run<S, F>(self, sandbox: S, shutdown: F) -> Result<Shutdown, ServerError>
    where
        S: Sandbox + Send,
        F: Future<Output = ()> + Send,
    {
        self.run_on(sandbox, |address: String| TcpListener::bind(address), shutdown)
            .await
    }

    /// Like [`Server::run`], with `bind` turning the configured listen address
    /// into a [`Listener`]. `bind` is only called once the sandbox is in place.
    pub async fn run_on<S, L, B, BF, F>(
        self,
        sandbox: S,
        bind: B,
        shutdown: F,
    ) -> Result<Shutdown, ServerError>
    where
        S: Sandbox + Send,
        L: Listener,
        B: FnOnce(String) -> BF + Send,
        BF: Future<Output = io::Result<L>> + Send,
        F: Future<Output = ()> + Send,
    {
        let dispatch = self.logging.dispatch().clone();
        let phase = self.phase.clone();

        let result = self
            .serve(sandbox, bind, shutdown)
            .with_subscriber(dispatch)
            .await;
        if result.is_err() {
            phase.send_replace(Phase::Failed);
        }
        result
    }

    async fn serve<S, L, B, BF, F>(
        self,
        sandbox: S,
        bind: B,
        shutdown: F,
    ) -> Result<Shutdown, ServerError>
    where
        S: Sandbox + Send,
        L: Listener,
        B: FnOnce(String) -> BF + Send,
        BF: Future<Output = io::Result<L>> + Send,
        F: Future<Output = ()> + Send,
    {
        let directory = check_directory(&self.config.directory)?;

        self.phase.send_replace(Phase::NegotiatingSandbox);
        Negotiator::new(sandbox).negotiate(&directory)?;

        let address = self.config.listen_address();
        let listener = bind(address.clone())
            .await
            .map_err(|source| ServerError::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { address, source })?;

        let builder = connection_builder(&self.config);
        let app = middleware::wrap(self.app, self.log);
        let stop = CancellationToken::new();

        info!(address = %local_addr, directory = %directory.display(), "starting");
        let accepting = accept_connections(listener, app, builder, stop.clone());
        tokio::pin!(accepting);
        self.phase.send_replace(Phase::Serving(local_addr));

        tokio::select! {
            accepted = &mut accepting => {
                let err = match accepted {
                    Ok(_) => io::Error::other("listener closed unexpectedly"),
                    Err(err) => err,
                };
                return Err(ServerError::Serve(err));
            }
            () = shutdown => {
                info!(timeout = %humantime::format_duration(self.config.shutdown_timeout), "shutdown");
            }
        }

        self.phase.send_replace(Phase::ShuttingDown);
        stop.cancel();

        let mut connections = match accepting.await {
            Ok(connections) => connections,
            Err(err) => {
                error!(error = %err, "shutdown");
                JoinSet::new()
            }
        };

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        let outcome = match drained {
            Ok(()) => Shutdown::Graceful,
            Err(_) => {
                connections.shutdown().await;
                warn!(
                    timeout = %humantime::format_duration(self.config.shutdown_timeout),
                    "shutdown ungraceful: connections still open"
                );
                Shutdown::Ungraceful
            }
        };

        self.phase.send_replace(Phase::Stopped);
        info!("stopped");
        Ok(outcome)
    }
}

/// HTTP/1 and HTTP/2 connection settings shared by every connection.
fn connection_builder(config: &ServerConfig) -> Builder<TokioExecutor> {
    let mut builder = Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(config.header_timeout);
    builder
}

/// Accept connections until `stop` is cancelled, then hand back the
/// connections still open. Errors tied to a single connection are skipped;
/// any other accept error ends the loop and aborts every connection.
async fn accept_connections<L: Listener>(
    mut listener: L,
    app: Router,
    builder: Builder<TokioExecutor>,
    stop: CancellationToken,
) -> io::Result<JoinSet<()>> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            () = stop.cancelled() => return Ok(connections),
            accepted = listener.accept() => {
                let (io, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) if is_connection_error(&err) => {
                        debug!(error = %err, "accept");
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                let connection =
                    serve_connection(io, remote, app.clone(), builder.clone(), stop.clone());
                connections.spawn(connection.with_current_subscriber());
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Serve one connection. On `stop` the connection finishes its in-flight
/// request and closes.
async fn serve_connection<I>(
    io: I,
    remote: SocketAddr,
    app: Router,
    builder: Builder<TokioExecutor>,
    stop: CancellationToken,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(remote));
        app.clone().oneshot(request)
    });

    let connection = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        () = stop.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(err) = result {
        debug!(remote = %remote, error = %err, "connection closed");
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
