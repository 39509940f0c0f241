//! Network listeners driven by a hand-written accept loop.
//!
//! Each listener binds its address, serves every accepted connection on its own task and
//! stops accepting as soon as the shared lifetime is cancelled. Open connections are then
//! asked to finish their in-flight requests; whatever is still open when the shutdown
//! timeout elapses is aborted and reported as [`ListenerError::ShutdownTimeout`].
use std::{convert::Infallible, io, net::SocketAddr, time::Duration};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::watch,
    task::JoinSet,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    adapters::{middleware::request_host, panic_guard::PanicGuard},
    core::lifetime::Lifetime,
    metrics, tracing_setup,
};

/// Pause after a failed `accept` (e.g. file descriptor exhaustion) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("{listener} listener failed to bind {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("{listener} listener shutdown timeout exceeded, closed {remaining} connection(s)")]
    ShutdownTimeout {
        listener: &'static str,
        remaining: usize,
    },
    #[error("listener task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What a listener does with each request.
#[derive(Clone, Debug)]
pub enum ListenerService {
    /// The guarded, reloadable site pipeline.
    Site(PanicGuard),
    /// Plaintext listener answering everything with a redirect to https.
    HttpsRedirect,
}

impl ListenerService {
    async fn call(&self, req: Request<Body>, remote_addr: SocketAddr) -> Response {
        match self {
            ListenerService::Site(guard) => guard.serve(req, remote_addr).await,
            ListenerService::HttpsRedirect => https_redirect(&req),
        }
    }
}

/// `301` to the same host and path over https; `400` without a host.
pub fn https_redirect(req: &Request<Body>) -> Response {
    let Some(host) = request_host(req) else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    match HeaderValue::try_from(format!("https://{host}{path_and_query}")) {
        Ok(location) => (
            StatusCode::MOVED_PERMANENTLY,
            [(header::LOCATION, location)],
        )
            .into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

pub struct Listener {
    name: &'static str,
    addr: String,
    service: ListenerService,
    tls: Option<TlsAcceptor>,
    shutdown_timeout: Duration,
    bound: watch::Sender<Option<SocketAddr>>,
}

impl Listener {
    pub fn new(
        name: &'static str,
        addr: String,
        service: ListenerService,
        tls: Option<TlsAcceptor>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            name,
            addr,
            service,
            tls,
            shutdown_timeout,
            bound: watch::Sender::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Receives the local address once the listener is bound.
    pub fn subscribe_bound(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.bound.subscribe()
    }

    /// Accept and serve until `lifetime` is cancelled, then drain within the timeout.
    pub async fn run(self, lifetime: Lifetime) -> Result<(), ListenerError> {
        let span = tracing_setup::create_listener_span(self.name, &self.addr);
        self.serve(lifetime).instrument(span).await
    }

    async fn serve(self, lifetime: Lifetime) -> Result<(), ListenerError> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|source| ListenerError::Bind {
                listener: self.name,
                addr: self.addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().ok();
        self.bound.send_replace(local_addr);
        tracing::info!(
            addr = %self.addr,
            local_addr = ?local_addr,
            tls = self.tls.is_some(),
            "server is running"
        );

        let builder = auto::Builder::new(TokioExecutor::new());
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = lifetime.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let _ = stream.set_nodelay(true);
                        connections.spawn(
                            handle_connection(
                                stream,
                                remote_addr,
                                self.service.clone(),
                                self.tls.clone(),
                                builder.clone(),
                                lifetime.token().clone(),
                            )
                            .in_current_span(),
                        );
                        metrics::set_active_connections(self.name, connections.len());
                    }
                    Err(error) => {
                        tracing::warn!(%error, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {
                    metrics::set_active_connections(self.name, connections.len());
                }
            }
        }

        drop(listener);
        tracing::info!(open = connections.len(), "server is draining");

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        let outcome = match drained {
            Ok(()) => {
                tracing::info!("all clients closed successfully");
                Ok(())
            }
            Err(_) => {
                let remaining = connections.len();
                tracing::error!(remaining, "server shutdown timeout exceeded");
                connections.shutdown().await;
                Err(ListenerError::ShutdownTimeout {
                    listener: self.name,
                    remaining,
                })
            }
        };

        metrics::set_active_connections(self.name, 0);
        tracing::info!("server stopped");
        outcome
    }
}

async fn handle_connection<S>(
    stream: S,
    remote_addr: SocketAddr,
    service: ListenerService,
    tls: Option<TlsAcceptor>,
    builder: auto::Builder<TokioExecutor>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match tls {
        None => serve_connection(stream, remote_addr, service, builder, shutdown).await,
        Some(acceptor) => {
            let handshake = tokio::select! {
                result = acceptor.accept(stream) => result,
                _ = shutdown.cancelled() => return,
            };
            match handshake {
                Ok(stream) => {
                    serve_connection(stream, remote_addr, service, builder, shutdown).await
                }
                Err(error) => {
                    tracing::debug!(%error, remote_addr = %remote_addr, "tls handshake failed");
                }
            }
        }
    }
}

async fn serve_connection<S>(
    stream: S,
    remote_addr: SocketAddr,
    service: ListenerService,
    builder: auto::Builder<TokioExecutor>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let hyper_service = service_fn(move |req: Request<Incoming>| {
        let service = service.clone();
        async move {
            let mut req = req.map(Body::new);
            req.extensions_mut().insert(ConnectInfo(remote_addr));
            Ok::<_, Infallible>(service.call(req, remote_addr).await)
        }
    });

    let conn = builder.serve_connection(TokioIo::new(stream), hyper_service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(error) = result {
        tracing::debug!(%error, remote_addr = %remote_addr, "connection closed with error");
    }
}
