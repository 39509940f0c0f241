//! Assorted reusable Axum middleware used by the site pipeline.
//!
//! These functions are lightweight composable layers attached to the Axum `Router`:
//! completion logging, canonical-host redirects and crawler directives. They stay
//! stateless apart from the canonical host they are given.
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Log one line per completed request with its status and latency.
pub async fn request_log_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let url = req.uri().to_string();
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    let response = next.run(req).await;
    log_completion(&method, &url, &remote_addr, response.status(), start.elapsed());
    response
}

/// The one-line summary written for every finished request.
pub fn log_completion(
    method: &Method,
    url: &str,
    remote_addr: &str,
    status: StatusCode,
    duration: Duration,
) {
    tracing::info!(
        method = %method,
        url = %url,
        remote_addr = %remote_addr,
        status = status.as_u16(),
        duration = ?duration,
        "request completed"
    );
}

/// Host the request was addressed to, from the URI authority (HTTP/2) or `Host` header.
pub fn request_host(req: &Request) -> Option<&str> {
    req.uri()
        .authority()
        .map(|a| a.as_str())
        .or_else(|| req.headers().get(header::HOST)?.to_str().ok())
}

/// Redirect (`307`) requests addressed to any other host to the canonical one.
pub async fn host_redirect_middleware(
    State(host): State<Arc<str>>,
    req: Request,
    next: Next,
) -> Response {
    if request_host(&req) == Some(&*host) {
        return next.run(req).await;
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("//{host}{path_and_query}");

    match HeaderValue::try_from(location) {
        Ok(location) => (
            StatusCode::TEMPORARY_REDIRECT,
            [(header::LOCATION, location)],
        )
            .into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// Ask crawlers not to index or follow anything on the site.
pub async fn robots_middleware(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response.headers_mut().insert(
        "X-Robots-Tag",
        HeaderValue::from_static("noindex, nofollow"),
    );
    response
}
