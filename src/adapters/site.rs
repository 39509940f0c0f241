//! Event site pipeline factory.
//!
//! Assembles the router served by the binary from `data_dir`:
//! * `static/www/**` served as files, with `static/404.html` as the fallback page;
//! * documents (paths ending in `/` or `.html`) and the fallback pass through the
//!   admission limiter, which answers with `static/429.html` when a shard is full;
//! * `POST /admin/reload` rebuilds the pipeline for callers holding the admin cookie.
//!
//! Missing pages fail the build, so a broken data directory is caught at startup or
//! rejected by a reload while the previous pipeline keeps serving.
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, Request, State},
    handler::Handler,
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::post,
};
use eyre::{WrapErr, bail};
use serde_json::json;
use tower_http::services::ServeDir;

use crate::{
    adapters::middleware::{host_redirect_middleware, request_log_middleware, robots_middleware},
    core::{
        admission::{AdmissionDecision, AdmissionLimiter, RejectResponder, admission_middleware},
        reloadable::ReloadHandle,
    },
    ports::pipeline::{BuildContext, PipelineFactory},
};

pub const ADMIN_COOKIE: &str = "X-Admin-Key";

const NOT_FOUND_PAGE: &str = "static/404.html";
const TOO_MANY_REQUESTS_PAGE: &str = "static/429.html";
const WWW_DIR: &str = "static/www";

/// Marks a request already admitted by the document middleware.
#[derive(Clone, Copy)]
struct DocumentAdmitted;

#[derive(Clone)]
struct Site {
    not_found: Bytes,
    limiter: Arc<AdmissionLimiter>,
    admin_key: Arc<str>,
    reload: ReloadHandle,
}

/// The site factory as a [`PipelineFactory`].
pub fn factory() -> Arc<dyn PipelineFactory> {
    Arc::new(build)
}

pub fn build(ctx: &BuildContext) -> eyre::Result<Router> {
    let settings = &ctx.settings;
    let data_dir = PathBuf::from(&settings.data_dir);

    let not_found = read_page(&data_dir, NOT_FOUND_PAGE)?;
    let too_many_requests = read_page(&data_dir, TOO_MANY_REQUESTS_PAGE)?;

    let www = data_dir.join(WWW_DIR);
    if !www.is_dir() {
        bail!("server: www directory {} does not exist", www.display());
    }

    let reject: RejectResponder = Arc::new(move || {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Html(too_many_requests.clone()),
        )
            .into_response()
    });
    let limiter = Arc::new(
        AdmissionLimiter::from_config(&settings.admission, reject, &ctx.background)
            .wrap_err("server: create admission limiter")?,
    );

    let site = Site {
        not_found,
        limiter: limiter.clone(),
        admin_key: Arc::from(settings.admin_key.as_str()),
        reload: ctx.reload.clone(),
    };

    register("GET", "/", NOT_FOUND_PAGE);
    register("GET", "/{file...}", WWW_DIR);
    let files = ServeDir::new(&www).not_found_service(not_found_handler.with_state(site.clone()));

    register("POST", "/admin/reload", "reload_handler()");
    let mut router = Router::new()
        .route("/admin/reload", post(reload_handler))
        .fallback_service(files)
        .with_state(site)
        .layer(middleware::from_fn_with_state(limiter, document_admission))
        .layer(middleware::from_fn(robots_middleware));

    if !settings.host.is_empty() {
        router = router.layer(middleware::from_fn_with_state(
            Arc::<str>::from(settings.host.as_str()),
            host_redirect_middleware,
        ));
    }

    Ok(router.layer(middleware::from_fn(request_log_middleware)))
}

fn register(method: &str, path: &str, src: &str) {
    tracing::info!(method, path, src, "registering handler");
}

fn read_page(data_dir: &Path, name: &str) -> eyre::Result<Bytes> {
    let path = data_dir.join(name);
    let content = std::fs::read(&path)
        .wrap_err_with(|| format!("server: read {}", path.display()))?;
    Ok(Bytes::from(content))
}

/// Whether a path names an HTML document rather than an asset.
fn is_document(path: &str) -> bool {
    path.ends_with('/') || path.ends_with(".html")
}

async fn document_admission(
    State(limiter): State<Arc<AdmissionLimiter>>,
    mut req: Request,
    next: Next,
) -> Response {
    if !is_document(req.uri().path()) {
        return next.run(req).await;
    }
    req.extensions_mut().insert(DocumentAdmitted);
    admission_middleware(State(limiter), req, next).await
}

async fn not_found_handler(State(site): State<Site>, req: Request) -> Response {
    if req.extensions().get::<DocumentAdmitted>().is_some() {
        return not_found_page(&site);
    }

    let client_key = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    match site.limiter.admit(&client_key) {
        AdmissionDecision::Admitted(ticket) => {
            ticket.paced().await;
            ticket.hold_until_sent(not_found_page(&site))
        }
        AdmissionDecision::Rejected => site.limiter.reject(),
    }
}

fn not_found_page(site: &Site) -> Response {
    (StatusCode::NOT_FOUND, Html(site.not_found.clone())).into_response()
}

fn has_admin_cookie(req: &Request, key: &str) -> bool {
    req.headers()
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .any(|(name, value)| name == ADMIN_COOKIE && value == key)
}

async fn reload_handler(State(site): State<Site>, req: Request) -> Response {
    if !has_admin_cookie(&req, &site.admin_key) {
        return not_found_handler(State(site), req).await;
    }

    let reload = site.reload.clone();
    let outcome = tokio::task::spawn_blocking(move || reload.reload()).await;

    match outcome {
        Ok(Ok(())) => (StatusCode::OK, Json(json!({}))).into_response(),
        Ok(Err(error)) => {
            tracing::error!(%error, "failed to reload handler");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": error.to_string() })),
            )
                .into_response()
        }
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": error.to_string() })),
        )
            .into_response(),
    }
}
