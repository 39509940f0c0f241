//! Hot-swappable request pipeline.
//!
//! The active [`Router`] lives behind an [`ArcSwap`]: readers take a snapshot without
//! locking and a reload replaces it with one atomic store. A request that already captured
//! the old snapshot finishes against it; the displaced router is dropped with its last
//! reference, which also stops any pacing gates it owned.
use std::{
    fmt,
    sync::{Arc, Mutex, OnceLock, PoisonError, Weak},
};

use arc_swap::ArcSwap;
use axum::{Router, body::Body, extract::Request, response::Response};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::{
    config::ServerConfig,
    metrics::{self, ReloadOutcome},
    ports::pipeline::{BuildContext, PipelineFactory},
};

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("failed to build pipeline: {0:#}")]
    Build(eyre::Report),
    #[error("pipeline is no longer being served")]
    Unavailable,
    #[error("reload task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

struct Shared {
    current: ArcSwap<Router>,
    /// Serializes writers; readers never take it.
    writer: Mutex<()>,
    factory: Arc<dyn PipelineFactory>,
    ctx: BuildContext,
}

impl Shared {
    fn reload(&self) -> Result<(), ReloadError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match self.factory.build(&self.ctx) {
            Ok(router) => {
                self.current.store(Arc::new(router));
                metrics::increment_pipeline_reloads(ReloadOutcome::Success);
                tracing::info!("reloaded handler");
                Ok(())
            }
            Err(error) => {
                metrics::increment_pipeline_reloads(ReloadOutcome::Failure);
                tracing::error!(error = %format!("{error:#}"), "reload handler");
                Err(ReloadError::Build(error))
            }
        }
    }
}

/// Owner of the active pipeline. Cloning shares the same slot.
#[derive(Clone)]
pub struct ReloadableHandler {
    shared: Arc<Shared>,
}

impl ReloadableHandler {
    /// Build the initial pipeline. Failure here means there is nothing to serve.
    pub fn new(
        settings: Arc<ServerConfig>,
        factory: Arc<dyn PipelineFactory>,
        background: CancellationToken,
    ) -> eyre::Result<Self> {
        let slot = Arc::new(OnceLock::new());
        let ctx = BuildContext {
            settings,
            reload: ReloadHandle { slot: slot.clone() },
            background,
        };

        let initial = factory.build(&ctx)?;
        let shared = Arc::new(Shared {
            current: ArcSwap::from_pointee(initial),
            writer: Mutex::new(()),
            factory,
            ctx,
        });
        let _ = slot.set(Arc::downgrade(&shared));

        Ok(Self { shared })
    }

    /// Snapshot of the active pipeline.
    pub fn current(&self) -> Arc<Router> {
        self.shared.current.load_full()
    }

    /// Rebuild and swap. On error the active pipeline is left untouched. Concurrent
    /// reloads run one after another, so the last one to finish is the newest build.
    pub fn reload(&self) -> Result<(), ReloadError> {
        self.shared.reload()
    }

    pub fn handle(&self) -> ReloadHandle {
        self.shared.ctx.reload.clone()
    }

    /// Dispatch one request into the pipeline active at call time.
    pub async fn serve(&self, req: Request<Body>) -> Response {
        let router = Router::clone(&self.current());
        match router.oneshot(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

impl fmt::Debug for ReloadableHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadableHandler").finish_non_exhaustive()
    }
}

/// Weak reference to a [`ReloadableHandler`], safe to store inside the pipeline itself.
#[derive(Clone)]
pub struct ReloadHandle {
    slot: Arc<OnceLock<Weak<Shared>>>,
}

impl ReloadHandle {
    pub fn reload(&self) -> Result<(), ReloadError> {
        self.slot
            .get()
            .and_then(Weak::upgrade)
            .ok_or(ReloadError::Unavailable)?
            .reload()
    }
}

impl fmt::Debug for ReloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self.slot.get().is_some_and(|w| w.strong_count() > 0);
        f.debug_struct("ReloadHandle").field("live", &live).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use axum::routing::get;
    use http::StatusCode;

    use super::*;

    /// Factory producing a router whose `/` answers with the build generation.
    fn counting_factory(
        builds: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
    ) -> Arc<dyn PipelineFactory> {
        Arc::new(move |_: &BuildContext| -> eyre::Result<Router> {
            if fail.load(Ordering::SeqCst) {
                eyre::bail!("static/404.html: No such file or directory");
            }
            let generation = builds.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Router::new().route("/", get(move || async move { generation.to_string() })))
        })
    }

    async fn body_of(handler: &ReloadableHandler) -> String {
        let response = handler
            .serve(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn handler(factory: Arc<dyn PipelineFactory>) -> eyre::Result<ReloadableHandler> {
        ReloadableHandler::new(
            Arc::new(ServerConfig::default()),
            factory,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_initial_build_failure_is_fatal() {
        let fail = Arc::new(AtomicBool::new(true));
        let result = handler(counting_factory(Arc::new(AtomicUsize::new(0)), fail));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_successful_reload_swaps_pipeline() {
        let builds = Arc::new(AtomicUsize::new(0));
        let handler = handler(counting_factory(builds, Arc::default())).unwrap();
        assert_eq!(body_of(&handler).await, "1");

        handler.reload().unwrap();

        assert_eq!(body_of(&handler).await, "2");
        assert_eq!(body_of(&handler).await, "2");
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_pipeline() {
        let fail = Arc::new(AtomicBool::new(false));
        let handler = handler(counting_factory(Arc::default(), fail.clone())).unwrap();
        let before = handler.current();

        fail.store(true, Ordering::SeqCst);
        let error = handler.reload().unwrap_err();

        assert!(matches!(error, ReloadError::Build(_)));
        assert!(error.to_string().contains("static/404.html"));
        assert!(Arc::ptr_eq(&before, &handler.current()));
        assert_eq!(body_of(&handler).await, "1");
    }

    #[tokio::test]
    async fn test_captured_snapshot_survives_reload() {
        let handler = handler(counting_factory(Arc::default(), Arc::default())).unwrap();
        let old = handler.current();

        handler.reload().unwrap();

        let response = Router::clone(&old)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"1");
        assert_eq!(body_of(&handler).await, "2");
    }

    #[tokio::test]
    async fn test_handle_reloads_through_weak_reference() {
        let handler = handler(counting_factory(Arc::default(), Arc::default())).unwrap();
        let reload = handler.handle();

        reload.reload().unwrap();
        assert_eq!(body_of(&handler).await, "2");

        drop(handler);
        assert!(matches!(reload.reload(), Err(ReloadError::Unavailable)));
    }

    #[tokio::test]
    async fn test_factory_sees_the_reload_handle() {
        let seen = Arc::new(AtomicBool::new(false));
        let flag = seen.clone();
        let factory: Arc<dyn PipelineFactory> =
            Arc::new(move |ctx: &BuildContext| -> eyre::Result<Router> {
                // During the initial build the handler does not exist yet.
                let _ = ctx.reload.reload();
                flag.store(true, Ordering::SeqCst);
                Ok(Router::new())
            });

        let _handler = handler(factory).unwrap();
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_concurrent_reloads_build_one_at_a_time() {
        let building = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let factory: Arc<dyn PipelineFactory> = {
            let building = building.clone();
            let overlapped = overlapped.clone();
            Arc::new(move |_: &BuildContext| -> eyre::Result<Router> {
                if building.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.store(true, Ordering::SeqCst);
                }
                std::thread::sleep(std::time::Duration::from_millis(30));
                building.fetch_sub(1, Ordering::SeqCst);
                Ok(Router::new())
            })
        };
        let handler = handler(factory).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| handler.reload().unwrap());
            }
        });

        assert!(!overlapped.load(Ordering::SeqCst));
    }
}
