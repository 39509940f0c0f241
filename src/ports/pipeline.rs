use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::{config::ServerConfig, core::reloadable::ReloadHandle};

/// Everything a pipeline factory may use while assembling a router.
#[derive(Clone)]
pub struct BuildContext {
    /// Validated settings the supervisor was started with.
    pub settings: Arc<ServerConfig>,
    /// Weak handle back to the reloadable handler, for administrative endpoints.
    pub reload: ReloadHandle,
    /// Cancelled when the supervisor stops. Background timers created by the pipeline
    /// (admission pacing gates) must observe it.
    pub background: CancellationToken,
}

/// PipelineFactory defines the port for building the request pipeline
///
/// It is called once at startup, where failure is fatal, and again on every reload,
/// where failure keeps the previous pipeline active.
pub trait PipelineFactory: Send + Sync + 'static {
    fn build(&self, ctx: &BuildContext) -> eyre::Result<Router>;
}

impl<F> PipelineFactory for F
where
    F: Fn(&BuildContext) -> eyre::Result<Router> + Send + Sync + 'static,
{
    fn build(&self, ctx: &BuildContext) -> eyre::Result<Router> {
        self(ctx)
    }
}
