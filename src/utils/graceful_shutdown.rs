use eyre::{Result, WrapErr};
use tokio::signal;

use crate::core::{
    lifetime::{CancelReason, Lifetime},
    reloadable::{ReloadError, ReloadHandle},
};

/// Maps process signals onto the serving lifetime and the reloadable handler.
///
/// * SIGINT / SIGTERM cancel the lifetime with [`CancelReason::Signal`].
/// * SIGHUP rebuilds the pipeline and keeps serving.
pub struct GracefulShutdown {
    lifetime: Lifetime,
    reload: ReloadHandle,
}

impl GracefulShutdown {
    pub fn new(lifetime: Lifetime, reload: ReloadHandle) -> Self {
        Self { lifetime, reload }
    }

    /// Cancel the lifetime as if an operator signal arrived.
    pub fn trigger_shutdown(&self) {
        if self.lifetime.is_cancelled() {
            tracing::warn!("Shutdown already initiated, ignoring signal");
            return;
        }
        self.lifetime.cancel(CancelReason::Signal);
    }

    /// Rebuild the pipeline off the async workers and log the outcome.
    pub async fn trigger_reload(&self) -> Result<(), ReloadError> {
        let reload = self.reload.clone();
        match tokio::task::spawn_blocking(move || reload.reload()).await {
            Ok(result) => result,
            Err(error) => {
                tracing::error!(%error, "reload task failed");
                Err(ReloadError::Task(error))
            }
        }
    }

    /// Listen for signals until the lifetime is cancelled.
    pub async fn run_signal_handler(&self) -> Result<()> {
        let mut terminate = Terminate::new()?;
        let mut hangup = Hangup::new()?;

        tracing::info!("Signal handler started. SIGINT/SIGTERM shut down, SIGHUP reloads");

        loop {
            tokio::select! {
                _ = self.lifetime.cancelled() => break,
                result = signal::ctrl_c() => {
                    result.wrap_err("Failed to listen for SIGINT")?;
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                    self.trigger_shutdown();
                }
                _ = terminate.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    self.trigger_shutdown();
                }
                _ = hangup.recv() => {
                    tracing::info!("Received SIGHUP, reloading handler");
                    // Outcome is logged by the handler itself.
                    let _ = self.trigger_reload().await;
                }
            }
        }

        Ok(())
    }
}

#[cfg(unix)]
struct Terminate(signal::unix::Signal);

#[cfg(unix)]
impl Terminate {
    fn new() -> Result<Self> {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .map(Self)
            .wrap_err("Failed to register SIGTERM handler")
    }

    async fn recv(&mut self) {
        self.0.recv().await;
    }
}

#[cfg(unix)]
struct Hangup(signal::unix::Signal);

#[cfg(unix)]
impl Hangup {
    fn new() -> Result<Self> {
        signal::unix::signal(signal::unix::SignalKind::hangup())
            .map(Self)
            .wrap_err("Failed to register SIGHUP handler")
    }

    async fn recv(&mut self) {
        self.0.recv().await;
    }
}

// On non-Unix systems only Ctrl+C is available.
#[cfg(not(unix))]
struct Terminate;

#[cfg(not(unix))]
impl Terminate {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}

#[cfg(not(unix))]
type Hangup = Terminate;
