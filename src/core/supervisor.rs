//! Serving supervisor.
//!
//! Owns the reloadable pipeline, the optional certificate rotator and every listener, and
//! runs them under one cancellable scope: `Starting → Running → ShuttingDown → Stopped`.
//! Any listener exiting, an operator signal or the configured deadline cancels the scope;
//! every listener then drains within the shutdown timeout and [`Supervisor::run`] returns
//! the joined listener errors.
use std::{fmt, net::SocketAddr, sync::Arc};

use thiserror::Error;
use tokio::{sync::watch, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::{
        listener::{Listener, ListenerError, ListenerService},
        panic_guard::PanicGuard,
        tls::{CertificateRotator, CredentialError},
    },
    config::{ServerConfig, ServerConfigValidator, ValidationError},
    core::{
        lifetime::{CancelReason, Lifetime},
        reloadable::{ReloadHandle, ReloadableHandler},
    },
    ports::pipeline::PipelineFactory,
};

pub const PRIMARY_LISTENER: &str = "primary";
pub const REDIRECT_LISTENER: &str = "redirect";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration:\n{}", join_lines(.0))]
    InvalidConfig(Vec<ValidationError>),
    #[error("failed to build initial pipeline: {0:#}")]
    Pipeline(eyre::Report),
    #[error("failed to load tls certificate: {0}")]
    Credential(#[from] CredentialError),
}

/// Every listener error of one serving session, in completion order.
#[derive(Debug, Error)]
#[error("{}", join_lines(.errors))]
pub struct RunError {
    pub errors: Vec<ListenerError>,
}

impl RunError {
    pub fn timed_out(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, ListenerError::ShutdownTimeout { .. }))
    }
}

fn join_lines<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct Supervisor {
    settings: Arc<ServerConfig>,
    handler: ReloadableHandler,
    rotator: Option<Arc<CertificateRotator>>,
    listeners: Vec<Listener>,
    background: CancellationToken,
    state: watch::Sender<ServingState>,
}

impl Supervisor {
    /// Validate settings, build the initial pipeline and load the certificate.
    ///
    /// Nothing is bound yet; any error here means serving never starts.
    pub fn new(
        config: ServerConfig,
        factory: Arc<dyn PipelineFactory>,
    ) -> Result<Self, StartupError> {
        let state = watch::Sender::new(ServingState::Starting);

        let errors = ServerConfigValidator::collect_errors(&config);
        if !errors.is_empty() {
            return Err(StartupError::InvalidConfig(errors));
        }
        let settings = Arc::new(config);

        let background = CancellationToken::new();
        let handler = ReloadableHandler::new(settings.clone(), factory, background.clone())
            .map_err(StartupError::Pipeline)?;

        let rotator = settings
            .tls
            .as_ref()
            .map(CertificateRotator::new)
            .transpose()?
            .map(Arc::new);
        let acceptor = rotator.as_ref().map(|r| r.acceptor()).transpose()?;

        let mut listeners = vec![Listener::new(
            PRIMARY_LISTENER,
            settings.listen_addr(),
            ListenerService::Site(PanicGuard::new(handler.clone())),
            acceptor,
            settings.shutdown_timeout,
        )];
        if settings.https_redirect {
            listeners.push(Listener::new(
                REDIRECT_LISTENER,
                settings.redirect_addr(),
                ListenerService::HttpsRedirect,
                None,
                settings.shutdown_timeout,
            ));
        }

        for listener in &listeners {
            tracing::info!(listener = listener.name(), "listener registered");
        }

        Ok(Self {
            settings,
            handler,
            rotator,
            listeners,
            background,
            state,
        })
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServingState> {
        self.state.subscribe()
    }

    /// Local address of a registered listener once it is bound.
    pub fn subscribe_bound(&self, listener: &str) -> Option<watch::Receiver<Option<SocketAddr>>> {
        self.listeners
            .iter()
            .find(|l| l.name() == listener)
            .map(Listener::subscribe_bound)
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        self.handler.handle()
    }

    pub fn settings(&self) -> &ServerConfig {
        &self.settings
    }

    /// Serve until `lifetime` is cancelled, the deadline passes or a listener exits.
    pub async fn run(self, lifetime: Lifetime) -> Result<(), RunError> {
        let Self {
            settings,
            handler: _handler,
            rotator,
            listeners,
            background,
            state,
        } = self;

        let scope = lifetime.child();
        let deadline = settings.deadline.map(|d| scope.bind_deadline(d));
        let rotation = rotator.map(|r| tokio::spawn(r.reload_loop(scope.clone())));

        let mut tasks = JoinSet::new();
        for listener in listeners {
            let scope = scope.clone();
            tasks.spawn(async move {
                let result = listener.run(scope.clone()).await;
                scope.cancel(CancelReason::ListenerFailure);
                result
            });
        }
        state.send_replace(ServingState::Running);

        scope.cancelled().await;
        let reason = scope.reason().unwrap_or(CancelReason::Requested);
        tracing::info!(reason = %reason, "server is shutting down");
        state.send_replace(ServingState::ShuttingDown);
        // Open pacing gates so admitted requests can finish inside the drain window.
        background.cancel();

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => errors.push(error),
                Err(error) => errors.push(ListenerError::Task(error)),
            }
        }

        if let Some(rotation) = rotation {
            if let Err(error) = rotation.await {
                tracing::error!(%error, "tls reload loop failed");
            }
        }
        if let Some(deadline) = deadline {
            let _ = deadline.await;
        }

        state.send_replace(ServingState::Stopped);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RunError { errors })
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("listeners", &self.listeners.len())
            .field("tls", &self.rotator.is_some())
            .field("state", &*self.state.borrow())
            .finish()
    }
}
