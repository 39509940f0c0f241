use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize structured logging with JSON output for Sphinx
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install JSON tracing subscriber")?;

    tracing::debug!("Sphinx structured logging initialized");
    Ok(())
}

/// Initialize console-friendly logging for development
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install console tracing subscriber")?;

    tracing::debug!("Sphinx console logging initialized");
    Ok(())
}

/// Span wrapping one listener's accept loop and connection tasks.
pub fn create_listener_span(listener: &str, addr: &str) -> tracing::Span {
    tracing::info_span!("listener", name = listener, addr = addr)
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, remote_addr: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        http.remote_addr = remote_addr,
    )
}
