//! Sphinx - serving core for a puzzle-hunt event site.
//!
//! Sphinx keeps a small static site available while the event is running: under adversarial
//! load, across content updates and certificate renewals, and up to a hard end time. The
//! library exposes the building blocks so they can be embedded or tested in isolation; the
//! binary wires them to a YAML configuration file and process signals.
//!
//! # Features
//! - Per-client admission control: traffic is sharded by client host, each shard caps
//!   concurrent requests and paces request starts to one per period
//! - Hot reload of the whole request pipeline without dropping connections
//! - TLS certificate rotation from disk with lock-free handshake lookups
//! - Panic recovery per request
//! - HTTP/1.1 + HTTP/2, optional plaintext listener redirecting to https
//! - Bounded graceful shutdown on signal, listener failure or an absolute deadline
//! - Metrics (via the `metrics` facade) & structured tracing via `tracing`
//!
//! # Quick Example
//! ```no_run
//! use sphinx::{Lifetime, Supervisor, adapters::site, config::load_config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("config.yaml").await?;
//! let supervisor = Supervisor::new(config, site::factory())?;
//! supervisor.run(Lifetime::new()).await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! the serving logic inside `core`. A pipeline is any `axum::Router` produced by a
//! [`PipelineFactory`]; the supervisor owns it behind a reloadable handle and runs the
//! listeners that dispatch into it.
//!
//! # Error Handling
//! Component seams return `thiserror` enums ([`StartupError`], [`ReloadError`],
//! [`RunError`], ...). Pipeline factories and application glue use `eyre::Result<T>` with
//! context attached through `WrapErr`.
//!
//! # License
//! Licensed under Apache-2.0.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    core::{
        CancelReason, Lifetime, ReloadError, ReloadHandle, RunError, ServingState, StartupError,
        Supervisor,
    },
    ports::pipeline::{BuildContext, PipelineFactory},
    utils::GracefulShutdown,
};
