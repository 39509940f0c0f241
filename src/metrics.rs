//! Lightweight metrics helpers for Sphinx.
//!
//! This module exposes a small set of convenience functions wrapping the `metrics` crate
//! macros. It does not embed a concrete exporter (the application can initialize any
//! compatible recorder externally) while still documenting and describing the
//! Sphinx-specific metric names.
//!
//! Provided metrics (labels vary by family):
//! * `sphinx_admissions_total` (counter)
//! * `sphinx_admission_rejections_total` (counter, by shard)
//! * `sphinx_pipeline_reloads_total` (counter, by outcome)
//! * `sphinx_certificate_reloads_total` (counter, by outcome)
//! * `sphinx_recovered_panics_total` (counter)
//! * `sphinx_active_connections` (gauge, by listener)
//!
//! Admission rejections are only visible here; they are never logged per request.
use metrics::{Unit, counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::Lazy;

pub const SPHINX_ADMISSIONS_TOTAL: &str = "sphinx_admissions_total";
pub const SPHINX_ADMISSION_REJECTIONS_TOTAL: &str = "sphinx_admission_rejections_total";
pub const SPHINX_PIPELINE_RELOADS_TOTAL: &str = "sphinx_pipeline_reloads_total";
pub const SPHINX_CERTIFICATE_RELOADS_TOTAL: &str = "sphinx_certificate_reloads_total";
pub const SPHINX_RECOVERED_PANICS_TOTAL: &str = "sphinx_recovered_panics_total";
pub const SPHINX_ACTIVE_CONNECTIONS: &str = "sphinx_active_connections";

/// Outcome label for reload counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Success,
    Failure,
}

impl ReloadOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ReloadOutcome::Success => "success",
            ReloadOutcome::Failure => "failure",
        }
    }
}

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        SPHINX_ADMISSIONS_TOTAL,
        Unit::Count,
        "Requests that acquired an admission slot."
    );
    describe_counter!(
        SPHINX_ADMISSION_REJECTIONS_TOTAL,
        Unit::Count,
        "Requests shed because their shard had no free admission slot."
    );
    describe_counter!(
        SPHINX_PIPELINE_RELOADS_TOTAL,
        Unit::Count,
        "Request pipeline rebuild attempts by outcome."
    );
    describe_counter!(
        SPHINX_CERTIFICATE_RELOADS_TOTAL,
        Unit::Count,
        "Periodic TLS certificate reload attempts by outcome."
    );
    describe_counter!(
        SPHINX_RECOVERED_PANICS_TOTAL,
        Unit::Count,
        "Request handler panics converted into 500 responses."
    );
    describe_gauge!(
        SPHINX_ACTIVE_CONNECTIONS,
        "Number of currently open connections per listener."
    );
});

pub fn increment_admissions() {
    counter!(SPHINX_ADMISSIONS_TOTAL).increment(1);
}

pub fn increment_admission_rejections(shard: usize) {
    counter!(SPHINX_ADMISSION_REJECTIONS_TOTAL, "shard" => shard.to_string()).increment(1);
}

pub fn increment_pipeline_reloads(outcome: ReloadOutcome) {
    counter!(SPHINX_PIPELINE_RELOADS_TOTAL, "outcome" => outcome.as_str()).increment(1);
}

pub fn increment_certificate_reloads(outcome: ReloadOutcome) {
    counter!(SPHINX_CERTIFICATE_RELOADS_TOTAL, "outcome" => outcome.as_str()).increment(1);
}

pub fn increment_recovered_panics() {
    counter!(SPHINX_RECOVERED_PANICS_TOTAL).increment(1);
}

/// Set the open connection count for a listener.
pub fn set_active_connections(listener: &'static str, count: usize) {
    gauge!(SPHINX_ACTIVE_CONNECTIONS, "listener" => listener).set(count as f64);
}

/// Register metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    Lazy::force(&DESCRIPTIONS);
    tracing::debug!("sphinx metric descriptions registered");
    Ok(())
}
