//! Periodic dispatch gate.
//!
//! A background ticker deposits at most one release into a single-slot buffer every
//! period; each waiter consumes one release. Ticks that arrive while the buffer is full
//! are dropped, so an idle gate lets exactly one waiter through immediately and every
//! further waiter is spaced by at least one period.
use std::{sync::Arc, time::Duration};

use tokio::{
    sync::Semaphore,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::{CancellationToken, DropGuard};

pub struct PacingGate {
    releases: Arc<Semaphore>,
    _stop: DropGuard,
}

impl PacingGate {
    /// Spawn the ticker for a new gate. The ticker stops when `background` is cancelled
    /// or the gate is dropped, whichever comes first.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(period: Duration, background: &CancellationToken) -> Self {
        let releases = Arc::new(Semaphore::new(0));
        let stop = background.child_token();

        tokio::spawn(tick(period, releases.clone(), stop.clone()));

        Self {
            releases,
            _stop: stop.drop_guard(),
        }
    }

    /// Wait for the next release. Returns immediately once the ticker has stopped so that
    /// admitted requests can still drain during shutdown.
    pub async fn wait(&self) {
        if let Ok(permit) = self.releases.acquire().await {
            permit.forget();
        }
    }
}

async fn tick(period: Duration, releases: Arc<Semaphore>, stop: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                if releases.available_permits() == 0 {
                    releases.add_permits(1);
                }
            }
        }
    }

    releases.close();
    tracing::trace!(period = ?period, "pacing gate stopped");
}
