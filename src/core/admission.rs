//! Per-client admission control.
//!
//! Traffic is sharded by a 64-bit FNV-1 hash of the client's host (port ignored). Each
//! shard combines two independent primitives:
//! * a counting semaphore of `max_concurrent` slots bounding how many requests may be
//!   waiting or in flight, and
//! * a [`PacingGate`] releasing one dispatch start per period.
//!
//! A request that finds no free slot is rejected synchronously without waiting. An
//! admitted request waits for its shard's gate, runs, and releases its slot once its
//! response body has been sent. Shards share nothing, so saturating one never affects another.
//!
//! Addresses that cannot be split into host and port all land on shard 0.
use std::{
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use http_body_util::BodyExt;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{config::AdmissionConfig, core::pacing::PacingGate, metrics};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Builds the response served to rejected requests.
pub type RejectResponder = Arc<dyn Fn() -> Response + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("admission limiter needs at least one shard")]
    NoShards,
    #[error("admission pacing period must be greater than zero")]
    ZeroPeriod,
    #[error("admission shards need a capacity of at least one")]
    ZeroCapacity,
}

/// Outcome of [`AdmissionLimiter::admit`].
pub enum AdmissionDecision {
    Admitted(AdmissionTicket),
    Rejected,
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted(_))
    }
}

impl fmt::Debug for AdmissionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionDecision::Admitted(ticket) => {
                f.debug_tuple("Admitted").field(&ticket.shard).finish()
            }
            AdmissionDecision::Rejected => f.write_str("Rejected"),
        }
    }
}

/// A held admission slot. Dropping the ticket returns the slot to its shard.
pub struct AdmissionTicket {
    shard: usize,
    gate: Arc<PacingGate>,
    slot: OwnedSemaphorePermit,
}

impl AdmissionTicket {
    /// Wait for the shard's pacing gate to release this request.
    pub async fn paced(&self) {
        self.gate.wait().await;
    }

    /// Keep the slot until `response`'s body has been fully sent or dropped.
    pub fn hold_until_sent(self, response: Response) -> Response {
        let slot = self.slot;
        response.map(move |body| {
            Body::new(body.map_frame(move |frame| {
                let _held = &slot;
                frame
            }))
        })
    }
}

struct Shard {
    slots: Arc<Semaphore>,
    gate: Arc<PacingGate>,
}

pub struct AdmissionLimiter {
    shards: Vec<Shard>,
    capacity: usize,
    reject: RejectResponder,
}

impl AdmissionLimiter {
    /// Create `shards` independent shards, each with `capacity` slots and a gate releasing
    /// one dispatch per `period`. Gate tickers stop when `background` is cancelled or the
    /// limiter is dropped.
    pub fn new(
        shards: usize,
        period: Duration,
        capacity: usize,
        reject: RejectResponder,
        background: &CancellationToken,
    ) -> Result<Self, AdmissionError> {
        if shards == 0 {
            return Err(AdmissionError::NoShards);
        }
        if period.is_zero() {
            return Err(AdmissionError::ZeroPeriod);
        }
        if capacity == 0 {
            return Err(AdmissionError::ZeroCapacity);
        }

        let shards = (0..shards)
            .map(|_| Shard {
                slots: Arc::new(Semaphore::new(capacity)),
                gate: Arc::new(PacingGate::start(period, background)),
            })
            .collect::<Vec<_>>();

        tracing::info!(
            shards = shards.len(),
            period = ?period,
            max_concurrent = capacity,
            "admission limiter created"
        );

        Ok(Self {
            shards,
            capacity,
            reject,
        })
    }

    pub fn from_config(
        config: &AdmissionConfig,
        reject: RejectResponder,
        background: &CancellationToken,
    ) -> Result<Self, AdmissionError> {
        Self::new(
            config.shards,
            config.period,
            config.max_concurrent,
            reject,
            background,
        )
    }

    /// Try to take a slot on the client's shard without waiting.
    pub fn admit(&self, client_key: &str) -> AdmissionDecision {
        let index = self.shard_index(client_key);
        let shard = &self.shards[index];

        match shard.slots.clone().try_acquire_owned() {
            Ok(slot) => {
                metrics::increment_admissions();
                AdmissionDecision::Admitted(AdmissionTicket {
                    shard: index,
                    gate: shard.gate.clone(),
                    slot,
                })
            }
            Err(_) => {
                metrics::increment_admission_rejections(index);
                AdmissionDecision::Rejected
            }
        }
    }

    /// Shard for a client address of the form `host:port` or `[v6]:port`.
    pub fn shard_index(&self, client_key: &str) -> usize {
        match split_host(client_key) {
            Some(host) => (fnv1_64(host.as_bytes()) % self.shards.len() as u64) as usize,
            None => 0,
        }
    }

    /// Response for a rejected request.
    pub fn reject(&self) -> Response {
        (self.reject)()
    }
}

impl fmt::Debug for AdmissionLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLimiter")
            .field("shards", &self.shards.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Plain `429 Too Many Requests`.
pub fn too_many_requests() -> RejectResponder {
    Arc::new(|| (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response())
}

/// Axum middleware applying the limiter to every request passing through it.
///
/// The client key comes from the `ConnectInfo<SocketAddr>` extension set by the listener;
/// requests without one are keyed by the empty string and therefore use shard 0. The slot
/// stays taken until the response body has been written, so a slow download keeps
/// counting against its shard.
pub async fn admission_middleware(
    State(limiter): State<Arc<AdmissionLimiter>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let client_key = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    match limiter.admit(&client_key) {
        AdmissionDecision::Admitted(ticket) => {
            ticket.paced().await;
            let response = next.run(req).await;
            ticket.hold_until_sent(response)
        }
        AdmissionDecision::Rejected => limiter.reject(),
    }
}

/// Host part of `host:port`, `[host]:port` or `[host%zone]:port`. `None` when the
/// address has no port separator or an unbracketed host contains colons.
fn split_host(addr: &str) -> Option<&str> {
    if let Some(rest) = addr.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let after = &rest[end + 1..];
        let port = after.strip_prefix(':')?;
        if port.contains(':') || host.is_empty() && port.is_empty() {
            return None;
        }
        return Some(host);
    }

    let colon = addr.rfind(':')?;
    let host = &addr[..colon];
    if host.contains(':') || host.contains('[') || host.contains(']') {
        return None;
    }
    Some(host)
}

/// 64-bit FNV-1 (multiply, then xor).
fn fnv1_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        hash.wrapping_mul(FNV_PRIME) ^ u64::from(b)
    })
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn limiter(shards: usize, period: Duration, capacity: usize) -> AdmissionLimiter {
        AdmissionLimiter::new(
            shards,
            period,
            capacity,
            too_many_requests(),
            &CancellationToken::new(),
        )
        .unwrap()
    }

    fn free_slots(limiter: &AdmissionLimiter) -> usize {
        limiter.shards[0].slots.available_permits()
    }

    /// Two client keys that the limiter places on different shards.
    fn keys_on_different_shards(limiter: &AdmissionLimiter) -> (String, String) {
        let first = "10.0.0.1:5000".to_string();
        let shard = limiter.shard_index(&first);
        let second = (2..=255)
            .map(|i| format!("10.0.0.{i}:5000"))
            .find(|key| limiter.shard_index(key) != shard)
            .expect("some host must hash to another shard");
        (first, second)
    }

    #[test]
    fn test_fnv1_matches_reference_vectors() {
        assert_eq!(fnv1_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1_64(b"a"), 0xaf63_bd4c_8601_b7be);
        assert_eq!(fnv1_64(b"foobar"), 0x340d_8765_a4dd_a9c2);
    }

    #[test]
    fn test_split_host_handles_common_forms() {
        assert_eq!(split_host("192.168.1.10:443"), Some("192.168.1.10"));
        assert_eq!(split_host("[::1]:8080"), Some("::1"));
        assert_eq!(split_host("example.com:80"), Some("example.com"));
        assert_eq!(split_host("example.com"), None);
        assert_eq!(split_host("::1"), None);
        assert_eq!(split_host(""), None);
        assert_eq!(split_host("[::1]"), None);
    }

    #[test]
    fn test_rejects_invalid_construction() {
        let background = CancellationToken::new();
        let reject = too_many_requests();
        assert_eq!(
            AdmissionLimiter::new(0, Duration::from_secs(1), 1, reject.clone(), &background)
                .unwrap_err(),
            AdmissionError::NoShards
        );
        assert_eq!(
            AdmissionLimiter::new(1, Duration::ZERO, 1, reject.clone(), &background).unwrap_err(),
            AdmissionError::ZeroPeriod
        );
        assert_eq!(
            AdmissionLimiter::new(1, Duration::from_secs(1), 0, reject, &background).unwrap_err(),
            AdmissionError::ZeroCapacity
        );
    }

    #[tokio::test]
    async fn test_port_does_not_change_the_shard() {
        let limiter = limiter(16, Duration::from_millis(10), 1);
        assert_eq!(
            limiter.shard_index("203.0.113.7:1111"),
            limiter.shard_index("203.0.113.7:2222")
        );
    }

    #[tokio::test]
    async fn test_unparseable_addresses_use_shard_zero() {
        let limiter = limiter(16, Duration::from_millis(10), 1);
        for key in ["", "not-an-address", "::1", "[::1]"] {
            assert_eq!(limiter.shard_index(key), 0, "{key:?}");
        }
    }

    #[tokio::test]
    async fn test_capacity_one_admits_exactly_one_of_two() {
        let limiter = limiter(4, Duration::from_millis(100), 1);

        let first = limiter.admit("198.51.100.4:40000");
        let second = limiter.admit("198.51.100.4:40001");

        assert!(first.is_admitted());
        assert!(matches!(second, AdmissionDecision::Rejected));
    }

    #[tokio::test]
    async fn test_dropping_a_ticket_frees_the_slot() {
        let limiter = limiter(1, Duration::from_millis(100), 1);

        let ticket = limiter.admit("198.51.100.4:1");
        assert_eq!(free_slots(&limiter), 0);
        drop(ticket);

        assert_eq!(free_slots(&limiter), 1);
        assert!(limiter.admit("198.51.100.4:1").is_admitted());
    }

    #[tokio::test]
    async fn test_saturated_shard_does_not_affect_another() {
        let limiter = limiter(8, Duration::from_millis(100), 2);
        let (busy, other) = keys_on_different_shards(&limiter);

        let _held: Vec<_> = (0..2).map(|_| limiter.admit(&busy)).collect();
        assert!(matches!(limiter.admit(&busy), AdmissionDecision::Rejected));

        for _ in 0..2 {
            let decision = limiter.admit(&other);
            assert!(decision.is_admitted());
        }
    }

    #[tokio::test]
    async fn test_dispatch_starts_are_paced_per_shard() {
        let period = Duration::from_millis(50);
        let limiter = Arc::new(limiter(1, period, 5));
        let start = Instant::now();

        let mut tasks = Vec::new();
        for i in 0..5 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                let decision = limiter.admit(&format!("192.0.2.1:{}", 1000 + i));
                let AdmissionDecision::Admitted(ticket) = decision else {
                    panic!("request {i} should be admitted");
                };
                ticket.paced().await;
                start.elapsed()
            }));
        }

        let mut starts = Vec::new();
        for task in tasks {
            starts.push(task.await.unwrap());
        }
        starts.sort();

        for pair in starts.windows(2) {
            assert!(
                pair[1] - pair[0] >= period - Duration::from_millis(10),
                "dispatch starts {:?} and {:?} closer than {period:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[tokio::test]
    async fn test_sixth_concurrent_request_is_shed() {
        let limiter = limiter(1, Duration::from_millis(50), 5);
        let held: Vec<_> = (0..5).map(|_| limiter.admit("192.0.2.1:1")).collect();
        assert!(held.iter().all(AdmissionDecision::is_admitted));

        assert!(matches!(
            limiter.admit("192.0.2.1:1"),
            AdmissionDecision::Rejected
        ));
    }

    #[tokio::test]
    async fn test_slot_is_held_until_body_is_sent() {
        use axum::{Router, middleware, routing::get};
        use tower::ServiceExt;

        let limiter = Arc::new(limiter(1, Duration::from_millis(10), 1));
        let app = Router::new()
            .route("/", get(|| async { "round 1" }))
            .layer(middleware::from_fn_with_state(
                limiter.clone(),
                admission_middleware,
            ));

        let mut req = Request::builder().uri("/").body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000))));
        let response = app.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(free_slots(&limiter), 0);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"round 1");
        assert_eq!(free_slots(&limiter), 1);
    }
}
