//! Outermost request wrapper: request span plus panic recovery.
use std::{any::Any, net::SocketAddr, panic::AssertUnwindSafe, time::Instant};

use axum::{
    body::Body,
    extract::Request,
    response::{IntoResponse, Response},
};
use futures_util::FutureExt;
use http::StatusCode;
use tracing::Instrument;

use crate::{
    adapters::middleware::log_completion, core::reloadable::ReloadableHandler, metrics,
    tracing_setup,
};

/// Runs each request against the active pipeline and turns a panic into a fixed 500.
///
/// A panic can only be caught before the pipeline produced a response, so nothing has
/// been written to the client yet and the partial response is simply dropped.
#[derive(Clone, Debug)]
pub struct PanicGuard {
    handler: ReloadableHandler,
}

impl PanicGuard {
    pub fn new(handler: ReloadableHandler) -> Self {
        Self { handler }
    }

    pub async fn serve(&self, req: Request<Body>, remote_addr: SocketAddr) -> Response {
        let start = Instant::now();
        let method = req.method().clone();
        let url = req.uri().to_string();
        let remote = remote_addr.to_string();
        let span = tracing_setup::create_request_span(method.as_str(), req.uri().path(), &remote);

        let outcome = AssertUnwindSafe(self.handler.serve(req))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        match outcome {
            Ok(response) => response,
            Err(payload) => {
                let _entered = span.enter();
                metrics::increment_recovered_panics();
                tracing::error!(panic = %panic_message(payload.as_ref()), "recovered panic");
                let response = internal_error();
                // The pipeline's own request log unwound with the panic.
                log_completion(&method, &url, &remote, response.status(), start.elapsed());
                response
            }
        }
    }
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fmt,
        sync::{Arc, Mutex},
    };

    use axum::{Router, routing::get};
    use tokio_util::sync::CancellationToken;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    use super::*;
    use crate::{config::ServerConfig, ports::pipeline::BuildContext};

    fn guard() -> PanicGuard {
        let handler = ReloadableHandler::new(
            Arc::new(ServerConfig::default()),
            Arc::new(|_: &BuildContext| -> eyre::Result<Router> {
                Ok(Router::new()
                    .route("/ok", get(|| async { "fine" }))
                    .route(
                        "/boom",
                        get(|| async {
                            if true {
                                panic!("puzzle index out of range");
                            }
                            "unreachable"
                        }),
                    ))
            }),
            CancellationToken::new(),
        )
        .unwrap();
        PanicGuard::new(handler)
    }

    fn get_request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let guard = guard();
        let response = guard.serve(get_request("/boom"), remote()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_serving_continues_after_a_panic() {
        let guard = guard();
        let _ = guard.serve(get_request("/boom"), remote()).await;

        let response = guard.serve(get_request("/ok"), remote()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_panic_message_handles_payload_types() {
        let text: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(text.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    /// Collects the message of every event emitted while installed.
    #[derive(Clone, Default)]
    struct Messages(Arc<Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Messages {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let mut visitor = MessageVisitor(None);
            event.record(&mut visitor);
            if let Some(message) = visitor.0 {
                self.0.lock().unwrap().push(message);
            }
        }
    }

    struct MessageVisitor(Option<String>);

    impl tracing::field::Visit for MessageVisitor {
        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            if field.name() == "message" {
                self.0 = Some(value.to_string());
            }
        }

        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.0 = Some(format!("{value:?}"));
            }
        }
    }

    #[tokio::test]
    async fn test_panicking_request_still_logs_completion() {
        let messages = Messages::default();
        let _default = tracing_subscriber::registry()
            .with(messages.clone())
            .set_default();

        let guard = guard();
        let _ = guard.serve(get_request("/boom"), remote()).await;

        let logged = messages.0.lock().unwrap().clone();
        assert!(logged.iter().any(|m| m == "recovered panic"), "{logged:?}");
        assert!(logged.iter().any(|m| m == "request completed"), "{logged:?}");
    }
}
