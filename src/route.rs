//! Streaming Route Factory
//!
//! Builds axum handlers for long-lived newline-delimited JSON responses.
//! One [`StreamRoute`] owns one [`HeartbeatClock`]; every handler produced
//! from it shares that clock, so the keep-alive cost is one timer for the
//! whole route, regardless of how many connections are open.
//!
//! The route itself never times a connection out — the heartbeat is the
//! keep-alive mechanism. Mount it outside any timeout middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum::routing::{any, MethodRouter};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{ServerConfig, StreamConfig};
use crate::error::ServeError;
use crate::heartbeat::HeartbeatClock;
use crate::session::{SessionRequest, StreamSession};

/// Fallback request-body read limit when the route is built without a
/// config, matching [`StreamConfig`]'s default.
const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Factory for streaming request handlers sharing one heartbeat clock.
pub struct StreamRoute {
    clock: Arc<HeartbeatClock>,
    body_limit: usize,
}

impl StreamRoute {
    /// Create a factory whose sessions receive a heartbeat every
    /// `heartbeat_interval`. Requires a running tokio runtime.
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            clock: Arc::new(HeartbeatClock::new(heartbeat_interval)),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    /// Create a factory from a [`StreamConfig`].
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            clock: Arc::new(HeartbeatClock::new(config.heartbeat_interval())),
            body_limit: config.max_body_size,
        }
    }

    /// Number of sessions currently attached to the shared clock.
    pub fn active_sessions(&self) -> usize {
        self.clock.subscriber_count()
    }

    /// Build the request handler. `on_session` runs once per accepted
    /// connection, synchronously, before the session's `Open` event fires;
    /// it is where application code registers lifecycle listeners and
    /// starts producing messages.
    pub fn handler<F>(&self, on_session: F) -> MethodRouter
    where
        F: Fn(StreamSession) + Clone + Send + Sync + 'static,
    {
        let clock = Arc::clone(&self.clock);
        let body_limit = self.body_limit;

        any(move |req: Request| {
            let clock = Arc::clone(&clock);
            let on_session = on_session.clone();
            async move { handle_stream(clock, body_limit, on_session, req).await }
        })
    }
}

async fn handle_stream<F>(
    clock: Arc<HeartbeatClock>,
    body_limit: usize,
    on_session: F,
    req: Request,
) -> Response
where
    F: Fn(StreamSession) + Clone + Send + Sync + 'static,
{
    // Fast-fail protocol gate: only the write method and preflight pass.
    // This is a normal protocol response, not an error.
    if req.method() != Method::POST && req.method() != Method::OPTIONS {
        tracing::debug!(method = %req.method(), "method not allowed on stream route");
        return method_not_allowed();
    }

    let (parts, body) = req.into_parts();

    // The body is read once, up front; this channel is unidirectional
    // after that.
    let bytes = match to_bytes(body, body_limit).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, "failed to read request body");
            return bad_request();
        }
    };
    let body_json = if bytes.is_empty() {
        None
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!(error = %err, "request body is not JSON, exposing none");
                None
            }
        }
    };

    let request = SessionRequest::new(parts.method, parts.uri, parts.headers, body_json);
    let (session, stream) = StreamSession::new(request);

    let beat_session = session.clone();
    let subscription = clock.subscribe(move || {
        if let Err(err) = beat_session.send(&serde_json::json!({ "name": "heartbeat" })) {
            tracing::warn!(error = %err, "heartbeat send failed");
        }
    });
    session.attach_heartbeat(Arc::clone(&clock), subscription);

    tracing::debug!(session = %session.id(), active = clock.subscriber_count(), "stream session opened");

    // The response is an unbounded sequence of JSON lines, not a single
    // document.
    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response.headers_mut().insert(
        header::TRANSFER_ENCODING,
        HeaderValue::from_static("chunked"),
    );

    on_session(session.clone());
    session.emit_open();

    response
}

fn method_not_allowed() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static("POST, OPTIONS"));
    response
}

fn bad_request() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Assemble a router with the streaming handler mounted at `path`, plus
/// request tracing and a permissive CORS layer (which is what answers real
/// browser preflights before they reach the handler).
pub fn build_router<F>(path: &str, route: &StreamRoute, on_session: F) -> Router
where
    F: Fn(StreamSession) + Clone + Send + Sync + 'static,
{
    Router::new()
        .route(path, route.handler(on_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and run the server until ctrl-c/SIGTERM.
pub async fn serve(router: Router, config: &ServerConfig) -> Result<(), ServeError> {
    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("json-lines listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("json-lines server shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use futures_util::StreamExt;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tower::util::ServiceExt;

    fn test_router<F>(on_session: F) -> Router
    where
        F: Fn(StreamSession) + Clone + Send + Sync + 'static,
    {
        let route = StreamRoute::new(Duration::from_secs(60));
        Router::new().route("/", route.handler(on_session))
    }

    #[tokio::test]
    async fn get_is_rejected_with_405() {
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&invoked);
        let app = test_router(move |_session| {
            flag.store(true, Ordering::SeqCst);
        });

        let response = app
            .oneshot(Request::builder().method("GET").uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            response.headers().get(header::ALLOW).unwrap(),
            "POST, OPTIONS"
        );
        // No session was ever constructed.
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn post_opens_a_chunked_json_stream() {
        let app = test_router(|session| session.close());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get(header::TRANSFER_ENCODING).unwrap(),
            "chunked"
        );
    }

    #[tokio::test]
    async fn options_is_accepted() {
        let app = test_router(|session| session.close());

        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn parsed_request_body_reaches_the_session() {
        let seen: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let app = test_router(move |session| {
            *sink.lock().unwrap() = session.request().body().cloned();
            session.close();
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"foo":"bar"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*seen.lock().unwrap(), Some(json!({ "foo": "bar" })));
    }

    #[tokio::test]
    async fn open_fires_after_the_application_callback() {
        let opened = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&opened);
        let app = test_router(move |session| {
            let flag = Arc::clone(&flag);
            session.on_open(move || {
                flag.store(true, Ordering::SeqCst);
            });
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(opened.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn response_streams_the_sent_lines() {
        let app = test_router(|session| {
            let producer = session.clone();
            session.on_open(move || {
                producer.send(&json!({ "foo": "bar" })).unwrap();
                producer.close();
            });
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let mut stream = response.into_body().into_data_stream();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }

        let text = std::str::from_utf8(&collected).unwrap();
        assert_eq!(text, "{\"foo\":\"bar\"}\n");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_a_session_exists() {
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&invoked);

        let route = StreamRoute::from_config(&StreamConfig {
            heartbeat_interval_secs: 60.0,
            max_body_size: 8,
        });
        let app = Router::new().route(
            "/",
            route.handler(move |_session| {
                flag.store(true, Ordering::SeqCst);
            }),
        );

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::from(r#"{"far-too-long":"for an 8 byte limit"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!invoked.load(Ordering::SeqCst));
    }
}
