//! Server-Sent Events / streamable HTTP transport.
//!
//! Clients hold a `GET` event stream open and submit JSON-RPC messages with
//! `POST`; replies are pushed back over the stream as `message` events. The
//! stream is keyed by its `Mcp-Session-Id`.

use std::{
    convert::Infallible,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures::Stream;
use serde_json::Value;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Mutex,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::errors::{AppError, TransportError};
use crate::logging::request_logging_middleware;
use crate::mcp::JsonRpcProcessor;
use crate::transport::connection::spawn_ping_task;
use crate::transport::cors::{cors_middleware, preflight, CorsPolicy};
use crate::transport::http::HealthResponse;
use crate::transport::{accepts_event_stream, ConnectionTable, Lifecycle, Transport};

pub const TRANSPORT_NAME: &str = "sse";
pub const SESSION_HEADER: &str = "mcp-session-id";

const EVENT_BUFFER: usize = 64;
/// How long a reply may wait for room in a stream's buffer.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
const USAGE_HINT: &str =
    "MCP SSE endpoint. Open a stream with GET and 'Accept: text/event-stream', then POST JSON-RPC messages.";

/// Write side of one event stream.
#[derive(Debug, Clone)]
pub struct SseSink {
    sender: mpsc::Sender<Event>,
    // serializes POST processing per session
    order: Arc<Mutex<()>>,
}

impl SseSink {
    fn new(sender: mpsc::Sender<Event>) -> Self {
        Self {
            sender,
            order: Arc::new(Mutex::new(())),
        }
    }
}

struct SseShared {
    processor: Arc<JsonRpcProcessor>,
    connections: ConnectionTable<SseSink>,
    endpoint: String,
    delivery_timeout: Duration,
}

impl SseShared {
    /// Processes `body` and pushes any reply to the session's stream.
    async fn deliver(&self, session_id: &str, sink: &SseSink, body: &[u8]) {
        let _order = sink.order.lock().await;

        let reply = self.processor.process_message(body).await;
        if reply.is_empty() {
            return;
        }

        let event = Event::default().event("message").data(reply);
        match tokio::time::timeout(self.delivery_timeout, sink.sender.send(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!(connection_id = %session_id, "stream closed before reply was delivered");
                self.connections.mark_inactive(session_id).await;
            }
            Err(_) => {
                warn!(connection_id = %session_id, "stream is not draining, marking inactive");
                self.connections.mark_inactive(session_id).await;
            }
        }
    }
}

pub struct SseTransport {
    config: TransportConfig,
    shared: Arc<SseShared>,
    lifecycle: Lifecycle,
}

impl SseTransport {
    pub fn new(config: TransportConfig, processor: Arc<JsonRpcProcessor>) -> Self {
        let shared = Arc::new(SseShared {
            processor,
            connections: ConnectionTable::new(config.max_connections),
            endpoint: config.sse_endpoint.clone(),
            delivery_timeout: DELIVERY_TIMEOUT,
        });
        let lifecycle = Lifecycle::new(TRANSPORT_NAME, config.bind);

        Self {
            config,
            shared,
            lifecycle,
        }
    }

    pub async fn active_connections(&self) -> usize {
        self.shared.connections.active_count().await
    }

    pub fn router(&self) -> Router {
        let cors = CorsPolicy::new(&self.config.allowed_origins).exposing("Mcp-Session-Id");
        let stream_routes = get(open_stream).post(post_message).options(preflight);

        Router::new()
            .route("/health", get(health))
            .route("/", stream_routes.clone())
            .route("/{*path}", stream_routes)
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(middleware::from_fn(request_logging_middleware))
            .layer(middleware::from_fn_with_state(cors, cors_middleware))
            .with_state(Arc::clone(&self.shared))
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    async fn start(&self) -> Result<(), TransportError> {
        let shared = Arc::clone(&self.shared);
        let interval = self.config.ping_interval;
        let timeout = self.config.ping_timeout;

        self.lifecycle
            .start(self.router(), move || {
                Some(spawn_ping_task(interval, move || {
                    ping_connections(Arc::clone(&shared), timeout)
                }))
            })
            .await
    }

    async fn stop(&self) {
        self.lifecycle
            .stop(|| async { self.shared.connections.close_all().await.len() })
            .await
    }

    async fn is_running(&self) -> bool {
        self.lifecycle.is_running().await
    }

    async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr().await
    }
}

/// Event stream that drops its table entry once the client goes away.
struct SessionStream {
    events: ReceiverStream<Event>,
    _guard: SessionGuard,
}

impl Stream for SessionStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events)
            .poll_next(cx)
            .map(|event| event.map(Ok))
    }
}

struct SessionGuard {
    shared: Arc<SseShared>,
    session_id: String,
    sequence: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let shared = Arc::clone(&self.shared);
        let session_id = std::mem::take(&mut self.session_id);
        let sequence = self.sequence;
        runtime.spawn(async move {
            if shared
                .connections
                .remove_instance(&session_id, sequence)
                .await
            {
                info!(connection_id = %session_id, "sse stream closed");
            }
        });
    }
}

async fn open_stream(
    State(shared): State<Arc<SseShared>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !accepts_event_stream(accept) {
        return Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            USAGE_HINT,
        )
            .into_response());
    }

    let session_id = session_id(&headers).unwrap_or_else(|| Uuid::new_v4().to_string());
    let session_value = HeaderValue::from_str(&session_id).map_err(|_| {
        AppError::bad_request("invalid_session_id", "Mcp-Session-Id is not a valid header value")
    })?;

    let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
    let sequence = shared
        .connections
        .try_insert(session_id.clone(), SseSink::new(sender.clone()))
        .await
        .map_err(|err| {
            warn!(connection_id = %session_id, error = %err, "rejecting sse stream");
            AppError::service_unavailable("too_many_connections", "connection limit reached")
        })?;

    // fresh channel, cannot be full
    let _ = sender.try_send(Event::default().event("endpoint").data(shared.endpoint.as_str()));
    info!(connection_id = %session_id, "sse stream opened");

    let stream = SessionStream {
        events: ReceiverStream::new(receiver),
        _guard: SessionGuard {
            shared: Arc::clone(&shared),
            session_id,
            sequence,
        },
    };

    let mut response = Sse::new(stream).into_response();
    response
        .headers_mut()
        .insert(HeaderName::from_static(SESSION_HEADER), session_value);
    Ok(response)
}

async fn post_message(
    State(shared): State<Arc<SseShared>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    if body.is_empty() {
        return Err(AppError::bad_request(
            "empty_body",
            "request body must not be empty",
        ));
    }

    if let Some(session_id) = session_id(&headers) {
        if !shared.connections.contains(&session_id).await {
            return Err(AppError::not_found(
                "unknown_session",
                "no stream is open for this Mcp-Session-Id",
            ));
        }

        if let Some(sink) = shared.connections.active_sink(&session_id).await {
            shared.deliver(&session_id, &sink, &body).await;
        } else {
            debug!(connection_id = %session_id, "session inactive, dropping message");
        }

        let echoed = HeaderValue::from_str(&session_id).map_err(|_| {
            AppError::bad_request("invalid_session_id", "Mcp-Session-Id is not a valid header value")
        })?;
        return Ok((
            StatusCode::ACCEPTED,
            [(HeaderName::from_static(SESSION_HEADER), echoed)],
        )
            .into_response());
    }

    if !is_legacy_message(&body) {
        return Err(AppError::bad_request(
            "missing_session",
            "Mcp-Session-Id header is required for this message",
        ));
    }

    let Some((session_id, sink)) = shared.connections.most_recent_active().await else {
        return Err(AppError::bad_request(
            "no_active_stream",
            "open an event stream before posting messages",
        ));
    };

    shared.deliver(&session_id, &sink, &body).await;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn health(State(shared): State<Arc<SseShared>>) -> Json<HealthResponse> {
    let active = shared.connections.active_count().await;
    Json(
        HealthResponse::new(TRANSPORT_NAME, &shared.processor)
            .with_connections(active, shared.connections.max_connections()),
    )
}

/// One liveness round: ping every active stream, then evict dead or silent ones.
async fn ping_connections(shared: Arc<SseShared>, timeout: Duration) {
    for (session_id, sink) in shared.connections.active_sinks().await {
        let event = Event::default()
            .event("ping")
            .data(Utc::now().to_rfc3339());

        match sink.sender.try_send(event) {
            Ok(()) => shared.connections.touch(&session_id).await,
            Err(TrySendError::Full(_)) => {
                debug!(connection_id = %session_id, "event buffer full, ping skipped");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %session_id, "ping failed, marking stream inactive");
                shared.connections.mark_inactive(&session_id).await;
            }
        }
    }

    let evicted = shared.connections.evict_stale(timeout).await;
    if !evicted.is_empty() {
        info!(count = evicted.len(), "evicted sse streams");
    }
}

fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Messages that may be posted without a session header.
///
/// A batch qualifies only when every element does.
fn is_legacy_message(body: &[u8]) -> bool {
    fn qualifies(message: &Value) -> bool {
        message
            .get("method")
            .and_then(Value::as_str)
            .is_some_and(|method| {
                method == "initialize"
                    || method.starts_with("notifications/")
                    || method.starts_with("tools/")
            })
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Array(items)) => !items.is_empty() && items.iter().all(qualifies),
        Ok(message) => qualifies(&message),
        Err(_) => false,
    }
}
