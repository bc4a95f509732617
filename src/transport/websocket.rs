//! WebSocket transport.
//!
//! Every socket is one connection; each text or binary frame carries one
//! JSON-RPC message and replies go back as text frames in arrival order.

use std::{fmt::Display, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocketUpgrade},
        State,
    },
    middleware,
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::errors::TransportError;
use crate::logging::request_logging_middleware;
use crate::mcp::JsonRpcProcessor;
use crate::transport::connection::spawn_ping_task;
use crate::transport::cors::{cors_middleware, CorsPolicy};
use crate::transport::http::HealthResponse;
use crate::transport::{ConnectionTable, Lifecycle, Transport};

pub const TRANSPORT_NAME: &str = "websocket";

const OUTBOUND_BUFFER: usize = 64;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type OutboundSender = mpsc::Sender<Message>;

struct WsShared {
    processor: Arc<JsonRpcProcessor>,
    connections: ConnectionTable<OutboundSender>,
    max_message_size: usize,
}

pub struct WebSocketTransport {
    config: TransportConfig,
    shared: Arc<WsShared>,
    lifecycle: Lifecycle,
}

impl WebSocketTransport {
    pub fn new(config: TransportConfig, processor: Arc<JsonRpcProcessor>) -> Self {
        let shared = Arc::new(WsShared {
            processor,
            connections: ConnectionTable::new(config.max_connections),
            max_message_size: config.max_body_bytes,
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
        let cors = CorsPolicy::new(&self.config.allowed_origins);

        Router::new()
            .route("/", get(upgrade))
            .route("/mcp", get(upgrade))
            .route("/ws", get(upgrade))
            .route("/health", get(health))
            .layer(middleware::from_fn(request_logging_middleware))
            .layer(middleware::from_fn_with_state(cors, cors_middleware))
            .with_state(Arc::clone(&self.shared))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
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
            .stop(|| async {
                let closed = self.shared.connections.close_all().await;
                for connection in &closed {
                    let _ = connection.sink().try_send(close_message(
                        close_code::AWAY,
                        "server shutting down",
                    ));
                }
                closed.len()
            })
            .await
    }

    async fn is_running(&self) -> bool {
        self.lifecycle.is_running().await
    }

    async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr().await
    }
}

async fn upgrade(State(shared): State<Arc<WsShared>>, ws: WebSocketUpgrade) -> Response {
    let max_message_size = shared.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            run_connection(shared, sink, stream).await;
        })
}

async fn health(State(shared): State<Arc<WsShared>>) -> Json<HealthResponse> {
    let active = shared.connections.active_count().await;
    Json(
        HealthResponse::new(TRANSPORT_NAME, &shared.processor)
            .with_connections(active, shared.connections.max_connections()),
    )
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    }))
}

/// Drives one socket until the client leaves, a frame fails, or the server closes it.
async fn run_connection<Si, St, E>(shared: Arc<WsShared>, mut sink: Si, mut stream: St)
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display,
    St: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send,
{
    let connection_id = Uuid::new_v4().to_string();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    let sequence = match shared
        .connections
        .try_insert(connection_id.clone(), outbound_tx.clone())
        .await
    {
        Ok(sequence) => sequence,
        Err(err) => {
            warn!(connection_id = %connection_id, error = %err, "rejecting websocket");
            let _ = sink
                .send(close_message(close_code::AGAIN, "connection limit reached"))
                .await;
            let _ = sink.close().await;
            return;
        }
    };
    info!(connection_id = %connection_id, "websocket connected");

    let writer_id = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(err) = sink.send(message).await {
                debug!(connection_id = %writer_id, error = %err, "websocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = outbound_tx.closed() => break,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                debug!(connection_id = %connection_id, error = %err, "websocket read failed");
                break;
            }
            None => break,
        };

        let reply = match message {
            Message::Text(text) => {
                shared
                    .processor
                    .process_message(text.as_str().as_bytes())
                    .await
            }
            Message::Binary(data) => shared.processor.process_message(&data).await,
            Message::Ping(_) | Message::Pong(_) => {
                shared.connections.touch(&connection_id).await;
                continue;
            }
            Message::Close(_) => break,
        };

        if reply.is_empty() {
            continue;
        }
        if outbound_tx.send(Message::Text(reply.into())).await.is_err() {
            break;
        }
    }

    shared
        .connections
        .remove_instance(&connection_id, sequence)
        .await;
    drop(outbound_tx);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!(connection_id = %connection_id, "websocket disconnected");
}

/// One liveness round: queue a protocol ping on every socket, then evict dead ones.
async fn ping_connections(shared: Arc<WsShared>, timeout: Duration) {
    for (connection_id, sender) in shared.connections.active_sinks().await {
        match sender.try_send(Message::Ping(Bytes::new())) {
            Ok(()) => shared.connections.touch(&connection_id).await,
            Err(TrySendError::Full(_)) => {
                debug!(connection_id = %connection_id, "outbound buffer full, ping skipped");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %connection_id, "ping failed, marking socket inactive");
                shared.connections.mark_inactive(&connection_id).await;
            }
        }
    }

    let evicted = shared.connections.evict_stale(timeout).await;
    for connection in &evicted {
        let _ = connection
            .sink()
            .try_send(close_message(close_code::AWAY, "connection timed out"));
    }
    if !evicted.is_empty() {
        info!(count = evicted.len(), "evicted websocket connections");
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures::channel::mpsc as channel;
    use serde_json::Value;

    use crate::tools::{echo::EchoTool, ToolRegistry};
    use crate::transport::test_support::{open_raw, read_to_close};

    use super::*;

    type ClientTx = channel::UnboundedSender<Result<Message, Infallible>>;
    type ClientRx = channel::UnboundedReceiver<Message>;

    async fn shared(max_connections: usize) -> Arc<WsShared> {
        let registry = Arc::new(ToolRegistry::default());
        registry.register_tool(Arc::new(EchoTool), Some("utility")).await;

        let mut config = TransportConfig::new(([127, 0, 0, 1], 0).into());
        config.max_connections = max_connections;
        Arc::clone(&WebSocketTransport::new(config, crate::build_processor(registry)).shared)
    }

    fn connect(shared: &Arc<WsShared>) -> (ClientTx, ClientRx, tokio::task::JoinHandle<()>) {
        let (client_tx, server_rx) = channel::unbounded();
        let (server_tx, client_rx) = channel::unbounded();
        let task = tokio::spawn(run_connection(Arc::clone(shared), server_tx, server_rx));
        (client_tx, client_rx, task)
    }

    async fn next_message(client_rx: &mut ClientRx) -> Message {
        tokio::time::timeout(Duration::from_secs(2), client_rx.next())
            .await
            .expect("message should arrive")
            .expect("socket should stay open")
    }

    fn text_json(message: Message) -> Value {
        match message {
            Message::Text(text) => serde_json::from_str(text.as_str()).expect("reply should be json"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn notification_frames_produce_no_reply() {
        let shared = shared(10).await;
        let (client_tx, mut client_rx, task) = connect(&shared);

        client_tx
            .unbounded_send(Ok(Message::Binary(Bytes::from_static(
                br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            ))))
            .expect("send should succeed");
        client_tx
            .unbounded_send(Ok(Message::Text(
                r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#.into(),
            )))
            .expect("send should succeed");

        let reply = text_json(next_message(&mut client_rx).await);
        assert_eq!(reply["id"], 2);
        assert_eq!(reply["result"], serde_json::json!({}));

        client_tx
            .unbounded_send(Ok(Message::Close(None)))
            .expect("send should succeed");
        task.await.expect("connection task should finish");
        assert!(shared.connections.is_empty().await);
    }

    #[tokio::test]
    async fn replies_follow_arrival_order() {
        let shared = shared(10).await;
        let (client_tx, mut client_rx, task) = connect(&shared);

        for id in 1..=3 {
            client_tx
                .unbounded_send(Ok(Message::Text(
                    format!(r#"{{"jsonrpc":"2.0","id":{id},"method":"ping"}}"#).into(),
                )))
                .expect("send should succeed");
        }

        for id in 1..=3 {
            assert_eq!(text_json(next_message(&mut client_rx).await)["id"], id);
        }

        drop(client_tx);
        task.await.expect("connection task should finish");
    }

    #[tokio::test]
    async fn invalid_utf8_binary_frame_is_a_parse_error() {
        let shared = shared(10).await;
        let (client_tx, mut client_rx, task) = connect(&shared);

        client_tx
            .unbounded_send(Ok(Message::Binary(Bytes::from_static(&[0xff, 0xfe, 0x00]))))
            .expect("send should succeed");

        let reply = text_json(next_message(&mut client_rx).await);
        assert_eq!(reply["error"]["code"], -32700);
        assert_eq!(reply["id"], Value::Null);

        drop(client_tx);
        task.await.expect("connection task should finish");
    }

    #[tokio::test]
    async fn socket_over_capacity_is_closed_with_try_again() {
        let shared = shared(1).await;
        let (placeholder, _placeholder_rx) = mpsc::channel(1);
        shared
            .connections
            .try_insert("existing".to_string(), placeholder)
            .await
            .expect("admit");

        let (_client_tx, mut client_rx, task) = connect(&shared);

        match next_message(&mut client_rx).await {
            Message::Close(Some(frame)) => assert_eq!(frame.code, close_code::AGAIN),
            other => panic!("expected close frame, got {other:?}"),
        }
        task.await.expect("connection task should finish");
        assert_eq!(shared.connections.len().await, 1);
    }

    #[tokio::test]
    async fn stop_closes_open_sockets() {
        let mut config = TransportConfig::new(([127, 0, 0, 1], 0).into());
        config.max_connections = 10;
        let transport =
            WebSocketTransport::new(config, crate::build_processor(Arc::new(ToolRegistry::default())));
        transport.start().await.expect("transport should start");
        let addr = transport.local_addr().await.expect("bound address");

        let (mut socket, mut received) = open_raw(
            addr,
            "GET /ws HTTP/1.1\r\n\
             Host: localhost\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            b"\r\n\r\n",
        )
        .await;
        assert!(received.starts_with(b"HTTP/1.1 101"));

        for _ in 0..100 {
            if transport.active_connections().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.active_connections().await, 1);

        transport.stop().await;
        transport.stop().await;

        read_to_close(&mut socket, &mut received).await;
        let header_end = received
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .expect("handshake response")
            + 4;
        let frames = &received[header_end..];
        assert!(frames.len() >= 4, "expected a close frame");
        assert_eq!(frames[0], 0x88);
        assert_eq!(u16::from_be_bytes([frames[2], frames[3]]), close_code::AWAY);

        assert!(transport.shared.connections.is_empty().await);
        assert!(!transport.is_running().await);
    }

    #[tokio::test]
    async fn ping_round_reaches_live_sockets_and_evicts_dead_ones() {
        let shared = shared(10).await;

        let (live_tx, mut live_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (dead_tx, dead_rx) = mpsc::channel(OUTBOUND_BUFFER);
        drop(dead_rx);
        shared
            .connections
            .try_insert("live".to_string(), live_tx)
            .await
            .expect("admit");
        shared
            .connections
            .try_insert("dead".to_string(), dead_tx)
            .await
            .expect("admit");

        ping_connections(Arc::clone(&shared), Duration::from_secs(60)).await;

        assert!(matches!(live_rx.try_recv(), Ok(Message::Ping(_))));
        assert!(shared.connections.contains("live").await);
        assert!(!shared.connections.contains("dead").await);
    }
}
