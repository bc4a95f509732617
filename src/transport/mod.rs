//! Transport layer for the Model Context Protocol
//!
//! Three interchangeable transports (plain HTTP, SSE/streamable HTTP, WebSocket)
//! share one lifecycle contract and feed raw payloads into the JSON-RPC processor.

use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use axum::Router;
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::errors::TransportError;

pub mod connection;
pub mod cors;
pub mod http;
pub mod sse;
pub mod websocket;

pub use connection::{Connection, ConnectionTable, PingTask};
pub use cors::CorsPolicy;
pub use http::HttpTransport;
pub use sse::SseTransport;
pub use websocket::WebSocketTransport;

/// How long `stop()` waits for in-flight requests before aborting the server task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle contract shared by every transport.
///
/// `start` and `stop` are idempotent: calling either in the target state is a no-op.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<(), TransportError>;

    async fn stop(&self);

    async fn is_running(&self) -> bool;

    async fn local_addr(&self) -> Option<SocketAddr>;
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
    ping: Option<PingTask>,
}

/// Owns a transport's listening socket and background ping task.
pub(crate) struct Lifecycle {
    name: &'static str,
    bind: SocketAddr,
    running: Mutex<Option<RunningServer>>,
}

impl Lifecycle {
    pub(crate) fn new(name: &'static str, bind: SocketAddr) -> Self {
        Self {
            name,
            bind,
            running: Mutex::new(None),
        }
    }

    pub(crate) async fn start<F>(&self, router: Router, spawn_ping: F) -> Result<(), TransportError>
    where
        F: FnOnce() -> Option<PingTask>,
    {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!(transport = self.name, "start ignored, already running");
            return Ok(());
        }

        let listener = TcpListener::bind(self.bind)
            .await
            .map_err(|source| TransportError::Bind {
                addr: self.bind,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let name = self.name;
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(transport = name, error = %err, "server loop failed");
            }
        });

        *running = Some(RunningServer {
            local_addr,
            shutdown: shutdown_tx,
            server,
            ping: spawn_ping(),
        });

        info!(transport = self.name, local_addr = %local_addr, "transport started");
        Ok(())
    }

    /// Stops the ping task, closes tracked connections via `close_connections`, then
    /// shuts the listener down.
    pub(crate) async fn stop<F, Fut>(&self, close_connections: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = usize>,
    {
        let mut running = self.running.lock().await;
        let Some(server) = running.take() else {
            debug!(transport = self.name, "stop ignored, not running");
            return;
        };

        if let Some(ping) = server.ping {
            ping.shutdown().await;
        }

        let closed = close_connections().await;
        let _ = server.shutdown.send(());

        let mut handle = server.server;
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await.is_err() {
            warn!(transport = self.name, "graceful shutdown timed out, aborting server task");
            handle.abort();
        }

        info!(
            transport = self.name,
            closed_connections = closed,
            "transport stopped"
        );
    }

    pub(crate) async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub(crate) async fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|server| server.local_addr)
    }
}

/// Media type portion of a content-type style header value.
pub(crate) fn media_type(content_type: &str) -> &str {
    content_type.trim().split(';').next().unwrap_or("").trim()
}

pub(crate) fn is_json_content_type(content_type: &str) -> bool {
    media_type(content_type).eq_ignore_ascii_case("application/json")
}

/// True when any entry of an `Accept` header selects `text/event-stream`.
pub(crate) fn accepts_event_stream(accept: &str) -> bool {
    accept
        .split(',')
        .any(|entry| media_type(entry).eq_ignore_ascii_case("text/event-stream"))
}

/// Raw TCP clients for driving a started transport end to end.
#[cfg(test)]
pub(crate) mod test_support {
    use std::{net::SocketAddr, time::Duration};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    /// Writes `head` and reads until `marker` has been received.
    pub(crate) async fn open_raw(addr: SocketAddr, head: &str, marker: &[u8]) -> (TcpStream, Vec<u8>) {
        let mut socket = TcpStream::connect(addr).await.expect("connect should succeed");
        socket
            .write_all(head.as_bytes())
            .await
            .expect("request should be written");

        let mut received = Vec::new();
        while !contains(&received, marker) {
            assert!(
                read_chunk(&mut socket, &mut received).await,
                "connection closed before marker arrived"
            );
        }
        (socket, received)
    }

    /// Reads until the server closes the connection.
    pub(crate) async fn read_to_close(socket: &mut TcpStream, received: &mut Vec<u8>) {
        while read_chunk(socket, received).await {}
    }

    pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|window| window == needle)
    }

    async fn read_chunk(socket: &mut TcpStream, received: &mut Vec<u8>) -> bool {
        let mut buffer = [0_u8; 1024];
        let read = tokio::time::timeout(READ_TIMEOUT, socket.read(&mut buffer))
            .await
            .expect("server should answer or close in time")
            .expect("read should succeed");
        received.extend_from_slice(&buffer[..read]);
        read > 0
    }
}
