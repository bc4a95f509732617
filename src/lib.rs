use std::sync::Arc;

pub mod config;
pub mod errors;
pub mod logging;
pub mod mcp;
pub mod tools;
pub mod transport;

use config::{TransportConfig, TransportKind};
use mcp::JsonRpcProcessor;
use tools::ToolRegistry;
use transport::{HttpTransport, SseTransport, Transport, WebSocketTransport};

/// Creates a processor with the MCP method set bound to `registry`.
pub fn build_processor(registry: Arc<ToolRegistry>) -> Arc<JsonRpcProcessor> {
    let processor = JsonRpcProcessor::new();
    mcp::server::register_mcp_methods(&processor, registry);
    Arc::new(processor)
}

pub fn build_transport(
    kind: TransportKind,
    config: TransportConfig,
    processor: Arc<JsonRpcProcessor>,
) -> Box<dyn Transport> {
    match kind {
        TransportKind::Http => Box::new(HttpTransport::new(config, processor)),
        TransportKind::Sse => Box::new(SseTransport::new(config, processor)),
        TransportKind::WebSocket => Box::new(WebSocketTransport::new(config, processor)),
    }
}
