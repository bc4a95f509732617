use std::sync::Arc;

use mcp_tool_server::{
    build_processor, build_transport,
    config::Config,
    logging,
    tools::{echo::EchoTool, ToolRegistry},
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let transport_config = config.transport_config()?;

    let registry = Arc::new(ToolRegistry::new(config.tool_timeout));
    registry.register_tool(Arc::new(EchoTool), Some("utility")).await;

    let processor = build_processor(Arc::clone(&registry));
    let transport = build_transport(config.transport, transport_config, processor);

    info!(
        transport = transport.name(),
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        "server starting"
    );
    transport.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    transport.stop().await;

    Ok(())
}
