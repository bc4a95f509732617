//! The MCP method set
//!
//! Registers the standard MCP methods (`initialize`, `ping`, `tools/list`,
//! `tools/call` and the client notifications) on a processor, bridging tool calls
//! into the registry and mapping executor failures onto JSON-RPC errors.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rust_mcp_sdk::schema::{
    Implementation, InitializeResult, ServerCapabilities, ServerCapabilitiesTools,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::mcp::processor::{HandlerResult, JsonRpcProcessor, MethodHandler};
use crate::mcp::rpc::{
    RpcError, INVALID_PARAMS, PERMISSION_DENIED, TOOL_EXECUTION_ERROR, TOOL_NOT_FOUND,
};
use crate::tools::{
    Priority, ToolErrorCode, ToolExecutionError, ToolExecutionRequest, ToolRegistry,
};

/// Newest first; unknown client versions are answered with the first entry.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];

pub fn register_mcp_methods(processor: &JsonRpcProcessor, registry: Arc<ToolRegistry>) {
    processor.register_method("initialize", initialize);
    processor.register_method("ping", ping);
    processor.register_method("notifications/initialized", acknowledge);
    processor.register_method("notifications/cancelled", acknowledge);
    processor.register_method(
        "tools/list",
        ListToolsHandler {
            registry: Arc::clone(&registry),
        },
    );
    processor.register_method("tools/call", CallToolHandler { registry });
}

async fn initialize(params: Option<Value>) -> HandlerResult {
    let protocol_version = negotiate_protocol_version(params.as_ref())?;

    let initialize_result = InitializeResult {
        server_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
            description: None,
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools {
                list_changed: Some(false),
            }),
            ..Default::default()
        },
        protocol_version: protocol_version.to_string(),
        instructions: None,
        meta: None,
    };

    serde_json::to_value(initialize_result)
        .map_err(|err| RpcError::internal_error(err.to_string()).into())
}

async fn ping(_params: Option<Value>) -> HandlerResult {
    Ok(json!({}))
}

async fn acknowledge(_params: Option<Value>) -> HandlerResult {
    Ok(Value::Null)
}

pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<&'static str, RpcError> {
    let offered_version = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| RpcError::invalid_params("initialize params.protocolVersion is required"))?;

    Ok(SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|supported| **supported == offered_version)
        .copied()
        .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0]))
}

#[derive(Debug, Default, Deserialize)]
struct ListToolsParams {
    #[serde(default)]
    category: Option<String>,
}

struct ListToolsHandler {
    registry: Arc<ToolRegistry>,
}

#[async_trait]
impl MethodHandler for ListToolsHandler {
    async fn handle(&self, params: Option<Value>) -> HandlerResult {
        let params: ListToolsParams = match params {
            Some(value) => serde_json::from_value(value)
                .map_err(|err| RpcError::invalid_params(err.to_string()))?,
            None => ListToolsParams::default(),
        };

        let tools = self
            .registry
            .list_tools(params.category.as_deref())
            .await
            .into_iter()
            .map(|definition| {
                json!({
                    "name": definition.name,
                    "description": definition.description,
                    "inputSchema": definition.parameters,
                })
            })
            .collect::<Vec<_>>();

        Ok(json!({ "tools": tools }))
    }
}

#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    #[serde(alias = "name")]
    pub tool_name: String,
    #[serde(default, alias = "parameters")]
    pub arguments: Map<String, Value>,
    /// Per-call deadline override in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub priority: Priority,
}

struct CallToolHandler {
    registry: Arc<ToolRegistry>,
}

#[async_trait]
impl MethodHandler for CallToolHandler {
    async fn handle(&self, params: Option<Value>) -> HandlerResult {
        let Some(raw_params) = params else {
            return Err(RpcError::invalid_params("tools/call requires params").into());
        };

        let call: ToolCallParams = serde_json::from_value(raw_params)
            .map_err(|err| RpcError::invalid_params(err.to_string()))?;

        let mut request =
            ToolExecutionRequest::new(call.tool_name, call.arguments).with_priority(call.priority);
        if let Some(seconds) = call.timeout {
            let timeout = Duration::try_from_secs_f64(seconds)
                .ok()
                .filter(|timeout| !timeout.is_zero())
                .ok_or_else(|| RpcError::invalid_params("timeout must be a positive number of seconds"))?;
            request = request.with_timeout(timeout);
        }

        let result = self.registry.execute_tool(request).await;
        if let Some(error) = result.error.as_ref().filter(|_| !result.success) {
            return Err(tool_error_to_rpc(error).into());
        }

        serde_json::to_value(&result).map_err(|err| RpcError::internal_error(err.to_string()).into())
    }
}

pub fn tool_error_to_rpc(error: &ToolExecutionError) -> RpcError {
    let (code, message) = match error.code {
        ToolErrorCode::ToolNotFound => (TOOL_NOT_FOUND, "Tool not found"),
        ToolErrorCode::PermissionDenied => (PERMISSION_DENIED, "Permission denied"),
        ToolErrorCode::InvalidParameters => (INVALID_PARAMS, "Invalid params"),
        ToolErrorCode::ToolUnavailable
        | ToolErrorCode::ExecutionTimeout
        | ToolErrorCode::ExecutionError => (TOOL_EXECUTION_ERROR, "Tool execution error"),
    };

    RpcError::new(
        code,
        message,
        Some(json!({
            "code": error.code,
            "message": error.message,
            "details": error.details,
        })),
    )
}
