//! JSON-RPC 2.0 envelope representations and error constructors
//!
//! Provides the request/response shapes shared by every transport, the standard
//! error codes, and the tool-domain codes in the -32000 range.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

pub const TOOL_NOT_FOUND: i64 = -32001;
pub const TOOL_EXECUTION_ERROR: i64 = -32002;
pub const PERMISSION_DENIED: i64 = -32003;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

impl RequestId {
    /// Extracts an id from a raw value, ignoring anything that is not a string or integer.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(id) => Some(Self::String(id.clone())),
            Value::Number(number) => number.as_i64().map(Self::Integer),
            _ => None,
        }
    }
}

impl From<RequestId> for Value {
    fn from(id: RequestId) -> Self {
        match id {
            RequestId::Integer(value) => Value::Number(value.into()),
            RequestId::String(value) => Value::String(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err("jsonrpc must be \"2.0\"");
        }

        if self.method.trim().is_empty() {
            return Err("method must not be empty");
        }

        match &self.params {
            None | Some(Value::Object(_)) | Some(Value::Array(_)) => Ok(()),
            Some(_) => Err("params must be an object or an array"),
        }
    }
}

/// Validates one batch element or single message into a request.
///
/// On failure the returned response carries whatever id could be recovered.
pub fn parse_request(value: Value) -> Result<RpcRequest, RpcResponse> {
    let recovered_id = value.get("id").and_then(RequestId::from_value);

    if !value.is_object() {
        return Err(RpcResponse::error(
            None,
            RpcError::invalid_request("request must be a JSON object"),
        ));
    }

    let request: RpcRequest = serde_json::from_value(value).map_err(|err| {
        RpcResponse::error(
            recovered_id.clone(),
            RpcError::invalid_request(err.to_string()),
        )
    })?;

    request.validate().map_err(|reason| {
        RpcResponse::error(recovered_id, RpcError::invalid_request(reason))
    })?;

    Ok(request)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("json-rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, "Parse error", Some(json!({ "details": detail.into() })))
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(
            INVALID_REQUEST,
            "Invalid Request",
            Some(json!({ "details": detail.into() })),
        )
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            METHOD_NOT_FOUND,
            "Method not found",
            Some(json!({ "method": method })),
        )
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(
            INVALID_PARAMS,
            "Invalid params",
            Some(json!({ "details": detail.into() })),
        )
    }

    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self::new(
            INTERNAL_ERROR,
            "Internal error",
            Some(json!({ "details": detail.into() })),
        )
    }

    pub fn tool_execution_error(detail: impl Into<String>) -> Self {
        Self::new(
            TOOL_EXECUTION_ERROR,
            "Tool execution error",
            Some(json!({ "details": detail.into() })),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<RequestId>,
}

impl RpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id: Some(id),
        }
    }

    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Serializes a response (or batch of responses) to wire text.
///
/// Falls back to a literal internal error if serialization itself fails.
pub fn encode<T: Serialize>(payload: &T) -> String {
    serde_json::to_string(payload).unwrap_or_else(|err| {
        tracing::error!(error = %err, "jsonrpc response serialization failed");
        format!(
            r#"{{"jsonrpc":"2.0","error":{{"code":{INTERNAL_ERROR},"message":"Internal error"}},"id":null}}"#
        )
    })
}
