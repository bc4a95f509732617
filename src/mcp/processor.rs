//! Transport-agnostic JSON-RPC 2.0 processor
//!
//! Turns raw payload bytes into zero or more responses: decodes and validates the
//! envelope, expands batches, dispatches to registered method handlers and encodes
//! the outcome. The only state kept across calls is the method table.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::errors::panic_message;
use crate::mcp::audit::redact_audit_params;
use crate::mcp::rpc::{encode, parse_request, RpcError, RpcRequest, RpcResponse};

pub type HandlerResult = Result<Value, HandlerError>;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Passed through to the caller unchanged.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// Reported to the caller as a tool execution error.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Uniform async contract for every registered method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>) -> HandlerResult {
        (self)(params).await
    }
}

#[derive(Default)]
pub struct JsonRpcProcessor {
    methods: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
}

impl JsonRpcProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_method<H>(&self, name: impl Into<String>, handler: H)
    where
        H: MethodHandler + 'static,
    {
        let name = name.into();
        let previous = self
            .methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::new(handler));

        if previous.is_some() {
            warn!(method = %name, "replaced existing method handler");
        } else {
            debug!(method = %name, "registered method handler");
        }
    }

    pub fn unregister_method(&self, name: &str) -> bool {
        self.methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names = self
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Processes one wire message (single object or batch).
    ///
    /// Returns the encoded reply, or an empty string when nothing must be sent back.
    pub async fn process_message(&self, payload: &[u8]) -> String {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(err) => {
                debug!(error = %err, "payload is not valid utf-8");
                return encode(&RpcResponse::error(None, RpcError::parse_error(err.to_string())));
            }
        };

        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "payload is not valid json");
                return encode(&RpcResponse::error(None, RpcError::parse_error(err.to_string())));
            }
        };

        match value {
            Value::Array(items) => {
                if items.is_empty() {
                    return encode(&RpcResponse::error(
                        None,
                        RpcError::invalid_request("batch must not be empty"),
                    ));
                }

                let mut responses = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(response) = self.process_value(item).await {
                        responses.push(response);
                    }
                }

                if responses.is_empty() {
                    String::new()
                } else {
                    encode(&responses)
                }
            }
            single => self
                .process_value(single)
                .await
                .map(|response| encode(&response))
                .unwrap_or_default(),
        }
    }

    pub async fn process_value(&self, value: Value) -> Option<RpcResponse> {
        match parse_request(value) {
            Ok(request) => self.handle_request(request).await,
            Err(response) => Some(response),
        }
    }

    pub async fn handle_request(&self, request: RpcRequest) -> Option<RpcResponse> {
        let RpcRequest {
            method, params, id, ..
        } = request;

        let handler = self
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&method)
            .cloned();

        let Some(handler) = handler else {
            return match id {
                Some(id) => Some(RpcResponse::error(
                    Some(id),
                    RpcError::method_not_found(&method),
                )),
                None => {
                    debug!(method = %method, "dropping notification for unknown method");
                    None
                }
            };
        };

        let audit_params = redact_audit_params(params.as_ref());
        let outcome = AssertUnwindSafe(handler.handle(params))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(HandlerError::Rpc(err))) => Err(err),
            Ok(Err(HandlerError::Failed(message))) => {
                Err(RpcError::tool_execution_error(message))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(method = %method, panic = %message, "method handler panicked");
                Err(RpcError::internal_error(message))
            }
        };

        info!(
            method = %method,
            params = %audit_params,
            notification = id.is_none(),
            outcome = if result.is_ok() { "success" } else { "failure" },
            "mcp action audited"
        );

        match (id, result) {
            (Some(id), Ok(value)) => Some(RpcResponse::success(id, value)),
            (Some(id), Err(err)) => Some(RpcResponse::error(Some(id), err)),
            (None, Ok(_)) => None,
            (None, Err(err)) => {
                warn!(method = %method, error = %err, "notification handler failed");
                None
            }
        }
    }
}
