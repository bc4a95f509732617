//! Tool registry and executor
//!
//! Holds tool instances keyed by name and runs them under a deadline. Every outcome,
//! expected or not, comes back as a [`ToolExecutionResult`]; nothing here panics or
//! propagates a tool's failure to the caller's task.

use std::{
    collections::{BTreeSet, HashMap},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::FutureExt;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::panic_message;
use crate::tools::{
    Tool, ToolDefinition, ToolError, ToolErrorCode, ToolExecutionRequest, ToolExecutionResult,
};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    definition: ToolDefinition,
    category: Option<String>,
}

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    default_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

impl ToolRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Registers a tool under its definition's name. An existing tool with the same
    /// name is replaced.
    pub async fn register_tool(&self, tool: Arc<dyn Tool>, category: Option<&str>) {
        let definition = tool.definition();
        let name = definition.name.clone();
        let entry = RegisteredTool {
            tool,
            definition,
            category: category.map(str::to_string),
        };

        let previous = self.tools.write().await.insert(name.clone(), entry);
        if previous.is_some() {
            warn!(tool = %name, "tool re-registered, previous definition replaced");
        } else {
            info!(tool = %name, category = category.unwrap_or("-"), "tool registered");
        }
    }

    /// Removes a tool and runs its cleanup hook. Returns false if it was not registered.
    pub async fn unregister_tool(&self, name: &str) -> bool {
        let removed = self.tools.write().await.remove(name);
        match removed {
            Some(entry) => {
                entry.tool.cleanup().await;
                info!(tool = %name, "tool unregistered");
                true
            }
            None => false,
        }
    }

    pub async fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .await
            .get(name)
            .map(|entry| Arc::clone(&entry.tool))
    }

    pub async fn list_tools(&self, category: Option<&str>) -> Vec<ToolDefinition> {
        let tools = self.tools.read().await;
        let mut definitions = tools
            .values()
            .filter(|entry| category.is_none() || entry.category.as_deref() == category)
            .map(|entry| entry.definition.clone())
            .collect::<Vec<_>>();
        definitions.sort_by(|left, right| left.name.cmp(&right.name));
        definitions
    }

    pub async fn list_categories(&self) -> Vec<String> {
        self.tools
            .read()
            .await
            .values()
            .filter_map(|entry| entry.category.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }

    /// Executes a tool call. Wall-clock time is stamped into the metadata of every
    /// result, including failures.
    pub async fn execute_tool(&self, request: ToolExecutionRequest) -> ToolExecutionResult {
        let tool_name = request.tool_name.clone();
        let request_id = request.execution_context.request_id.clone();
        let started_at = Instant::now();

        let mut result = self.run(request).await;
        let elapsed = started_at.elapsed();
        result.metadata.execution_time_ms = Some(elapsed.as_secs_f64() * 1000.0);

        debug!(
            tool = %tool_name,
            request_id = %request_id,
            success = result.success,
            error_code = ?result.error.as_ref().map(|error| error.code),
            duration_ms = elapsed.as_millis(),
            "tool execution finished"
        );

        result
    }

    async fn run(&self, request: ToolExecutionRequest) -> ToolExecutionResult {
        let tool_name = request.tool_name.clone();

        let Some(tool) = self.get_tool(&tool_name).await else {
            return ToolExecutionResult::failure(
                ToolErrorCode::ToolNotFound,
                format!("tool '{tool_name}' is not registered"),
                json!({ "tool_name": tool_name }),
            );
        };

        if !request.execution_context.allows(&tool_name) {
            return ToolExecutionResult::failure(
                ToolErrorCode::PermissionDenied,
                format!("request is not permitted to call tool '{tool_name}'"),
                json!({ "tool_name": tool_name }),
            );
        }

        if !tool.is_available() {
            return ToolExecutionResult::failure(
                ToolErrorCode::ToolUnavailable,
                format!("tool '{tool_name}' is currently unavailable"),
                json!({ "tool_name": tool_name }),
            );
        }

        if let Err(errors) = tool.validate_parameters(&request.parameters) {
            return ToolExecutionResult::failure(
                ToolErrorCode::InvalidParameters,
                format!("invalid parameters for tool '{tool_name}'"),
                json!({ "errors": errors }),
            );
        }

        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let execution = AssertUnwindSafe(tool.execute(request)).catch_unwind();

        // Dropping the timed-out future cancels the tool call at its next await point.
        match tokio::time::timeout(timeout, execution).await {
            Err(_) => {
                warn!(tool = %tool_name, timeout_ms = timeout.as_millis(), "tool execution timed out");
                ToolExecutionResult::failure(
                    ToolErrorCode::ExecutionTimeout,
                    format!("tool '{tool_name}' did not finish within {timeout:?}"),
                    json!({ "timeout_ms": timeout.as_millis() as u64 }),
                )
            }
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                warn!(tool = %tool_name, panic = %message, "tool execution panicked");
                ToolExecutionResult::failure(ToolErrorCode::ExecutionError, message, json!({}))
            }
            Ok(Ok(Err(ToolError::PermissionDenied(message)))) => ToolExecutionResult::failure(
                ToolErrorCode::PermissionDenied,
                message,
                json!({ "tool_name": tool_name }),
            ),
            Ok(Ok(Err(err))) => {
                warn!(tool = %tool_name, error = %err, "tool execution failed");
                ToolExecutionResult::failure(ToolErrorCode::ExecutionError, err.to_string(), json!({}))
            }
            Ok(Ok(Ok(result))) => result,
        }
    }
}
