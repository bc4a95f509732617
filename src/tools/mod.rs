//! Tool contract, execution request/result model, and the registry
//!
//! Concrete tools live outside this crate and plug in through the [`Tool`] trait;
//! the registry owns them by name and runs them under a deadline.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub mod echo;
pub mod registry;
pub mod validation;

pub use registry::ToolRegistry;
pub use validation::{validate_against_schema, FieldError, ValidationResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub request_id: String,
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// When present, only tools named here (or `*`) may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            working_directory: std::env::current_dir().unwrap_or_default(),
            session_id: None,
            user_id: None,
            permissions: None,
        }
    }
}

impl ExecutionContext {
    pub fn allows(&self, tool_name: &str) -> bool {
        match &self.permissions {
            None => true,
            Some(granted) => granted
                .iter()
                .any(|permission| permission == "*" || permission == tool_name),
        }
    }
}

/// Advisory only; the registry does not reorder work by priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone)]
pub struct ToolExecutionRequest {
    pub tool_name: String,
    pub parameters: Map<String, Value>,
    pub execution_context: ExecutionContext,
    pub timeout: Option<Duration>,
    pub priority: Priority,
}

impl ToolExecutionRequest {
    pub fn new(tool_name: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            execution_context: ExecutionContext::default(),
            timeout: None,
            priority: Priority::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_context(mut self, execution_context: ExecutionContext) -> Self {
        self.execution_context = execution_context;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolErrorCode {
    ToolNotFound,
    ToolUnavailable,
    PermissionDenied,
    InvalidParameters,
    ExecutionTimeout,
    ExecutionError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionError {
    pub code: ToolErrorCode,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_ms: Option<f64>,
    #[serde(default)]
    pub io_operations: u64,
    #[serde(default)]
    pub cache_hit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolExecutionError>,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
    #[serde(default)]
    pub resources_used: Vec<String>,
}

impl ToolExecutionResult {
    pub fn success(content: Value) -> Self {
        Self {
            success: true,
            content: Some(content),
            error: None,
            metadata: ExecutionMetadata::default(),
            resources_used: Vec::new(),
        }
    }

    pub fn failure(code: ToolErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            success: false,
            content: None,
            error: Some(ToolExecutionError {
                code,
                message: message.into(),
                details,
            }),
            metadata: ExecutionMetadata::default(),
            resources_used: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Tools may report themselves busy or disabled; the registry trusts this.
    fn is_available(&self) -> bool {
        true
    }

    fn validate_parameters(&self, parameters: &Map<String, Value>) -> ValidationResult {
        validate_against_schema(&self.definition().parameters, parameters)
    }

    async fn execute(&self, request: ToolExecutionRequest)
        -> Result<ToolExecutionResult, ToolError>;

    /// Invoked once when the registry unregisters the tool.
    async fn cleanup(&self) {}
}
