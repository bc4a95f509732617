use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{Tool, ToolDefinition, ToolError, ToolExecutionRequest, ToolExecutionResult};

/// Returns the supplied message unchanged. Used as the smoke-test tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "echo",
            "Echo the supplied message back to the caller",
            json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "Text to echo back"
                    }
                },
                "required": ["message"]
            }),
        )
    }

    async fn execute(
        &self,
        request: ToolExecutionRequest,
    ) -> Result<ToolExecutionResult, ToolError> {
        let message = request
            .parameters
            .get("message")
            .cloned()
            .unwrap_or(Value::Null);

        Ok(ToolExecutionResult::success(json!({ "message": message })))
    }
}
