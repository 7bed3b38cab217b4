//! Trivial in-process tools.
//!
//! Used by tests and as a template for registering non-code tools.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::tools::tool::{CallContext, Tool, ToolError, ToolOutput};

/// Echoes back the input message.
#[derive(Debug)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the input message. Useful for testing."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo back"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let message = params
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ToolError::InvalidParameters("missing 'message' parameter".to_string())
            })?;

        Ok(ToolOutput::text(message, Duration::from_millis(1)))
    }
}

/// Reports the current UTC time.
#[derive(Debug)]
pub struct TimeTool;

#[async_trait]
impl Tool for TimeTool {
    fn name(&self) -> &str {
        "time"
    }

    fn description(&self) -> &str {
        "Returns the current UTC date and time in RFC 3339 format."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
        _ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let now = chrono::Utc::now().to_rfc3339();
        Ok(ToolOutput::text(now, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx() -> CallContext {
        CallContext::new(Uuid::new_v4(), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_echo_tool() {
        let tool = EchoTool;

        let result = tool
            .execute(serde_json::json!({"message": "hello"}), &ctx())
            .await
            .unwrap();

        assert_eq!(result.result, serde_json::json!("hello"));
    }

    #[tokio::test]
    async fn test_echo_missing_message() {
        let tool = EchoTool;

        let err = tool.execute(serde_json::json!({}), &ctx()).await;
        assert!(matches!(err, Err(ToolError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_time_tool() {
        let tool = TimeTool;

        let result = tool.execute(serde_json::json!({}), &ctx()).await.unwrap();
        let text = result.result.as_str().unwrap();
        assert!(text.contains('T'));
    }
}
