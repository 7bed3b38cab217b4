//! Tool trait and types.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Error type for tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("External service error: {0}")]
    ExternalService(String),
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        ToolError::ExecutionFailed(err.to_string())
    }
}

/// How a tool executes, recorded on its spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Runs inside this process; no isolation needed.
    InProcess,
    /// Runs model-generated code in a session kernel.
    SandboxedCode,
    /// Calls out to an external service.
    Remote,
}

/// Per-call context threaded through tool execution.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Session on whose behalf the call runs.
    pub session_id: Uuid,
    /// Fires when the session's turn is cancelled.
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(session_id: Uuid, cancel: CancellationToken) -> Self {
        Self { session_id, cancel }
    }
}

/// Output from a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The result data.
    pub result: serde_json::Value,
    /// Time taken.
    pub duration: Duration,
}

impl ToolOutput {
    /// Create a successful output with a JSON result.
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    /// Create a text output.
    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
        }
    }
}

/// A tool's advertised surface: name, description, parameter schema, kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub kind: ToolKind,
}

/// Trait for tools that the agent can use.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name.
    fn name(&self) -> &str;

    /// Get a description of what the tool does.
    fn description(&self) -> &str;

    /// Get the JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// How this tool executes.
    fn kind(&self) -> ToolKind {
        ToolKind::InProcess
    }

    /// Execute the tool with the given parameters.
    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError>;

    /// Get the tool spec for model function calling.
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
            kind: self.kind(),
        }
    }
}
