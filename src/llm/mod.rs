//! Model client seam.
//!
//! The orchestrator talks to the model through [`ModelClient`], an opaque
//! dependency: network, auth, and provider quirks stay behind it. The bundled
//! [`OpenAiClient`] speaks any OpenAI-compatible chat completions endpoint;
//! tests use scripted fakes.

mod openai;

pub use openai::OpenAiClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One message in the context replayed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Set on tool-result messages: which call this answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name, on tool-result messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Set on assistant messages that invoked tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tools(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls: if calls.is_empty() { None } else { Some(calls) },
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            name: Some(name.into()),
            ..Self::plain(Role::Tool, content)
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: None,
        }
    }
}

/// A tool surface advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: serde_json::Value,
}

/// One completion request: the full replayed context plus the toolset.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
    Unknown,
}

/// A full (non-streaming) model response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: FinishReason,
}

/// Incremental events from a streaming completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A fragment of assistant text.
    Delta(String),
    /// A fully accumulated tool call (fragments are assembled client-side).
    ToolCall(ToolCallRequest),
    /// End of the response.
    Done(FinishReason),
}

/// Errors from the model client.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("model request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("authentication failed")]
    AuthFailed,

    #[error("rate limited")]
    RateLimited,

    #[error("invalid response from model: {reason}")]
    InvalidResponse { reason: String },

    #[error("stream error: {reason}")]
    Stream { reason: String },
}

/// The model client contract.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Streaming variant. The default adapter falls back to
    /// [`complete`](Self::complete) and replays it as a single delta, so
    /// simple clients only implement one method.
    async fn complete_streaming(
        &self,
        req: CompletionRequest,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, LlmError>>, LlmError> {
        let response = self.complete(req).await?;
        let (tx, rx) = mpsc::channel(8);
        if !response.content.is_empty() {
            let _ = tx.send(Ok(StreamEvent::Delta(response.content))).await;
        }
        for call in response.tool_calls {
            let _ = tx.send(Ok(StreamEvent::ToolCall(call))).await;
        }
        let _ = tx.send(Ok(StreamEvent::Done(response.finish_reason))).await;
        Ok(rx)
    }

    fn model_name(&self) -> &str;
}
