//! Tool dispatch router.
//!
//! Turns a model response into an ordered set of [`ToolCall`]s, validates
//! them against the registry, and runs them concurrently. Every failure mode
//! short of an internal panic becomes a [`ToolResult`] with `is_error` set,
//! because the model is the consumer of these outcomes and can recover from
//! them.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::llm::CompletionResponse;
use crate::tools::parser;
use crate::tools::registry::ToolRegistry;
use crate::tools::schema;
use crate::tools::tool::{CallContext, ToolError};

/// A validated-shape tool invocation, ordered within its round.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Call id, echoed back on the result. Synthesized for inline calls.
    pub id: String,
    /// Position within the round; results are reassembled in this order.
    pub index: usize,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Outcome of one tool call, success or failure alike.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    /// Tool output, or the error message when `is_error` is set.
    pub content: String,
    pub is_error: bool,
    pub index: usize,
}

impl ToolResult {
    fn error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: message.into(),
            is_error: true,
            index: call.index,
        }
    }
}

/// A call that cannot be dispatched as written.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unknown tool '{name}'")]
    UnknownTool { name: String },

    #[error("invalid arguments for '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },
}

/// Routes tool calls from model responses to registered tools.
pub struct ToolRouter {
    registry: Arc<ToolRegistry>,
}

impl ToolRouter {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Collect the calls a response asks for.
    ///
    /// Structured `tool_calls` from the API come first, then intents parsed
    /// out of the assistant text. Malformed inline blocks are returned as
    /// ready-made error results so the model sees what went wrong.
    pub fn collect_calls(&self, response: &CompletionResponse) -> (Vec<ToolCall>, Vec<ToolResult>) {
        let mut calls = Vec::new();
        let mut failures = Vec::new();

        for request in &response.tool_calls {
            calls.push(ToolCall {
                id: request.id.clone(),
                index: calls.len(),
                name: request.name.clone(),
                arguments: request.arguments.clone(),
            });
        }

        let extracted = parser::extract_calls(&response.content);
        for raw in extracted.calls {
            calls.push(ToolCall {
                id: format!("inline_{}", calls.len()),
                index: calls.len(),
                name: raw.name,
                arguments: raw.arguments,
            });
        }
        for (i, reason) in extracted.malformed.into_iter().enumerate() {
            let index = calls.len() + i;
            failures.push(ToolResult {
                call_id: format!("malformed_{index}"),
                name: "tool_call".to_string(),
                content: reason,
                is_error: true,
                index,
            });
        }

        (calls, failures)
    }

    /// Check a call's name and argument shape against the registry.
    pub fn validate(&self, call: &ToolCall) -> Result<(), ValidationError> {
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| ValidationError::UnknownTool {
                name: call.name.clone(),
            })?;

        schema::check_args(&tool.parameters_schema(), &call.arguments).map_err(|reason| {
            ValidationError::InvalidArguments {
                name: call.name.clone(),
                reason,
            }
        })
    }

    /// Dispatch a batch of calls concurrently and return results in call
    /// order, regardless of completion order.
    ///
    /// Validation failures and tool errors come back as error results; only
    /// the surrounding orchestration decides whether any of them ends the
    /// turn.
    pub async fn dispatch_all(&self, calls: Vec<ToolCall>, ctx: &CallContext) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        let mut handles = Vec::new();

        for call in calls {
            if let Err(e) = self.validate(&call) {
                debug!(call_id = %call.id, tool = %call.name, error = %e, "Rejected tool call");
                results.push(ToolResult::error(&call, e.to_string()));
                continue;
            }
            let Some(tool) = self.registry.get(&call.name).map(Arc::clone) else {
                // Unreachable after validate(), but keep it a data error.
                results.push(ToolResult::error(&call, format!("unknown tool '{}'", call.name)));
                continue;
            };
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                let outcome = tool.execute(call.arguments.clone(), &ctx).await;
                (call, outcome)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((call, Ok(output))) => {
                    let content = match output.result {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    results.push(ToolResult {
                        call_id: call.id,
                        name: call.name,
                        content,
                        is_error: false,
                        index: call.index,
                    });
                }
                Ok((call, Err(e))) => {
                    debug!(call_id = %call.id, tool = %call.name, error = %e, "Tool call failed");
                    results.push(ToolResult::error(&call, format_tool_error(&e)));
                }
                Err(e) => {
                    warn!(error = %e, "Tool task panicked");
                    // The call moved into the task; all we can do is note it.
                    results.push(ToolResult {
                        call_id: String::new(),
                        name: String::new(),
                        content: format!("tool task failed: {e}"),
                        is_error: true,
                        index: usize::MAX,
                    });
                }
            }
        }

        results.sort_by_key(|r| r.index);
        results
    }
}

fn format_tool_error(err: &ToolError) -> String {
    match err {
        ToolError::Timeout(d) => format!("tool timed out after {d:?}"),
        ToolError::Cancelled => "tool call cancelled".to_string(),
        other => other.to_string(),
    }
}
