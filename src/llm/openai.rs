//! OpenAI-compatible chat completions client.
//!
//! Works against any endpoint that implements the standard chat completions
//! API with function calling, streaming included.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::ModelSettings;
use crate::llm::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmError, ModelClient, Role,
    StreamEvent, ToolCallRequest, ToolDefinition,
};

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct OpenAiClient {
    client: Client,
    settings: ModelSettings,
}

impl OpenAiClient {
    pub fn new(settings: ModelSettings) -> Self {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, settings }
    }

    fn api_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn build_body(&self, req: CompletionRequest, stream: bool) -> ChatCompletionRequest {
        let messages = req.messages.into_iter().map(Into::into).collect();
        let tools: Vec<ChatCompletionTool> = req.tools.into_iter().map(Into::into).collect();
        ChatCompletionRequest {
            model: self.settings.model.clone(),
            messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            tools: if tools.is_empty() { None } else { Some(tools) },
            stream,
        }
    }

    async fn send(&self, body: &ChatCompletionRequest) -> Result<reqwest::Response, LlmError> {
        let mut request = self
            .client
            .post(self.api_url())
            .header("Content-Type", "application/json");
        if let Some(key) = &self.settings.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 => LlmError::AuthFailed,
                429 => LlmError::RateLimited,
                _ => LlmError::RequestFailed {
                    reason: format!("HTTP {status}: {text}"),
                },
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = self.build_body(req, false);
        let response = self.send(&body).await?;
        let text = response.text().await.unwrap_or_default();

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                reason: format!("JSON parse error: {e}"),
            })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                reason: "no choices in response".to_string(),
            })?;

        let (content, raw_calls) = match choice.message {
            Some(msg) => (
                msg.content.unwrap_or_default(),
                msg.tool_calls.unwrap_or_default(),
            ),
            None => (String::new(), Vec::new()),
        };

        let tool_calls: Vec<ToolCallRequest> = raw_calls
            .into_iter()
            .map(|tc| ToolCallRequest {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::Object(Default::default())),
            })
            .collect();

        let finish_reason = fold_finish_reason(choice.finish_reason.as_deref(), &tool_calls);

        Ok(CompletionResponse {
            content,
            tool_calls,
            finish_reason,
        })
    }

    async fn complete_streaming(
        &self,
        req: CompletionRequest,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, LlmError>>, LlmError> {
        let body = self.build_body(req, true);
        let response = self.send(&body).await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            let mut assembler = ToolCallAssembler::default();
            let mut finish = FinishReason::Unknown;

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(LlmError::Stream {
                                reason: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    if data == "[DONE]" {
                        for call in assembler.take() {
                            let _ = tx.send(Ok(StreamEvent::ToolCall(call))).await;
                        }
                        let _ = tx.send(Ok(StreamEvent::Done(finish))).await;
                        return;
                    }

                    let parsed: StreamResponse = match serde_json::from_str(data) {
                        Ok(p) => p,
                        Err(e) => {
                            let _ = tx
                                .send(Err(LlmError::Stream {
                                    reason: format!("bad stream frame: {e}"),
                                }))
                                .await;
                            return;
                        }
                    };

                    for choice in parsed.choices {
                        if let Some(fr) = choice.finish_reason.as_deref() {
                            finish = fold_finish_reason(Some(fr), &[]);
                        }
                        let Some(delta) = choice.delta else { continue };
                        if let Some(text) = delta.content {
                            if !text.is_empty() {
                                let _ = tx.send(Ok(StreamEvent::Delta(text))).await;
                            }
                        }
                        for fragment in delta.tool_calls.unwrap_or_default() {
                            assembler.push(fragment);
                        }
                    }
                }
            }

            // Stream ended without a [DONE] sentinel; flush what we have.
            for call in assembler.take() {
                let _ = tx.send(Ok(StreamEvent::ToolCall(call))).await;
            }
            let _ = tx.send(Ok(StreamEvent::Done(finish))).await;
        });

        Ok(rx)
    }

    fn model_name(&self) -> &str {
        &self.settings.model
    }
}

/// Accumulates streamed tool-call fragments keyed by choice index.
#[derive(Default)]
struct ToolCallAssembler {
    partial: Vec<PartialCall>,
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAssembler {
    fn push(&mut self, fragment: StreamToolCall) {
        let index = fragment.index.unwrap_or(self.partial.len());
        while self.partial.len() <= index {
            self.partial.push(PartialCall::default());
        }
        let slot = &mut self.partial[index];
        if let Some(id) = fragment.id {
            slot.id = id;
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name {
                slot.name.push_str(&name);
            }
            if let Some(args) = function.arguments {
                slot.arguments.push_str(&args);
            }
        }
    }

    fn take(&mut self) -> Vec<ToolCallRequest> {
        std::mem::take(&mut self.partial)
            .into_iter()
            .enumerate()
            .filter(|(_, p)| !p.name.is_empty())
            .map(|(i, p)| ToolCallRequest {
                id: if p.id.is_empty() {
                    format!("call_{i}")
                } else {
                    p.id
                },
                name: p.name,
                arguments: serde_json::from_str(&p.arguments)
                    .unwrap_or(serde_json::Value::Object(Default::default())),
            })
            .collect()
    }
}

fn fold_finish_reason(raw: Option<&str>, tool_calls: &[ToolCallRequest]) -> FinishReason {
    let fr = raw.unwrap_or("");
    if fr.contains("tool_calls") || fr.contains("function_call") || !tool_calls.is_empty() {
        FinishReason::ToolUse
    } else if fr.contains("stop") {
        FinishReason::Stop
    } else if fr.contains("length") {
        FinishReason::Length
    } else if fr.contains("content_filter") {
        FinishReason::ContentFilter
    } else {
        FinishReason::Unknown
    }
}

// Wire types for the chat completions API.

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatCompletionMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatCompletionTool>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatCompletionMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatCompletionToolCall>>,
}

impl From<ChatMessage> for ChatCompletionMessage {
    fn from(msg: ChatMessage) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let tool_calls = msg.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|tc| ChatCompletionToolCall {
                    id: tc.id,
                    call_type: "function".to_string(),
                    function: ChatCompletionToolCallFunction {
                        name: tc.name,
                        arguments: tc.arguments.to_string(),
                    },
                })
                .collect()
        });
        Self {
            role: role.to_string(),
            content: Some(msg.content),
            tool_call_id: msg.tool_call_id,
            name: msg.name,
            tool_calls,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: ChatCompletionToolCallFunction,
}

#[derive(Debug, Serialize)]
struct ChatCompletionToolCallFunction {
    name: String,
    /// JSON-encoded string, per the wire format.
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ChatCompletionFunction,
}

impl From<ToolDefinition> for ChatCompletionTool {
    fn from(def: ToolDefinition) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: ChatCompletionFunction {
                name: def.name,
                description: Some(def.description),
                parameters: Some(def.parameters),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: Option<ChatCompletionResponseMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseToolCallFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamToolCallFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallFunction {
    name: Option<String>,
    arguments: Option<String>,
}
