//! Turn orchestrator.
//!
//! Drives one user turn through a bounded loop of model rounds. Each round
//! streams a model response, and either terminates with a final answer or
//! fans out the requested tool calls, folds the results back into the
//! history, and goes around again. Rounds within a session are strictly
//! sequential; the session lock is held for the whole turn.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::session::Turn;
use crate::agent::session_manager::SessionManager;
use crate::config::AgentSettings;
use crate::llm::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, ModelClient, StreamEvent,
    ToolCallRequest,
};
use crate::tools::{CallContext, ToolResult, ToolRouter};

/// Where a turn currently is in its round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnPhase {
    AwaitingModel,
    ModelResponded,
    DispatchingTools,
    ToolsResolved,
    Terminated,
}

/// Orchestration failures surfaced to the caller. Tool and execution
/// problems never land here; they go back to the model as data.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] LlmError),

    #[error("round limit of {limit} exceeded without a final answer")]
    RoundLimitExceeded { limit: usize },

    #[error("turn cancelled")]
    Cancelled,

    #[error("unknown session {0}")]
    UnknownSession(Uuid),
}

/// Progress events emitted while a turn runs, for interactive frontends.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A fragment of assistant text, in order.
    Delta(String),
    /// A tool call is about to run.
    ToolStarted { name: String, call_id: String },
    /// A tool call finished.
    ToolFinished { call_id: String, is_error: bool },
}

/// Drives turns for all sessions.
pub struct Orchestrator {
    sessions: Arc<SessionManager>,
    router: Arc<ToolRouter>,
    model: Arc<dyn ModelClient>,
    settings: AgentSettings,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        router: Arc<ToolRouter>,
        model: Arc<dyn ModelClient>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            sessions,
            router,
            model,
            settings,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Run one user turn to completion and return the final assistant text.
    pub async fn run_turn(&self, session_id: Uuid, text: &str) -> Result<String, AgentError> {
        self.run_turn_inner(session_id, text, None).await
    }

    /// Like [`run_turn`](Self::run_turn), but emits [`AgentEvent`]s as the
    /// turn progresses.
    pub async fn run_turn_with_events(
        &self,
        session_id: Uuid,
        text: &str,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<String, AgentError> {
        self.run_turn_inner(session_id, text, Some(&events)).await
    }

    async fn run_turn_inner(
        &self,
        session_id: Uuid,
        text: &str,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Result<String, AgentError> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or(AgentError::UnknownSession(session_id))?;
        let cancel = self.sessions.cancel_token(session_id).await;

        // Serializes rounds within the session for the whole turn.
        let mut session = session.lock().await;
        session.push_turn(Turn::user(text));

        let tools = self.router.registry().definitions();
        let mut phase = TurnPhase::AwaitingModel;

        for round in 0..self.settings.max_rounds {
            debug!(session_id = %session_id, round, ?phase, "Starting round");

            let request = CompletionRequest {
                messages: session.to_messages(&self.settings.system_prompt),
                tools: tools.clone(),
                temperature: None,
                max_tokens: None,
            };

            let response = self.stream_response(request, &cancel, events).await?;
            phase = TurnPhase::ModelResponded;
            debug!(session_id = %session_id, round, ?phase, "Model responded");

            let (calls, parse_failures) = self.router.collect_calls(&response);

            if calls.is_empty() && parse_failures.is_empty() {
                phase = TurnPhase::Terminated;
                debug!(session_id = %session_id, round, ?phase, "Turn complete");
                session.push_turn(Turn::assistant(response.content.clone(), Vec::new()));
                return Ok(response.content);
            }

            phase = TurnPhase::DispatchingTools;
            debug!(session_id = %session_id, round, ?phase, "Dispatching");
            let mut requested: Vec<ToolCallRequest> = calls
                .iter()
                .map(|c| ToolCallRequest {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    arguments: c.arguments.clone(),
                })
                .collect();
            // Parse failures get a call entry too, so their error results
            // answer a declared call id when the history is replayed.
            requested.extend(parse_failures.iter().map(|f| ToolCallRequest {
                id: f.call_id.clone(),
                name: f.name.clone(),
                arguments: serde_json::Value::Object(Default::default()),
            }));
            session.push_turn(Turn::assistant(response.content.clone(), requested));

            if let Some(tx) = events {
                for call in &calls {
                    let _ = tx
                        .send(AgentEvent::ToolStarted {
                            name: call.name.clone(),
                            call_id: call.id.clone(),
                        })
                        .await;
                }
            }

            info!(
                session_id = %session_id,
                round,
                calls = calls.len(),
                "Dispatching tool calls"
            );

            let ctx = CallContext::new(session_id, cancel.clone());
            let mut results = self.router.dispatch_all(calls, &ctx).await;

            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            results.extend(parse_failures);
            results.sort_by_key(|r| r.index);

            if let Some(tx) = events {
                for result in &results {
                    let _ = tx
                        .send(AgentEvent::ToolFinished {
                            call_id: result.call_id.clone(),
                            is_error: result.is_error,
                        })
                        .await;
                }
            }

            phase = TurnPhase::ToolsResolved;
            debug!(session_id = %session_id, round, ?phase, "Tool calls resolved");
            session.push_turn(Turn::tool_results(results));
            phase = TurnPhase::AwaitingModel;
        }

        // The final round's calls ran to completion and their results are in
        // the history; we just refuse to start another round.
        warn!(
            session_id = %session_id,
            limit = self.settings.max_rounds,
            "Round limit exceeded"
        );
        Err(AgentError::RoundLimitExceeded {
            limit: self.settings.max_rounds,
        })
    }

    /// Stream one model response to completion, accumulating deltas and
    /// tool-call fragments. Cancellation is honored between chunks.
    async fn stream_response(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Result<CompletionResponse, AgentError> {
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            rx = self.model.complete_streaming(request) => rx?,
        };

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut finish_reason = FinishReason::Unknown;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                event = rx.recv() => event,
            };
            let Some(event) = event else { break };

            match event? {
                StreamEvent::Delta(text) => {
                    if let Some(tx) = events {
                        let _ = tx.send(AgentEvent::Delta(text.clone())).await;
                    }
                    content.push_str(&text);
                }
                StreamEvent::ToolCall(call) => tool_calls.push(call),
                StreamEvent::Done(reason) => {
                    finish_reason = reason;
                    break;
                }
            }
        }

        Ok(CompletionResponse {
            content,
            tool_calls,
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelSettings, Settings};
    use crate::kernel::KernelPool;
    use crate::llm::Role;
    use crate::tools::builtin::EchoTool;
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Scripted model: pops one canned response per round.
    struct ScriptedModel {
        script: StdMutex<Vec<CompletionResponse>>,
    }

    impl ScriptedModel {
        fn new(mut responses: Vec<CompletionResponse>) -> Self {
            responses.reverse();
            Self {
                script: StdMutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn complete(&self, _req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.script
                .lock()
                .unwrap()
                .pop()
                .ok_or(LlmError::RequestFailed {
                    reason: "script exhausted".to_string(),
                })
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn final_answer(text: &str) -> CompletionResponse {
        CompletionResponse {
            content: text.to_string(),
            tool_calls: vec![],
            finish_reason: FinishReason::Stop,
        }
    }

    fn echo_call(id: &str, message: &str) -> CompletionResponse {
        CompletionResponse {
            content: String::new(),
            tool_calls: vec![ToolCallRequest {
                id: id.to_string(),
                name: "echo".to_string(),
                arguments: serde_json::json!({"message": message}),
            }],
            finish_reason: FinishReason::ToolUse,
        }
    }

    async fn orchestrator(
        responses: Vec<CompletionResponse>,
        max_rounds: usize,
    ) -> (Orchestrator, Uuid) {
        let pool = Arc::new(KernelPool::new(KernelSettings::default()));
        let sessions = Arc::new(SessionManager::new(pool));
        let session = sessions.create().await;
        let id = session.lock().await.id;

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let router = Arc::new(ToolRouter::new(Arc::new(registry)));

        let mut settings = Settings::default().agent;
        settings.max_rounds = max_rounds;

        let orch = Orchestrator::new(
            sessions,
            router,
            Arc::new(ScriptedModel::new(responses)),
            settings,
        );
        (orch, id)
    }

    #[tokio::test]
    async fn test_plain_answer_terminates_first_round() {
        let (orch, id) = orchestrator(vec![final_answer("hello there")], 4).await;

        let answer = orch.run_turn(id, "hi").await.unwrap();
        assert_eq!(answer, "hello there");

        let session = orch.sessions().get(id).await.unwrap();
        let session = session.lock().await;
        assert_eq!(session.turns.len(), 2);
        assert_eq!(session.turns[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let (orch, id) = orchestrator(
            vec![echo_call("call_1", "ping"), final_answer("it said ping")],
            4,
        )
        .await;

        let answer = orch.run_turn(id, "use echo").await.unwrap();
        assert_eq!(answer, "it said ping");

        let session = orch.sessions().get(id).await.unwrap();
        let session = session.lock().await;
        // user, assistant+call, tool results, assistant answer
        assert_eq!(session.turns.len(), 4);
        assert_eq!(session.turns[2].role, Role::Tool);
        assert_eq!(session.turns[2].tool_results[0].content, "ping");
        assert!(!session.turns[2].tool_results[0].is_error);
    }

    #[tokio::test]
    async fn test_round_limit_exceeded_keeps_results() {
        let (orch, id) = orchestrator(
            vec![echo_call("call_1", "a"), echo_call("call_2", "b")],
            2,
        )
        .await;

        let err = orch.run_turn(id, "loop forever").await.unwrap_err();
        assert!(matches!(err, AgentError::RoundLimitExceeded { limit: 2 }));

        // Final round's tool results still landed in the history.
        let session = orch.sessions().get(id).await.unwrap();
        let session = session.lock().await;
        assert_eq!(session.turns.last().unwrap().role, Role::Tool);
        assert_eq!(session.turns.last().unwrap().tool_results[0].content, "b");
    }

    #[tokio::test]
    async fn test_unknown_tool_folded_back_to_model() {
        let bad_call = CompletionResponse {
            content: String::new(),
            tool_calls: vec![ToolCallRequest {
                id: "call_1".to_string(),
                name: "no_such_tool".to_string(),
                arguments: serde_json::json!({}),
            }],
            finish_reason: FinishReason::ToolUse,
        };
        let (orch, id) = orchestrator(vec![bad_call, final_answer("recovered")], 4).await;

        let answer = orch.run_turn(id, "go").await.unwrap();
        assert_eq!(answer, "recovered");

        let session = orch.sessions().get(id).await.unwrap();
        let session = session.lock().await;
        let result = &session.turns[2].tool_results[0];
        assert!(result.is_error);
        assert!(result.content.contains("no_such_tool"));
    }

    #[tokio::test]
    async fn test_malformed_inline_call_answers_declared_call_id() {
        let garbled = CompletionResponse {
            content: r#"<tool_call>{"name": }</tool_call>"#.to_string(),
            tool_calls: vec![],
            finish_reason: FinishReason::ToolUse,
        };
        let (orch, id) = orchestrator(vec![garbled, final_answer("recovered")], 4).await;

        let answer = orch.run_turn(id, "go").await.unwrap();
        assert_eq!(answer, "recovered");

        let session = orch.sessions().get(id).await.unwrap();
        let session = session.lock().await;
        let assistant = &session.turns[1];
        let result = &session.turns[2].tool_results[0];
        assert!(result.is_error);
        // The failure's synthetic id is declared on the assistant turn, so
        // the replayed tool message answers a real call.
        assert!(assistant.tool_calls.iter().any(|c| c.id == result.call_id));

        let messages = session.to_messages("sys");
        let declared: Vec<&str> = messages
            .iter()
            .filter_map(|m| m.tool_calls.as_ref())
            .flatten()
            .map(|c| c.id.as_str())
            .collect();
        for message in messages.iter().filter(|m| m.role == Role::Tool) {
            let call_id = message.tool_call_id.as_deref().unwrap();
            assert!(declared.contains(&call_id));
        }
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (orch, _) = orchestrator(vec![], 1).await;
        let err = orch.run_turn(Uuid::new_v4(), "hi").await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_events_emitted_in_order() {
        let (orch, id) = orchestrator(
            vec![echo_call("call_1", "x"), final_answer("done")],
            4,
        )
        .await;

        let (tx, mut rx) = mpsc::channel(16);
        let answer = orch.run_turn_with_events(id, "go", tx).await.unwrap();
        assert_eq!(answer, "done");

        let mut saw_started = false;
        let mut saw_finished = false;
        let mut saw_delta = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                AgentEvent::ToolStarted { name, .. } => {
                    assert_eq!(name, "echo");
                    saw_started = true;
                }
                AgentEvent::ToolFinished { is_error, .. } => {
                    assert!(!is_error);
                    assert!(saw_started);
                    saw_finished = true;
                }
                AgentEvent::Delta(_) => saw_delta = true,
            }
        }
        assert!(saw_finished);
        assert!(saw_delta);
    }

    /// Model that never answers; the turn only ends by cancellation.
    struct StallingModel;

    #[async_trait]
    impl ModelClient for StallingModel {
        async fn complete(&self, _req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(final_answer("too late"))
        }

        fn model_name(&self) -> &str {
            "stalling"
        }
    }

    #[tokio::test]
    async fn test_cancellation_mid_turn() {
        let pool = Arc::new(KernelPool::new(KernelSettings::default()));
        let sessions = Arc::new(SessionManager::new(pool));
        let session = sessions.create().await;
        let id = session.lock().await.id;

        let router = Arc::new(ToolRouter::new(Arc::new(ToolRegistry::new())));
        let orch = Orchestrator::new(
            sessions,
            router,
            Arc::new(StallingModel),
            Settings::default().agent,
        );

        let (result, ()) = tokio::join!(orch.run_turn(id, "hi"), async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            orch.sessions().cancel(id).await;
        });

        assert!(matches!(result.unwrap_err(), AgentError::Cancelled));
    }
}
