//! Conversation sessions and turns.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::llm::{ChatMessage, Role, ToolCallRequest};
use crate::tools::ToolResult;

/// One completed step of a conversation. Immutable once appended.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Calls the assistant made in this turn, if any.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Results folded back for the model, if this is a tool turn.
    pub tool_results: Vec<ToolResult>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            tool_results: results,
            ..Self::plain(Role::Tool, "")
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// One conversation. Owns its turn history; its kernel lives in the pool,
/// keyed by this session's id.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    /// Append-only history.
    pub turns: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            turns: Vec::new(),
            created_at: now,
            last_active_at: now,
        }
    }

    pub fn push_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.last_active_at = Utc::now();
    }

    /// Project the history into the message list replayed to the model.
    ///
    /// Tool turns expand into one message per result so every call id is
    /// answered, which function-calling endpoints require.
    pub fn to_messages(&self, system_prompt: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(system_prompt)];

        for turn in &self.turns {
            match turn.role {
                Role::User => messages.push(ChatMessage::user(&turn.content)),
                Role::Assistant => messages.push(ChatMessage::assistant_with_tools(
                    &turn.content,
                    turn.tool_calls.clone(),
                )),
                Role::Tool => {
                    for result in &turn.tool_results {
                        messages.push(ChatMessage::tool_result(
                            &result.call_id,
                            &result.name,
                            &result.content,
                        ));
                    }
                }
                Role::System => messages.push(ChatMessage::system(&turn.content)),
            }
        }

        messages
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
