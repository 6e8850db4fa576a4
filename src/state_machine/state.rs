//! Session state types

use super::StatePatch;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ============================================================================
// Stage identifiers
// ============================================================================

/// The four processing roles of the routing state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Greeting,
    Analytics,
    Validation,
    Execution,
}

impl StageId {
    pub const ALL: [StageId; 4] = [
        StageId::Greeting,
        StageId::Analytics,
        StageId::Validation,
        StageId::Execution,
    ];

    /// Display name used as the author of messages a stage produces
    pub fn agent_name(self) -> &'static str {
        match self {
            StageId::Greeting => "Greeting_Agent",
            StageId::Analytics => "Analytics_Agent",
            StageId::Validation => "Validation_Agent",
            StageId::Execution => "Execution_Agent",
        }
    }

    /// Resolve a stage from either its agent name or its short name.
    ///
    /// The model addresses stages by agent name in redirect calls, so matching
    /// is case-insensitive and tolerates surrounding whitespace.
    pub fn from_name(name: &str) -> Option<Self> {
        let needle = name.trim();
        Self::ALL.into_iter().find(|stage| {
            stage.agent_name().eq_ignore_ascii_case(needle)
                || stage.short_name().eq_ignore_ascii_case(needle)
        })
    }

    fn short_name(self) -> &'static str {
        match self {
            StageId::Greeting => "greeting",
            StageId::Analytics => "analytics",
            StageId::Validation => "validation",
            StageId::Execution => "execution",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.agent_name())
    }
}

// ============================================================================
// Transcript
// ============================================================================

/// Author role of a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// One entry in the conversation transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// Which stage (or the user) produced this entry
    pub name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool results: the id of the call this answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            name: "User".to_string(),
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: None,
            is_error: false,
        }
    }

    pub fn assistant(stage: StageId, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            name: stage.agent_name().to_string(),
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: None,
            is_error: false,
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn tool_result(call: &ToolCall, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            name: call.name.clone(),
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: Some(call.id.clone()),
            is_error,
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

// ============================================================================
// Session State
// ============================================================================

/// The record threaded through every stage of a turn.
///
/// Stages consume a state and hand back a new one; nothing mutates a state
/// that another holder can observe. `messages` only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Last stage that ran, or `None` before the first stage of the thread
    #[serde(default)]
    pub current_route: Option<StageId>,
    #[serde(default)]
    pub user_query: String,
    #[serde(default)]
    pub generated_query: String,
    /// Only meaningful right after a validation pass
    #[serde(default)]
    pub query_correct: bool,
    #[serde(default)]
    pub query_result: Vec<Value>,
}

impl SessionState {
    /// Append a transcript entry
    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Merge a patch by key overwrite; absent keys keep their current value
    #[must_use]
    pub fn apply(mut self, patch: StatePatch) -> Self {
        let StatePatch {
            current_route,
            user_query,
            generated_query,
            query_correct,
            query_result,
        } = patch;

        if let Some(route) = current_route {
            self.current_route = Some(route);
        }
        if let Some(user_query) = user_query {
            self.user_query = user_query;
        }
        if let Some(generated_query) = generated_query {
            self.generated_query = generated_query;
        }
        if let Some(query_correct) = query_correct {
            self.query_correct = query_correct;
        }
        if let Some(query_result) = query_result {
            self.query_result = query_result;
        }
        self
    }

    pub fn has_generated_query(&self) -> bool {
        !self.generated_query.trim().is_empty()
    }

    /// Text of the most recent user message
    pub fn latest_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Content of the last non-empty assistant message at or after `from`
    pub fn last_reply_since(&self, from: usize) -> Option<&str> {
        self.messages
            .get(from..)?
            .iter()
            .rev()
            .find(|m| m.is_assistant() && !m.content.trim().is_empty())
            .map(|m| m.content.as_str())
    }
}
