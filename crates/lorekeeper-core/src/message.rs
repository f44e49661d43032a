//! Dialogue message shared by every ReAct transcript and the System
//! agent's persistent history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One turn in a dialogue. A `tool` message always carries a `tool_call_id`
/// matching a preceding `assistant.tool_calls[*].id`; within this codebase
/// tool turns are represented as plain `user`-role Observation messages per
/// the ReAct loop's text-only contract (see `react::Observation`), so the
/// `tool_call_id`/`tool_calls` fields exist for protocol fidelity but are
/// unused by the ReAct transcript itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
            timestamp: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::User, content);
        msg.timestamp = Some(Utc::now());
        msg
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Assistant, content);
        msg.timestamp = Some(Utc::now());
        msg
    }
}
