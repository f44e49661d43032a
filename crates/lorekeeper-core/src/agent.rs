//! Agent protocol & registry (C8) — the typed envelope every dispatchable
//! agent speaks, a name-keyed registry, and the `call_agent` tool that lets
//! the System agent invoke its sub-agents as an ordinary tool call (§4.8).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex as TokioMutex;

use crate::message::Message;
use lorekeeper_tools::{Tool, ToolResult};

/// Inbound envelope to an [`AgentProtocol`] (§3, §6). `metadata` is the
/// extension point: no business field is mandatory.
#[derive(Debug, Clone, Default)]
pub struct AgentMessage {
    pub content: String,
    pub metadata: Map<String, Value>,
}

impl AgentMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Outbound envelope from an [`AgentProtocol`]. `success = false` only for
/// errors outside the ReAct loop itself (§7) — a failed loop iteration never
/// reaches here, it is absorbed and retried internally.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub content: String,
    pub metadata: Map<String, Value>,
    pub success: bool,
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn ok(content: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            content: content.into(),
            metadata,
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            content: "Sorry, I ran into a problem — please try again.".to_string(),
            metadata: Map::new(),
            success: false,
            error: Some(error),
        }
    }
}

/// Contract every dispatchable agent implements (§4.8). `invoke` must never
/// panic on agent-reachable input — every failure path returns
/// `AgentResponse { success: false, .. }` instead.
#[async_trait]
pub trait AgentProtocol: Send + Sync {
    fn agent_name(&self) -> &str;
    fn agent_description(&self) -> &str;
    async fn invoke(&self, message: AgentMessage) -> AgentResponse;
}

/// Name → agent map with a prompt-ready listing and a lazily-constructed
/// `call_agent` tool.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn AgentProtocol>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    pub fn register(&mut self, agent: Arc<dyn AgentProtocol>) {
        self.agents.insert(agent.agent_name().to_string(), agent);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentProtocol>> {
        self.agents.get(name).cloned()
    }

    /// `(name, description)` pairs, sorted by name, for inclusion in a
    /// dispatching agent's system prompt.
    pub fn list_agents(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .agents
            .values()
            .map(|a| (a.agent_name().to_string(), a.agent_description().to_string()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn names_joined(&self) -> String {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names.join(", ")
    }
}

/// Shared handle to a System agent's persistent dialogue, read (never
/// written) by the auto-injecting `call_agent` tool (§9 "shared mutable
/// dialogue buffer").
pub type HistoryHandle = Arc<TokioMutex<Vec<Message>>>;

/// The `call_agent` tool (§4.8). Without a `history` handle this is the
/// plain form any agent could theoretically hold; the System agent always
/// constructs it with `Some(history)` so every dispatch auto-injects
/// `metadata.conversation_history` (§8 property 11).
pub struct CallAgentTool {
    registry: Arc<AgentRegistry>,
    history: Option<HistoryHandle>,
}

impl CallAgentTool {
    pub fn new(registry: Arc<AgentRegistry>, history: Option<HistoryHandle>) -> Self {
        Self { registry, history }
    }
}

#[async_trait]
impl Tool for CallAgentTool {
    fn name(&self) -> &str {
        "call_agent"
    }

    fn description(&self) -> &str {
        "Dispatch a request to another agent by name and receive its response."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "agent_name": {"type": "string", "description": "Name of the agent to invoke"},
                "input": {"type": "string", "description": "The content to pass to the agent"},
                "metadata": {"type": "object", "description": "Optional extra metadata, e.g. memory_context"},
            },
            "required": ["agent_name", "input"],
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let Some(agent_name) = args.get("agent_name").and_then(Value::as_str) else {
            return ToolResult::fail("call_agent requires an 'agent_name' string argument");
        };
        let Some(agent) = self.registry.get(agent_name) else {
            return ToolResult::fail(format!(
                "Unknown agent: {agent_name}. Available: [{}]",
                self.registry.names_joined()
            ));
        };

        let input = args.get("input").and_then(Value::as_str).unwrap_or_default().to_string();
        let mut metadata = args
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        if let Some(history) = &self.history {
            let snapshot = history.lock().await.clone();
            metadata.insert(
                "conversation_history".to_string(),
                serde_json::to_value(&snapshot).unwrap_or(Value::Null),
            );
        }

        let response = agent.invoke(AgentMessage { content: input, metadata }).await;
        if !response.success {
            return ToolResult::fail(response.error.unwrap_or_else(|| "agent invocation failed".to_string()));
        }

        ToolResult::ok(serde_json::json!({
            "content": response.content,
            "metadata": response.metadata,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    struct EchoAgent;

    #[async_trait]
    impl AgentProtocol for EchoAgent {
        fn agent_name(&self) -> &str {
            "echo_agent"
        }
        fn agent_description(&self) -> &str {
            "echoes its input"
        }
        async fn invoke(&self, message: AgentMessage) -> AgentResponse {
            AgentResponse::ok(message.content, message.metadata)
        }
    }

    #[tokio::test]
    async fn unknown_agent_fails_without_panic() {
        let registry = Arc::new(AgentRegistry::new());
        let tool = CallAgentTool::new(registry, None);
        let result = tool
            .execute(serde_json::json!({"agent_name": "nope", "input": "hi"}))
            .await;
        assert!(matches!(result, ToolResult::Fail(_)));
    }

    #[tokio::test]
    async fn auto_injects_conversation_history_and_merges_metadata() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(EchoAgent));
        let registry = Arc::new(registry);

        let history: HistoryHandle = Arc::new(TokioMutex::new(vec![
            Message::new(Role::User, "hi"),
            Message::new(Role::Assistant, "hello"),
            Message::new(Role::User, "how are you"),
        ]));

        let tool = CallAgentTool::new(registry, Some(history.clone()));
        let result = tool
            .execute(serde_json::json!({
                "agent_name": "echo_agent",
                "input": "payload",
                "metadata": {"memory_context": "x"},
            }))
            .await;

        let ToolResult::Ok(value) = result else {
            panic!("expected ok");
        };
        let history_len = value["metadata"]["conversation_history"].as_array().unwrap().len();
        assert_eq!(history_len, history.lock().await.len());
        assert_eq!(value["metadata"]["memory_context"], "x");
    }
}
