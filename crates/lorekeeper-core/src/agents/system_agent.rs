//! System agent (C11) — stateful; owns the persistent dialogue history and
//! orchestrates `memory_agent → character_agent → Final Answer` through the
//! single auto-injecting `call_agent` tool (§4.11).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex as TokioMutex;
use tracing::{info, warn};

use crate::agent::{AgentMessage, AgentProtocol, AgentRegistry, AgentResponse, CallAgentTool, HistoryHandle};
use crate::llm::LLMBackend;
use crate::memory::MemoryManager;
use crate::message::{Message, Role};
use crate::react::{self, ReactDriver};
use lorekeeper_tools::Toolkit;

const BEHAVIOUR_RULES: &str = "\
You are the orchestrator of a conversational agent. For every user message you MUST, in order:\n\
1. Call `call_agent` with `agent_name: \"memory_agent\"` and `input` set to the user's message, \
   to recall and store relevant memory.\n\
2. Call `call_agent` with `agent_name: \"character_agent\"` and `input` set to the user's message, \
   passing `metadata: {\"memory_context\": <the memory_agent response content>}`.\n\
3. Produce a Final Answer whose text is EXACTLY the character_agent response content, verbatim — \
   do not paraphrase or summarise it.\n";

struct SystemAgentRun {
    toolkit: Toolkit,
    system_prompt: String,
}

impl ReactDriver for SystemAgentRun {
    fn name(&self) -> &str {
        "system_agent"
    }

    fn system_prompt(&self) -> String {
        self.system_prompt.clone()
    }

    fn toolkit(&self) -> &Toolkit {
        &self.toolkit
    }

    fn max_iterations(&self) -> usize {
        10
    }
}

/// System agent (C11). One instance per session: `history` is the single
/// shared dialogue buffer, read by `call_agent` on every dispatch and
/// mutated only here.
pub struct SystemAgent {
    user_id: String,
    registry: Arc<AgentRegistry>,
    history: HistoryHandle,
    llm: Arc<dyn LLMBackend>,
    memory: Arc<MemoryManager>,
    message_window: usize,
}

impl SystemAgent {
    pub fn new(
        user_id: impl Into<String>,
        registry: Arc<AgentRegistry>,
        llm: Arc<dyn LLMBackend>,
        memory: Arc<MemoryManager>,
        message_window: usize,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            registry,
            history: Arc::new(TokioMutex::new(Vec::new())),
            llm,
            memory,
            message_window,
        }
    }

    fn build_run(&self) -> SystemAgentRun {
        let agents_block = self
            .registry
            .list_agents()
            .iter()
            .map(|(name, description)| format!("- {name}: {description}"))
            .collect::<Vec<_>>()
            .join("\n");

        let system_prompt = format!("{BEHAVIOUR_RULES}\n## Available agents\n{agents_block}\n");

        let toolkit = Toolkit::new().with(Arc::new(CallAgentTool::new(
            self.registry.clone(),
            Some(self.history.clone()),
        )));

        SystemAgentRun { toolkit, system_prompt }
    }

    /// `on_user_input` (§4.11): append the current turn before the ReAct
    /// loop starts, so `call_agent`'s auto-injected history already
    /// includes it.
    async fn on_user_input(&self, text: &str) {
        self.history.lock().await.push(Message::user(text));
    }

    /// `on_final_answer` (§4.11): append the reply, then run window trim.
    async fn on_final_answer(&self, text: &str) {
        self.history.lock().await.push(Message::assistant(text));
        self.trim_if_needed().await;
    }

    async fn trim_if_needed(&self) {
        let user_count = {
            let history = self.history.lock().await;
            history.iter().filter(|m| m.role == Role::User).count()
        };
        if user_count < self.message_window {
            return;
        }

        let snapshot = self.history.lock().await.clone();
        if self.memory.save_summary(&self.user_id, &snapshot).await.is_some() {
            self.history.lock().await.clear();
            info!(user_id = %self.user_id, "dialogue window summarised and cleared");
            return;
        }

        warn!(user_id = %self.user_id, "summariser failed, dropping oldest user/assistant pair instead");
        let mut history = self.history.lock().await;
        if let Some(first_user) = history.iter().position(|m| m.role == Role::User) {
            history.remove(first_user);
        }
        if let Some(first_assistant) = history.iter().position(|m| m.role == Role::Assistant) {
            history.remove(first_assistant);
        }
    }
}

#[async_trait]
impl AgentProtocol for SystemAgent {
    fn agent_name(&self) -> &str {
        "system_agent"
    }

    fn agent_description(&self) -> &str {
        "Orchestrates the memory and character agents to answer one user turn."
    }

    async fn invoke(&self, message: AgentMessage) -> AgentResponse {
        self.on_user_input(&message.content).await;

        let run = self.build_run();
        let result = react::run(&run, self.llm.as_ref(), &message.content).await;

        if !result.success {
            warn!("system_agent ReAct loop failed to converge: {:?}", result.error);
            return AgentResponse::failed(result.error.unwrap_or_else(|| "system agent failed".to_string()));
        }

        self.on_final_answer(&result.answer).await;
        AgentResponse::ok(result.answer, Map::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::errors::LLMError;
    use crate::llm::{ChatRequest, LLMResponse};
    use crate::storage::InMemoryStorageBackend;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    fn test_config(message_window: usize) -> Config {
        Config {
            llm_api_url: "http://localhost".to_string(),
            llm_api_key: None,
            llm_model: "test".to_string(),
            embedding_model: "test".to_string(),
            database_url: "test".to_string(),
            message_window,
            max_iterations: 10,
            recent_summaries: 3,
            promotion_threshold: 3,
            mid_term_range_days: 30,
            search_limit: 5,
            long_term_min_score: 0.1,
            long_term_min_importance: 1.0,
            chat_timeout_secs: 60,
            stream_timeout_secs: 300,
            helper_timeout_secs: 30,
        }
    }

    /// Stub sub-agents that skip their own ReAct loops entirely — this test
    /// is only concerned with the System agent's own orchestration and
    /// window-trim behaviour (§8 property 7), not the Memory/Character
    /// agents' internals (covered by their own unit tests).
    struct StubMemoryAgent;
    #[async_trait]
    impl AgentProtocol for StubMemoryAgent {
        fn agent_name(&self) -> &str {
            "memory_agent"
        }
        fn agent_description(&self) -> &str {
            "stub"
        }
        async fn invoke(&self, message: AgentMessage) -> AgentResponse {
            AgentResponse::ok(format!("[Memory Context] recalled for: {}", message.content), Map::new())
        }
    }

    struct StubCharacterAgent;
    #[async_trait]
    impl AgentProtocol for StubCharacterAgent {
        fn agent_name(&self) -> &str {
            "character_agent"
        }
        fn agent_description(&self) -> &str {
            "stub"
        }
        async fn invoke(&self, message: AgentMessage) -> AgentResponse {
            AgentResponse::ok(format!("Echo: {}", message.content), Map::new())
        }
    }

    fn expected_reply(user_text: &str) -> String {
        format!("Echo: {user_text}")
    }

    /// Scripts the exact three-step `call_agent` sequence the System agent's
    /// own system prompt mandates (§4.11) for one turn given `user_text`.
    fn scripted_turn(user_text: &str) -> Vec<String> {
        vec![
            format!(
                "Thought: recall memory first\nAction: call_agent\nAction Input: {{\"agent_name\": \"memory_agent\", \"input\": \"{user_text}\"}}"
            ),
            format!(
                "Thought: now generate the in-character reply\nAction: call_agent\nAction Input: {{\"agent_name\": \"character_agent\", \"input\": \"{user_text}\", \"metadata\": {{\"memory_context\": \"ctx\"}}}}"
            ),
            format!("Thought: done\nFinal Answer: {}", expected_reply(user_text)),
        ]
    }

    struct ScriptedSystemLLM {
        replies: StdMutex<std::collections::VecDeque<String>>,
    }

    impl ScriptedSystemLLM {
        fn for_turns(turns: &[&str]) -> Self {
            let mut replies = std::collections::VecDeque::new();
            for text in turns {
                replies.extend(scripted_turn(text));
            }
            Self {
                replies: StdMutex::new(replies),
            }
        }
    }

    #[async_trait]
    impl LLMBackend for ScriptedSystemLLM {
        async fn chat(&self, _request: ChatRequest) -> Result<LLMResponse, LLMError> {
            let content = self.replies.lock().unwrap().pop_front().unwrap_or_default();
            Ok(LLMResponse {
                content: Some(content),
                finish_reason: Some("stop".into()),
                usage: None,
            })
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LLMError> {
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }
    }

    /// Deterministic LLM for the memory manager's own summariser call —
    /// independent of `ScriptedSystemLLM`, which only drives the System
    /// agent's ReAct loop.
    struct SummarizerLLM;
    #[async_trait]
    impl LLMBackend for SummarizerLLM {
        async fn chat(&self, _request: ChatRequest) -> Result<LLMResponse, LLMError> {
            Ok(LLMResponse {
                content: Some(serde_json::json!({"summary": "two turns about greetings", "keywords": "greeting"}).to_string()),
                finish_reason: Some("stop".into()),
                usage: None,
            })
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LLMError> {
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }
    }

    /// §8 property 7: with `message_window = 2`, driving two full user/
    /// assistant turns must trigger a summariser call before the third user
    /// message would be enqueued, insert exactly one mid-term row whose
    /// `raw_messages` contains all four messages, and leave the in-memory
    /// dialogue list empty afterwards.
    #[tokio::test]
    async fn window_trim_triggers_summary_and_clears_history() {
        let storage = Arc::new(InMemoryStorageBackend::new());
        let memory_llm: Arc<dyn LLMBackend> = Arc::new(SummarizerLLM);
        let memory = Arc::new(MemoryManager::new("bot1", storage.clone(), memory_llm, &test_config(2)));

        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(StubMemoryAgent));
        registry.register(Arc::new(StubCharacterAgent));
        let registry = Arc::new(registry);

        let system_llm: Arc<dyn LLMBackend> = Arc::new(ScriptedSystemLLM::for_turns(&["hi there", "how are you"]));
        let system = SystemAgent::new("user1", registry, system_llm, memory, 2);

        let first = system.invoke(AgentMessage::new("hi there")).await;
        assert!(first.success);
        assert_eq!(first.content, expected_reply("hi there"));
        // Window isn't full after one user turn yet.
        assert_eq!(system.history.lock().await.len(), 2);
        assert!(storage.mid_term_rows().is_empty());

        let second = system.invoke(AgentMessage::new("how are you")).await;
        assert!(second.success);
        assert_eq!(second.content, expected_reply("how are you"));

        // Two user messages hit message_window=2: summarised and cleared.
        assert!(system.history.lock().await.is_empty());

        let rows = storage.mid_term_rows();
        assert_eq!(rows.len(), 1);
        let raw = rows[0].raw_messages.as_array().expect("raw_messages is an array");
        assert_eq!(raw.len(), 4);
        let contents: Vec<&str> = raw.iter().map(|m| m["content"].as_str().unwrap()).collect();
        assert_eq!(
            contents,
            vec!["hi there", &expected_reply("hi there"), "how are you", &expected_reply("how are you")]
        );
    }
}
