//! Memory agent (C9) — stateless; every [`MemoryAgent::invoke`] runs one
//! fresh ReAct loop over the two memory-search tools and returns a
//! structured memory context (§4.9).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::agent::{AgentMessage, AgentProtocol, AgentResponse};
use crate::llm::LLMBackend;
use crate::memory::{MemoryManager, MemoryType};
use crate::react::{self, ReactDriver};
use lorekeeper_tools::{Tool, ToolResult, Toolkit};

/// Default lookback window for `search_memory`, in days — distinct from
/// [`crate::config::Config::mid_term_range_days`], which bounds the
/// underlying mid-term read path when the tool doesn't override it (§4.9).
const SEARCH_MEMORY_DEFAULT_RANGE_DAYS: i64 = 90;
const SEARCH_MEMORY_DEFAULT_LIMIT: usize = 5;
const DEFAULT_STORE_IMPORTANCE: i32 = 5;

/// Behavioural rules prepended to every Memory agent run (§4.9): search
/// first, store only when something new and factual surfaced, never
/// fabricate a memory that wasn't actually observed.
const BEHAVIOUR_RULES: &str = "\
You are the memory subsystem of a conversational agent. On every turn you must:\n\
1. Call `search_memory` at least once to recall anything relevant to the current input.\n\
2. If the input contains a new durable fact, preference, or event about the user that is \
   not already present in what you recalled, call `store_long_term_memory` to save it.\n\
3. Never invent or fabricate a memory — only store what the user actually said.\n\
4. Once you have done the necessary searching (and storing, if warranted), produce a Final Answer.\n";

struct SearchMemoryTool {
    user_id: String,
    memory: Arc<MemoryManager>,
}

#[async_trait]
impl Tool for SearchMemoryTool {
    fn name(&self) -> &str {
        "search_memory"
    }

    fn description(&self) -> &str {
        "Search both mid-term (recent dialogue summaries) and long-term (vectorised facts) \
         memory for anything relevant to `query`."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "time_range_days": {"type": "integer", "default": SEARCH_MEMORY_DEFAULT_RANGE_DAYS},
                "limit": {"type": "integer", "default": SEARCH_MEMORY_DEFAULT_LIMIT},
            },
            "required": ["query"],
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let Some(query) = args.get("query").and_then(Value::as_str) else {
            return ToolResult::fail("search_memory requires a 'query' string argument");
        };
        let time_range_days = args
            .get("time_range_days")
            .and_then(Value::as_i64)
            .unwrap_or(SEARCH_MEMORY_DEFAULT_RANGE_DAYS);
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(SEARCH_MEMORY_DEFAULT_LIMIT);

        let (mid_term, long_term) = tokio::join!(
            self.memory.search_mid_term(&self.user_id, query, Some(time_range_days), Some(limit)),
            self.memory.search_long_term(&self.user_id, query, None, Some(limit)),
        );

        let mid_term_json: Vec<Value> = mid_term
            .iter()
            .map(|item| json!({"content": item.content, "score": item.final_score}))
            .collect();
        let long_term_json: Vec<Value> = long_term
            .iter()
            .map(|item| json!({"content": item.content, "score": item.final_score, "importance": item.importance}))
            .collect();

        ToolResult::ok(json!({
            "mid_term": mid_term_json,
            "long_term": long_term_json,
        }))
    }
}

struct StoreLongTermMemoryTool {
    user_id: String,
    memory: Arc<MemoryManager>,
}

#[async_trait]
impl Tool for StoreLongTermMemoryTool {
    fn name(&self) -> &str {
        "store_long_term_memory"
    }

    fn description(&self) -> &str {
        "Persist a durable fact, preference, or event about the user to long-term memory."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {"type": "string"},
                "memory_type": {"type": "string", "enum": ["preference", "fact", "event"]},
                "importance": {"type": "integer", "minimum": 1, "maximum": 10, "default": DEFAULT_STORE_IMPORTANCE},
            },
            "required": ["content", "memory_type"],
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let Some(content) = args.get("content").and_then(Value::as_str) else {
            return ToolResult::fail("store_long_term_memory requires a 'content' string argument");
        };
        let Some(memory_type) = args
            .get("memory_type")
            .and_then(Value::as_str)
            .and_then(MemoryType::parse)
        else {
            return ToolResult::fail(
                "store_long_term_memory requires a 'memory_type' of preference, fact, or event",
            );
        };
        let importance = args
            .get("importance")
            .and_then(Value::as_i64)
            .map(|v| v as i32)
            .unwrap_or(DEFAULT_STORE_IMPORTANCE);

        match self
            .memory
            .store_long_term(&self.user_id, content, memory_type, importance, Vec::new())
            .await
        {
            Some(id) => ToolResult::ok(json!({"stored": true, "id": id.to_string(), "content": content})),
            None => ToolResult::fail("failed to store long-term memory"),
        }
    }
}

/// One fresh ReAct run's worth of prompt/toolkit state (§4.9: "stateless,
/// each invoke runs one fresh ReAct loop"). Built once per [`MemoryAgent::invoke`].
struct MemoryAgentRun {
    toolkit: Toolkit,
    system_prompt: String,
}

const RESPONSE_SCHEMA_DESCRIPTION: &str = "\
Extract your answer ONLY from the Observations you received from tool calls above, never \
from your own Thoughts. Populate `related_memory.short_term` from the conversation history \
you were given (a brief summary of the recent turns); populate `related_memory.mid_term` and \
`related_memory.long_term` from the `search_memory` Observation; populate `storage_result` from \
the `store_long_term_memory` Observation if you called it, or {\"stored\": false, \"content\": \"\"} \
otherwise. Output bare JSON only, no markdown fences.";

impl ReactDriver for MemoryAgentRun {
    fn name(&self) -> &str {
        "memory_agent"
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

    fn response_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "related_memory": {
                    "type": "object",
                    "properties": {
                        "short_term": {"type": "string"},
                        "mid_term": {"type": "string"},
                        "long_term": {"type": "string"},
                    },
                    "required": ["short_term", "mid_term", "long_term"],
                },
                "storage_result": {
                    "type": "object",
                    "properties": {
                        "stored": {"type": "boolean"},
                        "content": {"type": "string"},
                    },
                    "required": ["stored", "content"],
                },
            },
            "required": ["related_memory", "storage_result"],
        }))
    }

    fn finalize_prompt(&self, schema_str: &str) -> String {
        format!(
            "Based on the conversation so far, produce a result matching the following \
             JSON Schema.\n\n## JSON Schema\n{schema_str}\n\n{RESPONSE_SCHEMA_DESCRIPTION}"
        )
    }

    fn format_final_output(&self, data: &Value) -> String {
        let related = data.get("related_memory").cloned().unwrap_or_default();
        let storage = data.get("storage_result").cloned().unwrap_or_default();
        let get = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).unwrap_or("").to_string();

        format!(
            "[Memory Context]\nShort-term: {}\nMid-term: {}\nLong-term: {}\nStored: {} ({})",
            get(&related, "short_term"),
            get(&related, "mid_term"),
            get(&related, "long_term"),
            storage.get("stored").and_then(Value::as_bool).unwrap_or(false),
            get(&storage, "content"),
        )
    }
}

/// Memory agent (C9). Owned per session alongside [`crate::agents::system_agent::SystemAgent`];
/// `user_id` is fixed at construction, there is no mutable state between calls.
pub struct MemoryAgent {
    user_id: String,
    memory: Arc<MemoryManager>,
    llm: Arc<dyn LLMBackend>,
    recent_summaries: usize,
}

impl MemoryAgent {
    pub fn new(user_id: impl Into<String>, memory: Arc<MemoryManager>, llm: Arc<dyn LLMBackend>, recent_summaries: usize) -> Self {
        Self {
            user_id: user_id.into(),
            memory,
            llm,
            recent_summaries,
        }
    }

    async fn build_run(&self, metadata: &Map<String, Value>) -> MemoryAgentRun {
        let summaries = self.memory.recent_summaries(&self.user_id, self.recent_summaries).await;
        let summaries_block = if summaries.is_empty() {
            "(no prior dialogue summaries on record)".to_string()
        } else {
            summaries.iter().map(|s| format!("- {s}")).collect::<Vec<_>>().join("\n")
        };

        let history_block = metadata
            .get("conversation_history")
            .map(|v| serde_json::to_string_pretty(v).unwrap_or_default())
            .unwrap_or_else(|| "(no conversation history supplied)".to_string());

        let system_prompt = format!(
            "{BEHAVIOUR_RULES}\n## Recent dialogue summaries\n{summaries_block}\n\n\
             ## Conversation history\n{history_block}\n"
        );

        let toolkit = Toolkit::new()
            .with(Arc::new(SearchMemoryTool {
                user_id: self.user_id.clone(),
                memory: self.memory.clone(),
            }))
            .with(Arc::new(StoreLongTermMemoryTool {
                user_id: self.user_id.clone(),
                memory: self.memory.clone(),
            }));

        MemoryAgentRun { toolkit, system_prompt }
    }
}

#[async_trait]
impl AgentProtocol for MemoryAgent {
    fn agent_name(&self) -> &str {
        "memory_agent"
    }

    fn agent_description(&self) -> &str {
        "Recalls and stores long-lived facts about the user across short/mid/long-term memory."
    }

    async fn invoke(&self, message: AgentMessage) -> AgentResponse {
        let run = self.build_run(&message.metadata).await;
        let result = react::run(&run, self.llm.as_ref(), &message.content).await;

        if !result.success {
            warn!("memory_agent ReAct loop failed to converge: {:?}", result.error);
            return AgentResponse::failed(result.error.unwrap_or_else(|| "memory agent failed".to_string()));
        }

        AgentResponse::ok(result.answer, Map::new())
    }
}
