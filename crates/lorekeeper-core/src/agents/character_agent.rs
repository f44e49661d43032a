//! Character agent (C10) — stateless; a persona-prompted two-tool pipeline
//! (`analyze_emotion` → `generate_response`) whose Final Answer must equal
//! the second tool's output verbatim (§4.10).

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::agent::{AgentMessage, AgentProtocol, AgentResponse};
use crate::config::CHARACTER_MAX_ITERATIONS;
use crate::emotion::Emotion;
use crate::llm::{ChatMessage, ChatRequest, LLMBackend, DEFAULT_HELPER_TIMEOUT};
use crate::message::Message;
use crate::persona::Persona;
use crate::react::{self, ReactDriver};
use lorekeeper_tools::{Tool, ToolResult, Toolkit};

const BEHAVIOUR_RULES: &str = "\
You are the character subsystem of a conversational agent: you decide how the persona feels \
and what it says. Every turn you MUST, in order:\n\
1. Call `analyze_emotion` exactly once to assess the persona's current affective state.\n\
2. Call `generate_response` exactly once, passing the `emotion` object you just received.\n\
3. Produce a Final Answer whose text is EXACTLY the `generate_response` Observation, verbatim — \
   do not paraphrase, wrap in quotes, or call any further tool after step 2.\n";

struct AnalyzeEmotionTool {
    llm: Arc<dyn LLMBackend>,
}

#[async_trait]
impl Tool for AnalyzeEmotionTool {
    fn name(&self) -> &str {
        "analyze_emotion"
    }

    fn description(&self) -> &str {
        "Assess the persona's current mood/affection/energy/trust given the user's input."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "user_input": {"type": "string"},
                "conversation_history": {"type": "string"},
            },
            "required": ["user_input"],
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let Some(user_input) = args.get("user_input").and_then(Value::as_str) else {
            return ToolResult::fail("analyze_emotion requires a 'user_input' string argument");
        };
        let history = args.get("conversation_history").and_then(Value::as_str).unwrap_or("");

        let prompt = format!(
            "Given the recent conversation and the user's latest message, estimate the \
             character's emotional state. Reply with bare JSON only, in the form \
             {{\"mood\": <-1..1>, \"affection\": <-1..1>, \"energy\": <0..1>, \"trust\": <0..1>}}.\n\n\
             Recent conversation:\n{history}\n\nUser's latest message: {user_input}"
        );
        let request = ChatRequest::new(vec![ChatMessage::new("user", prompt)])
            .with_temperature(0.5)
            .json_mode()
            .with_timeout(DEFAULT_HELPER_TIMEOUT);

        let emotion = match self.llm.chat(request).await {
            Ok(response) => match serde_json::from_str::<Value>(response.text()) {
                Ok(value) => Emotion::from_value(&value),
                Err(err) => {
                    warn!("analyze_emotion: unparseable LLM output, using default emotion: {err}");
                    Emotion::default()
                }
            },
            Err(err) => {
                warn!("analyze_emotion: LLM call failed, using default emotion: {err}");
                Emotion::default()
            }
        };

        ToolResult::ok(serde_json::to_value(emotion).unwrap_or(Value::Null))
    }
}

struct GenerateResponseTool {
    llm: Arc<dyn LLMBackend>,
    persona: Arc<RwLock<Persona>>,
    memory_context: Option<String>,
}

/// Strip a leading/trailing matching quote pair and a `Name:`-style role
/// prefix an LLM sometimes echoes back despite instructions not to.
fn clean_reply(raw: &str, persona_name: &str) -> String {
    let mut text = raw.trim();

    if let Some(colon) = text.find(':') {
        let prefix = text[..colon].trim();
        if prefix.eq_ignore_ascii_case(persona_name) || prefix.eq_ignore_ascii_case("assistant") {
            text = text[colon + 1..].trim_start();
        }
    }

    for quote in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            text = &text[1..text.len() - 1];
        }
    }

    text.trim().to_string()
}

#[async_trait]
impl Tool for GenerateResponseTool {
    fn name(&self) -> &str {
        "generate_response"
    }

    fn description(&self) -> &str {
        "Generate the persona's in-character reply given the user's input, current emotion, \
         and any recalled memory context."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "user_input": {"type": "string"},
                "emotion": {"type": "object"},
                "memory_context": {"type": "string"},
            },
            "required": ["user_input", "emotion"],
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let Some(user_input) = args.get("user_input").and_then(Value::as_str) else {
            return ToolResult::fail("generate_response requires a 'user_input' string argument");
        };
        let Some(emotion_value) = args.get("emotion") else {
            return ToolResult::fail("generate_response requires an 'emotion' object argument");
        };
        let emotion = Emotion::from_value(emotion_value);

        let memory_context = args
            .get("memory_context")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.memory_context.clone())
            .unwrap_or_default();

        let persona = self.persona.read().expect("persona lock poisoned").clone();

        let prompt = format!(
            "## Persona\n{}\n\n## Current emotional state\nmood={:.2} affection={:.2} energy={:.2} trust={:.2}\n\n\
             ## Relevant memory\n{memory_context}\n\n\
             ## User's message\n{user_input}\n\n\
             Reply in character, in the persona's own voice. Do not prefix your reply with the \
             persona's name or any role label, and do not wrap it in quotes.",
            persona.describe(),
            emotion.mood,
            emotion.affection,
            emotion.energy,
            emotion.trust,
        );

        let request = ChatRequest::new(vec![ChatMessage::new("user", prompt)])
            .with_temperature(0.8)
            .with_timeout(DEFAULT_HELPER_TIMEOUT);

        match self.llm.chat(request).await {
            Ok(response) => ToolResult::ok_text(clean_reply(response.text(), &persona.name)),
            Err(err) => ToolResult::fail(format!("generate_response LLM call failed: {err}")),
        }
    }
}

struct CharacterAgentRun {
    toolkit: Toolkit,
    system_prompt: String,
}

impl ReactDriver for CharacterAgentRun {
    fn name(&self) -> &str {
        "character_agent"
    }

    fn system_prompt(&self) -> String {
        self.system_prompt.clone()
    }

    fn toolkit(&self) -> &Toolkit {
        &self.toolkit
    }

    fn max_iterations(&self) -> usize {
        CHARACTER_MAX_ITERATIONS
    }
}

/// Character agent (C10). Owned per session; `persona` is swapped atomically
/// via [`CharacterAgent::set_persona`] and is otherwise read-only between
/// calls — the agent itself holds no other mutable state.
pub struct CharacterAgent {
    llm: Arc<dyn LLMBackend>,
    persona: Arc<RwLock<Persona>>,
}

impl CharacterAgent {
    pub fn new(llm: Arc<dyn LLMBackend>, persona: Persona) -> Self {
        Self {
            llm,
            persona: Arc::new(RwLock::new(persona)),
        }
    }

    pub fn set_persona(&self, persona: Persona) {
        *self.persona.write().expect("persona lock poisoned") = persona;
    }

    fn build_run(&self, metadata: &Map<String, Value>) -> CharacterAgentRun {
        let memory_context = metadata.get("memory_context").and_then(Value::as_str).map(str::to_string);

        let history_block = metadata
            .get("conversation_history")
            .and_then(|v| serde_json::from_value::<Vec<Message>>(v.clone()).ok())
            .map(|msgs| {
                msgs.iter()
                    .map(|m| format!("{}: {}", m.role.as_str(), m.content))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_else(|| "(no conversation history supplied)".to_string());

        let system_prompt = format!("{BEHAVIOUR_RULES}\n## Recent conversation\n{history_block}\n");

        let toolkit = Toolkit::new()
            .with(Arc::new(AnalyzeEmotionTool { llm: self.llm.clone() }))
            .with(Arc::new(GenerateResponseTool {
                llm: self.llm.clone(),
                persona: self.persona.clone(),
                memory_context,
            }));

        CharacterAgentRun { toolkit, system_prompt }
    }

    /// Walk the trace for the first Observation that parses as a mapping
    /// containing at least one emotion field (§4.10) — i.e. the
    /// `analyze_emotion` Observation, whichever iteration it landed on.
    fn extract_emotion(trace: &[Message]) -> Option<Emotion> {
        for message in trace {
            let Some(rest) = message.content.strip_prefix("Observation: ") else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(rest) else {
                continue;
            };
            let Some(obj) = value.as_object() else {
                continue;
            };
            if ["mood", "affection", "valence", "arousal"].iter().any(|k| obj.contains_key(*k)) {
                return Some(Emotion::from_value(&value));
            }
        }
        None
    }
}

#[async_trait]
impl AgentProtocol for CharacterAgent {
    fn agent_name(&self) -> &str {
        "character_agent"
    }

    fn agent_description(&self) -> &str {
        "Analyses emotional state and generates the persona's in-character reply."
    }

    async fn invoke(&self, message: AgentMessage) -> AgentResponse {
        let run = self.build_run(&message.metadata);
        let result = react::run(&run, self.llm.as_ref(), &message.content).await;

        if !result.success {
            warn!("character_agent ReAct loop failed to converge: {:?}", result.error);
            return AgentResponse::failed(result.error.unwrap_or_else(|| "character agent failed".to_string()));
        }

        let mut metadata = Map::new();
        if let Some(emotion) = Self::extract_emotion(&result.trace) {
            metadata.insert("emotion_state".to_string(), serde_json::to_value(emotion).unwrap_or(Value::Null));
        }

        AgentResponse::ok(result.answer, metadata)
    }
}
