//! The ReAct loop (C7) — the core control discipline every agent in this
//! crate runs its turn through. A text-only language model is driven by a
//! system prompt into alternating Thought/Action/Observation steps until it
//! emits a Final Answer; this module owns prompt assembly, the line-scan
//! parser, the repair-feedback branches, and the optional structured-output
//! finalisation pass (§4.7).
//!
//! The parser is a small state machine keyed on section headers, not a
//! regex engine: each marker's span runs to the next marker or end of
//! string. Markers are matched case-insensitively via ASCII lowercasing,
//! which never changes a string's byte length, so offsets found in the
//! lowercased copy are valid directly against the original.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::llm::{ChatMessage, ChatRequest, LLMBackend, DEFAULT_CHAT_TIMEOUT};
use crate::message::Message;
use lorekeeper_tools::Toolkit;

const MARKER_THOUGHT: &str = "Thought:";
const MARKER_ACTION: &str = "Action:";
const MARKER_ACTION_INPUT: &str = "Action Input:";
const MARKER_OBSERVATION: &str = "Observation:";
const MARKER_FINAL_ANSWER: &str = "Final Answer:";

/// Minimum length, in characters, for a `Final Answer` to be accepted —
/// shorter text is assumed to be a stray fragment, not a real reply.
const MIN_FINAL_ANSWER_LEN: usize = 5;

/// Outcome of one full ReAct run (§3, `AgentResult` in the system this is
/// modelled on).
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub answer: String,
    pub iterations: usize,
    pub trace: Vec<Message>,
    pub success: bool,
    pub error: Option<String>,
}

/// Per-agent hooks the loop calls into. Implementors provide the
/// business-specific half of an agent (system prompt, tools, optional
/// structured output); this module provides the control flow (§4.7, §4.9,
/// §4.10, §4.11 all build on this single loop).
pub trait ReactDriver: Send + Sync {
    /// Name used only for log lines.
    fn name(&self) -> &str;

    /// Business-specific portion of the system prompt. The format rules and
    /// tool list are appended by [`run`].
    fn system_prompt(&self) -> String;

    fn toolkit(&self) -> &Toolkit;

    fn max_iterations(&self) -> usize;

    /// JSON-Schema for the structured finalisation pass. `None` (the
    /// default) skips finalisation entirely — the raw Final Answer text is
    /// returned verbatim.
    fn response_schema(&self) -> Option<Value> {
        None
    }

    /// Render the finalisation JSON into user-visible text.
    fn format_final_output(&self, data: &Value) -> String {
        serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string())
    }

    fn finalize_prompt(&self, schema_str: &str) -> String {
        format!(
            "Based on the conversation so far, produce a result matching the following \
             JSON Schema.\n\n## JSON Schema\n{schema_str}\n\nOutput bare JSON only, nothing else."
        )
    }

    /// Called once a Final Answer has been accepted and (if applicable)
    /// finalised, before the result is returned.
    fn on_final_answer(&self, _answer: &str) {}
}

fn format_template(tool_names: &str) -> String {
    format!(
        "## Output format (must be followed exactly)\n\n\
         Every reply must contain the following lines, in order:\n\
         ```\n\
         Thought: [your reasoning]\n\
         Action: [tool name, one of {tool_names}]\n\
         Action Input: [arguments as JSON]\n\
         ```\n\
         or, once every necessary tool call has been made:\n\
         ```\n\
         Thought: all necessary tool calls are complete\n\
         Final Answer: [your final answer]\n\
         ```\n\n\
         Rules:\n\
         1. A Thought must always be followed by an Action or a Final Answer — never left dangling.\n\
         2. At least one tool must be called before a Final Answer is produced.\n\
         3. Action and Final Answer never appear in the same reply.\n"
    )
}

const NO_TOOL_FORMAT: &str = "Reply using the following format:\n\nThought: [your reasoning]\nFinal Answer: [your final answer]\n";

fn build_system_prompt(driver: &dyn ReactDriver) -> String {
    let mut prompt = driver.system_prompt();
    let toolkit = driver.toolkit();
    if toolkit.is_empty() {
        prompt.push('\n');
        prompt.push_str(NO_TOOL_FORMAT);
    } else {
        prompt.push_str("\n## Available tools\n");
        prompt.push_str(&toolkit.describe_for_prompt());
        prompt.push_str(&format_template(&toolkit.names_joined()));
    }
    prompt
}

fn to_chat_messages(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| ChatMessage::new(m.role.as_str(), m.content.clone()))
        .collect()
}

#[derive(Debug, Default)]
struct ParsedReply {
    action: Option<String>,
    action_input: Option<Value>,
    final_answer: Option<String>,
}

/// Case-insensitive search for `marker` in `content`, starting at byte
/// offset `from`. Returns the byte offset of the marker's first character.
fn find_marker(content: &str, marker: &str, from: usize) -> Option<usize> {
    if from > content.len() {
        return None;
    }
    let haystack = content[from..].to_ascii_lowercase();
    let needle = marker.to_ascii_lowercase();
    haystack.find(&needle).map(|i| i + from)
}

fn section_end(content: &str, after: usize, stop_markers: &[&str]) -> usize {
    stop_markers
        .iter()
        .filter_map(|m| find_marker(content, m, after))
        .min()
        .unwrap_or(content.len())
}

fn parse_action_input(raw: &str) -> Value {
    let mut text = raw.trim();
    if let Some(stripped) = text.strip_prefix("```") {
        text = stripped.trim_start_matches(|c: char| c.is_alphanumeric()).trim_start_matches('\n');
        text = text.trim_end().trim_end_matches("```").trim();
    }

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return value;
    }

    let quote_fixed = text.replace('\'', "\"");
    if let Ok(value) = serde_json::from_str::<Value>(&quote_fixed) {
        warn!("Action Input parsed only after quote repair: {text}");
        return value;
    }

    warn!("Action Input is not valid JSON, falling back to raw text: {text}");
    serde_json::json!({ "input": text })
}

/// Parse one LLM reply into its ReAct sections (§4.7 step 2, testable
/// properties 8 and 10). `Action` dominates `Final Answer`: if an `Action:`
/// marker is present, `Final Answer:` in the same reply is never parsed.
fn parse_react_output(content: &str) -> ParsedReply {
    let Some(action_marker) = find_marker(content, MARKER_ACTION, 0) else {
        return parse_final_answer(content);
    };

    let action_text_start = action_marker + MARKER_ACTION.len();
    let action_end = section_end(content, action_text_start, &[MARKER_ACTION_INPUT, "\n"]);
    let Some(action) = content[action_text_start..action_end].split_whitespace().next() else {
        return ParsedReply::default();
    };
    let action = action.to_string();

    let action_input = find_marker(content, MARKER_ACTION_INPUT, action_text_start).map(|input_marker| {
        let input_start = input_marker + MARKER_ACTION_INPUT.len();
        let input_end = section_end(content, input_start, &[MARKER_OBSERVATION, MARKER_THOUGHT, MARKER_FINAL_ANSWER]);
        parse_action_input(&content[input_start..input_end])
    });

    ParsedReply {
        action: Some(action),
        action_input,
        final_answer: None,
    }
}

fn parse_final_answer(content: &str) -> ParsedReply {
    let Some(final_marker) = find_marker(content, MARKER_FINAL_ANSWER, 0) else {
        return ParsedReply::default();
    };
    let text = content[final_marker + MARKER_FINAL_ANSWER.len()..].trim();

    if text.is_empty() || text.starts_with('[') || text.chars().count() < MIN_FINAL_ANSWER_LEN {
        warn!("Final Answer rejected as empty or placeholder-like: {text:?}");
        return ParsedReply::default();
    }

    ParsedReply {
        action: None,
        action_input: None,
        final_answer: Some(text.to_string()),
    }
}

async fn finalize(driver: &dyn ReactDriver, llm: &dyn LLMBackend, trace: &[Message], raw_final: &str) -> String {
    let Some(schema) = driver.response_schema() else {
        return raw_final.to_string();
    };

    let schema_str = serde_json::to_string_pretty(&schema).unwrap_or_default();
    let mut messages = to_chat_messages(trace);
    messages.push(ChatMessage::new("user", driver.finalize_prompt(&schema_str)));

    let request = ChatRequest::new(messages).json_mode().with_timeout(DEFAULT_CHAT_TIMEOUT);
    match llm.chat(request).await {
        Ok(response) => {
            let raw = response.text();
            match serde_json::from_str::<Value>(raw) {
                Ok(data) => driver.format_final_output(&data),
                Err(err) => {
                    warn!("[{}] finalisation JSON unparseable, returning raw text: {err}", driver.name());
                    raw.to_string()
                }
            }
        }
        Err(err) => {
            warn!("[{}] finalisation call failed, falling back to raw Final Answer: {err}", driver.name());
            raw_final.to_string()
        }
    }
}

/// Run one full ReAct loop for `user_input` against `driver` (§4.7).
pub async fn run(driver: &dyn ReactDriver, llm: &dyn LLMBackend, user_input: &str) -> AgentResult {
    let mut trace = vec![Message::system(build_system_prompt(driver)), Message::user(user_input)];
    let mut has_called_tool = false;
    let max_iterations = driver.max_iterations();

    for iteration in 0..max_iterations {
        debug!("[{}] ReAct iteration {}/{}", driver.name(), iteration + 1, max_iterations);

        let request = ChatRequest::new(to_chat_messages(&trace)).with_timeout(DEFAULT_CHAT_TIMEOUT);
        let content = match llm.chat(request).await {
            Ok(response) => response.text().to_string(),
            Err(err) => {
                warn!("[{}] LLM call failed mid-loop: {err}", driver.name());
                trace.push(Message::user(format!("The previous request failed ({err}). Please try again.")));
                continue;
            }
        };

        let parsed = parse_react_output(&content);
        let has_action = parsed.action.is_some() && parsed.action_input.is_some();
        let has_final = parsed.final_answer.is_some();

        if has_action && has_final {
            trace.push(Message::user("Format error: Action and Final Answer cannot both appear in the same reply."));
            continue;
        }

        if has_final && !has_called_tool && !driver.toolkit().is_empty() {
            trace.push(Message::user(
                "Error: you must call a tool before producing a Final Answer. Follow the required \
                 workflow and call the necessary tool first.",
            ));
            continue;
        }

        trace.push(Message::assistant(content));

        if let Some(raw_final) = parsed.final_answer {
            let answer = finalize(driver, llm, &trace, &raw_final).await;
            driver.on_final_answer(&answer);
            info!("[{}] Final Answer accepted after {} iteration(s)", driver.name(), iteration + 1);
            return AgentResult {
                answer,
                iterations: iteration + 1,
                trace,
                success: true,
                error: None,
            };
        }

        if let (Some(action), Some(action_input)) = (parsed.action, parsed.action_input) {
            let result = driver.toolkit().call(&action, action_input).await;
            has_called_tool = true;
            trace.push(Message::user(format!("Observation: {}", result.to_text())));
            continue;
        }

        if iteration < max_iterations - 1 {
            warn!("[{}] reply had neither a valid Action nor a Final Answer", driver.name());
            trace.push(Message::user(
                "Format error: you produced a Thought with no Action and no Final Answer. \
                 Reply using exactly this shape:\n\nThought: [your reasoning]\nAction: [tool name]\n\
                 Action Input: [arguments as JSON]\n",
            ));
        }
    }

    AgentResult {
        answer: String::new(),
        iterations: max_iterations,
        trace,
        success: false,
        error: Some("Exceeded max iterations".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LLMError;
    use crate::llm::LLMResponse;
    use async_trait::async_trait;
    use lorekeeper_tools::{Tool, ToolResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn action_dominates_final_answer_in_same_reply() {
        let content = "Thought: t\nAction: foo\nAction Input: {\"x\":1}\nFinal Answer: ignored";
        let parsed = parse_react_output(content);
        assert_eq!(parsed.action.as_deref(), Some("foo"));
        assert_eq!(parsed.action_input, Some(serde_json::json!({"x": 1})));
        assert!(parsed.final_answer.is_none());
    }

    #[test]
    fn rejects_placeholder_and_short_final_answers() {
        assert!(parse_react_output("Final Answer: [example]").final_answer.is_none());
        assert!(parse_react_output("Final Answer: hi").final_answer.is_none());
        assert!(parse_react_output("Final Answer: hello there").final_answer.is_some());
    }

    #[test]
    fn action_input_repairs_single_quotes_then_falls_back_to_raw_text() {
        let content = "Action: foo\nAction Input: {'x': 1}";
        let parsed = parse_react_output(content);
        assert_eq!(parsed.action_input, Some(serde_json::json!({"x": 1})));

        let content = "Action: foo\nAction Input: not json at all";
        let parsed = parse_react_output(content);
        assert_eq!(parsed.action_input, Some(serde_json::json!({"input": "not json at all"})));
    }

    struct EchoTool;
    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes input"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, args: Value) -> ToolResult {
            ToolResult::ok(args)
        }
    }

    struct ScriptedLLM {
        replies: Mutex<Vec<&'static str>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LLMBackend for ScriptedLLM {
        async fn chat(&self, _request: ChatRequest) -> Result<LLMResponse, LLMError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            let content = if replies.is_empty() { String::new() } else { replies.remove(0).to_string() };
            Ok(LLMResponse {
                content: Some(content),
                finish_reason: Some("stop".into()),
                usage: None,
            })
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, LLMError> {
            Ok(vec![])
        }
    }

    struct TestDriver {
        toolkit: Toolkit,
        max_iterations: usize,
    }

    impl ReactDriver for TestDriver {
        fn name(&self) -> &str {
            "test"
        }
        fn system_prompt(&self) -> String {
            "you are a test agent".to_string()
        }
        fn toolkit(&self) -> &Toolkit {
            &self.toolkit
        }
        fn max_iterations(&self) -> usize {
            self.max_iterations
        }
    }

    #[tokio::test]
    async fn repair_loop_invokes_tool_exactly_once_after_one_correction() {
        let llm = ScriptedLLM {
            replies: Mutex::new(vec![
                "Thought: thinking",
                "Thought: now acting\nAction: echo\nAction Input: {\"a\":1}",
                "Thought: done\nFinal Answer: the final answer here",
            ]),
            calls: AtomicUsize::new(0),
        };
        let driver = TestDriver {
            toolkit: Toolkit::new().with(std::sync::Arc::new(EchoTool)),
            max_iterations: 10,
        };

        let result = run(&driver, &llm, "hello").await;
        assert!(result.success);
        assert_eq!(result.answer, "the final answer here");
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);

        let observations = result.trace.iter().filter(|m| m.content.starts_with("Observation:")).count();
        assert_eq!(observations, 1);
    }

    #[tokio::test]
    async fn early_final_answer_is_rejected_until_a_tool_has_been_called() {
        let llm = ScriptedLLM {
            replies: Mutex::new(vec![
                "Thought: t\nFinal Answer: hello there",
                "Thought: acting\nAction: echo\nAction Input: {}",
                "Thought: done\nFinal Answer: hello there again",
            ]),
            calls: AtomicUsize::new(0),
        };
        let driver = TestDriver {
            toolkit: Toolkit::new().with(std::sync::Arc::new(EchoTool)),
            max_iterations: 10,
        };

        let result = run(&driver, &llm, "hi").await;
        assert!(result.success);
        assert_eq!(result.answer, "hello there again");
    }

    #[tokio::test]
    async fn exhausting_iterations_returns_an_unsuccessful_result() {
        let llm = ScriptedLLM {
            replies: Mutex::new(vec!["Thought: stuck"; 3].into_iter().collect()),
            calls: AtomicUsize::new(0),
        };
        let driver = TestDriver {
            toolkit: Toolkit::new(),
            max_iterations: 3,
        };

        let result = run(&driver, &llm, "hi").await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Exceeded max iterations"));
        assert_eq!(result.iterations, 3);
    }
}
