//! Tool & Toolkit — the declarative tool contract every agent dispatches through.
//!
//! A [`Tool`] is called by name with a JSON object of named arguments. The
//! [`Toolkit`] that owns a set of tools guarantees unknown-tool calls and
//! tool-internal failures never propagate as panics: everything comes back
//! as a [`ToolResult`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::Semaphore;

/// Default number of tool calls a [`Toolkit`] will run concurrently in one batch.
pub const DEFAULT_BATCH_WORKERS: usize = 5;

/// Outcome of a single tool invocation.
///
/// `data` for the `Ok` variant is any JSON-serialisable value; string
/// rendering uses the text form directly for plain strings and falls back
/// to compact JSON for structured values.
#[derive(Debug, Clone)]
pub enum ToolResult {
    Ok(Value),
    Fail(String),
}

impl ToolResult {
    pub fn ok(data: impl Into<Value>) -> Self {
        ToolResult::Ok(data.into())
    }

    pub fn ok_text(text: impl Into<String>) -> Self {
        ToolResult::Ok(Value::String(text.into()))
    }

    pub fn fail(message: impl Into<String>) -> Self {
        ToolResult::Fail(message.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolResult::Ok(_))
    }

    /// Render for inclusion in a ReAct `Observation:` line.
    pub fn to_text(&self) -> String {
        match self {
            ToolResult::Ok(Value::String(s)) => s.clone(),
            ToolResult::Ok(v) => serde_json::to_string(v).unwrap_or_else(|_| v.to_string()),
            ToolResult::Fail(msg) => format!("Error: {msg}"),
        }
    }
}

/// Immutable descriptor for one callable capability.
///
/// Implementations must be safe to call concurrently with other tools in
/// the same batch — no unsynchronised shared mutable state.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Globally unique (within one toolkit) tool name.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema describing the named-argument object this tool accepts.
    fn parameters(&self) -> Value;

    async fn execute(&self, args: Value) -> ToolResult;
}

/// A call requested by the ReAct loop, carrying the arguments already
/// parsed out of `Action Input:` plus a caller-supplied id used to restore
/// ordering after a concurrent batch.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub args: Value,
}

#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub call_id: String,
    pub result: ToolResult,
}

/// A registry of [`Tool`]s callable by name.
#[derive(Clone, Default)]
pub struct Toolkit {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Toolkit {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Comma-joined list of tool names, e.g. for an error message listing choices.
    pub fn names_joined(&self) -> String {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names.join(", ")
    }

    /// Prompt-ready description: one block per tool, name + description + schema.
    pub fn describe_for_prompt(&self) -> String {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            let tool = &self.tools[name];
            out.push_str(&format!(
                "{}:\n  Description: {}\n  Args: {}\n\n",
                tool.name(),
                tool.description(),
                tool.parameters()
            ));
        }
        out
    }

    /// Invoke one tool by name. Unknown names and execute-time failures are
    /// both captured as `ToolResult::Fail`, never a panic.
    pub async fn call(&self, tool_name: &str, args: Value) -> ToolResult {
        let Some(tool) = self.tools.get(tool_name) else {
            return ToolResult::fail(format!(
                "Unknown tool: {tool_name}. Available: [{}]",
                self.names_joined()
            ));
        };

        if !args.is_object() && !args.is_null() {
            return ToolResult::fail(format!(
                "Invalid arguments for tool '{tool_name}': expected an object, got {args}"
            ));
        }

        tool.execute(args).await
    }

    /// Execute a batch of calls concurrently with a bounded worker pool,
    /// preserving the caller-supplied order in the returned vector
    /// regardless of completion interleaving.
    pub async fn call_batch(&self, calls: Vec<ToolCall>) -> Vec<ToolCallOutcome> {
        let permits = DEFAULT_BATCH_WORKERS.min(calls.len().max(1));
        let semaphore = Arc::new(Semaphore::new(permits));

        let mut futures = FuturesUnordered::new();
        for (index, call) in calls.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let toolkit = self.clone();
            futures.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                let result = toolkit.call(&call.tool_name, call.args).await;
                (
                    index,
                    ToolCallOutcome {
                        call_id: call.call_id,
                        result,
                    },
                )
            });
        }

        let mut slots: Vec<Option<ToolCallOutcome>> = Vec::new();
        while let Some((index, outcome)) = futures.next().await {
            if slots.len() <= index {
                slots.resize_with(index + 1, || None);
            }
            slots[index] = Some(outcome);
        }

        slots.into_iter().map(|s| s.expect("every index filled")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct EchoTool {
        name: String,
        delay_ms: u64,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "echoes its input back"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, args: Value) -> ToolResult {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            ToolResult::ok(args)
        }
    }

    #[tokio::test]
    async fn unknown_tool_fails_without_panic() {
        let toolkit = Toolkit::new();
        let result = toolkit.call("does_not_exist", Value::Null).await;
        assert!(matches!(result, ToolResult::Fail(_)));
    }

    #[tokio::test]
    async fn batch_preserves_caller_order_despite_interleaving() {
        // Slower calls are placed first so completion order is reversed from
        // submission order; the returned vector must still match submission order.
        let mut toolkit = Toolkit::new();
        toolkit.register(Arc::new(EchoTool {
            name: "slow".into(),
            delay_ms: 30,
        }));
        toolkit.register(Arc::new(EchoTool {
            name: "fast".into(),
            delay_ms: 0,
        }));

        let calls = vec![
            ToolCall {
                call_id: "c1".into(),
                tool_name: "slow".into(),
                args: serde_json::json!({}),
            },
            ToolCall {
                call_id: "c2".into(),
                tool_name: "fast".into(),
                args: serde_json::json!({}),
            },
            ToolCall {
                call_id: "c3".into(),
                tool_name: "fast".into(),
                args: serde_json::json!({}),
            },
        ];

        let outcomes = toolkit.call_batch(calls).await;
        let ids: Vec<&str> = outcomes.iter().map(|o| o.call_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
    }
}
