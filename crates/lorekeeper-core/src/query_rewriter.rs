//! Query rewriter (C4) — three LLM-driven text transforms, each falling
//! back to its original input on any parse or transport failure (§4.4).
//! None of these operations ever returns an error to its caller.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::llm::{ChatMessage, ChatRequest, LLMBackend, DEFAULT_HELPER_TIMEOUT};

/// Temperature used for every rewrite call — low enough to keep rewrites
/// close to deterministic without pinning `seed`.
const REWRITE_TEMPERATURE: f32 = 0.3;

pub struct QueryRewriter {
    llm: Arc<dyn LLMBackend>,
}

impl QueryRewriter {
    pub fn new(llm: Arc<dyn LLMBackend>) -> Self {
        Self { llm }
    }

    /// Resolve relative time references to absolute dates and de-colloquialise,
    /// producing a single line suitable for BM25.
    pub async fn rewrite_for_mid_term(&self, query: &str) -> String {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let prompt = format!(
            "Today's date is {today}. Rewrite the following search query into a single \
             line suitable for keyword search: resolve any relative time reference \
             (e.g. \"yesterday\", \"last week\") into an absolute date, and remove \
             colloquial filler words. Reply with only the rewritten line.\n\nQuery: {query}"
        );
        self.rewrite_or_fallback(&prompt, query).await
    }

    /// Extract core semantics, stripping temporal and colloquial tokens, for
    /// an embedding-based search.
    pub async fn rewrite_for_long_term(&self, query: &str) -> String {
        let prompt = format!(
            "Rewrite the following query into a short, dense phrase capturing only its \
             core semantic content, suitable for embedding-based search. Strip temporal \
             references and colloquial phrasing. Reply with only the rewritten phrase.\n\n\
             Query: {query}"
        );
        self.rewrite_or_fallback(&prompt, query).await
    }

    /// Rewrite a memory-to-be-stored into third-person factual form so the
    /// stored vector lives in the same semantic space as long-term queries.
    /// The original `content` is preserved separately by the caller for
    /// display (`vector = embed(normalized)`, `display = content`).
    pub async fn normalize_for_storage(&self, content: &str) -> String {
        let prompt = format!(
            "Rewrite the following memory into third-person factual form, as a short \
             statement suitable for storage alongside other long-term facts. Reply with \
             only the rewritten statement.\n\nMemory: {content}"
        );
        self.rewrite_or_fallback(&prompt, content).await
    }

    async fn rewrite_or_fallback(&self, prompt: &str, original: &str) -> String {
        let request = ChatRequest::new(vec![ChatMessage::new("user", prompt)])
            .with_temperature(REWRITE_TEMPERATURE)
            .with_timeout(DEFAULT_HELPER_TIMEOUT);

        match self.llm.chat(request).await {
            Ok(response) => {
                let text = response.text().trim();
                if text.is_empty() {
                    original.to_string()
                } else {
                    text.to_string()
                }
            }
            Err(err) => {
                warn!("query rewrite failed, falling back to original input: {err}");
                original.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LLMError;
    use crate::llm::LLMResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FailingLLM;
    #[async_trait]
    impl LLMBackend for FailingLLM {
        async fn chat(&self, _request: ChatRequest) -> Result<LLMResponse, LLMError> {
            Err(LLMError::Transport("boom".into()))
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, LLMError> {
            Err(LLMError::Transport("boom".into()))
        }
    }

    struct EchoLLM {
        called: AtomicBool,
    }
    #[async_trait]
    impl LLMBackend for EchoLLM {
        async fn chat(&self, request: ChatRequest) -> Result<LLMResponse, LLMError> {
            self.called.store(true, Ordering::SeqCst);
            Ok(LLMResponse {
                content: Some(format!("rewritten: {}", request.messages[0].content)),
                finish_reason: Some("stop".into()),
                usage: None,
            })
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, LLMError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn falls_back_to_original_on_transport_error() {
        let rewriter = QueryRewriter::new(Arc::new(FailingLLM));
        let out = rewriter.rewrite_for_mid_term("what did I say yesterday").await;
        assert_eq!(out, "what did I say yesterday");
    }

    #[tokio::test]
    async fn uses_llm_output_on_success() {
        let rewriter = QueryRewriter::new(Arc::new(EchoLLM {
            called: AtomicBool::new(false),
        }));
        let out = rewriter.normalize_for_storage("I like pizza").await;
        assert!(out.starts_with("rewritten:"));
    }
}
