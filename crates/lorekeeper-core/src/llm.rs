//! LLM facade (C2) — a thin, typed wrapper over whatever backend actually
//! serves completions and embeddings.
//!
//! The ReAct loop (see `react.rs`) never uses the backend's native
//! function-calling protocol: it always sends plain messages and parses
//! free-form text. The `tools` parameter on [`LLMBackend::chat`] exists for
//! wire-format fidelity with a real backend but is never populated by this
//! crate's own callers.

use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::LLMError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub response_format_json: bool,
    pub seed: Option<i64>,
    pub timeout: Option<Duration>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn json_mode(mut self) -> Self {
        self.response_format_json = true;
        self
    }

    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct LLMResponse {
    pub content: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl LLMResponse {
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Default timeout for a non-streaming chat call.
pub const DEFAULT_CHAT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default timeout for a streaming chat call.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);
/// Default timeout for background helper calls (emotion analysis, summarisation).
pub const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_secs(30);

/// A finite, non-restartable lazy sequence of text chunks (§4.2).
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String, LLMError>> + Send>>;

/// External collaborator: the language-model and embedding backend. Any
/// backend error surfaces as `LLMError`; the caller (always the ReAct loop
/// or a query-rewriter/ranker helper) decides whether to retry or fall back.
///
/// The ReAct loop itself never calls [`Self::stream`] — §4.7 step 1 is
/// explicitly non-streaming — but the facade exposes it as its own
/// documented operation alongside `chat`/`embed` per §4.2/§6. The default
/// implementation here degrades gracefully for any backend that hasn't
/// bothered to implement real incremental delivery: it runs one ordinary
/// `chat` call and republishes the whole reply as a single-item stream.
#[async_trait]
pub trait LLMBackend: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<LLMResponse, LLMError>;

    async fn stream(&self, request: ChatRequest) -> Result<ChatStream, LLMError> {
        let text = self.chat(request).await?.text().to_string();
        Ok(Box::pin(futures::stream::once(async move { Ok(text) })))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LLMError>;
}

/// reqwest-backed implementation of [`LLMBackend`] against an
/// OpenAI-compatible chat-completions + embeddings HTTP surface.
pub struct HttpLLMBackend {
    api_url: String,
    api_key: Option<String>,
    chat_model: String,
    embedding_model: String,
    client: reqwest::Client,
}

impl HttpLLMBackend {
    pub fn new(
        api_url: impl Into<String>,
        api_key: Option<String>,
        chat_model: impl Into<String>,
        embedding_model: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            api_key,
            chat_model: chat_model.into(),
            embedding_model: embedding_model.into(),
            client: reqwest::Client::new(),
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }
}

#[async_trait]
impl LLMBackend for HttpLLMBackend {
    async fn chat(&self, request: ChatRequest) -> Result<LLMResponse, LLMError> {
        let mut body = serde_json::json!({
            "model": self.chat_model,
            "messages": request.messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(mt) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(mt);
        }
        if let Some(seed) = request.seed {
            body["seed"] = serde_json::json!(seed);
        }
        if request.response_format_json {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let timeout = request.timeout.unwrap_or(DEFAULT_CHAT_TIMEOUT);
        let req = self
            .authed(self.client.post(format!("{}/chat/completions", self.api_url)))
            .json(&body)
            .timeout(timeout);

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                LLMError::Timeout(timeout.as_secs())
            } else {
                LLMError::Transport(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            return Err(LLMError::Transport(format!(
                "chat completion returned status {}",
                resp.status()
            )));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| LLMError::MalformedResponse(e.to_string()))?;

        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string);
        let finish_reason = json["choices"][0]["finish_reason"]
            .as_str()
            .map(str::to_string);
        let usage = json.get("usage").map(|u| Usage {
            prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });

        Ok(LLMResponse {
            content,
            finish_reason,
            usage,
        })
    }

    /// Real incremental delivery against an OpenAI-compatible
    /// `text/event-stream` response: `data: {json chunk}` lines terminated
    /// by a literal `data: [DONE]`, each chunk's `choices[0].delta.content`
    /// republished as one stream item.
    async fn stream(&self, request: ChatRequest) -> Result<ChatStream, LLMError> {
        let mut body = serde_json::json!({
            "model": self.chat_model,
            "messages": request.messages,
            "stream": true,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(mt) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(mt);
        }
        if let Some(seed) = request.seed {
            body["seed"] = serde_json::json!(seed);
        }

        let timeout = request.timeout.unwrap_or(DEFAULT_STREAM_TIMEOUT);
        let req = self
            .authed(self.client.post(format!("{}/chat/completions", self.api_url)))
            .json(&body)
            .timeout(timeout);

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                LLMError::Timeout(timeout.as_secs())
            } else {
                LLMError::Transport(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            return Err(LLMError::Transport(format!(
                "chat completion (stream) returned status {}",
                resp.status()
            )));
        }

        let mut byte_stream = resp.bytes_stream();
        let chunks = try_stream! {
            let mut buffer = String::new();
            while let Some(next) = byte_stream.next().await {
                let bytes = next.map_err(|e| LLMError::Transport(e.to_string()))?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer.drain(..=line_end);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        return;
                    }
                    let Ok(parsed) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };
                    if let Some(text) = parsed["choices"][0]["delta"]["content"].as_str() {
                        if !text.is_empty() {
                            yield text.to_string();
                        }
                    }
                }
            }
        };

        Ok(Box::pin(chunks))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LLMError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let req = self
            .authed(self.client.post(format!("{}/embeddings", self.api_url)))
            .json(&serde_json::json!({
                "model": self.embedding_model,
                "input": texts,
                "encoding_format": "float",
            }))
            .timeout(DEFAULT_HELPER_TIMEOUT);

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("embedding request failed: {e}");
                return Err(LLMError::Transport(e.to_string()));
            }
        };

        if !resp.status().is_success() {
            return Err(LLMError::Transport(format!(
                "embeddings endpoint returned status {}",
                resp.status()
            )));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| LLMError::MalformedResponse(e.to_string()))?;

        let data = json["data"]
            .as_array()
            .ok_or_else(|| LLMError::MalformedResponse("missing data array".into()))?;

        let vectors = data
            .iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_f64().map(|f| f as f32))
                            .collect::<Vec<f32>>()
                    })
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>();

        if vectors.len() != texts.len() {
            return Err(LLMError::MalformedResponse(
                "embedding count mismatch".into(),
            ));
        }

        Ok(vectors)
    }
}
