//! Typed errors at the two backend trait boundaries (§6 `LLMBackend`,
//! `StorageBackend`). Everything above those boundaries deals in
//! `anyhow::Result` or in `ToolResult::Fail` — the ReAct loop never sees a
//! typed error, only text, per the transport-error contract in §7.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("LLM request timed out after {0}s")]
    Timeout(u64),
    #[error("LLM transport error: {0}")]
    Transport(String),
    #[error("LLM returned an unexpected response shape: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage transport error: {0}")]
    Transport(String),
    #[error("storage query error: {0}")]
    Query(String),
    #[error("record not found: {0}")]
    NotFound(String),
}
