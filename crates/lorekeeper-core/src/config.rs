//! Environment-driven configuration for every knob enumerated in the
//! external-interfaces section: LLM endpoint, timeouts, memory window
//! sizes, ranker thresholds.

use anyhow::{Context, Result};

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub llm_api_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub embedding_model: String,

    pub database_url: String,

    /// Number of user messages the System agent buffers before summarising.
    pub message_window: usize,
    /// Default ReAct iteration budget (Character agent overrides this to 5).
    pub max_iterations: usize,
    /// Number of recent mid-term summaries injected into the Memory agent prompt.
    pub recent_summaries: usize,
    /// Access-count threshold above which a mid-term record is promoted.
    pub promotion_threshold: i32,
    /// Default lookback window for mid-term search, in days.
    pub mid_term_range_days: i64,
    /// Default `limit` for `search_memory`.
    pub search_limit: usize,
    /// Minimum long-term final score to keep a result.
    pub long_term_min_score: f64,
    /// Minimum long-term importance to keep a result.
    pub long_term_min_importance: f64,

    pub chat_timeout_secs: u64,
    pub stream_timeout_secs: u64,
    pub helper_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            llm_api_url: std::env::var("LOREKEEPER_LLM_API_URL")
                .unwrap_or_else(|_| "http://localhost:8080/v1".to_string()),
            llm_api_key: std::env::var("LOREKEEPER_LLM_API_KEY").ok(),
            llm_model: std::env::var("LOREKEEPER_LLM_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            embedding_model: std::env::var("LOREKEEPER_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),

            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,

            message_window: env_parse("LOREKEEPER_MESSAGE_WINDOW", 20),
            max_iterations: env_parse("LOREKEEPER_MAX_ITERATIONS", 10),
            recent_summaries: env_parse("LOREKEEPER_RECENT_SUMMARIES", 3),
            promotion_threshold: env_parse("LOREKEEPER_PROMOTION_THRESHOLD", 3),
            mid_term_range_days: env_parse("LOREKEEPER_MID_TERM_RANGE_DAYS", 30),
            search_limit: env_parse("LOREKEEPER_SEARCH_LIMIT", 5),
            long_term_min_score: env_parse("LOREKEEPER_LONG_TERM_MIN_SCORE", 0.1),
            long_term_min_importance: env_parse("LOREKEEPER_LONG_TERM_MIN_IMPORTANCE", 1.0),

            chat_timeout_secs: env_parse("LOREKEEPER_CHAT_TIMEOUT_SECS", 60),
            stream_timeout_secs: env_parse("LOREKEEPER_STREAM_TIMEOUT_SECS", 300),
            helper_timeout_secs: env_parse("LOREKEEPER_HELPER_TIMEOUT_SECS", 30),
        })
    }
}

/// Fixed character-agent iteration budget; the spec pins this independently
/// of `Config::max_iterations`.
pub const CHARACTER_MAX_ITERATIONS: usize = 5;
