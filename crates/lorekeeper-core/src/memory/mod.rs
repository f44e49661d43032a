//! Memory manager (C6) — orchestrates recall, rank, dedup, store, and
//! promotion across the mid-term (BM25) and long-term (vector) tiers
//! (§4.6). This is the only caller of [`crate::ranker`], [`crate::bm25`]
//! (indirectly, through the ranker), and [`crate::query_rewriter`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::llm::LLMBackend;
use crate::message::Message;
use crate::query_rewriter::QueryRewriter;
use crate::ranker::{dedup_keep_highest, MemorySource, RankItem, Ranker};
use crate::storage::{partition_for, LongTermRecord, NewLongTermRecord, NewMidTermRecord, StorageBackend};

/// Ranker's coarse cut before the memory manager's own filter/limit pass.
const COARSE_RANK_LIMIT: usize = 100;
/// Over-recall factor applied to the ANN `top_k` before exact filtering.
const VECTOR_OVER_RECALL_FACTOR: i64 = 3;
/// Mid-term read path always loads at most this many recent rows,
/// regardless of query (§9 open question — preserved verbatim).
const MID_TERM_PRELOAD_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Preference,
    Fact,
    Event,
    Promoted,
}

impl MemoryType {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryType::Preference => "preference",
            MemoryType::Fact => "fact",
            MemoryType::Event => "event",
            MemoryType::Promoted => "promoted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "preference" => Some(MemoryType::Preference),
            "fact" => Some(MemoryType::Fact),
            "event" => Some(MemoryType::Event),
            "promoted" => Some(MemoryType::Promoted),
            _ => None,
        }
    }
}

/// Flatten a `raw_messages` JSON array (as stored on a `MidTermRecord` or a
/// long-term `extra.raw_messages`) into newline-joined display text.
fn raw_messages_text(raw: &Value) -> String {
    let Some(array) = raw.as_array() else {
        return String::new();
    };
    array
        .iter()
        .filter_map(|entry| {
            let role = entry.get("role").and_then(Value::as_str).unwrap_or("?");
            let content = entry.get("content").and_then(Value::as_str)?;
            Some(format!("{role}: {content}"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct MemoryManager {
    bot_id: String,
    storage: Arc<dyn StorageBackend>,
    llm: Arc<dyn LLMBackend>,
    rewriter: QueryRewriter,
    mid_term_range_days: i64,
    search_limit: usize,
    long_term_min_score: f64,
    long_term_min_importance: f64,
    promotion_threshold: i32,
    /// In-process, session-scoped access counters driving promotion (§4.6,
    /// §9): intentionally not persisted — promotion is a hint, not a
    /// guarantee, and is lost on process restart.
    access_counters: TokioMutex<HashMap<Uuid, i32>>,
}

impl MemoryManager {
    pub fn new(bot_id: impl Into<String>, storage: Arc<dyn StorageBackend>, llm: Arc<dyn LLMBackend>, config: &Config) -> Self {
        Self {
            bot_id: bot_id.into(),
            storage,
            rewriter: QueryRewriter::new(llm.clone()),
            llm,
            mid_term_range_days: config.mid_term_range_days,
            search_limit: config.search_limit,
            long_term_min_score: config.long_term_min_score,
            long_term_min_importance: config.long_term_min_importance,
            promotion_threshold: config.promotion_threshold,
            access_counters: TokioMutex::new(HashMap::new()),
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    // ---- write paths --------------------------------------------------

    /// Store a long-term fact. Returns `None` (logged) on any embedding or
    /// storage failure — callers treat this like any other tool failure.
    pub async fn store_long_term(
        &self,
        user_id: &str,
        content: &str,
        memory_type: MemoryType,
        importance: i32,
        tags: Vec<String>,
    ) -> Option<Uuid> {
        let importance = importance.clamp(1, 10);
        let normalized = self.rewriter.normalize_for_storage(content).await;

        let vector = match self.llm.embed(&[normalized.clone()]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
            Ok(_) => {
                warn!("embed returned no vectors for long-term store");
                return None;
            }
            Err(err) => {
                warn!("failed to embed normalized content for long-term store: {err}");
                return None;
            }
        };

        let extra = serde_json::json!({
            "importance": importance,
            "tags": tags,
            "source": "agent",
            "normalized_content": normalized,
        });

        match self
            .storage
            .insert_long_term(NewLongTermRecord {
                bot_id: self.bot_id.clone(),
                user_id: user_id.to_string(),
                memory_type: memory_type.as_str().to_string(),
                content: content.to_string(),
                vector,
                extra,
            })
            .await
        {
            Ok(id) => {
                debug!(%id, %user_id, memory_type = memory_type.as_str(), "stored long-term memory");
                Some(id)
            }
            Err(err) => {
                warn!("failed to insert long-term memory: {err}");
                None
            }
        }
    }

    /// Summarise a dialogue window into one mid-term record. `messages` is
    /// the full raw turn list (may include tool turns).
    pub async fn save_summary(&self, user_id: &str, messages: &[Message]) -> Option<Uuid> {
        if messages.is_empty() {
            return None;
        }

        let transcript = messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let (summary, keywords) = self.summarize(&transcript).await;

        let start_time = messages.first().and_then(|m| m.timestamp).unwrap_or_else(Utc::now);
        let end_time = messages.last().and_then(|m| m.timestamp).unwrap_or_else(Utc::now);
        let raw_messages = serde_json::to_value(messages).unwrap_or(Value::Null);

        let row = NewMidTermRecord {
            bot_id: self.bot_id.clone(),
            user_id: user_id.to_string(),
            summary,
            keywords,
            raw_messages,
            message_count: messages.len() as i32,
            start_time,
            end_time,
            access_count: 0,
            created_at: Utc::now(),
        };

        match self.storage.insert_mid_term(row).await {
            Ok(id) => {
                info!(%id, %user_id, "saved dialogue-window summary to mid-term memory");
                Some(id)
            }
            Err(err) => {
                warn!("failed to insert mid-term summary: {err}");
                None
            }
        }
    }

    async fn summarize(&self, transcript: &str) -> (String, String) {
        use crate::llm::{ChatMessage, ChatRequest, DEFAULT_HELPER_TIMEOUT};

        let prompt = format!(
            "Summarize the following dialogue in at most 200 characters, and list a \
             handful of comma-separated keywords. Reply with bare JSON only, no markdown \
             fences, in the form {{\"summary\": \"...\", \"keywords\": \"...\"}}.\n\n{transcript}"
        );
        let request = ChatRequest::new(vec![ChatMessage::new("user", prompt)])
            .with_temperature(0.3)
            .json_mode()
            .with_timeout(DEFAULT_HELPER_TIMEOUT);

        let fallback = || {
            let truncated: String = transcript.chars().take(200).collect();
            (truncated, String::new())
        };

        match self.llm.chat(request).await {
            Ok(response) => match serde_json::from_str::<Value>(response.text()) {
                Ok(parsed) => {
                    let summary = parsed.get("summary").and_then(Value::as_str).map(str::to_string);
                    let keywords = parsed.get("keywords").and_then(Value::as_str).map(str::to_string);
                    match (summary, keywords) {
                        (Some(s), Some(k)) => (s, k),
                        _ => fallback(),
                    }
                }
                Err(err) => {
                    warn!("failed to parse summarizer JSON, falling back to truncated transcript: {err}");
                    fallback()
                }
            },
            Err(err) => {
                warn!("summarizer LLM call failed, falling back to truncated transcript: {err}");
                fallback()
            }
        }
    }

    /// The `N` most recent mid-term summaries for `user_id`, newest first —
    /// used by the Memory agent (C9) to seed its system prompt on entry.
    /// Unlike [`Self::search_mid_term`] this is not query-driven and does
    /// not affect access counters or promotion.
    pub async fn recent_summaries(&self, user_id: &str, limit: usize) -> Vec<String> {
        let since = Utc::now() - Duration::days(self.mid_term_range_days);
        match self.storage.recent_mid_term(&self.bot_id, user_id, since, limit as i64).await {
            Ok(rows) => rows.into_iter().map(|r| r.summary).collect(),
            Err(err) => {
                warn!("failed to load recent summaries: {err}");
                Vec::new()
            }
        }
    }

    // ---- read paths -----------------------------------------------------

    /// Mid-term read path (§4.6): rewrite → load recent rows → rank → bump
    /// access counters (both the persisted column and the in-process
    /// promotion counter) → lazily promote.
    pub async fn search_mid_term(&self, user_id: &str, query: &str, time_range_days: Option<i64>, limit: Option<usize>) -> Vec<RankItem> {
        let rewritten = self.rewriter.rewrite_for_mid_term(query).await;
        let since = Utc::now() - Duration::days(time_range_days.unwrap_or(self.mid_term_range_days));

        let rows = match self
            .storage
            .recent_mid_term(&self.bot_id, user_id, since, MID_TERM_PRELOAD_LIMIT)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!("mid-term load failed: {err}");
                return Vec::new();
            }
        };

        let items: Vec<RankItem> = rows
            .iter()
            .map(|row| RankItem {
                id: row.id.to_string(),
                source: MemorySource::MidTerm,
                content: row.summary.clone(),
                raw_content: Some(raw_messages_text(&row.raw_messages)),
                bm25_score: 0.0,
                vector_score: 0.0,
                final_score: 0.0,
                created_at: row.created_at,
                access_count: row.access_count,
                importance: 0.0,
                keywords: row.keywords.clone(),
                metadata: Value::Null,
            })
            .collect();

        let ranked = Ranker::rank_mid_term(&rewritten, items, limit.unwrap_or(self.search_limit), Utc::now());

        for item in &ranked {
            let Ok(id) = item.id.parse::<Uuid>() else { continue };
            if let Err(err) = self.storage.increment_mid_term_access(id).await {
                warn!(%id, "failed to bump mid-term access_count: {err}");
            }
            let mut counters = self.access_counters.lock().await;
            *counters.entry(id).or_insert(0) += 1;
        }

        self.promote_pending(user_id).await;

        ranked
    }

    /// Long-term read path (§4.6): rewrite → embed → ANN over-recall search
    /// → exact `user_id`/`memory_type` filter → coarse rank → dedup → final
    /// score/importance filter → top `limit`.
    pub async fn search_long_term(
        &self,
        user_id: &str,
        query: &str,
        memory_type: Option<MemoryType>,
        limit: Option<usize>,
    ) -> Vec<RankItem> {
        let limit = limit.unwrap_or(self.search_limit);
        let rewritten = self.rewriter.rewrite_for_long_term(query).await;

        let vector = match self.llm.embed(&[rewritten.clone()]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
            _ => {
                warn!("failed to embed long-term query, returning no results");
                return Vec::new();
            }
        };

        let partition = partition_for(&self.bot_id);
        let top_k = VECTOR_OVER_RECALL_FACTOR * limit as i64;
        let hits = match self.storage.search_long_term(&self.bot_id, &vector, top_k).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(%partition, "long-term ANN search failed: {err}");
                return Vec::new();
            }
        };

        let items: Vec<RankItem> = hits
            .into_iter()
            .filter(|hit| hit.record.user_id == user_id)
            .filter(|hit| {
                memory_type
                    .map(|mt| hit.record.memory_type == mt.as_str())
                    .unwrap_or(true)
            })
            .map(|hit| Self::rank_item_from_long_term(hit.record, hit.score))
            .collect();

        let ranked = Ranker::rank_long_term(&rewritten, items, COARSE_RANK_LIMIT, Utc::now());
        let deduped = dedup_keep_highest(ranked, |i| i.final_score);

        let mut filtered: Vec<RankItem> = deduped
            .into_iter()
            .filter(|i| i.final_score >= self.long_term_min_score && i.importance >= self.long_term_min_importance)
            .collect();
        filtered.truncate(limit);
        filtered
    }

    fn rank_item_from_long_term(record: LongTermRecord, vector_score: f64) -> RankItem {
        let source = record.extra.get("source").and_then(Value::as_str).unwrap_or("agent");
        let raw_content = if source == "mid_term" {
            record
                .extra
                .get("raw_messages")
                .map(raw_messages_text)
                .or_else(|| Some(record.content.clone()))
        } else {
            Some(record.content.clone())
        };
        let importance = record
            .extra
            .get("importance")
            .and_then(Value::as_f64)
            .unwrap_or(5.0);
        let keywords = record
            .extra
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();

        RankItem {
            id: record.id.to_string(),
            source: MemorySource::LongTerm,
            content: record.content,
            raw_content,
            bm25_score: 0.0,
            vector_score,
            final_score: 0.0,
            created_at: record.created_at,
            access_count: 0,
            importance,
            keywords,
            metadata: record.extra,
        }
    }

    // ---- promotion -------------------------------------------------------

    /// Promote any mid-term record whose in-process access counter has
    /// reached `promotion_threshold` into a long-term `promoted` record,
    /// then delete the mid-term row. Best-effort: failures are logged and
    /// never propagate (§4.6, §7).
    pub async fn promote_pending(&self, user_id: &str) {
        let candidates: Vec<Uuid> = {
            let counters = self.access_counters.lock().await;
            counters
                .iter()
                .filter(|(_, &count)| count >= self.promotion_threshold)
                .map(|(id, _)| *id)
                .collect()
        };

        for id in candidates {
            match self.promote_one(user_id, id).await {
                Ok(()) => {
                    self.access_counters.lock().await.remove(&id);
                }
                Err(err) => {
                    warn!(%id, "promotion failed, will retry on next read: {err}");
                }
            }
        }
    }

    async fn promote_one(&self, user_id: &str, mid_id: Uuid) -> anyhow::Result<()> {
        let Some(record) = self.storage.fetch_mid_term(mid_id).await? else {
            return Ok(());
        };

        let normalized = self.rewriter.normalize_for_storage(&record.summary).await;
        let mut vectors = self
            .llm
            .embed(&[normalized.clone()])
            .await
            .map_err(|e| anyhow::anyhow!("embed failed during promotion: {e}"))?;
        if vectors.is_empty() {
            anyhow::bail!("embed returned no vectors during promotion");
        }
        let vector = vectors.remove(0);

        let extra = serde_json::json!({
            "importance": 5,
            "tags": [],
            "source": "mid_term",
            "source_id": mid_id.to_string(),
            "normalized_content": normalized,
            "raw_messages": record.raw_messages,
        });

        self.storage
            .insert_long_term(NewLongTermRecord {
                bot_id: self.bot_id.clone(),
                user_id: user_id.to_string(),
                memory_type: MemoryType::Promoted.as_str().to_string(),
                content: record.summary.clone(),
                vector,
                extra,
            })
            .await?;

        self.storage.delete_mid_term(mid_id).await?;
        info!(%mid_id, "promoted mid-term record to long-term memory");
        Ok(())
    }

    /// Flush any pending promotions. Called on session close in addition to
    /// the lazy trigger inside `search_mid_term` (§4.6).
    pub async fn close(&self, user_id: &str) {
        self.promote_pending(user_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LLMError;
    use crate::llm::{ChatRequest, LLMResponse};
    use crate::storage::InMemoryStorageBackend;
    use async_trait::async_trait;

    fn test_config() -> Config {
        Config {
            llm_api_url: "http://localhost".to_string(),
            llm_api_key: None,
            llm_model: "test".to_string(),
            embedding_model: "test".to_string(),
            database_url: "test".to_string(),
            message_window: 20,
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

    /// Deterministic stand-in for an embedding/chat backend: `embed` turns
    /// each text's byte length into a fixed-width vector (so distinct inputs
    /// reliably produce distinct vectors without a real model), `chat` just
    /// echoes its prompt back as the "normalized"/"summary" text so tests
    /// can assert on exactly what was passed through.
    struct DeterministicLLM;

    #[async_trait]
    impl LLMBackend for DeterministicLLM {
        async fn chat(&self, request: ChatRequest) -> Result<LLMResponse, LLMError> {
            let prompt = &request.messages[0].content;
            let content = if prompt.contains("\"summary\"") {
                serde_json::json!({"summary": "user likes pizza", "keywords": "pizza, food"}).to_string()
            } else {
                format!("normalized: {prompt}")
            };
            Ok(LLMResponse {
                content: Some(content),
                finish_reason: Some("stop".into()),
                usage: None,
            })
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LLMError> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0, 0.0]).collect())
        }
    }

    #[test]
    fn raw_messages_text_joins_role_and_content() {
        let raw = serde_json::json!([
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"},
        ]);
        assert_eq!(raw_messages_text(&raw), "user: hi\nassistant: hello");
    }

    #[test]
    fn memory_type_roundtrips() {
        for mt in [MemoryType::Preference, MemoryType::Fact, MemoryType::Event, MemoryType::Promoted] {
            assert_eq!(MemoryType::parse(mt.as_str()), Some(mt));
        }
        assert_eq!(MemoryType::parse("nonsense"), None);
    }

    /// §8 property 6: the inserted record's vector equals
    /// `embed(normalize_for_storage(content))` and its `content` equals the
    /// original argument, not the normalized form.
    #[tokio::test]
    async fn store_long_term_vector_matches_normalized_content() {
        let storage = Arc::new(InMemoryStorageBackend::new());
        let llm: Arc<dyn LLMBackend> = Arc::new(DeterministicLLM);
        let manager = MemoryManager::new("bot1", storage.clone(), llm.clone(), &test_config());

        let id = manager
            .store_long_term("user1", "I like pizza", MemoryType::Fact, 50, vec!["food".into()])
            .await
            .expect("store should succeed");

        let rows = storage.long_term_rows();
        let row = rows.iter().find(|r| r.id == id).expect("row present");
        assert_eq!(row.content, "I like pizza");

        let normalized = row.extra.get("normalized_content").and_then(Value::as_str).unwrap();
        assert!(normalized.starts_with("normalized: "));

        let expected_vector = llm.embed(&[normalized.to_string()]).await.unwrap().remove(0);
        let stored_vector: Vec<f32> = row
            .extra
            .get("__vector")
            .and_then(Value::as_array)
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap() as f32)
            .collect();
        assert_eq!(stored_vector, expected_vector);

        // importance is clamped into [1, 10]
        assert_eq!(row.extra.get("importance").and_then(Value::as_i64), Some(10));
    }

    #[tokio::test]
    async fn promotion_moves_mid_term_row_to_long_term_and_deletes_it() {
        let storage = Arc::new(InMemoryStorageBackend::new());
        let llm: Arc<dyn LLMBackend> = Arc::new(DeterministicLLM);
        let mut config = test_config();
        config.promotion_threshold = 2;
        let manager = MemoryManager::new("bot1", storage.clone(), llm, &config);

        let mid_id = manager
            .save_summary(
                "user1",
                &[Message::user("hello"), Message::assistant("hi there")],
            )
            .await
            .expect("summary saved");

        // Two searches bump the in-process counter to the threshold and
        // trigger lazy promotion on the second call.
        manager.search_mid_term("user1", "hello", None, None).await;
        manager.search_mid_term("user1", "hello", None, None).await;

        assert!(storage.mid_term_rows().iter().all(|r| r.id != mid_id));
        let promoted = storage
            .long_term_rows()
            .into_iter()
            .find(|r| r.memory_type == MemoryType::Promoted.as_str())
            .expect("promoted row present");
        assert_eq!(promoted.extra.get("source").and_then(Value::as_str), Some("mid_term"));
    }
}
