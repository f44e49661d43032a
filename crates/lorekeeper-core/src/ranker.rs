//! Ranker (C5) — coarse + fine re-ranking for both memory tiers (§4.5).
//!
//! Operates purely on in-memory [`RankItem`]s; it never talks to storage or
//! the LLM. [`crate::memory`] is the only caller.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::bm25::{tokenize, Bm25Document, Bm25Index};

pub const MID_TERM_BM25_WEIGHT: f64 = 0.6;
pub const MID_TERM_TIME_WEIGHT: f64 = 0.3;
pub const MID_TERM_ACCESS_WEIGHT: f64 = 0.1;
pub const MID_TERM_TIME_HORIZON_SECS: f64 = 30.0 * 86_400.0;

pub const LONG_TERM_VECTOR_WEIGHT: f64 = 0.5;
pub const LONG_TERM_IMPORTANCE_WEIGHT: f64 = 0.25;
pub const LONG_TERM_CONTEXT_WEIGHT: f64 = 0.15;
pub const LONG_TERM_TIME_WEIGHT: f64 = 0.1;
pub const LONG_TERM_TIME_HORIZON_SECS: f64 = 365.0 * 86_400.0;

pub const TIME_DECAY_FLOOR: f64 = 0.1;
pub const SMALL_CORPUS_THRESHOLD: usize = 3;
pub const DEFAULT_MIN_SCORE_THRESHOLD: f64 = 0.1;
pub const SMALL_CORPUS_MIN_SCORE_THRESHOLD: f64 = 0.01;
pub const DEDUP_PREFIX_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySource {
    MidTerm,
    LongTerm,
}

/// Unified in-memory record consumed by the ranker regardless of source
/// tier (§3). Never persisted.
#[derive(Debug, Clone)]
pub struct RankItem {
    pub id: String,
    pub source: MemorySource,
    pub content: String,
    pub raw_content: Option<String>,
    pub bm25_score: f64,
    pub vector_score: f64,
    pub final_score: f64,
    pub created_at: DateTime<Utc>,
    pub access_count: i32,
    pub importance: f64,
    pub keywords: String,
    pub metadata: Value,
}

/// `1 − age/horizon` clamped to `[TIME_DECAY_FLOOR, 1.0]`. A non-positive
/// (unset / epoch sentinel) timestamp short-circuits to `0.5` rather than
/// producing a spuriously extreme score (§4.5 supplement).
pub fn time_decay(created_at: DateTime<Utc>, now: DateTime<Utc>, horizon_secs: f64) -> f64 {
    if created_at.timestamp() <= 0 {
        return 0.5;
    }
    let age_seconds = (now - created_at).num_seconds().max(0) as f64;
    (1.0 - age_seconds / horizon_secs).clamp(TIME_DECAY_FLOOR, 1.0)
}

/// Exact mid-term weighting formula (§8 property 4), exposed standalone so
/// it is directly testable without constructing a full `RankItem` batch.
pub fn mid_term_final_score(bm25: f64, time_decay: f64, access: f64) -> f64 {
    MID_TERM_BM25_WEIGHT * bm25 + MID_TERM_TIME_WEIGHT * time_decay + MID_TERM_ACCESS_WEIGHT * access
}

fn dedup_key(content: &str) -> String {
    content.chars().take(DEDUP_PREFIX_LEN).collect()
}

/// Deduplicate on the first `DEDUP_PREFIX_LEN` characters of `content`,
/// keeping the item `score_of` ranks highest per group (§8 property 5).
pub fn dedup_keep_highest(items: Vec<RankItem>, score_of: impl Fn(&RankItem) -> f64) -> Vec<RankItem> {
    let mut best: HashMap<String, RankItem> = HashMap::new();
    for item in items {
        let key = dedup_key(&item.content);
        match best.get(&key) {
            Some(existing) if score_of(existing) >= score_of(&item) => {}
            _ => {
                best.insert(key, item);
            }
        }
    }
    let mut out: Vec<RankItem> = best.into_values().collect();
    out.sort_by(|a, b| score_of(b).partial_cmp(&score_of(a)).unwrap_or(std::cmp::Ordering::Equal));
    out
}

pub struct Ranker;

impl Ranker {
    /// Mid-term ranking: BM25 (normalised to the batch max) + time decay +
    /// access frequency, deduplicated, sorted, truncated to `top_k` (§4.5).
    pub fn rank_mid_term(query: &str, items: Vec<RankItem>, top_k: usize, now: DateTime<Utc>) -> Vec<RankItem> {
        if items.is_empty() {
            return items;
        }

        let docs: Vec<Bm25Document> = items
            .iter()
            .map(|item| Bm25Document {
                id: item.id.clone(),
                text: item.raw_content.clone().unwrap_or_else(|| item.content.clone()),
                keywords: item.keywords.clone(),
            })
            .collect();
        let index = Bm25Index::fit(&docs);
        let raw_scores = index.score(query);
        let max_bm25 = raw_scores.values().cloned().fold(0.0_f64, f64::max);

        let min_threshold = if items.len() <= SMALL_CORPUS_THRESHOLD {
            SMALL_CORPUS_MIN_SCORE_THRESHOLD
        } else {
            DEFAULT_MIN_SCORE_THRESHOLD
        };

        let max_access = items.iter().map(|i| i.access_count.max(0)).max().unwrap_or(0) as f64;

        let mut scored: Vec<RankItem> = items
            .into_iter()
            .map(|mut item| {
                let raw = *raw_scores.get(&item.id).unwrap_or(&0.0);
                item.bm25_score = if max_bm25 > 0.0 { raw / max_bm25 } else { 0.0 };
                item
            })
            .filter(|item| item.bm25_score >= min_threshold)
            .collect();

        scored = dedup_keep_highest(scored, |i| i.bm25_score);

        for item in scored.iter_mut() {
            let decay = time_decay(item.created_at, now, MID_TERM_TIME_HORIZON_SECS);
            let access = if max_access > 0.0 {
                item.access_count.max(0) as f64 / max_access
            } else {
                0.0
            };
            item.final_score = mid_term_final_score(item.bm25_score, decay, access);
        }

        scored.sort_by(|a, b| b.final_score.partial_cmp(&a.final_score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    /// Long-term coarse ranking: vector similarity + importance + lexical
    /// context overlap + time decay. Sorted descending, truncated to
    /// `coarse_limit`. Deduplication and the final score/importance filter
    /// are the memory manager's responsibility (§4.6), applied after this
    /// coarse pass.
    pub fn rank_long_term(
        query: &str,
        items: Vec<RankItem>,
        coarse_limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<RankItem> {
        if items.is_empty() {
            return items;
        }

        let max_vector = items.iter().map(|i| i.vector_score).fold(0.0_f64, f64::max);
        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
        let query_len = query_tokens.len().max(1) as f64;

        let mut scored: Vec<RankItem> = items
            .into_iter()
            .map(|mut item| {
                let vector_norm = if max_vector > 0.0 { item.vector_score / max_vector } else { 0.0 };
                let importance_score = ((item.importance - 1.0) / 9.0).clamp(0.0, 1.0);

                let context_text = item.raw_content.clone().unwrap_or_else(|| item.content.clone());
                let doc_tokens: HashSet<String> = tokenize(&context_text).into_iter().collect();
                let overlap = query_tokens.intersection(&doc_tokens).count() as f64;
                let context_score = overlap / query_len;

                let decay = time_decay(item.created_at, now, LONG_TERM_TIME_HORIZON_SECS);

                item.vector_score = vector_norm;
                item.final_score = LONG_TERM_VECTOR_WEIGHT * vector_norm
                    + LONG_TERM_IMPORTANCE_WEIGHT * importance_score
                    + LONG_TERM_CONTEXT_WEIGHT * context_score
                    + LONG_TERM_TIME_WEIGHT * decay;
                item
            })
            .collect();

        scored.sort_by(|a, b| b.final_score.partial_cmp(&a.final_score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(coarse_limit);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, content: &str, created_at: DateTime<Utc>, access_count: i32) -> RankItem {
        RankItem {
            id: id.to_string(),
            source: MemorySource::MidTerm,
            content: content.to_string(),
            raw_content: None,
            bm25_score: 0.0,
            vector_score: 0.0,
            final_score: 0.0,
            created_at,
            access_count,
            importance: 5.0,
            keywords: String::new(),
            metadata: Value::Null,
        }
    }

    #[test]
    fn mid_term_weights_are_exact() {
        assert_eq!(mid_term_final_score(1.0, 0.0, 0.0), 0.6);
        assert_eq!(mid_term_final_score(0.0, 1.0, 0.0), 0.3);
        assert_eq!(mid_term_final_score(0.0, 0.0, 1.0), 0.1);
    }

    #[test]
    fn dedup_keeps_highest_scoring_duplicate() {
        let now = Utc::now();
        let shared_content = "a".repeat(150); // first 100 chars identical
        let items = vec![
            {
                let mut i = item("a", &shared_content, now, 0);
                i.final_score = 0.9;
                i
            },
            {
                let mut i = item("b", &shared_content, now, 0);
                i.final_score = 0.5;
                i
            },
            {
                let mut i = item("c", &shared_content, now, 0);
                i.final_score = 0.7;
                i
            },
        ];

        let deduped = dedup_keep_highest(items, |i| i.final_score);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].id, "a");
        assert_eq!(deduped[0].final_score, 0.9);
    }

    #[test]
    fn zero_timestamp_short_circuits_time_decay() {
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let now = Utc::now();
        assert_eq!(time_decay(epoch, now, MID_TERM_TIME_HORIZON_SECS), 0.5);
    }

    #[test]
    fn rank_mid_term_relaxes_threshold_for_small_batches() {
        let now = Utc::now();
        let items = vec![item("only", "completely unrelated text", now, 0)];
        let ranked = Ranker::rank_mid_term("query terms not present", items, 5, now);
        // bm25 hit ratio is 0 for zero overlap, which is still >= the relaxed
        // small-corpus threshold (0.01 is irrelevant at exactly 0 -> filtered out)
        assert!(ranked.is_empty());
    }
}
