//! Storage backends (A4) — the two persistent stores behind the
//! `StorageBackend` external interface (§6): the relational mid-term
//! memory table and the pgvector-backed long-term store.
//!
//! §6 describes storage in terms of a generic operation algebra (typed
//! insert/update/delete/select rows, an ANN `search`) modelled on the
//! reference system's driver-agnostic storage client. Diesel already gives
//! us a type-checked query builder against our two concrete tables, so
//! rather than re-host a generic raw-SQL operation dispatcher on top of it,
//! this crate exposes the same semantics as a narrower, domain-typed trait:
//! one method per operation the memory manager (C6) actually performs. This
//! also sidesteps the injection risk of building raw SQL by string
//! interpolation — every query below is a bound Diesel expression.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use pgvector::{Vector, VectorExpressionMethods};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::errors::StorageError;
use crate::schema::{memory_vectors, mid_term_memory};

/// Relational row for one consolidated dialogue-window summary (§3).
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = mid_term_memory)]
pub struct MidTermRecord {
    pub id: Uuid,
    pub bot_id: String,
    pub user_id: String,
    pub summary: String,
    pub keywords: String,
    pub raw_messages: Value,
    pub message_count: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub access_count: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = mid_term_memory)]
pub struct NewMidTermRecord {
    pub bot_id: String,
    pub user_id: String,
    pub summary: String,
    pub keywords: String,
    pub raw_messages: Value,
    pub message_count: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub access_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Vector row for one long-term memory fact (§3). `extra` carries
/// `{importance, tags, source, normalized_content, raw_messages?}`.
#[derive(Debug, Clone)]
pub struct LongTermRecord {
    pub id: Uuid,
    pub bot_id: String,
    pub user_id: String,
    pub memory_type: String,
    pub content: String,
    pub extra: Value,
    pub created_at: DateTime<Utc>,
}

pub struct NewLongTermRecord {
    pub bot_id: String,
    pub user_id: String,
    pub memory_type: String,
    pub content: String,
    pub vector: Vec<f32>,
    pub extra: Value,
}

/// One ANN hit: the stored record plus a `[0,1]`-ish similarity score
/// derived from cosine distance (`1 - distance`).
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub record: LongTermRecord,
    pub score: f64,
}

/// The storage surface the memory manager (C6) is built against. A
/// production implementation is [`PgStorageBackend`]; tests substitute an
/// in-memory fake.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn insert_mid_term(&self, row: NewMidTermRecord) -> Result<Uuid, StorageError>;

    /// Up to `limit` most recent rows for `(bot_id, user_id)` with
    /// `created_at >= since`, newest first.
    async fn recent_mid_term(
        &self,
        bot_id: &str,
        user_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MidTermRecord>, StorageError>;

    async fn fetch_mid_term(&self, id: Uuid) -> Result<Option<MidTermRecord>, StorageError>;

    /// Atomic `access_count = access_count + 1`.
    async fn increment_mid_term_access(&self, id: Uuid) -> Result<(), StorageError>;

    async fn delete_mid_term(&self, id: Uuid) -> Result<(), StorageError>;

    async fn insert_long_term(&self, row: NewLongTermRecord) -> Result<Uuid, StorageError>;

    /// ANN search scoped to `bot_id`, returning up to `top_k` nearest
    /// neighbours by cosine distance. Callers (the memory manager) are
    /// responsible for the additional exact `user_id`/`memory_type` filter
    /// described in §4.6 — our vector store has no per-user partition, only
    /// a per-bot one.
    async fn search_long_term(
        &self,
        bot_id: &str,
        query_vector: &[f32],
        top_k: i64,
    ) -> Result<Vec<VectorHit>, StorageError>;

    async fn delete_long_term(&self, id: Uuid) -> Result<(), StorageError>;
}

/// Diesel/PostgreSQL + pgvector implementation of [`StorageBackend`].
///
/// Diesel's connection is synchronous; every call below runs inside
/// `tokio::task::spawn_blocking` so it never stalls the async runtime's
/// worker threads, matching the `LLMBackend`/tool-call suspension points
/// described in §5.
pub struct PgStorageBackend {
    conn: Arc<Mutex<PgConnection>>,
}

impl PgStorageBackend {
    pub fn new(database_url: &str) -> Result<Self, StorageError> {
        let conn = PgConnection::establish(database_url)
            .map_err(|e| StorageError::Transport(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn from_connection(conn: PgConnection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

fn lock_err() -> StorageError {
    StorageError::Transport("database connection lock poisoned".to_string())
}

fn join_err(e: tokio::task::JoinError) -> StorageError {
    StorageError::Transport(format!("blocking task panicked: {e}"))
}

#[async_trait]
impl StorageBackend for PgStorageBackend {
    async fn insert_mid_term(&self, row: NewMidTermRecord) -> Result<Uuid, StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| lock_err())?;
            diesel::insert_into(mid_term_memory::table)
                .values(&row)
                .returning(mid_term_memory::id)
                .get_result(&mut *conn)
                .map_err(|e| StorageError::Query(e.to_string()))
        })
        .await
        .map_err(join_err)?
    }

    async fn recent_mid_term(
        &self,
        bot_id: &str,
        user_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MidTermRecord>, StorageError> {
        let conn = self.conn.clone();
        let bot_id = bot_id.to_string();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| lock_err())?;
            mid_term_memory::table
                .filter(mid_term_memory::bot_id.eq(&bot_id))
                .filter(mid_term_memory::user_id.eq(&user_id))
                .filter(mid_term_memory::created_at.ge(since))
                .order(mid_term_memory::created_at.desc())
                .limit(limit)
                .select(MidTermRecord::as_select())
                .load(&mut *conn)
                .map_err(|e| StorageError::Query(e.to_string()))
        })
        .await
        .map_err(join_err)?
    }

    async fn fetch_mid_term(&self, id: Uuid) -> Result<Option<MidTermRecord>, StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| lock_err())?;
            mid_term_memory::table
                .find(id)
                .select(MidTermRecord::as_select())
                .first(&mut *conn)
                .optional()
                .map_err(|e| StorageError::Query(e.to_string()))
        })
        .await
        .map_err(join_err)?
    }

    async fn increment_mid_term_access(&self, id: Uuid) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| lock_err())?;
            diesel::update(mid_term_memory::table.find(id))
                .set(mid_term_memory::access_count.eq(mid_term_memory::access_count + 1))
                .execute(&mut *conn)
                .map_err(|e| StorageError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn delete_mid_term(&self, id: Uuid) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| lock_err())?;
            diesel::delete(mid_term_memory::table.find(id))
                .execute(&mut *conn)
                .map_err(|e| StorageError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn insert_long_term(&self, row: NewLongTermRecord) -> Result<Uuid, StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| lock_err())?;
            let id = Uuid::new_v4();
            let now = Utc::now();
            diesel::insert_into(memory_vectors::table)
                .values((
                    memory_vectors::id.eq(id),
                    memory_vectors::bot_id.eq(&row.bot_id),
                    memory_vectors::user_id.eq(&row.user_id),
                    memory_vectors::memory_type.eq(&row.memory_type),
                    memory_vectors::content.eq(&row.content),
                    memory_vectors::embedding.eq(Vector::from(row.vector)),
                    memory_vectors::extra.eq(&row.extra),
                    memory_vectors::created_at.eq(now),
                ))
                .execute(&mut *conn)
                .map_err(|e| StorageError::Query(e.to_string()))?;
            Ok(id)
        })
        .await
        .map_err(join_err)?
    }

    async fn search_long_term(
        &self,
        bot_id: &str,
        query_vector: &[f32],
        top_k: i64,
    ) -> Result<Vec<VectorHit>, StorageError> {
        let conn = self.conn.clone();
        let bot_id = bot_id.to_string();
        let query_vector = Vector::from(query_vector.to_vec());
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| lock_err())?;
            let select_distance = memory_vectors::embedding.cosine_distance(query_vector.clone());
            let order_distance = memory_vectors::embedding.cosine_distance(query_vector);

            let rows: Vec<(Uuid, String, String, String, String, Value, DateTime<Utc>, f64)> =
                memory_vectors::table
                    .filter(memory_vectors::bot_id.eq(&bot_id))
                    .select((
                        memory_vectors::id,
                        memory_vectors::bot_id,
                        memory_vectors::user_id,
                        memory_vectors::memory_type,
                        memory_vectors::content,
                        memory_vectors::extra,
                        memory_vectors::created_at,
                        select_distance,
                    ))
                    .order(order_distance)
                    .limit(top_k)
                    .load(&mut *conn)
                    .map_err(|e| StorageError::Query(e.to_string()))?;

            Ok(rows
                .into_iter()
                .map(
                    |(id, bot_id, user_id, memory_type, content, extra, created_at, distance)| {
                        VectorHit {
                            record: LongTermRecord {
                                id,
                                bot_id,
                                user_id,
                                memory_type,
                                content,
                                extra,
                                created_at,
                            },
                            score: 1.0 - distance,
                        }
                    },
                )
                .collect())
        })
        .await
        .map_err(join_err)?
    }

    async fn delete_long_term(&self, id: Uuid) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| lock_err())?;
            diesel::delete(memory_vectors::table.find(id))
                .execute(&mut *conn)
                .map_err(|e| StorageError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(join_err)?
    }
}

/// Per-bot namespace inside the vector collection, derived deterministically
/// from `bot_id` (§6): non-alphanumeric characters become `_`. Used only
/// for logging/labelling — actual row scoping is the `bot_id` equality
/// filter in [`StorageBackend::search_long_term`], since pgvector has no
/// notion of named partitions.
pub fn partition_for(bot_id: &str) -> String {
    let sanitized: String = bot_id
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("bot_{sanitized}")
}

/// In-memory [`StorageBackend`] fake used by the memory/agent test suites —
/// avoids every test standing up a real Postgres+pgvector instance.
#[cfg(test)]
pub struct InMemoryStorageBackend {
    mid_term: Mutex<Vec<MidTermRecord>>,
    long_term: Mutex<Vec<LongTermRecord>>,
}

#[cfg(test)]
impl InMemoryStorageBackend {
    pub fn new() -> Self {
        Self {
            mid_term: Mutex::new(Vec::new()),
            long_term: Mutex::new(Vec::new()),
        }
    }

    pub fn mid_term_rows(&self) -> Vec<MidTermRecord> {
        self.mid_term.lock().unwrap().clone()
    }

    pub fn long_term_rows(&self) -> Vec<LongTermRecord> {
        self.long_term.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl StorageBackend for InMemoryStorageBackend {
    async fn insert_mid_term(&self, row: NewMidTermRecord) -> Result<Uuid, StorageError> {
        let id = Uuid::new_v4();
        self.mid_term.lock().unwrap().push(MidTermRecord {
            id,
            bot_id: row.bot_id,
            user_id: row.user_id,
            summary: row.summary,
            keywords: row.keywords,
            raw_messages: row.raw_messages,
            message_count: row.message_count,
            start_time: row.start_time,
            end_time: row.end_time,
            access_count: row.access_count,
            created_at: row.created_at,
        });
        Ok(id)
    }

    async fn recent_mid_term(
        &self,
        bot_id: &str,
        user_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MidTermRecord>, StorageError> {
        let mut rows: Vec<MidTermRecord> = self
            .mid_term
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.bot_id == bot_id && r.user_id == user_id && r.created_at >= since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn fetch_mid_term(&self, id: Uuid) -> Result<Option<MidTermRecord>, StorageError> {
        Ok(self.mid_term.lock().unwrap().iter().find(|r| r.id == id).cloned())
    }

    async fn increment_mid_term_access(&self, id: Uuid) -> Result<(), StorageError> {
        if let Some(row) = self.mid_term.lock().unwrap().iter_mut().find(|r| r.id == id) {
            row.access_count += 1;
        }
        Ok(())
    }

    async fn delete_mid_term(&self, id: Uuid) -> Result<(), StorageError> {
        self.mid_term.lock().unwrap().retain(|r| r.id != id);
        Ok(())
    }

    async fn insert_long_term(&self, row: NewLongTermRecord) -> Result<Uuid, StorageError> {
        let id = Uuid::new_v4();
        let mut extra = row.extra;
        if let Some(obj) = extra.as_object_mut() {
            obj.insert("__vector".to_string(), serde_json::json!(row.vector));
        }
        self.long_term.lock().unwrap().push(LongTermRecord {
            id,
            bot_id: row.bot_id,
            user_id: row.user_id,
            memory_type: row.memory_type,
            content: row.content,
            extra,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn search_long_term(
        &self,
        bot_id: &str,
        _query_vector: &[f32],
        top_k: i64,
    ) -> Result<Vec<VectorHit>, StorageError> {
        let mut hits: Vec<VectorHit> = self
            .long_term
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.bot_id == bot_id)
            .map(|r| VectorHit {
                record: r.clone(),
                score: 1.0,
            })
            .collect();
        hits.truncate(top_k.max(0) as usize);
        Ok(hits)
    }

    async fn delete_long_term(&self, id: Uuid) -> Result<(), StorageError> {
        self.long_term.lock().unwrap().retain(|r| r.id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_sanitizes_non_alphanumeric() {
        assert_eq!(partition_for("bot-42!"), "bot_bot_42_");
        assert_eq!(partition_for("abc123"), "bot_abc123");
    }
}
