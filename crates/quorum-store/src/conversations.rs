use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, escape_like};

/// Insert payload for one completed call. `timestamp` defaults to now; tests
/// and backfills may supply their own.
#[derive(Clone, Debug, Default)]
pub struct NewConversation {
    pub timestamp: Option<String>,
    pub agent: String,
    pub model: String,
    pub provider: String,
    pub prompt: String,
    pub response: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub duration_ms: f64,
    pub estimated_cost_usd: f64,
    pub fallback_used: bool,
    pub original_model: Option<String>,
    pub fallback_reason: Option<String>,
    pub session_id: Option<String>,
    pub embedding: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: i64,
    pub timestamp: String,
    pub agent: String,
    pub model: String,
    pub provider: String,
    pub prompt: String,
    pub response: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub duration_ms: f64,
    pub estimated_cost_usd: f64,
    pub fallback_used: bool,
    pub original_model: Option<String>,
    pub fallback_reason: Option<String>,
    pub session_id: Option<String>,
    #[serde(skip)]
    pub embedding: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default)]
pub struct SearchFilter {
    pub query: Option<String>,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub session_id: Option<String>,
    pub limit: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GroupStats {
    pub count: u64,
    pub tokens: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_conversations: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub by_agent: BTreeMap<String, GroupStats>,
    pub by_model: BTreeMap<String, GroupStats>,
}

const COLUMNS: &str = "id, timestamp, agent, model, provider, prompt, response, \
     prompt_tokens, completion_tokens, total_tokens, duration_ms, estimated_cost_usd, \
     fallback_used, original_model, fallback_reason, session_id, embedding";

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a completed call. Enforces the token identity
    /// `total = prompt + completion` when both sides are known.
    #[instrument(skip(self, rec), fields(agent = %rec.agent))]
    pub fn insert(&self, rec: &NewConversation) -> Result<i64, StoreError> {
        if rec.prompt_tokens > 0
            && rec.completion_tokens > 0
            && rec.total_tokens != rec.prompt_tokens + rec.completion_tokens
        {
            return Err(StoreError::Invalid(format!(
                "total_tokens {} != prompt {} + completion {}",
                rec.total_tokens, rec.prompt_tokens, rec.completion_tokens
            )));
        }
        if rec.estimated_cost_usd < 0.0 || rec.duration_ms < 0.0 {
            return Err(StoreError::Invalid(
                "cost and duration must be non-negative".into(),
            ));
        }

        let timestamp = rec
            .timestamp
            .clone()
            .unwrap_or_else(|| Utc::now().to_rfc3339());

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (
                    timestamp, agent, model, provider, prompt, response,
                    prompt_tokens, completion_tokens, total_tokens, duration_ms,
                    estimated_cost_usd, fallback_used, original_model,
                    fallback_reason, session_id, embedding
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                rusqlite::params![
                    timestamp,
                    rec.agent,
                    rec.model,
                    rec.provider,
                    rec.prompt,
                    rec.response,
                    rec.prompt_tokens,
                    rec.completion_tokens,
                    rec.total_tokens,
                    rec.duration_ms,
                    rec.estimated_cost_usd,
                    rec.fallback_used,
                    rec.original_model,
                    rec.fallback_reason,
                    rec.session_id,
                    rec.embedding,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    #[instrument(skip(self))]
    pub fn get_by_id(&self, id: i64) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM conversations WHERE id = ?1"))?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => row_to_conversation(row),
                None => Err(StoreError::NotFound(format!("conversation {id}"))),
            }
        })
    }

    /// Idempotent: deleting a missing id succeeds.
    #[instrument(skip(self))]
    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    /// Most recent conversations, newest first, optionally filtered by agent.
    #[instrument(skip(self))]
    pub fn recent(&self, limit: u32, agent: Option<&str>) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = match agent {
                Some(_) => format!(
                    "SELECT {COLUMNS} FROM conversations WHERE agent = ?1 \
                     ORDER BY timestamp DESC, id DESC LIMIT ?2"
                ),
                None => format!(
                    "SELECT {COLUMNS} FROM conversations ORDER BY timestamp DESC, id DESC LIMIT ?1"
                ),
            };
            let mut stmt = conn.prepare(&sql)?;
            let mut out = Vec::new();
            let mut rows = match agent {
                Some(a) => stmt.query(rusqlite::params![a, limit])?,
                None => stmt.query(rusqlite::params![limit])?,
            };
            while let Some(row) = rows.next()? {
                out.push(row_to_conversation(row)?);
            }
            Ok(out)
        })
    }

    /// Conversations of one session, oldest to newest. The `limit` most
    /// recent rows are selected before reordering so a long session yields
    /// its tail, not its head.
    #[instrument(skip(self))]
    pub fn get_recent_by_session(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM conversations WHERE session_id = ?1 \
                 ORDER BY timestamp DESC, id DESC LIMIT ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![session_id, limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_conversation(row)?);
            }
            out.reverse();
            Ok(out)
        })
    }

    /// Candidate pool for knowledge retrieval: most recent rows outside the
    /// excluded session, embedding blobs included.
    #[instrument(skip(self))]
    pub fn query_candidates(
        &self,
        agent: Option<&str>,
        exclude_session_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut clauses: Vec<String> = Vec::new();
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

            if let Some(a) = agent {
                clauses.push(format!("agent = ?{}", params.len() + 1));
                params.push(Box::new(a.to_string()));
            }
            if let Some(excluded) = exclude_session_id {
                clauses.push(format!(
                    "(session_id IS NULL OR session_id != ?{})",
                    params.len() + 1
                ));
                params.push(Box::new(excluded.to_string()));
            }

            let mut sql = format!("SELECT {COLUMNS} FROM conversations");
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(&format!(
                " ORDER BY timestamp DESC, id DESC LIMIT ?{}",
                params.len() + 1
            ));
            params.push(Box::new(limit));

            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(param_refs.as_slice())?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_conversation(row)?);
            }
            Ok(out)
        })
    }

    /// Substring search over prompt/response with optional filters.
    #[instrument(skip(self, filter))]
    pub fn search(&self, filter: &SearchFilter) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut clauses: Vec<String> = Vec::new();
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

            if let Some(q) = &filter.query {
                let pattern = format!("%{}%", escape_like(q));
                clauses.push(format!(
                    "(prompt LIKE ?{n} ESCAPE '\\' OR response LIKE ?{n} ESCAPE '\\')",
                    n = params.len() + 1
                ));
                params.push(Box::new(pattern));
            }
            if let Some(a) = &filter.agent {
                clauses.push(format!("agent = ?{}", params.len() + 1));
                params.push(Box::new(a.clone()));
            }
            if let Some(m) = &filter.model {
                clauses.push(format!("model = ?{}", params.len() + 1));
                params.push(Box::new(m.clone()));
            }
            if let Some(from) = &filter.from_date {
                clauses.push(format!("timestamp >= ?{}", params.len() + 1));
                params.push(Box::new(from.clone()));
            }
            if let Some(to) = &filter.to_date {
                clauses.push(format!("timestamp <= ?{}", params.len() + 1));
                params.push(Box::new(to.clone()));
            }
            if let Some(sid) = &filter.session_id {
                clauses.push(format!("session_id = ?{}", params.len() + 1));
                params.push(Box::new(sid.clone()));
            }

            let mut sql = format!("SELECT {COLUMNS} FROM conversations");
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            let limit = if filter.limit == 0 { 10 } else { filter.limit };
            sql.push_str(&format!(
                " ORDER BY timestamp DESC, id DESC LIMIT ?{}",
                params.len() + 1
            ));
            params.push(Box::new(limit));

            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(param_refs.as_slice())?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_conversation(row)?);
            }
            Ok(out)
        })
    }

    /// Lazy embedding backfill.
    #[instrument(skip(self, blob))]
    pub fn update_embedding(&self, id: i64, blob: &[u8]) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE conversations SET embedding = ?1 WHERE id = ?2",
                rusqlite::params![blob, id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
    }

    /// Delete conversations whose session has been pruned, older than the
    /// cutoff. Sessionless records are kept.
    #[instrument(skip(self))]
    pub fn cleanup(&self, older_than: &str) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM conversations
                 WHERE timestamp < ?1
                   AND session_id IS NOT NULL
                   AND session_id NOT IN (SELECT session_id FROM sessions)",
                [older_than],
            )?;
            Ok(deleted)
        })
    }

    pub fn stats(&self) -> Result<MemoryStats, StoreError> {
        self.db.with_conn(|conn| {
            let (total_conversations, total_tokens, total_cost_usd): (u64, u64, f64) = conn
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(total_tokens), 0), COALESCE(SUM(estimated_cost_usd), 0.0)
                     FROM conversations",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;

            let mut by_agent = BTreeMap::new();
            let mut stmt = conn.prepare(
                "SELECT agent, COUNT(*), COALESCE(SUM(total_tokens), 0) FROM conversations GROUP BY agent",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let agent: String = row.get(0)?;
                by_agent.insert(agent, GroupStats { count: row.get(1)?, tokens: row.get(2)? });
            }

            let mut by_model = BTreeMap::new();
            let mut stmt = conn.prepare(
                "SELECT model, COUNT(*), COALESCE(SUM(total_tokens), 0) FROM conversations GROUP BY model",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let model: String = row.get(0)?;
                by_model.insert(model, GroupStats { count: row.get(1)?, tokens: row.get(2)? });
            }

            Ok(MemoryStats {
                total_conversations,
                total_tokens,
                total_cost_usd,
                by_agent,
                by_model,
            })
        })
    }

    pub fn last_conversation_at(&self) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            let ts = conn
                .query_row(
                    "SELECT timestamp FROM conversations ORDER BY timestamp DESC, id DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .ok();
            Ok(ts)
        })
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, StoreError> {
    Ok(ConversationRow {
        id: row_helpers::get(row, 0, "conversations", "id")?,
        timestamp: row_helpers::get(row, 1, "conversations", "timestamp")?,
        agent: row_helpers::get(row, 2, "conversations", "agent")?,
        model: row_helpers::get(row, 3, "conversations", "model")?,
        provider: row_helpers::get(row, 4, "conversations", "provider")?,
        prompt: row_helpers::get(row, 5, "conversations", "prompt")?,
        response: row_helpers::get(row, 6, "conversations", "response")?,
        prompt_tokens: row_helpers::get(row, 7, "conversations", "prompt_tokens")?,
        completion_tokens: row_helpers::get(row, 8, "conversations", "completion_tokens")?,
        total_tokens: row_helpers::get(row, 9, "conversations", "total_tokens")?,
        duration_ms: row_helpers::get(row, 10, "conversations", "duration_ms")?,
        estimated_cost_usd: row_helpers::get(row, 11, "conversations", "estimated_cost_usd")?,
        fallback_used: row_helpers::get(row, 12, "conversations", "fallback_used")?,
        original_model: row_helpers::get_opt(row, 13, "conversations", "original_model")?,
        fallback_reason: row_helpers::get_opt(row, 14, "conversations", "fallback_reason")?,
        session_id: row_helpers::get_opt(row, 15, "conversations", "session_id")?,
        embedding: row_helpers::get_opt(row, 16, "conversations", "embedding")?,
    })
}
