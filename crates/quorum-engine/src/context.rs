use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use quorum_core::{MemoryConfig, MemoryStrategy, Tokenizer};
use quorum_embeddings::{cosine, decode_blob, encode_blob, EmbeddingService};
use quorum_store::{ConversationRepo, ConversationRow};

const SESSION_HEADER: &str = "[SESSION CONTEXT - Recent conversation]\n";
const KNOWLEDGE_HEADER: &str = "[KNOWLEDGE CONTEXT - Relevant past topics]\n";
/// Bounded candidate pool for knowledge retrieval.
const CANDIDATE_POOL: u32 = 50;
/// Knowledge candidate responses are clipped before token counting so one
/// long record cannot eat the whole budget.
const KNOWLEDGE_SNIPPET_CHARS: usize = 300;
const SESSION_PROMPT_CHARS: usize = 150;
const SESSION_RESPONSE_CHARS: usize = 300;
const SENTINEL_SCORE: f64 = 0.0;

/// What the aggregator injected, reported on the RunResult.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextTelemetry {
    pub session_tokens: u32,
    pub knowledge_tokens: u32,
    pub total_tokens: u32,
    pub session_messages: u32,
    pub knowledge_messages: u32,
}

/// Dual-context retrieval: a session slice for continuity and a
/// semantically ranked knowledge slice from other sessions, under a
/// priority-capped token budget. Memory is best-effort: every internal
/// failure is logged and degrades to less (or no) context.
pub struct ContextAggregator {
    conversations: Arc<ConversationRepo>,
    embedder: Arc<dyn EmbeddingService>,
    tokenizer: Tokenizer,
}

struct ScoredCandidate {
    row: ConversationRow,
    score: f64,
}

impl ContextAggregator {
    pub fn new(
        conversations: Arc<ConversationRepo>,
        embedder: Arc<dyn EmbeddingService>,
        tokenizer: Tokenizer,
    ) -> Self {
        Self {
            conversations,
            embedder,
            tokenizer,
        }
    }

    #[instrument(skip(self, prompt, session_id, config), fields(session = session_id.unwrap_or("-")))]
    pub async fn aggregate(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        agent: &str,
        config: &MemoryConfig,
    ) -> (String, ContextTelemetry) {
        let mut telemetry = ContextTelemetry::default();
        if prompt.trim().is_empty() {
            return (String::new(), telemetry);
        }

        let budget = config.max_context_tokens as usize;
        let session_cap = budget * 3 / 4;

        let (session_block, session_tokens, session_messages) =
            self.session_slice(session_id, config, session_cap);

        let remaining = budget.saturating_sub(session_tokens);
        let (knowledge_block, knowledge_tokens, knowledge_messages) = self
            .knowledge_slice(prompt, session_id, agent, config, remaining)
            .await;

        telemetry.session_tokens = session_tokens as u32;
        telemetry.session_messages = session_messages as u32;
        telemetry.knowledge_tokens = knowledge_tokens as u32;
        telemetry.knowledge_messages = knowledge_messages as u32;
        telemetry.total_tokens = (session_tokens + knowledge_tokens) as u32;

        let mut sections = Vec::new();
        if let Some(block) = session_block {
            sections.push(block);
        }
        if let Some(block) = knowledge_block {
            sections.push(block);
        }

        (sections.join("\n\n"), telemetry)
    }

    /// Recent turns of the same session, oldest to newest, trimmed from the
    /// front until the block fits in 75% of the budget.
    fn session_slice(
        &self,
        session_id: Option<&str>,
        config: &MemoryConfig,
        cap: usize,
    ) -> (Option<String>, usize, usize) {
        let Some(session_id) = session_id else {
            return (None, 0, 0);
        };
        if !config.session_enabled {
            return (None, 0, 0);
        }

        let rows = match self
            .conversations
            .get_recent_by_session(session_id, config.session_limit)
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(session_id, error = %e, "session slice lookup failed; continuing without it");
                return (None, 0, 0);
            }
        };
        if rows.is_empty() {
            return (None, 0, 0);
        }

        let total = rows.len();
        let mut turns: Vec<String> = rows
            .iter()
            .enumerate()
            .map(|(i, row)| format_session_turn(row, total - i))
            .collect();

        loop {
            if turns.is_empty() {
                return (None, 0, 0);
            }
            let block = format!("{SESSION_HEADER}\n{}", turns.join("\n"));
            let tokens = self.tokenizer.count(&block);
            if tokens <= cap {
                return (Some(block), tokens, turns.len());
            }
            // Oldest turn goes first.
            turns.remove(0);
        }
    }

    /// Scored slice from other sessions, greedily packed into whatever
    /// budget the session slice left over.
    async fn knowledge_slice(
        &self,
        prompt: &str,
        exclude_session: Option<&str>,
        agent: &str,
        config: &MemoryConfig,
        budget_left: usize,
    ) -> (Option<String>, usize, usize) {
        if !config.knowledge_enabled || budget_left == 0 {
            return (None, 0, 0);
        }

        let agent_filter = config.same_agent_only.then_some(agent);
        let candidates = match self.conversations.query_candidates(
            agent_filter,
            exclude_session,
            CANDIDATE_POOL,
        ) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "knowledge candidate lookup failed; continuing without it");
                return (None, 0, 0);
            }
        };
        if candidates.is_empty() {
            return (None, 0, 0);
        }

        let mut scored = self.score_candidates(prompt, candidates, config).await;

        scored.retain(|c| c.score >= config.min_relevance);
        if scored.is_empty() {
            // Nothing cleared the bar: fall back to the single most recent
            // candidate at a sentinel score rather than injecting nothing.
            warn!(
                min_relevance = config.min_relevance,
                "no knowledge candidate above threshold; falling back to most recent"
            );
            let most_recent = self
                .conversations
                .query_candidates(agent_filter, exclude_session, 1)
                .ok()
                .and_then(|mut rows| rows.pop());
            let Some(row) = most_recent else {
                return (None, 0, 0);
            };
            scored = vec![ScoredCandidate {
                row,
                score: SENTINEL_SCORE,
            }];
        } else {
            // Score descending; more recent wins ties, higher id breaks
            // exact timestamp ties.
            scored.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.row.timestamp.cmp(&a.row.timestamp))
                    .then_with(|| b.row.id.cmp(&a.row.id))
            });
        }

        let header_tokens = self.tokenizer.count(KNOWLEDGE_HEADER);
        if header_tokens >= budget_left {
            return (None, 0, 0);
        }

        let mut entries: Vec<String> = Vec::new();
        let mut used = header_tokens;
        let mut count = 0usize;
        for candidate in &scored {
            let entry = format_knowledge_entry(&candidate.row, candidate.score);
            let entry_tokens = self.tokenizer.count(&entry) + 1; // joining newline
            if used + entry_tokens > budget_left {
                continue;
            }
            used += entry_tokens;
            entries.push(entry);
            count += 1;
        }

        // Recount the assembled block; joins can cost a token more than the
        // running estimate, and the budget is a hard ceiling.
        loop {
            if entries.is_empty() {
                return (None, 0, 0);
            }
            let block = format!("{KNOWLEDGE_HEADER}\n{}", entries.join("\n"));
            let tokens = self.tokenizer.count(&block);
            if tokens <= budget_left {
                debug!(entries = count, tokens, "knowledge slice assembled");
                return (Some(block), tokens, count);
            }
            entries.pop();
            count -= 1;
        }
    }

    async fn score_candidates(
        &self,
        prompt: &str,
        candidates: Vec<ConversationRow>,
        config: &MemoryConfig,
    ) -> Vec<ScoredCandidate> {
        let needs_semantic = matches!(
            config.strategy,
            MemoryStrategy::Semantic | MemoryStrategy::Hybrid
        );

        let prompt_vector = if needs_semantic {
            match self.embedder.embed(prompt).await {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(error = %e, "prompt embedding failed; semantic scores default to 0");
                    None
                }
            }
        } else {
            None
        };

        let prompt_keywords = keywords(prompt);
        let now = Utc::now();

        let mut scored = Vec::with_capacity(candidates.len());
        for row in candidates {
            let decay = time_decay(&row.timestamp, now, config.time_decay_hours);

            let semantic = match (&prompt_vector, config.strategy) {
                (Some(pv), MemoryStrategy::Semantic | MemoryStrategy::Hybrid) => {
                    self.candidate_similarity(pv, &row).await
                }
                _ => 0.0,
            };
            let keyword = keyword_overlap(&prompt_keywords, &row.prompt);

            let base = match config.strategy {
                MemoryStrategy::Semantic => semantic,
                MemoryStrategy::Keywords => keyword,
                MemoryStrategy::Hybrid => 0.7 * semantic + 0.3 * keyword,
            };

            scored.push(ScoredCandidate {
                score: base * decay,
                row,
            });
        }
        scored
    }

    /// Cosine similarity against the candidate's stored embedding; missing
    /// embeddings are generated on the spot and persisted for next time.
    async fn candidate_similarity(&self, prompt_vector: &[f32], row: &ConversationRow) -> f64 {
        let vector = match &row.embedding {
            Some(blob) => match decode_blob(blob) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(id = row.id, error = %e, "stored embedding unreadable; regenerating");
                    None
                }
            },
            None => None,
        };

        let vector = match vector {
            Some(v) => v,
            None => match self.embedder.embed(&row.prompt).await {
                Ok(v) => {
                    if let Err(e) = self.conversations.update_embedding(row.id, &encode_blob(&v)) {
                        warn!(id = row.id, error = %e, "embedding backfill failed");
                    }
                    v
                }
                Err(e) => {
                    warn!(id = row.id, error = %e, "candidate embedding failed; skipping semantic score");
                    return 0.0;
                }
            },
        };

        f64::from(cosine(prompt_vector, &vector))
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max).collect();
    format!("{clipped}...")
}

fn format_session_turn(row: &ConversationRow, age: usize) -> String {
    let plural = if age > 1 { "s" } else { "" };
    format!(
        "[{age} message{plural} ago]\nUser: \"{}\"\nAssistant: \"{}\"\n",
        truncate_chars(&row.prompt, SESSION_PROMPT_CHARS),
        truncate_chars(&row.response, SESSION_RESPONSE_CHARS),
    )
}

fn format_knowledge_entry(row: &ConversationRow, score: f64) -> String {
    format!(
        "[Relevance: {score:.2}, {}]\nTopic: {}\nSummary: \"{}\"\n",
        human_age(&row.timestamp),
        truncate_chars(&row.prompt, 80),
        truncate_chars(&row.response, KNOWLEDGE_SNIPPET_CHARS),
    )
}

fn human_age(timestamp: &str) -> String {
    let Ok(then) = DateTime::parse_from_rfc3339(timestamp) else {
        return "unknown age".into();
    };
    let seconds = (Utc::now() - then.with_timezone(&Utc)).num_seconds().max(0);
    match seconds {
        0..=59 => "just now".into(),
        60..=3599 => {
            let m = seconds / 60;
            format!("{m} minute{} ago", if m > 1 { "s" } else { "" })
        }
        3600..=86399 => {
            let h = seconds / 3600;
            format!("{h} hour{} ago", if h > 1 { "s" } else { "" })
        }
        _ => {
            let d = seconds / 86400;
            format!("{d} day{} ago", if d > 1 { "s" } else { "" })
        }
    }
}

fn time_decay(timestamp: &str, now: DateTime<Utc>, decay_hours: f64) -> f64 {
    if decay_hours <= 0.0 {
        return 1.0;
    }
    let Ok(then) = DateTime::parse_from_rfc3339(timestamp) else {
        return 1.0;
    };
    let age_hours = ((now - then.with_timezone(&Utc)).num_seconds().max(0) as f64) / 3600.0;
    (-age_hours / decay_hours).exp()
}

fn keywords(text: &str) -> BTreeSet<String> {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

fn keyword_overlap(prompt_keywords: &BTreeSet<String>, candidate_prompt: &str) -> f64 {
    if prompt_keywords.is_empty() {
        return 0.0;
    }
    let candidate = keywords(candidate_prompt);
    let overlap = prompt_keywords.intersection(&candidate).count();
    overlap as f64 / prompt_keywords.len() as f64
}
