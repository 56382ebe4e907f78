use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use quorum_core::{CompressionConfig, Tokenizer};
use quorum_llm::Connector;

/// Which threshold applies to the stage being compressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentClass {
    Standard,
    MemoryEnabled,
    Closer,
}

/// Structured summary emitted by the compression model. Field names are a
/// wire contract; downstream consumers rely on them exactly.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompressionSummary {
    pub key_decisions: Vec<String>,
    pub rationale: BTreeMap<String, String>,
    pub trade_offs: Vec<String>,
    pub open_questions: Vec<String>,
    pub technical_specs: BTreeMap<String, String>,
}

impl CompressionSummary {
    /// Render the summary as labeled prose for the next stage's prompt.
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if !self.key_decisions.is_empty() {
            parts.push(format!("Key decisions:\n- {}", self.key_decisions.join("\n- ")));
        }
        if !self.rationale.is_empty() {
            let lines: Vec<String> = self
                .rationale
                .iter()
                .map(|(k, v)| format!("- {k}: {v}"))
                .collect();
            parts.push(format!("Rationale:\n{}", lines.join("\n")));
        }
        if !self.trade_offs.is_empty() {
            parts.push(format!("Trade-offs:\n- {}", self.trade_offs.join("\n- ")));
        }
        if !self.open_questions.is_empty() {
            parts.push(format!("Open questions:\n- {}", self.open_questions.join("\n- ")));
        }
        if !self.technical_specs.is_empty() {
            let lines: Vec<String> = self
                .technical_specs
                .iter()
                .map(|(k, v)| format!("- {k}: {v}"))
                .collect();
            parts.push(format!("Technical specs:\n{}", lines.join("\n")));
        }
        parts.join("\n\n")
    }
}

const COMPRESSION_SYSTEM_PROMPT: &str = "You compress agent output into a compact structured summary. \
Respond with a single JSON object and nothing else. The object must have exactly these fields: \
\"key_decisions\" (array of strings), \"rationale\" (object mapping strings to strings), \
\"trade_offs\" (array of strings), \"open_questions\" (array of strings), \
\"technical_specs\" (object mapping strings to strings).";

/// Reduces a prior stage's output to a compact summary with a cheap model.
/// The sentence-aware truncator is the provably terminating fallback when
/// the model fails or emits non-JSON.
pub struct Compressor {
    connector: Arc<Connector>,
    config: CompressionConfig,
    tokenizer: Tokenizer,
}

impl Compressor {
    pub fn new(connector: Arc<Connector>, config: CompressionConfig, tokenizer: Tokenizer) -> Self {
        Self {
            connector,
            config,
            tokenizer,
        }
    }

    pub fn threshold(&self, class: AgentClass) -> usize {
        match class {
            AgentClass::Standard => self.config.standard_threshold,
            AgentClass::MemoryEnabled => self.config.memory_threshold,
            AgentClass::Closer => self.config.closer_threshold,
        }
    }

    /// Pass output through untouched below the class threshold; above it,
    /// substitute the structured summary (or the truncation fallback).
    #[instrument(skip(self, text), fields(chars = text.chars().count()))]
    pub async fn compress_if_needed(&self, text: &str, class: AgentClass) -> String {
        if text.chars().count() < self.threshold(class) {
            return text.to_string();
        }

        let user = format!("Compress the following output:\n\n{text}");
        match self
            .connector
            .call(
                &self.config.model,
                COMPRESSION_SYSTEM_PROMPT,
                &user,
                0.1,
                self.config.target_tokens,
                &[],
            )
            .await
        {
            Ok(response) => match parse_summary(&response.text) {
                Some(summary) => {
                    debug!("substituted structured summary");
                    summary.render()
                }
                None => {
                    warn!("compression model emitted non-JSON; using sentence truncation");
                    self.sentence_truncate(text, self.config.target_tokens as usize)
                }
            },
            Err(e) => {
                warn!(error = %e, "compression call failed; using sentence truncation");
                self.sentence_truncate(text, self.config.target_tokens as usize)
            }
        }
    }

    /// Keep whole sentences from the start until the remainder no longer
    /// fits the target token count.
    pub fn sentence_truncate(&self, text: &str, target_tokens: usize) -> String {
        if self.tokenizer.count(text) <= target_tokens {
            return text.to_string();
        }

        let mut kept = String::new();
        for sentence in split_sentences(text) {
            let mut candidate = kept.clone();
            candidate.push_str(sentence);
            if self.tokenizer.count(candidate.trim()) > target_tokens {
                break;
            }
            kept = candidate;
        }

        if kept.trim().is_empty() {
            // The first sentence alone blows the target; hard-clip it on a
            // char boundary near the token budget.
            let approx_chars = target_tokens.saturating_mul(4);
            let clipped: String = text.chars().take(approx_chars).collect();
            return format!("{}...", clipped.trim_end());
        }
        kept.trim_end().to_string()
    }
}

/// Split on sentence enders, keeping the terminator with its sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let end = i + c.len_utf8();
            sentences.push(&text[start..end]);
            start = end;
        }
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

/// Tolerates markdown code fences around the JSON body.
fn parse_summary(text: &str) -> Option<CompressionSummary> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_start())
        .map(|rest| rest.strip_suffix("```").unwrap_or(rest))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).ok()
}
