use serde::{Deserialize, Serialize};

/// Outcome of one agent execution inside a chain. Owned by the chain call
/// frame; the persisted ConversationRecord is the durable copy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
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
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub injected_context_tokens: u32,
    pub session_context_tokens: u32,
    pub knowledge_context_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl RunResult {
    /// Token accounting identity that every completed call must satisfy.
    pub fn tokens_consistent(&self) -> bool {
        self.total_tokens == self.prompt_tokens + self.completion_tokens
    }
}
