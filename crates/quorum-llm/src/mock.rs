use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::LlmError;
use crate::provider::{ChatCompletion, ChatProvider, ChatRequest};

/// Whether the LLM_MOCK environment flag is set (deterministic canned
/// responses; used for tests and offline runs).
pub fn mock_mode_enabled() -> bool {
    std::env::var("LLM_MOCK")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Deterministic provider for running the full pipeline without API keys.
/// Token counts are whitespace word counts, latency is simulated.
pub struct MockChatProvider {
    simulated_latency: Duration,
}

impl MockChatProvider {
    pub fn new() -> Self {
        Self {
            simulated_latency: Duration::from_millis(10),
        }
    }
}

impl Default for MockChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn word_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

fn head(text: &str, chars: usize) -> String {
    text.chars().take(chars).collect()
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        tokio::time::sleep(self.simulated_latency).await;

        let text = format!(
            "[MOCK RESPONSE] Simulated output from {}. The user asked: '{}...'",
            request.model,
            head(&request.user, 50),
        );
        Ok(ChatCompletion {
            prompt_tokens: word_count(&request.system) + word_count(&request.user),
            completion_tokens: word_count(&text),
            text,
            finish_reason: Some("stop".into()),
        })
    }
}

/// Pre-programmed responses returned in sequence; for exercising retry,
/// fallback, and chain behavior in tests without network access.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<ChatCompletion, LlmError>>>,
    call_count: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Result<ChatCompletion, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Convenience: a successful completion with the given text.
    pub fn text(text: &str) -> Result<ChatCompletion, LlmError> {
        Ok(ChatCompletion {
            text: text.to_string(),
            prompt_tokens: 10,
            completion_tokens: word_count(text),
            finish_reason: Some("stop".into()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::InvalidRequest(format!(
                "ScriptedProvider: no response configured for call {idx}"
            ))))
    }
}
