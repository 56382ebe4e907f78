use async_trait::async_trait;

use quorum_core::ModelRef;

use crate::errors::LlmError;

/// One chat-completion request: a system prompt and a single user turn.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model: ModelRef,
    pub system: String,
    pub user: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Raw provider output before fallback accounting is applied.
#[derive(Clone, Debug)]
pub struct ChatCompletion {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub finish_reason: Option<String>,
}

/// The remote chat-completion contract. Implementations resolve the
/// provider segment of `request.model` themselves; candidate rotation and
/// retry live in the connector, not here.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError>;
}

/// Reject completions the connector must not surface: empty text and
/// content-filter stops both route to the next fallback candidate.
pub fn validate_completion(completion: ChatCompletion) -> Result<ChatCompletion, LlmError> {
    if let Some(reason) = completion.finish_reason.as_deref() {
        if matches!(reason, "content_filter" | "safety") {
            return Err(LlmError::ContentFiltered {
                reason: reason.to_string(),
            });
        }
    }
    if completion.text.trim().is_empty() {
        return Err(LlmError::EmptyResponse);
    }
    Ok(completion)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(text: &str, finish: Option<&str>) -> ChatCompletion {
        ChatCompletion {
            text: text.into(),
            prompt_tokens: 10,
            completion_tokens: 5,
            finish_reason: finish.map(str::to_string),
        }
    }

    #[test]
    fn valid_completion_passes() {
        let out = validate_completion(completion("fine", Some("stop"))).unwrap();
        assert_eq!(out.text, "fine");
    }

    #[test]
    fn empty_text_rejected() {
        assert!(matches!(
            validate_completion(completion("   \n", Some("stop"))),
            Err(LlmError::EmptyResponse)
        ));
    }

    #[test]
    fn content_filter_rejected() {
        assert!(matches!(
            validate_completion(completion("partial", Some("content_filter"))),
            Err(LlmError::ContentFiltered { .. })
        ));
        assert!(matches!(
            validate_completion(completion("partial", Some("safety"))),
            Err(LlmError::ContentFiltered { .. })
        ));
    }
}
