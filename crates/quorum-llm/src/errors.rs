use std::time::Duration;

/// Why one fallback candidate could not produce a response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateFailure {
    pub model: String,
    pub reason: String,
}

/// Typed error hierarchy for chat-completion calls.
/// Classifies errors as fatal (don't retry), retryable, or terminal.
#[derive(Clone, Debug, thiserror::Error)]
pub enum LlmError {
    // Fatal — don't retry this candidate
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    ProviderOverloaded,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // Candidate-terminal — move to the next fallback without retrying
    #[error("empty response from model")]
    EmptyResponse,
    #[error("content filtered by provider (reason: {reason})")]
    ContentFiltered { reason: String },

    #[error("all providers failed ({})", format_attempts(attempts))]
    AllProvidersFailed { attempts: Vec<CandidateFailure> },
}

fn format_attempts(attempts: &[CandidateFailure]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.model, a.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::ProviderOverloaded
                | Self::NetworkError(_)
                | Self::Timeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_) | Self::InvalidRequest(_))
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging and fallback accounting.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "auth_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::ProviderOverloaded => "provider_overloaded",
            Self::NetworkError(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::EmptyResponse => "empty_response",
            Self::ContentFiltered { .. } => "content_filtered",
            Self::AllProvidersFailed { .. } => "all_providers_failed",
        }
    }

    /// Classify an HTTP status code into the appropriate variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            529 => Self::ProviderOverloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(LlmError::RateLimited { retry_after: None }.is_retryable());
        assert!(LlmError::ServerError { status: 500, body: "err".into() }.is_retryable());
        assert!(LlmError::ProviderOverloaded.is_retryable());
        assert!(LlmError::NetworkError("tcp".into()).is_retryable());
        assert!(LlmError::Timeout(Duration::from_secs(30)).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(LlmError::AuthenticationFailed("bad key".into()).is_fatal());
        assert!(LlmError::InvalidRequest("bad".into()).is_fatal());
        assert!(!LlmError::EmptyResponse.is_fatal());
    }

    #[test]
    fn candidate_terminal_neither_fatal_nor_retryable() {
        let empty = LlmError::EmptyResponse;
        assert!(!empty.is_retryable() && !empty.is_fatal());

        let filtered = LlmError::ContentFiltered { reason: "safety".into() };
        assert!(!filtered.is_retryable() && !filtered.is_fatal());
    }

    #[test]
    fn from_status_mapping() {
        assert!(LlmError::from_status(401, "no".into()).is_fatal());
        assert!(LlmError::from_status(429, "slow".into()).is_retryable());
        assert!(LlmError::from_status(529, "busy".into()).is_retryable());
        assert!(LlmError::from_status(503, "down".into()).is_retryable());
        assert!(LlmError::from_status(400, "bad".into()).is_fatal());
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = LlmError::RateLimited { retry_after: Some(Duration::from_secs(2)) };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(2)));
        assert_eq!(LlmError::EmptyResponse.suggested_delay(), None);
    }

    #[test]
    fn all_providers_failed_display_lists_attempts() {
        let err = LlmError::AllProvidersFailed {
            attempts: vec![
                CandidateFailure { model: "openai/gpt-4o".into(), reason: "missing_credential".into() },
                CandidateFailure { model: "google/gemini-1.5-flash".into(), reason: "server_error".into() },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("openai/gpt-4o: missing_credential"));
        assert!(msg.contains("google/gemini-1.5-flash: server_error"));
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(LlmError::EmptyResponse.error_kind(), "empty_response");
        assert_eq!(
            LlmError::ContentFiltered { reason: "safety".into() }.error_kind(),
            "content_filtered"
        );
        assert_eq!(
            LlmError::AuthenticationFailed("x".into()).error_kind(),
            "auth_failed"
        );
    }
}
