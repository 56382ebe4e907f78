use quorum_core::ConfigError;
use quorum_llm::LlmError;
use quorum_store::StoreError;

/// Errors surfaced from chain execution. Each maps onto an HTTP status or a
/// CLI exit code at the edges.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: LlmError,
    },

    #[error("all critics failed")]
    AllCriticsFailed,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("chain cancelled")]
    Cancelled,
}

impl ChainError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidSessionId(_) => "invalid_session_id",
            Self::Config(_) => "config",
            Self::StageFailed { .. } => "stage_failed",
            Self::AllCriticsFailed => "all_critics_failed",
            Self::Store(_) => "store",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether every fallback candidate was exhausted somewhere inside.
    pub fn is_all_providers_failed(&self) -> bool {
        matches!(
            self,
            Self::StageFailed {
                source: LlmError::AllProvidersFailed { .. },
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failed_preserves_cause() {
        let err = ChainError::StageFailed {
            stage: "builder".into(),
            source: LlmError::AllProvidersFailed { attempts: vec![] },
        };
        assert!(err.to_string().contains("builder"));
        assert!(err.is_all_providers_failed());
        assert_eq!(err.error_kind(), "stage_failed");
    }

    #[test]
    fn non_provider_errors_classified() {
        assert!(!ChainError::AllCriticsFailed.is_all_providers_failed());
        assert_eq!(
            ChainError::InvalidSessionId("bad!".into()).error_kind(),
            "invalid_session_id"
        );
    }
}
