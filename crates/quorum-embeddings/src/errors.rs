#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding model not ready")]
    NotReady,

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed embedding blob: {0}")]
    MalformedBlob(String),
}

impl EmbeddingError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::Inference(_) => "inference",
            Self::Network(_) => "network",
            Self::MalformedBlob(_) => "malformed_blob",
        }
    }
}
