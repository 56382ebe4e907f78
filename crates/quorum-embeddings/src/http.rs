use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::errors::EmbeddingError;
use crate::service::EmbeddingService;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote embedding model behind an OpenAI-shaped `/embeddings` endpoint.
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    dims: usize,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct WireResponse {
    data: Vec<WireEmbedding>,
}

#[derive(Deserialize)]
struct WireEmbedding {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>, dims: usize) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            dims,
        }
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbedder {
    #[instrument(skip(self, text), fields(model = %self.model, chars = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let body = WireRequest {
            model: &self.model,
            input: text,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbeddingError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let detail = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::Inference(format!("status {status}: {detail}")));
        }

        let wire: WireResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Inference(format!("malformed response: {e}")))?;

        let vector = wire
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::Inference("empty data array".into()))?;

        if vector.len() != self.dims {
            return Err(EmbeddingError::Inference(format!(
                "expected {} dimensions, got {}",
                self.dims,
                vector.len()
            )));
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
