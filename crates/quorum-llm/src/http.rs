use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use quorum_core::ProviderRegistry;

use crate::errors::LlmError;
use crate::provider::{validate_completion, ChatCompletion, ChatProvider, ChatRequest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Chat-completions transport speaking the OpenAI wire shape. The provider
/// registry supplies per-provider base URLs and bearer credentials; every
/// configured provider here exposes an OpenAI-compatible endpoint.
pub struct HttpChatProvider {
    client: Client,
    registry: Arc<ProviderRegistry>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

impl HttpChatProvider {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            registry,
        }
    }
}

#[async_trait]
impl ChatProvider for HttpChatProvider {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        let provider = request.model.provider.as_str();
        let base_url = self
            .registry
            .base_url(provider)
            .ok_or_else(|| LlmError::InvalidRequest(format!("unknown provider: {provider}")))?;
        let api_key = self
            .registry
            .api_key(provider)
            .ok_or_else(|| LlmError::AuthenticationFailed(format!("no credential for {provider}")))?
            .to_string();

        let body = WireRequest {
            model: &request.model.name,
            messages: vec![
                WireMessage { role: "system", content: &request.system },
                WireMessage { role: "user", content: &request.user },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let resp = self
            .client
            .post(format!("{base_url}/chat/completions"))
            .bearer_auth(api_key)
            .header("accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, body));
        }

        let wire: WireResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::NetworkError(format!("malformed response: {e}")))?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or(LlmError::EmptyResponse)?;
        let usage = wire.usage.unwrap_or(WireUsage {
            prompt_tokens: None,
            completion_tokens: None,
        });

        validate_completion(ChatCompletion {
            text: choice.message.content.unwrap_or_default(),
            prompt_tokens: usage.prompt_tokens.unwrap_or(0),
            completion_tokens: usage.completion_tokens.unwrap_or(0),
            finish_reason: choice.finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::ModelRef;

    #[test]
    fn wire_request_serializes_messages_in_order() {
        let body = WireRequest {
            model: "gpt-4o",
            messages: vec![
                WireMessage { role: "system", content: "sys" },
                WireMessage { role: "user", content: "usr" },
            ],
            temperature: 0.2,
            max_tokens: 100,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["model"], "gpt-4o");
    }

    #[test]
    fn wire_response_parses_usage() {
        let raw = r#"{
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let wire: WireResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(wire.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(wire.usage.unwrap().prompt_tokens, Some(12));
    }

    #[test]
    fn wire_response_tolerates_missing_usage() {
        let raw = r#"{"choices": [{"message": {"content": "x"}, "finish_reason": null}]}"#;
        let wire: WireResponse = serde_json::from_str(raw).unwrap();
        assert!(wire.usage.is_none());
    }

    #[tokio::test]
    async fn unknown_provider_is_invalid_request() {
        let registry = Arc::new(ProviderRegistry::with_states(&[]));
        let provider = HttpChatProvider::new(registry);
        let request = ChatRequest {
            model: ModelRef { provider: "mystery".into(), name: "m".into() },
            system: "s".into(),
            user: "u".into(),
            temperature: 0.0,
            max_tokens: 10,
        };
        assert!(matches!(
            provider.complete(&request).await,
            Err(LlmError::InvalidRequest(_))
        ));
    }
}
