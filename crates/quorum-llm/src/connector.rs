use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use quorum_core::{pricing, ModelRef, ProviderRegistry, RetryConfig};

use crate::errors::{CandidateFailure, LlmError};
use crate::provider::{ChatProvider, ChatRequest};

/// The connector's view of a successful call, with fallback provenance and
/// cost accounting attached.
#[derive(Clone, Debug)]
pub struct LlmResponse {
    pub text: String,
    /// Canonical `provider/model` that actually served the call.
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub duration_ms: f64,
    pub estimated_cost_usd: f64,
    /// The originally requested model, set when a fallback served the call.
    pub original_model: Option<String>,
    /// The primary candidate's failure reason, set when a fallback served.
    pub fallback_reason: Option<String>,
}

impl LlmResponse {
    pub fn fallback_used(&self) -> bool {
        self.original_model.is_some()
    }
}

/// Walks `[model] ++ fallbacks`, skipping unavailable providers and retrying
/// transient failures with capped exponential backoff. The connector has no
/// cross-agent knowledge: callers supply the agent's fallback order.
pub struct Connector {
    provider: Arc<dyn ChatProvider>,
    registry: Arc<ProviderRegistry>,
    retry: RetryConfig,
}

impl Connector {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        registry: Arc<ProviderRegistry>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            retry,
        }
    }

    #[instrument(skip(self, model, system, user, fallbacks), fields(model = %model))]
    pub async fn call(
        &self,
        model: &str,
        system: &str,
        user: &str,
        temperature: f64,
        max_tokens: u32,
        fallbacks: &[String],
    ) -> Result<LlmResponse, LlmError> {
        let start = Instant::now();
        let requested = model.to_string();

        let mut candidates = Vec::with_capacity(1 + fallbacks.len());
        candidates.push(requested.clone());
        candidates.extend(fallbacks.iter().cloned());

        let mut attempts: Vec<CandidateFailure> = Vec::new();

        for (idx, candidate) in candidates.iter().enumerate() {
            let model_ref = match ModelRef::parse(candidate) {
                Ok(m) => m,
                Err(_) => {
                    attempts.push(CandidateFailure {
                        model: candidate.clone(),
                        reason: "invalid_model_ref".into(),
                    });
                    continue;
                }
            };

            if let Some(reason) = self.registry.unavailable_reason(&model_ref.provider) {
                warn!(model = %candidate, reason, "skipping unavailable provider");
                attempts.push(CandidateFailure {
                    model: candidate.clone(),
                    reason: reason.to_string(),
                });
                continue;
            }

            let request = ChatRequest {
                model: model_ref.clone(),
                system: system.to_string(),
                user: user.to_string(),
                temperature,
                max_tokens,
            };

            match self.try_candidate(&request).await {
                Ok(completion) => {
                    let model_used = model_ref.to_string();
                    let cost = pricing::estimate_cost(
                        &model_used,
                        completion.prompt_tokens,
                        completion.completion_tokens,
                    );
                    let (original_model, fallback_reason) = if idx > 0 {
                        warn!(
                            requested = %requested,
                            used = %model_used,
                            reason = attempts.first().map(|a| a.reason.as_str()).unwrap_or("unknown"),
                            "primary model unavailable; served by fallback"
                        );
                        (
                            Some(requested.clone()),
                            // The reason reported is the PRIMARY candidate's
                            // failure, not the most recent one.
                            Some(
                                attempts
                                    .first()
                                    .map(|a| a.reason.clone())
                                    .unwrap_or_else(|| "primary_unavailable".into()),
                            ),
                        )
                    } else {
                        (None, None)
                    };

                    return Ok(LlmResponse {
                        text: completion.text,
                        provider: model_ref.provider,
                        model: model_used,
                        prompt_tokens: completion.prompt_tokens,
                        completion_tokens: completion.completion_tokens,
                        total_tokens: completion.prompt_tokens + completion.completion_tokens,
                        duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                        estimated_cost_usd: cost,
                        original_model,
                        fallback_reason,
                    });
                }
                Err(e) => {
                    debug!(model = %candidate, error = %e, "candidate failed");
                    attempts.push(CandidateFailure {
                        model: candidate.clone(),
                        reason: e.error_kind().to_string(),
                    });
                }
            }
        }

        warn!(requested = %requested, attempts = attempts.len(), "all candidates exhausted");
        Err(LlmError::AllProvidersFailed { attempts })
    }

    /// One candidate: retry transient errors up to the configured budget,
    /// bail immediately on fatal or candidate-terminal errors.
    async fn try_candidate(&self, request: &ChatRequest) -> Result<crate::provider::ChatCompletion, LlmError> {
        let mut last_error: Option<LlmError> = None;

        for attempt in 0..=self.retry.max_retries {
            let outcome = tokio::time::timeout(self.retry.call_timeout(), self.provider.complete(request))
                .await
                .unwrap_or(Err(LlmError::Timeout(self.retry.call_timeout())));

            match outcome {
                Ok(completion) => return Ok(completion),
                Err(e) => {
                    if !e.is_retryable() || attempt == self.retry.max_retries {
                        return Err(e);
                    }
                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LlmError::NetworkError("retries exhausted".into())))
    }

    /// Exponential backoff `base * 2^attempt`, capped; server-suggested
    /// delays win.
    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay.min(self.retry.max_delay());
        }
        let exp = self.retry.base_delay().as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp.min(self.retry.max_delay().as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedProvider;

    fn registry_all_enabled() -> Arc<ProviderRegistry> {
        Arc::new(ProviderRegistry::with_states(&[
            ("openai", Some("sk-test"), false),
            ("anthropic", Some("sk-ant-test"), false),
            ("google", Some("g-test"), false),
        ]))
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            call_timeout_secs: 5,
        }
    }

    fn connector(
        responses: Vec<Result<crate::provider::ChatCompletion, LlmError>>,
        registry: Arc<ProviderRegistry>,
    ) -> (Connector, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::new(responses));
        let c = Connector::new(provider.clone(), registry, fast_retry());
        (c, provider)
    }

    #[tokio::test]
    async fn success_on_primary() {
        let (c, provider) = connector(vec![ScriptedProvider::text("hello")], registry_all_enabled());
        let resp = c
            .call("openai/gpt-4o", "sys", "user", 0.2, 100, &[])
            .await
            .unwrap();
        assert_eq!(resp.text, "hello");
        assert_eq!(resp.provider, "openai");
        assert_eq!(resp.model, "openai/gpt-4o");
        assert!(!resp.fallback_used());
        assert_eq!(resp.total_tokens, resp.prompt_tokens + resp.completion_tokens);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn missing_credential_falls_through_without_calling() {
        let registry = Arc::new(ProviderRegistry::with_states(&[
            ("openai", None, false),
            ("google", Some("key"), false),
        ]));
        let (c, provider) = connector(vec![ScriptedProvider::text("served by fallback")], registry);

        let resp = c
            .call(
                "openai/gpt-4o",
                "sys",
                "user",
                0.2,
                100,
                &["google/gemini-1.5-flash".into()],
            )
            .await
            .unwrap();

        assert!(resp.fallback_used());
        assert_eq!(resp.original_model.as_deref(), Some("openai/gpt-4o"));
        assert_eq!(resp.fallback_reason.as_deref(), Some("missing_credential"));
        assert_eq!(resp.model, "google/gemini-1.5-flash");
        // The disabled provider was never invoked.
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn disabled_provider_reason() {
        let registry = Arc::new(ProviderRegistry::with_states(&[
            ("openai", Some("sk"), true),
            ("google", Some("key"), false),
        ]));
        let (c, _) = connector(vec![ScriptedProvider::text("ok")], registry);

        let resp = c
            .call(
                "openai/gpt-4o",
                "sys",
                "user",
                0.2,
                100,
                &["google/gemini-1.5-flash".into()],
            )
            .await
            .unwrap();
        assert_eq!(resp.fallback_reason.as_deref(), Some("provider_disabled"));
    }

    #[tokio::test]
    async fn transient_errors_retried_then_succeed() {
        let (c, provider) = connector(
            vec![
                Err(LlmError::ServerError { status: 500, body: "boom".into() }),
                Err(LlmError::ServerError { status: 502, body: "boom".into() }),
                ScriptedProvider::text("recovered"),
            ],
            registry_all_enabled(),
        );
        let resp = c
            .call("openai/gpt-4o", "sys", "user", 0.2, 100, &[])
            .await
            .unwrap();
        assert_eq!(resp.text, "recovered");
        assert!(!resp.fallback_used());
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn auth_failure_moves_to_next_candidate_without_retry() {
        let (c, provider) = connector(
            vec![
                Err(LlmError::AuthenticationFailed("bad key".into())),
                ScriptedProvider::text("fallback ok"),
            ],
            registry_all_enabled(),
        );
        let resp = c
            .call(
                "openai/gpt-4o",
                "sys",
                "user",
                0.2,
                100,
                &["anthropic/claude-3-5-haiku-20241022".into()],
            )
            .await
            .unwrap();
        assert_eq!(resp.fallback_reason.as_deref(), Some("auth_failed"));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn empty_response_falls_through() {
        let (c, _) = connector(
            vec![Err(LlmError::EmptyResponse), ScriptedProvider::text("next")],
            registry_all_enabled(),
        );
        let resp = c
            .call(
                "openai/gpt-4o",
                "sys",
                "user",
                0.2,
                100,
                &["google/gemini-1.5-flash".into()],
            )
            .await
            .unwrap();
        assert_eq!(resp.fallback_reason.as_deref(), Some("empty_response"));
    }

    #[tokio::test]
    async fn content_filter_falls_through() {
        let (c, _) = connector(
            vec![
                Err(LlmError::ContentFiltered { reason: "safety".into() }),
                ScriptedProvider::text("clean"),
            ],
            registry_all_enabled(),
        );
        let resp = c
            .call(
                "openai/gpt-4o",
                "sys",
                "user",
                0.2,
                100,
                &["google/gemini-1.5-flash".into()],
            )
            .await
            .unwrap();
        assert_eq!(resp.fallback_reason.as_deref(), Some("content_filtered"));
    }

    #[tokio::test]
    async fn all_candidates_exhausted_reports_per_candidate_reasons() {
        let registry = Arc::new(ProviderRegistry::with_states(&[
            ("openai", None, false),
            ("google", Some("key"), false),
        ]));
        let (c, _) = connector(
            vec![
                Err(LlmError::ServerError { status: 500, body: "1".into() }),
                Err(LlmError::ServerError { status: 500, body: "2".into() }),
                Err(LlmError::ServerError { status: 500, body: "3".into() }),
                Err(LlmError::ServerError { status: 500, body: "4".into() }),
            ],
            registry,
        );

        let err = c
            .call(
                "openai/gpt-4o",
                "sys",
                "user",
                0.2,
                100,
                &["google/gemini-1.5-flash".into()],
            )
            .await
            .unwrap_err();

        match err {
            LlmError::AllProvidersFailed { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].model, "openai/gpt-4o");
                assert_eq!(attempts[0].reason, "missing_credential");
                assert_eq!(attempts[1].reason, "server_error");
            }
            other => panic!("expected AllProvidersFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cost_is_computed_from_table() {
        let (c, _) = connector(
            vec![Ok(crate::provider::ChatCompletion {
                text: "answer".into(),
                prompt_tokens: 1_000_000,
                completion_tokens: 1_000_000,
                finish_reason: Some("stop".into()),
            })],
            registry_all_enabled(),
        );
        let resp = c
            .call("openai/gpt-4o-mini", "sys", "user", 0.2, 100, &[])
            .await
            .unwrap();
        assert!((resp.estimated_cost_usd - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_model_costs_zero() {
        let (c, _) = connector(vec![ScriptedProvider::text("ok")], registry_all_enabled());
        let resp = c
            .call("openai/gpt-unpriced", "sys", "user", 0.2, 100, &[])
            .await
            .unwrap();
        assert_eq!(resp.estimated_cost_usd, 0.0);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let c = Connector::new(
            provider,
            registry_all_enabled(),
            RetryConfig {
                max_retries: 3,
                base_delay_ms: 500,
                max_delay_ms: 4000,
                call_timeout_secs: 5,
            },
        );
        assert_eq!(c.retry_delay(0, None), Duration::from_millis(500));
        assert_eq!(c.retry_delay(1, None), Duration::from_millis(1000));
        assert_eq!(c.retry_delay(2, None), Duration::from_millis(2000));
        assert_eq!(c.retry_delay(3, None), Duration::from_millis(4000));
        assert_eq!(c.retry_delay(10, None), Duration::from_millis(4000));
        // Server-suggested delay wins but is still capped.
        assert_eq!(
            c.retry_delay(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            c.retry_delay(0, Some(Duration::from_secs(60))),
            Duration::from_millis(4000)
        );
    }
}
