use std::sync::Arc;
use std::time::Instant;

use axum::routing::{delete, get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use quorum_core::ProviderRegistry;
use quorum_engine::ChainRuntime;
use quorum_store::Database;
use quorum_telemetry::ConversationLogger;

use crate::handlers;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8420 }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<ChainRuntime>,
    pub registry: Arc<ProviderRegistry>,
    pub db: Database,
    pub logger: Arc<ConversationLogger>,
    start_time: Instant,
    last_request: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl AppState {
    pub fn new(
        runtime: Arc<ChainRuntime>,
        registry: Arc<ProviderRegistry>,
        db: Database,
        logger: Arc<ConversationLogger>,
    ) -> Self {
        Self {
            runtime,
            registry,
            db,
            logger,
            start_time: Instant::now(),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn mark_request(&self) {
        *self.last_request.lock() = Some(Utc::now());
    }

    pub fn last_request_at(&self) -> Option<String> {
        self.last_request.lock().map(|t| t.to_rfc3339())
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ask", post(handlers::ask))
        .route("/chain", post(handlers::chain))
        .route("/logs", get(handlers::logs))
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health))
        .route("/memory/search", get(handlers::memory_search))
        .route("/memory/recent", get(handlers::memory_recent))
        .route("/memory/stats", get(handlers::memory_stats))
        .route("/memory/{id}", delete(handlers::memory_delete))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Handle returned by `start()` — call `shutdown()` then `drain()`.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Signal the server to stop accepting new connections.
    pub fn shutdown(&self) {
        tracing::info!("server shutdown initiated");
        self.shutdown.cancel();
    }

    /// Wait for the server task to finish after shutdown.
    pub async fn drain(self) {
        let _ = self.server.await;
        tracing::debug!("server task drained");
    }
}

/// Bind and serve. Returns a handle for graceful shutdown.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "quorum server started");

    let shutdown = CancellationToken::new();
    let shutdown_for_axum = shutdown.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_for_axum.cancelled().await;
            })
            .await
            .ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server: server_task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::{
        AgentConfig, CriticConfig, CriticsConfig, MemoryConfig, OrchestratorConfig, RetryConfig,
    };
    use quorum_embeddings::HashEmbedder;
    use quorum_llm::{Connector, LlmError, ScriptedProvider};

    fn agent(name: &str) -> AgentConfig {
        AgentConfig {
            name: name.into(),
            model: "openai/gpt-4o".into(),
            system_prompt: format!("You are the {name}."),
            temperature: 0.2,
            max_tokens: 200,
            fallback_models: vec![],
            memory_enabled: false,
            memory: MemoryConfig::default(),
        }
    }

    fn state_with(
        responses: Vec<Result<quorum_llm::ChatCompletion, LlmError>>,
        registry: ProviderRegistry,
    ) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            agents: vec![agent("builder"), agent("closer"), agent("quality")],
            critics: CriticsConfig {
                members: vec![CriticConfig {
                    name: "quality".into(),
                    weight: 1.0,
                    keywords: vec!["anything".into()],
                }],
                dynamic_selection: false,
                min_critics: 1,
                max_critics: 1,
                fallback_critics: vec!["quality".into()],
                ..Default::default()
            },
            retry: RetryConfig {
                max_retries: 0,
                base_delay_ms: 1,
                max_delay_ms: 2,
                call_timeout_secs: 5,
            },
            ..Default::default()
        };
        let registry = Arc::new(registry);
        let db = Database::in_memory().unwrap();
        let logger = Arc::new(ConversationLogger::new(dir.path()));
        let connector = Arc::new(Connector::new(
            Arc::new(ScriptedProvider::new(responses)),
            registry.clone(),
            config.retry.clone(),
        ));
        let runtime = Arc::new(ChainRuntime::new(
            Arc::new(config),
            connector,
            db.clone(),
            Arc::new(HashEmbedder::default()),
            logger.clone(),
        ));
        (AppState::new(runtime, registry, db, logger), dir)
    }

    fn two_provider_registry() -> ProviderRegistry {
        ProviderRegistry::with_states(&[
            ("openai", Some("sk-test"), false),
            ("google", Some("g-key"), false),
        ])
    }

    async fn start_test_server(state: AppState) -> ServerHandle {
        start(ServerConfig { port: 0 }, state).await.unwrap()
    }

    #[tokio::test]
    async fn health_reports_healthy_with_two_providers() {
        let (state, _dir) = state_with(vec![], two_provider_registry());
        let handle = start_test_server(state).await;

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["providers"]["openai"]["available"], true);
        assert_eq!(body["memory"]["connected"], true);
        assert!(body["uptime_seconds"].is_number());

        handle.shutdown();
        handle.drain().await;
    }

    #[tokio::test]
    async fn health_degraded_with_one_provider() {
        let registry = ProviderRegistry::with_states(&[
            ("openai", Some("sk-test"), false),
            ("google", None, false),
        ]);
        let (state, _dir) = state_with(vec![], registry);
        let handle = start_test_server(state).await;

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["providers"]["google"]["available"], false);
        assert_eq!(body["providers"]["google"]["reason"], "missing_credential");

        handle.shutdown();
        handle.drain().await;
    }

    #[tokio::test]
    async fn health_unhealthy_without_providers() {
        let registry = ProviderRegistry::with_states(&[("openai", None, false)]);
        let (state, _dir) = state_with(vec![], registry);
        let handle = start_test_server(state).await;

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 503);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "unhealthy");

        handle.shutdown();
        handle.drain().await;
    }

    #[tokio::test]
    async fn ask_roundtrip() {
        let (state, _dir) = state_with(
            vec![ScriptedProvider::text("hello from builder")],
            two_provider_registry(),
        );
        let handle = start_test_server(state).await;

        let url = format!("http://127.0.0.1:{}/ask", handle.port);
        let client = reqwest::Client::new();
        let resp = client
            .post(&url)
            .json(&serde_json::json!({ "agent": "builder", "prompt": "say hello" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["agent"], "builder");
        assert_eq!(body["response"], "hello from builder");
        assert_eq!(
            body["total_tokens"].as_u64().unwrap(),
            body["prompt_tokens"].as_u64().unwrap() + body["completion_tokens"].as_u64().unwrap()
        );

        handle.shutdown();
        handle.drain().await;
    }

    #[tokio::test]
    async fn ask_empty_prompt_is_422() {
        let (state, _dir) = state_with(vec![], two_provider_registry());
        let handle = start_test_server(state).await;

        let url = format!("http://127.0.0.1:{}/ask", handle.port);
        let resp = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({ "agent": "builder", "prompt": "   " }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 422);

        handle.shutdown();
        handle.drain().await;
    }

    #[tokio::test]
    async fn ask_unknown_agent_is_400() {
        let (state, _dir) = state_with(vec![], two_provider_registry());
        let handle = start_test_server(state).await;

        let url = format!("http://127.0.0.1:{}/ask", handle.port);
        let resp = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({ "agent": "ghost", "prompt": "hi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["kind"], "config");

        handle.shutdown();
        handle.drain().await;
    }

    #[tokio::test]
    async fn ask_invalid_session_is_400() {
        let (state, _dir) = state_with(vec![], two_provider_registry());
        let handle = start_test_server(state).await;

        let url = format!("http://127.0.0.1:{}/ask", handle.port);
        let resp = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({
                "agent": "builder",
                "prompt": "hi",
                "session_id": "bad session!"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["kind"], "invalid_session_id");

        handle.shutdown();
        handle.drain().await;
    }

    #[tokio::test]
    async fn ask_provider_exhaustion_is_502() {
        let (state, _dir) = state_with(
            vec![Err(LlmError::ServerError { status: 500, body: "down".into() })],
            two_provider_registry(),
        );
        let handle = start_test_server(state).await;

        let url = format!("http://127.0.0.1:{}/ask", handle.port);
        let resp = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({ "agent": "builder", "prompt": "hi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);

        handle.shutdown();
        handle.drain().await;
    }

    #[tokio::test]
    async fn chain_roundtrip_returns_ordered_results() {
        let (state, _dir) = state_with(
            vec![
                ScriptedProvider::text("built"),
                ScriptedProvider::text("no issues at all"),
                ScriptedProvider::text("closed"),
            ],
            two_provider_registry(),
        );
        let handle = start_test_server(state).await;

        let url = format!("http://127.0.0.1:{}/chain", handle.port);
        let resp = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({ "prompt": "do the thing" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Vec<serde_json::Value> = resp.json().await.unwrap();
        let agents: Vec<&str> = body.iter().map(|r| r["agent"].as_str().unwrap()).collect();
        assert_eq!(agents, vec!["builder", "multi-critic", "closer"]);

        handle.shutdown();
        handle.drain().await;
    }

    #[tokio::test]
    async fn memory_endpoints_roundtrip() {
        let (state, _dir) = state_with(
            vec![ScriptedProvider::text("stored answer about jwt")],
            two_provider_registry(),
        );
        let handle = start_test_server(state).await;
        let client = reqwest::Client::new();
        let base = format!("http://127.0.0.1:{}", handle.port);

        client
            .post(format!("{base}/ask"))
            .json(&serde_json::json!({ "agent": "builder", "prompt": "tell me about jwt" }))
            .send()
            .await
            .unwrap();

        let recent: Vec<serde_json::Value> = client
            .get(format!("{base}/memory/recent?limit=5"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        let id = recent[0]["id"].as_i64().unwrap();

        let hits: Vec<serde_json::Value> = client
            .get(format!("{base}/memory/search?q=jwt"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let stats: serde_json::Value = client
            .get(format!("{base}/memory/stats"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["total_conversations"], 1);

        let deleted = client
            .delete(format!("{base}/memory/{id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), 200);
        // Idempotent: deleting again still succeeds.
        let again = client
            .delete(format!("{base}/memory/{id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), 200);

        handle.shutdown();
        handle.drain().await;
    }

    #[tokio::test]
    async fn logs_and_metrics_endpoints() {
        let (state, _dir) = state_with(
            vec![ScriptedProvider::text("logged answer")],
            two_provider_registry(),
        );
        let handle = start_test_server(state).await;
        let client = reqwest::Client::new();
        let base = format!("http://127.0.0.1:{}", handle.port);

        client
            .post(format!("{base}/ask"))
            .json(&serde_json::json!({ "agent": "builder", "prompt": "log me" }))
            .send()
            .await
            .unwrap();

        let logs: Vec<serde_json::Value> = client
            .get(format!("{base}/logs?limit=10"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["agent"], "builder");

        let metrics: serde_json::Value = client
            .get(format!("{base}/metrics"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(metrics["total_requests"], 1);
        assert_eq!(metrics["by_agent"]["builder"], 1);

        let bad = client
            .get(format!("{base}/logs?limit=5000"))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), 422);

        handle.shutdown();
        handle.drain().await;
    }
}
