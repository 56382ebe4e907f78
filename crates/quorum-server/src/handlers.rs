use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use quorum_core::RunResult;
use quorum_engine::{ChainError, SessionSource};
use quorum_store::SearchFilter;

use crate::server::AppState;

/// HTTP-facing error wrapper: maps the chain error taxonomy onto status
/// codes and a JSON body.
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: String) -> Self {
        Self {
            status,
            kind,
            message,
        }
    }

    fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid_input", message.into())
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        let status = match &err {
            ChainError::InvalidSessionId(_) => StatusCode::BAD_REQUEST,
            ChainError::Config(_) => StatusCode::BAD_REQUEST,
            ChainError::StageFailed { .. } | ChainError::AllCriticsFailed => {
                StatusCode::BAD_GATEWAY
            }
            ChainError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ChainError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.error_kind(), err.to_string())
    }
}

impl From<quorum_store::StoreError> for ApiError {
    fn from(err: quorum_store::StoreError) -> Self {
        let status = match &err {
            quorum_store::StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.error_kind(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.message, "kind": self.kind });
        (self.status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
pub struct AskRequest {
    pub agent: String,
    pub prompt: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub override_model: Option<String>,
}

#[derive(Deserialize)]
pub struct ChainRequest {
    pub prompt: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub stages: Option<Vec<String>>,
}

pub async fn ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<RunResult>, ApiError> {
    state.mark_request();
    if request.prompt.trim().is_empty() {
        return Err(ApiError::invalid_input("prompt cannot be empty"));
    }

    let result = state
        .runtime
        .run(
            &request.agent,
            &request.prompt,
            request.override_model.as_deref(),
            request.session_id.as_deref(),
            SessionSource::Api,
        )
        .await?;
    Ok(Json(result))
}

pub async fn chain(
    State(state): State<AppState>,
    Json(request): Json<ChainRequest>,
) -> Result<Json<Vec<RunResult>>, ApiError> {
    state.mark_request();
    if request.prompt.trim().is_empty() {
        return Err(ApiError::invalid_input("prompt cannot be empty"));
    }

    let results = state
        .runtime
        .chain(
            &request.prompt,
            request.session_id.as_deref(),
            SessionSource::Api,
            request.stages,
        )
        .await?;
    Ok(Json(results))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_logs_limit")]
    pub limit: usize,
}

fn default_logs_limit() -> usize {
    20
}

pub async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    state.mark_request();
    if query.limit == 0 || query.limit > 1000 {
        return Err(ApiError::invalid_input("limit must be between 1 and 1000"));
    }
    Ok(Json(state.logger.read_logs(query.limit)))
}

pub async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.mark_request();
    let metrics = state.logger.metrics_24h();
    Json(serde_json::to_value(metrics).unwrap_or_default())
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let providers = state.registry.availability();
    let available = providers.iter().filter(|p| p.available).count();

    let memory = match state.runtime.conversations().stats() {
        Ok(stats) => json!({
            "connected": true,
            "total_conversations": stats.total_conversations,
            "db_size_mb": state.db.size_mb(),
            "last_conversation_at": state
                .runtime
                .conversations()
                .last_conversation_at()
                .unwrap_or(None),
        }),
        Err(e) => {
            warn!(error = %e, "memory health probe failed");
            json!({ "connected": false, "error": e.to_string() })
        }
    };
    let memory_connected = memory["connected"].as_bool().unwrap_or(false);

    let status = if available == 0 {
        "unhealthy"
    } else if available < 2 || !memory_connected {
        "degraded"
    } else {
        "healthy"
    };

    let provider_map: serde_json::Map<String, serde_json::Value> = providers
        .into_iter()
        .map(|p| {
            (
                p.name,
                json!({ "available": p.available, "reason": p.reason }),
            )
        })
        .collect();

    let body = json!({
        "status": status,
        "providers": provider_map,
        "memory": memory,
        "uptime_seconds": state.uptime_seconds(),
        "last_request_at": state.last_request_at(),
        "stats_24h": state.logger.metrics_24h(),
    });

    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body))
}

#[derive(Deserialize)]
pub struct MemorySearchQuery {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default = "default_memory_limit")]
    pub limit: u32,
}

#[derive(Deserialize)]
pub struct MemoryRecentQuery {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default = "default_memory_limit")]
    pub limit: u32,
}

fn default_memory_limit() -> u32 {
    10
}

pub async fn memory_search(
    State(state): State<AppState>,
    Query(query): Query<MemorySearchQuery>,
) -> Result<Json<Vec<quorum_store::ConversationRow>>, ApiError> {
    state.mark_request();
    let rows = state.runtime.conversations().search(&SearchFilter {
        query: query.q,
        agent: query.agent,
        limit: query.limit,
        ..Default::default()
    })?;
    Ok(Json(rows))
}

pub async fn memory_recent(
    State(state): State<AppState>,
    Query(query): Query<MemoryRecentQuery>,
) -> Result<Json<Vec<quorum_store::ConversationRow>>, ApiError> {
    state.mark_request();
    let rows = state
        .runtime
        .conversations()
        .recent(query.limit, query.agent.as_deref())?;
    Ok(Json(rows))
}

pub async fn memory_stats(
    State(state): State<AppState>,
) -> Result<Json<quorum_store::MemoryStats>, ApiError> {
    state.mark_request();
    Ok(Json(state.runtime.conversations().stats()?))
}

pub async fn memory_delete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.mark_request();
    state.runtime.conversations().delete(id)?;
    Ok(Json(json!({ "deleted": id, "timestamp": Utc::now().to_rfc3339() })))
}
