//! HTTP gateway
//!
//! Thin axum adapter over [`Engine`]: the execution tool, dataset reports,
//! conversation lifecycle and the artifact file route.

use std::sync::Arc;

use axum::extract::{Json, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::cache::DatasetReport;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::quota::{ConversationExecutionState, DatasetRecord};
use crate::response::{ExecuteArgs, ToolResponse};
use crate::scheduler::PoolStats;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
        }
    }
}

/// Engine failure as an HTTP response.
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
            err if err.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Gateway error: {}", self.0);
        }
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    pool: PoolStats,
    conversations: usize,
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    conversation_id: String,
    #[serde(flatten)]
    args: ExecuteArgs,
}

#[derive(Debug, Deserialize)]
struct DatasetRequest {
    conversation_id: String,
    #[serde(flatten)]
    report: DatasetReport,
}

#[derive(Debug, Serialize)]
struct LifecycleResponse {
    conversation_id: String,
    found: bool,
}

pub fn router(engine: Arc<Engine>) -> Router {
    let files = format!("{}/:file_id", engine.publisher().route_prefix());
    Router::new()
        .route("/health", get(health_handler))
        .route("/tools/execute_python_code", post(execute_handler))
        .route("/datasets", post(dataset_handler))
        .route(
            "/conversations/:id",
            get(snapshot_handler).delete(end_handler),
        )
        .route("/conversations/:id/reset", post(reset_handler))
        .route(&files, get(file_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Serve until Ctrl-C, then shut the worker pool down.
pub async fn serve(engine: Arc<Engine>, config: GatewayConfig) -> EngineResult<()> {
    let listener = TcpListener::bind(config.bind_addr.as_str()).await?;
    tracing::info!("Gateway listening on {}", config.bind_addr);

    axum::serve(listener, router(Arc::clone(&engine)).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

async fn health_handler(State(engine): State<Arc<Engine>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        pool: engine.pool_stats(),
        conversations: engine.conversation_count(),
    })
}

async fn execute_handler(
    State(engine): State<Arc<Engine>>,
    Json(payload): Json<ExecuteRequest>,
) -> Json<ToolResponse> {
    Json(engine.call_tool(&payload.conversation_id, payload.args).await)
}

async fn dataset_handler(
    State(engine): State<Arc<Engine>>,
    Json(payload): Json<DatasetRequest>,
) -> Result<Json<DatasetRecord>, ApiError> {
    let record = engine
        .record_dataset_load(&payload.conversation_id, payload.report)
        .await?;
    Ok(Json(record))
}

async fn snapshot_handler(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<ConversationExecutionState>, StatusCode> {
    engine.snapshot(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn reset_handler(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Json<LifecycleResponse> {
    let found = engine.reset_conversation(&id).await;
    Json(LifecycleResponse {
        conversation_id: id,
        found,
    })
}

async fn end_handler(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Json<LifecycleResponse> {
    let found = engine.end_conversation(&id).await;
    Json(LifecycleResponse {
        conversation_id: id,
        found,
    })
}

async fn file_handler(
    State(engine): State<Arc<Engine>>,
    Path(file_id): Path<String>,
) -> Result<Response, ApiError> {
    let resolved = engine.publisher().resolve(&file_id)?;
    let bytes = tokio::fs::read(&resolved.path).await.map_err(EngineError::from)?;
    tracing::debug!("Serving artifact {}", resolved.path.display());
    Ok(([(header::CONTENT_TYPE, resolved.media_type)], bytes).into_response())
}
