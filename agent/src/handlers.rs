use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    client::ErrorBody, AckReadRequest, AgentStatus, ExecutorHandle, ExecutorStatus, FlowError,
    RegisterReadersRequest, ReleaseFlowRequest, ShardHandle, ShardKey, StartExecutorRequest,
};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

use crate::Agent;

pub fn build_router(agent: Agent) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/executors", post(start_executor))
        .route("/api/v1/executors/:id", get(executor_status))
        .route("/api/v1/executors/:id/cancel", post(cancel_executor))
        .route("/api/v1/shards", get(fetch_shard))
        .route("/api/v1/shards/readers", post(register_readers))
        .route("/api/v1/shards/ack", post(ack_reads))
        .route("/api/v1/flows/:id/release", post(release_flow))
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

pub struct ApiError(FlowError);

impl From<FlowError> for ApiError {
    fn from(e: FlowError) -> Self {
        ApiError(e)
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        ApiError(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody::from_error(&self.0);
        let status =
            StatusCode::from_u16(body.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn status(State(agent): State<Agent>) -> Json<AgentStatus> {
    Json(agent.status())
}

async fn start_executor(
    State(agent): State<Agent>,
    Json(req): Json<StartExecutorRequest>,
) -> ApiResult<ExecutorHandle> {
    Ok(Json(agent.start(req)?))
}

async fn executor_status(State(agent): State<Agent>, Path(id): Path<String>) -> ApiResult<ExecutorStatus> {
    Ok(Json(agent.executor_status(&id)?))
}

async fn cancel_executor(State(agent): State<Agent>, Path(id): Path<String>) -> StatusCode {
    agent.cancel(&id);
    StatusCode::NO_CONTENT
}

// Sirve un shard completo como JSONL; los de disco se streamean sin cargarlos.
async fn fetch_shard(
    State(agent): State<Agent>,
    Query(key): Query<ShardKey>,
) -> Result<Response, ApiError> {
    let (handle, _) = agent.store().locate(&key)?;
    let body = match handle {
        ShardHandle::Memory(bytes) => Body::from(bytes),
        ShardHandle::Disk(path) => {
            let file = tokio::fs::File::open(path).await?;
            Body::from_stream(ReaderStream::new(file))
        }
    };
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

async fn register_readers(
    State(agent): State<Agent>,
    Json(req): Json<RegisterReadersRequest>,
) -> StatusCode {
    agent.register_readers(&req.key, req.readers);
    StatusCode::NO_CONTENT
}

async fn ack_reads(State(agent): State<Agent>, Json(req): Json<AckReadRequest>) -> StatusCode {
    agent.ack_reads(&req.keys);
    StatusCode::NO_CONTENT
}

async fn release_flow(
    State(agent): State<Agent>,
    Path(flow_id): Path<String>,
    Json(req): Json<ReleaseFlowRequest>,
) -> Json<usize> {
    Json(agent.release_flow(&flow_id, req.include_persistent))
}
