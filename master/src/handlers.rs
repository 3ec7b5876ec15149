use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    client::ErrorBody, AgentView, CoordinatorApi, FlowError, GrantStatus, HeartbeatAck,
    HeartbeatRequest, SlotGrant, SlotRequest,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::Coordinator;

pub fn build_router(coordinator: Coordinator) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/agents", get(list_agents))
        .route("/api/v1/agents/heartbeat", post(agent_heartbeat))
        .route("/api/v1/slots/request", post(request_slots))
        .route("/api/v1/grants/:id", get(grant_status))
        .route("/api/v1/grants/:id/confirm", post(confirm_grant))
        .route("/api/v1/grants/:id/release", post(release_grant))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

/// `FlowError` como respuesta HTTP con cuerpo `ErrorBody`.
pub struct ApiError(FlowError);

impl From<FlowError> for ApiError {
    fn from(e: FlowError) -> Self {
        ApiError(e)
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

async fn list_agents(State(c): State<Coordinator>) -> ApiResult<Vec<AgentView>> {
    Ok(Json(c.agents().await?))
}

async fn agent_heartbeat(
    State(c): State<Coordinator>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<HeartbeatAck> {
    Ok(Json(c.heartbeat(req).await?))
}

async fn request_slots(
    State(c): State<Coordinator>,
    Json(req): Json<SlotRequest>,
) -> ApiResult<Vec<SlotGrant>> {
    let flow_id = req.flow_id.clone();
    let grants = c.request_slots(req).await.map_err(|e| {
        info!("pedido de slots de {} rechazado: {}", flow_id, e);
        e
    })?;
    Ok(Json(grants))
}

async fn grant_status(State(c): State<Coordinator>, Path(id): Path<String>) -> ApiResult<GrantStatus> {
    Ok(Json(c.grant_status(&id).await?))
}

async fn confirm_grant(State(c): State<Coordinator>, Path(id): Path<String>) -> ApiResult<GrantStatus> {
    Ok(Json(c.confirm_grant(&id).await?))
}

async fn release_grant(State(c): State<Coordinator>, Path(id): Path<String>) -> ApiResult<GrantStatus> {
    Ok(Json(c.release_grant(&id).await?))
}
