//! JSON admin and reporting API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::agent::{AgentId, AgentMode, AgentStatus};
use crate::error::HerdError;
use crate::session::{SessionHandler, SessionId, SessionState};
use crate::task_source::{Deployment, Job, JobRequirements, JobSource, UpgradeTaskSource};

#[derive(Clone)]
pub struct ApiState {
    pub handler: Arc<SessionHandler>,
    pub jobs: Arc<JobSource>,
    pub upgrades: Arc<UpgradeTaskSource>,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<HerdError> for ApiError {
    fn from(err: HerdError) -> Self {
        let status = match err {
            HerdError::AgentNotFound(_) | HerdError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            HerdError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            HerdError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

#[derive(Deserialize)]
struct ResourceNeedsRequest {
    #[serde(default)]
    pool: String,
    #[serde(default)]
    resource_needs: HashMap<String, i32>,
}

#[derive(Serialize)]
struct LeaseView {
    id: String,
    task_type: String,
    exclusive: bool,
}

#[derive(Serialize)]
struct AgentView {
    id: String,
    status: AgentStatus,
    mode: AgentMode,
    enabled: bool,
    online: bool,
    version: String,
    pools: Vec<String>,
    compute_cluster: Option<String>,
    session_id: Option<String>,
    session_state: Option<SessionState>,
    leases: Vec<LeaseView>,
    /// Task type the agent is draining for, if any
    draining: Option<String>,
    request_restart: bool,
    request_force_restart: bool,
    request_shutdown: bool,
}

#[derive(Deserialize, Default)]
struct RestartParams {
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct SubmitJobRequest {
    #[serde(default)]
    name: Option<String>,
    command: String,
    #[serde(default)]
    requirements: JobRequirements,
}

#[derive(Deserialize)]
struct DeploymentRequest {
    version: String,
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    rollout_duration_secs: u64,
}

#[derive(Deserialize, Serialize)]
struct DowntimeRequest {
    enabled: bool,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/sessions/:session_id/resource-needs",
            post(report_resource_needs_handler),
        )
        .route(
            "/api/compute/:cluster_id/resource-needs",
            get(resource_needs_handler),
        )
        .route("/api/agents", get(list_agents_handler))
        .route("/api/agents/:agent_id/restart", post(restart_handler))
        .route("/api/agents/:agent_id/shutdown", post(shutdown_handler))
        .route("/api/agents/:agent_id/enable", post(enable_handler))
        .route("/api/agents/:agent_id/disable", post(disable_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route(
            "/api/deployments",
            get(get_deployment_handler).post(set_deployment_handler),
        )
        .route("/api/downtime", put(downtime_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_http(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting HTTP API");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP API");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "HTTP API failed");
    }
}

async fn report_resource_needs_handler(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    Json(payload): Json<ResourceNeedsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id: SessionId = session_id
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid session ID"))?;
    let needs = state
        .handler
        .report_resource_needs(&session_id, payload.pool, payload.resource_needs)
        .await?;
    Ok(Json(needs))
}

async fn resource_needs_handler(
    State(state): State<ApiState>,
    Path(cluster_id): Path<String>,
) -> impl IntoResponse {
    Json(state.handler.resource_needs().for_cluster(&cluster_id).await)
}

async fn list_agents_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let mut agents = Vec::new();
    for entry in state.handler.agents().all().await {
        let agent = entry.lock().await;
        let session = agent.session.as_ref().filter(|s| s.is_live());
        agents.push(AgentView {
            id: agent.id.to_string(),
            status: agent.status,
            mode: agent.mode,
            enabled: agent.enabled,
            online: agent.is_online(),
            version: agent.version.clone(),
            pools: agent.pools.clone(),
            compute_cluster: agent.compute_cluster.clone(),
            session_id: session.map(|s| s.id.to_string()),
            session_state: session.map(|s| s.state),
            leases: agent
                .leases
                .iter()
                .map(|(id, lease)| LeaseView {
                    id: id.to_string(),
                    task_type: lease.task_type.clone(),
                    exclusive: lease.exclusive,
                })
                .collect(),
            draining: agent.pending_drain.clone(),
            request_restart: agent.request_restart,
            request_force_restart: agent.request_force_restart,
            request_shutdown: agent.request_shutdown,
        });
    }
    Json(agents)
}

async fn restart_handler(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
    Query(params): Query<RestartParams>,
) -> Result<StatusCode, ApiError> {
    state
        .handler
        .agents()
        .request_restart(&AgentId::new(agent_id), params.force)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn shutdown_handler(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .handler
        .agents()
        .request_shutdown(&AgentId::new(agent_id))
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn enable_handler(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .handler
        .agents()
        .set_enabled(&AgentId::new(agent_id), true)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn disable_handler(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .handler
        .agents()
        .set_enabled(&AgentId::new(agent_id), false)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.jobs.jobs().await)
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.command.trim().is_empty() {
        return Err(ApiError::bad_request("Command cannot be empty"));
    }
    let name = payload.name.unwrap_or_else(|| payload.command.clone());
    let job = Job::new(name, payload.command).with_requirements(payload.requirements);
    let job = state.jobs.submit(job).await?;
    state.handler.agents().notify_capacity_changed();
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_deployment_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.upgrades.deployment().await)
}

async fn set_deployment_handler(
    State(state): State<ApiState>,
    Json(payload): Json<DeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.version.trim().is_empty() {
        return Err(ApiError::bad_request("Version cannot be empty"));
    }
    let deployment = Deployment {
        version: payload.version,
        start_time: payload.start_time.unwrap_or_else(Utc::now),
        rollout_duration_secs: payload.rollout_duration_secs,
    };
    state.upgrades.set_deployment(deployment.clone()).await;
    Ok(Json(deployment))
}

async fn downtime_handler(
    State(state): State<ApiState>,
    Json(payload): Json<DowntimeRequest>,
) -> impl IntoResponse {
    state.handler.set_downtime(payload.enabled);
    Json(DowntimeRequest {
        enabled: state.handler.is_downtime(),
    })
}
