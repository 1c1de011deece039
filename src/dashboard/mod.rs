use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::EngineError;
use crate::scheduler::{JobId, JobKind, JobPayload, JobRecord, JobStatus, OwnerScope, Runner};

#[derive(Clone)]
pub struct DashboardState {
    pub runner: Runner,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub org_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub kind: String,
    pub org_id: String,
    pub user_id: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SubmitJobResponse {
    job_id: String,
}

#[derive(Debug, Serialize)]
struct CancelJobResponse {
    job_id: String,
    cancelled: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Maps engine errors onto HTTP statuses.
struct ApiError(StatusCode, String);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::JobNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::UnknownKind(_) | EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Store(_) | EngineError::Source(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, message.into())
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/{id}", get(get_job_handler))
        .route("/api/jobs/{id}/cancel", post(cancel_job_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| bad_request(format!("invalid job id '{}'", raw)))
}

async fn stats_handler(State(state): State<DashboardState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.runner.stats().await?))
}

async fn list_jobs_handler(
    State(state): State<DashboardState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(bad_request)?;

    let mut jobs: Vec<JobRecord> = match (query.org_id, query.user_id) {
        (Some(org_id), Some(user_id)) => {
            let owned = state
                .runner
                .list_by_owner(&OwnerScope::new(org_id, user_id))
                .await?;
            owned
                .into_iter()
                .filter(|job| status.map_or(true, |s| job.status == s))
                .collect()
        }
        (None, None) => match status {
            Some(status) => state.runner.list_by_status(status).await?,
            None => {
                let mut all = Vec::new();
                for status in [
                    JobStatus::Queued,
                    JobStatus::Processing,
                    JobStatus::Completed,
                    JobStatus::Failed,
                ] {
                    all.extend(state.runner.list_by_status(status).await?);
                }
                all
            }
        },
        _ => return Err(bad_request("org_id and user_id must be given together")),
    };

    jobs.sort_by_key(|job| (job.created_at, job.id));
    Ok(Json(jobs))
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let kind: JobKind = request.kind.parse().map_err(bad_request)?;
    let payload = JobPayload {
        prompt: request.prompt,
        parameters: request.parameters,
    };

    let job_id = state
        .runner
        .submit(
            kind,
            OwnerScope::new(request.org_id, request.user_id),
            payload,
            request.max_attempts,
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id: job_id.to_string(),
        }),
    ))
}

async fn get_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.runner.get_job(&id).await?))
}

async fn cancel_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_job_id(&id)?;
    let cancelled = state.runner.cancel(&id).await?;
    Ok(Json(CancelJobResponse {
        job_id: id.to_string(),
        cancelled,
    }))
}
