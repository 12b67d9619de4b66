//! JSON API of the master daemon.
//!
//! Clients submit, inspect, cancel and archive jobs here, and long-poll for
//! job changes. All handlers talk to the [`JobQueue`]; lock diagnostics come
//! from the [`LockManager`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

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

use crate::error::QueueError;
use crate::locking::{LockInfo, LockManager};
use crate::opcodes::OpInput;
use crate::scheduler::{CancelOutcome, Job, JobChange, JobFilter, JobId, JobQueue, JobStatus, QueueInfo};

/// Long-poll duration used when the client does not pass one.
const DEFAULT_WAIT_SECS: u64 = 30;

/// Default time budget of one auto-archive request.
const DEFAULT_ARCHIVE_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct ApiState {
    pub queue: Arc<JobQueue>,
    pub locks: Arc<LockManager>,
}

// =============================================================================
// Request and response bodies
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub ops: Vec<OpInput>,
    /// Applied to every opcode that does not carry its own priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl SubmitJobRequest {
    fn into_ops(self) -> Vec<OpInput> {
        let priority = self.priority;
        self.ops
            .into_iter()
            .map(|mut op| {
                if op.priority.is_none() {
                    op.priority = priority;
                }
                op
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub success: bool,
    pub job_id: Option<JobId>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBatchRequest {
    pub jobs: Vec<SubmitJobRequest>,
}

/// Full job record with its derived status and priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub status: JobStatus,
    pub priority: i32,
    pub job: Job,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            status: job.calc_status(),
            priority: job.calc_priority(),
            job,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListItem {
    pub id: JobId,
    pub status: JobStatus,
    pub priority: i32,
    pub summary: Vec<String>,
    pub received_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
}

impl From<&Job> for JobListItem {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.calc_status(),
            priority: job.calc_priority(),
            summary: job.summary(),
            received_timestamp: job.received_timestamp,
            end_timestamp: job.end_timestamp,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    pub summary: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitQuery {
    pub prev_status: Option<JobStatus>,
    #[serde(default)]
    pub prev_log_serial: u64,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveJobResponse {
    pub archived: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoArchiveRequest {
    /// Only jobs finished at least this long ago; all finished jobs if unset.
    #[serde(default)]
    pub age_secs: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoArchiveResponse {
    pub archived: usize,
    /// Jobs left unchecked because the time budget ran out.
    pub remaining: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainRequest {
    pub drain: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A queue error rendered as a JSON error body.
#[derive(Debug)]
pub struct ApiError(QueueError);

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            QueueError::Drained | QueueError::Full(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueueError::Validation(_) | QueueError::InvalidPriority(_) => StatusCode::BAD_REQUEST,
            QueueError::JobNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// =============================================================================
// Server
// =============================================================================

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/batch", post(submit_batch_handler))
        .route("/api/jobs/:id", get(job_handler))
        .route("/api/jobs/:id/wait", get(wait_handler))
        .route("/api/jobs/:id/cancel", post(cancel_handler))
        .route("/api/jobs/:id/archive", post(archive_handler))
        .route("/api/queue", get(queue_info_handler))
        .route("/api/queue/drain", put(drain_handler))
        .route("/api/queue/archive", post(auto_archive_handler))
        .route("/api/locks", get(locks_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "API server failed");
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    let ops = payload.into_ops();
    match run_blocking(&state.queue, move |queue| queue.submit_job(ops)).await {
        Ok(job_id) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                success: true,
                job_id: Some(job_id),
                error: None,
            }),
        ),
        Err(e) => {
            let error = e.to_string();
            (
                ApiError(e).status(),
                Json(SubmitJobResponse {
                    success: false,
                    job_id: None,
                    error: Some(error),
                }),
            )
        }
    }
}

async fn submit_batch_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitBatchRequest>,
) -> ApiResult<Vec<SubmitJobResponse>> {
    let jobs: Vec<Vec<OpInput>> = payload.jobs.into_iter().map(SubmitJobRequest::into_ops).collect();
    let results = run_blocking(&state.queue, move |queue| Ok(queue.submit_many_jobs(jobs)))
        .await?
        .into_iter()
        .map(|result| match result {
            Ok(job_id) => SubmitJobResponse {
                success: true,
                job_id: Some(job_id),
                error: None,
            },
            Err(e) => SubmitJobResponse {
                success: false,
                job_id: None,
                error: Some(e.to_string()),
            },
        })
        .collect();
    Ok(Json(results))
}

async fn list_jobs_handler(
    State(state): State<ApiState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Vec<JobListItem>> {
    let filter = JobFilter {
        statuses: query.status.map(|s| vec![s]),
        summary: query.summary,
        include_archived: query.archived,
        ..Default::default()
    };
    let jobs = run_blocking(&state.queue, move |queue| queue.query_jobs(&filter)).await?;
    Ok(Json(jobs.iter().map(JobListItem::from).collect()))
}

async fn job_handler(State(state): State<ApiState>, Path(id): Path<JobId>) -> ApiResult<JobResponse> {
    let job = run_blocking(&state.queue, move |queue| queue.query_job(id)).await?;
    Ok(Json(job.into()))
}

async fn wait_handler(
    State(state): State<ApiState>,
    Path(id): Path<JobId>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<JobChange> {
    let timeout = Duration::from_secs(query.timeout_secs.unwrap_or(DEFAULT_WAIT_SECS));
    let change = state
        .queue
        .wait_for_job_change(id, query.prev_status, query.prev_log_serial, timeout)
        .await?;
    Ok(Json(change))
}

async fn cancel_handler(State(state): State<ApiState>, Path(id): Path<JobId>) -> ApiResult<CancelOutcome> {
    let outcome = run_blocking(&state.queue, move |queue| queue.cancel_job(id)).await?;
    tracing::info!(job_id = id, success = outcome.success, "Cancel requested");
    Ok(Json(outcome))
}

async fn archive_handler(
    State(state): State<ApiState>,
    Path(id): Path<JobId>,
) -> ApiResult<ArchiveJobResponse> {
    let archived = run_blocking(&state.queue, move |queue| queue.archive_job(id)).await?;
    Ok(Json(ArchiveJobResponse { archived }))
}

async fn auto_archive_handler(
    State(state): State<ApiState>,
    Json(payload): Json<AutoArchiveRequest>,
) -> ApiResult<AutoArchiveResponse> {
    let age = payload.age_secs.map(Duration::from_secs);
    let timeout = Duration::from_secs(payload.timeout_secs.unwrap_or(DEFAULT_ARCHIVE_TIMEOUT_SECS));
    let (archived, remaining) =
        run_blocking(&state.queue, move |queue| queue.auto_archive_jobs(age, timeout)).await?;
    Ok(Json(AutoArchiveResponse { archived, remaining }))
}

async fn queue_info_handler(State(state): State<ApiState>) -> Json<QueueInfo> {
    Json(state.queue.info())
}

async fn drain_handler(
    State(state): State<ApiState>,
    Json(payload): Json<DrainRequest>,
) -> ApiResult<QueueInfo> {
    let drain = payload.drain;
    run_blocking(&state.queue, move |queue| queue.set_drain_flag(drain)).await?;
    tracing::info!(drain = payload.drain, "Drain flag changed");
    Ok(Json(state.queue.info()))
}

async fn locks_handler(State(state): State<ApiState>) -> Json<Vec<LockInfo>> {
    Json(state.locks.info())
}

/// Run a queue call that touches the disk on the blocking thread pool.
async fn run_blocking<T, F>(queue: &Arc<JobQueue>, f: F) -> Result<T, QueueError>
where
    F: FnOnce(&JobQueue) -> Result<T, QueueError> + Send + 'static,
    T: Send + 'static,
{
    let queue = queue.clone();
    tokio::task::spawn_blocking(move || f(&queue))
        .await
        .map_err(|e| QueueError::Internal(format!("queue task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_priority_fills_unset_op_priorities() {
        use crate::opcodes::OpCode;
        let request = SubmitJobRequest {
            ops: vec![
                OpInput::from(OpCode::ClusterQuery {}),
                OpInput::from(OpCode::ClusterQuery {}).with_priority(10),
            ],
            priority: Some(-10),
        };
        let ops = request.into_ops();
        assert_eq!(ops[0].priority, Some(-10));
        assert_eq!(ops[1].priority, Some(10));
    }

    #[test]
    fn errors_map_to_http_status() {
        assert_eq!(
            ApiError(QueueError::Full(5)).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError(QueueError::Drained).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ApiError(QueueError::InvalidPriority(3)).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError(QueueError::JobNotFound(9)).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError(QueueError::Internal("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
