//! Internal HTTP surface: the worker completion callback plus run
//! inspection and cancellation.
//!
//! Every `/internal` route requires the shared secret in the
//! `x-relay-internal-secret` header. Only the SHA-256 digest of the
//! configured secret is kept in memory and compared against the digest of
//! the presented one. With no secret configured every internal request is
//! refused.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::coordinator::{CompletionAck, CompletionReport, Coordinator, RunProgress};
use crate::errors::{CoordinatorError, RunError};
use crate::store::WorkerOutcome;

pub const SECRET_HEADER: &str = "x-relay-internal-secret";

// ── Wire types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Failed,
}

/// Body of `POST /internal/runs/{run_id}/resume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub job_id: i64,
    pub worker_id: String,
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResumeRequest {
    pub fn into_report(self, run_id: i64) -> CompletionReport {
        let outcome = match self.status {
            ReportStatus::Success => WorkerOutcome::Success {
                result: self.result_summary,
            },
            ReportStatus::Failed => WorkerOutcome::Failed {
                error: self
                    .error
                    .unwrap_or_else(|| "Worker reported failure".to_string()),
            },
        };
        CompletionReport {
            run_id,
            job_id: self.job_id,
            worker_id: self.worker_id,
            outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResumeResponse {
    Accepted { completed: u32, expected: u32 },
    Resumed { progress: RunProgress },
    /// Duplicate report, barrier already resolved, or run no longer waiting.
    Skipped,
}

impl From<CompletionAck> for ResumeResponse {
    fn from(ack: CompletionAck) -> Self {
        match ack {
            CompletionAck::Accepted {
                completed,
                expected,
            } => Self::Accepted {
                completed,
                expected,
            },
            CompletionAck::Resumed {
                progress: RunProgress::Skipped,
            }
            | CompletionAck::Duplicate
            | CompletionAck::Skipped => Self::Skipped,
            CompletionAck::Resumed { progress } => Self::Resumed { progress },
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────

/// Set in a 500 body when the report was recorded and the continuation it
/// drove failed the run. The worker must not retry.
pub const RUN_FAILED_FIELD: &str = "run_failed";

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(String),
    BadRequest(String),
    /// The continuation failed; the run is marked failed.
    RunFailed(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::RunFailed(msg) => {
                let body = serde_json::json!({"error": msg, RUN_FAILED_FIELD: true});
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Run(RunError::NotFound { .. })
            | CoordinatorError::JobNotFound { .. } => ApiError::NotFound(err.to_string()),
            CoordinatorError::Barrier(_) => ApiError::BadRequest(err.to_string()),
            CoordinatorError::Continuation { .. } => {
                tracing::error!(error = %err, "Continuation failed after completion report");
                ApiError::RunFailed(err.to_string())
            }
            CoordinatorError::Store(_) => {
                tracing::error!(error = %err, "Internal request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

// ── State and router ──────────────────────────────────────────────────

pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    secret_digest: Option<Vec<u8>>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, secret: Option<&str>) -> Self {
        Self {
            coordinator,
            secret_digest: secret
                .filter(|s| !s.is_empty())
                .map(|s| Sha256::digest(s.as_bytes()).to_vec()),
        }
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(expected) = &self.secret_digest else {
            return Err(ApiError::Unauthorized);
        };
        let presented = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        if Sha256::digest(presented.as_bytes()).as_slice() == expected.as_slice() {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}

pub type SharedState = Arc<AppState>;

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/internal/runs/{run_id}", get(get_run))
        .route("/internal/runs/{run_id}/cancel", post(cancel_run))
        .route("/internal/runs/{run_id}/resume", post(resume_run))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: SharedState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .context("Failed to get server address")?;
    tracing::info!(%addr, "Callback server listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;
    tracing::info!("Callback server stopped");
    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn get_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    let snapshot = state.coordinator.snapshot(run_id).await?;
    Ok(Json(snapshot))
}

async fn cancel_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(&headers)?;
    let transition = state.coordinator.cancel_run(run_id).await?;
    let status = if transition.applied() {
        "cancelled"
    } else {
        "skipped"
    };
    Ok(Json(serde_json::json!({"status": status})))
}

async fn resume_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(run_id): Path<i64>,
    Json(body): Json<ResumeRequest>,
) -> Result<Json<ResumeResponse>, ApiError> {
    state.authorize(&headers)?;
    let ack = state
        .coordinator
        .report_completion(body.into_report(run_id))
        .await?;
    Ok(Json(ResumeResponse::from(ack)))
}
