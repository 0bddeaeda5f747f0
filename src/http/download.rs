//! `POST /download`, `/download/cancel`, `/download/duplicate-response`.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{Level, event};

use crate::arbiter::{Decision, ResolveError};
use crate::error::CoreError;
use crate::options::DownloadOptions;
use crate::pool::Task;

use super::AppState;
use super::extract::ValidJson;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadRequest {
    urls: Vec<String>,
    #[serde(default)]
    options: DownloadOptions,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    status: &'static str,
    job_id: String,
    message: String,
}

/// Validates input, creates a Job via the Tracker, submits a task to the
/// Pool, and returns `{status:"queued", job_id, message}`.
pub async fn post_download(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<DownloadRequest>,
) -> Result<Response, CoreError> {
    if payload.urls.is_empty() {
        return Err(CoreError::InvalidInput("'urls' must be non-empty".to_string()));
    }
    payload.options.validate()?;

    let job = state.tracker.create(payload.urls).await;
    event!(Level::INFO, "created job {}", job.id());

    let task = Task {
        job: job.clone(),
        options: payload.options,
        execute: state.execute.clone(),
    };
    if state.pool.add_task(task).is_err() {
        event!(Level::WARN, "pool rejected task for job {}, already shut down", job.id());
        return Err(CoreError::Conflict("server is shutting down".to_string()));
    }

    let body = DownloadResponse {
        status: "queued",
        job_id: job.id().to_string(),
        message: format!("job {} queued", job.id()),
    };
    Ok((StatusCode::OK, Json(body)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CancelRequest {
    job_id: String,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    status: &'static str,
}

pub async fn post_cancel(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<CancelRequest>,
) -> Result<Response, CoreError> {
    let job = state
        .tracker
        .get(&payload.job_id)
        .await
        .ok_or_else(|| CoreError::NotFound(format!("unknown job '{}'", payload.job_id)))?;
    job.cancel().await;
    Ok((StatusCode::OK, Json(CancelResponse { status: "canceled" })).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DuplicateResponseRequest {
    job_id: String,
    prompt_id: String,
    choice: String,
}

#[derive(Debug, Serialize)]
struct DuplicateResponseOk {
    status: &'static str,
}

/// Validates `{jobId, promptId, choice}`, looks up the job, parses the
/// decision, and calls `arbiter.resolve`.
pub async fn post_duplicate_response(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<DuplicateResponseRequest>,
) -> Result<Response, CoreError> {
    let job = state
        .tracker
        .get(&payload.job_id)
        .await
        .ok_or_else(|| CoreError::NotFound(format!("unknown job '{}'", payload.job_id)))?;

    let decision = Decision::parse(&payload.choice)
        .ok_or_else(|| CoreError::InvalidInput(format!("invalid choice '{}'", payload.choice)))?;

    match job.arbiter().resolve(&payload.prompt_id, decision) {
        Ok(()) => Ok((StatusCode::OK, Json(DuplicateResponseOk { status: "resolved" })).into_response()),
        Err(ResolveError::NotFound) => {
            Err(CoreError::NotFound(format!("unknown prompt '{}'", payload.prompt_id)))
        }
        Err(ResolveError::Closed) => {
            Err(CoreError::Conflict(format!("prompt '{}' is closed", payload.prompt_id)))
        }
    }
}
