//! `GET /jobs/:id`, `DELETE /jobs/:id` (supplementary): a plain-JSON query
//! path for clients that don't want to attach to SSE, and an explicit-delete
//! complement to TTL-based reaping.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::CoreError;

use super::AppState;

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, CoreError> {
    let job = state
        .tracker
        .get(&id)
        .await
        .ok_or_else(|| CoreError::NotFound(format!("unknown job '{id}'")))?;
    let snapshot = job.snapshot().await;
    Ok((StatusCode::OK, Json(snapshot)).into_response())
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, CoreError> {
    if state.tracker.delete(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CoreError::NotFound(format!("unknown job '{id}'")))
    }
}
