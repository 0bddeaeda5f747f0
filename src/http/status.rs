//! `GET /status`: active job count plus process uptime, tracked via an
//! `Instant` captured at startup.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    active_jobs: usize,
    uptime_secs: u64,
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        active_jobs: state.tracker.active_count().await,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
