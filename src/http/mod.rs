//! HTTP/SSE surface: thin `axum` handlers translating requests into
//! Job/Tracker/Pool/Arbiter operations.
//!
//! Grounded in `autotube::handlers`/`autotube::main`'s style: a small
//! `Clone`-able state struct holding the shared handles, wired into
//! `axum::Router::with_state`, routes registered directly in `main`'s router
//! build rather than nested per-module routers.

mod download;
mod extract;
mod jobs;
mod media;
mod sse;
mod status;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use tower_http::trace::TraceLayer;

use crate::pool::{ExecutorFn, WorkerPool};
use crate::tracker::JobTracker;

/// Request bodies above this size are rejected with 413 before JSON decoding.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub tracker: JobTracker,
    pub pool: Arc<WorkerPool>,
    pub execute: ExecutorFn,
    pub media_root: PathBuf,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        tracker: JobTracker,
        pool: Arc<WorkerPool>,
        execute: ExecutorFn,
        media_root: PathBuf,
    ) -> Self {
        Self {
            tracker,
            pool,
            execute,
            media_root,
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/download", post(download::post_download))
        .route(
            "/download/duplicate-response",
            post(download::post_duplicate_response),
        )
        .route("/download/cancel", post(download::post_cancel))
        .route("/download/progress", get(sse::get_progress))
        .route("/status", get(status::get_status))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}", delete(jobs::delete_job))
        .route("/media", get(media::get_media))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
