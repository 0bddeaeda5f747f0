//! `GET /media` (supplementary): lists files under the media root's
//! `video`/`audio` sub-folders; no sidecar JSON, no write path.

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use tracing::{Level, event};

use super::AppState;

#[derive(Debug, Serialize)]
pub struct MediaEntry {
    kind: &'static str,
    name: String,
}

#[derive(Debug, Serialize)]
pub struct MediaResponse {
    entries: Vec<MediaEntry>,
}

fn list_dir(kind: &'static str, dir: &std::path::Path) -> Vec<MediaEntry> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .filter_map(|e| e.file_name().into_string().ok())
        .map(|name| MediaEntry { kind, name })
        .collect()
}

pub async fn get_media(State(state): State<AppState>) -> Json<MediaResponse> {
    let media_root = state.media_root.clone();
    let entries = tokio::task::spawn_blocking(move || {
        let mut entries = list_dir("video", &media_root.join("video"));
        entries.extend(list_dir("audio", &media_root.join("audio")));
        entries
    })
    .await
    .unwrap_or_else(|e| {
        event!(Level::WARN, "media listing task panicked: {e}");
        Vec::new()
    });

    Json(MediaResponse { entries })
}
