//! `GET /download/progress`: attaches a subscriber to a job's broker and
//! streams its events as SSE.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Deserialize;
use tracing::{event, Level};

use crate::error::CoreError;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct ProgressQuery {
    id: String,
    since: Option<u64>,
}

/// Parses `since` from the query string, falling back to `Last-Event-ID`,
/// then 0.
fn resolve_after_seq(query: &ProgressQuery, headers: &HeaderMap) -> u64 {
    if let Some(since) = query.since {
        return since;
    }
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0)
}

pub async fn get_progress(
    State(state): State<AppState>,
    Query(query): Query<ProgressQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, CoreError> {
    let job = state
        .tracker
        .get(&query.id)
        .await
        .ok_or_else(|| CoreError::NotFound(format!("unknown job '{}'", query.id)))?;

    let after_seq = resolve_after_seq(&query, &headers);
    let subscription = job.subscribe(after_seq).await;
    event!(Level::DEBUG, "subscriber attached to job {} after_seq={after_seq}", query.id);

    let stream = futures::stream::unfold(subscription.receiver, |mut receiver| async move {
        let event = receiver.recv().await?;
        let id = event.seq.to_string();
        let data = serde_json::to_string(&event).unwrap_or_default();
        let sse_event = SseEvent::default().id(id).data(data);
        Some((Ok(sse_event), receiver))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
