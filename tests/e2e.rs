//! Cross-module end-to-end scenarios driven against a real `axum::Router`
//! via `tower::ServiceExt::oneshot`, exercising the real stack end to end
//! rather than mocking individual components.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use fetchcore::arbiter::DuplicateArbiter;
use fetchcore::event::UrlResult;
use fetchcore::http::{self, AppState};
use fetchcore::job::Renderer;
use fetchcore::options::DownloadOptions;
use fetchcore::pool::{ExecutorFn, WorkerPool};
use fetchcore::tracker::JobTracker;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// An Executor used only by these tests: finishes plain URLs immediately,
/// and for the special URL `"dup"` raises a duplicate prompt and reports
/// whatever decision comes back as a log line, so tests can observe it
/// through the job's event history without reaching into the Arbiter.
fn test_executor() -> ExecutorFn {
    Arc::new(
        |cancel: CancellationToken,
         urls: Vec<String>,
         _options: DownloadOptions,
         renderer: Renderer,
         arbiter: DuplicateArbiter| {
            Box::pin(async move {
                let mut results = Vec::new();
                for url in urls {
                    let task_id = renderer.register(&url, 100);
                    if url == "dup" {
                        let decision = arbiter.prompt_duplicate("/m/video/a.mp4", &cancel).await;
                        renderer.log(
                            fetchcore::event::LogLevel::Info,
                            &format!("duplicate decision: {}", decision.as_str()),
                        );
                    }
                    if url == "slow" {
                        tokio::select! {
                            () = cancel.cancelled() => {
                                results.push(UrlResult {
                                    url,
                                    success: false,
                                    error: Some("canceled".to_string()),
                                });
                                continue;
                            }
                            () = tokio::time::sleep(Duration::from_secs(30)) => {}
                        }
                    }
                    renderer.update(&task_id, 100, 100);
                    renderer.finish(&task_id);
                    results.push(UrlResult {
                        url,
                        success: true,
                        error: None,
                    });
                }
                let exit_code = if cancel.is_cancelled() { 130 } else { 0 };
                (results, exit_code)
            }) as BoxFuture<'static, (Vec<UrlResult>, i32)>
        },
    )
}

fn test_router() -> Router {
    let tmp = std::env::temp_dir().join(format!("fetchcore-e2e-{}", std::process::id()));
    for folder in ["audio", "video", "playlist", "data"] {
        std::fs::create_dir_all(tmp.join(folder)).unwrap();
    }
    let tracker = JobTracker::new();
    let pool = WorkerPool::new(2);
    pool.start(CancellationToken::new());
    let state = AppState::new(tracker, pool, test_executor(), tmp);
    http::build_router(state)
}

async fn post_json(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn download_creates_job_and_returns_queued() {
    let router = test_router();
    let (status, body) = post_json(&router, "/download", json!({"urls": ["u1"]})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert!(body["job_id"].as_str().unwrap().starts_with("job_"));
}

#[tokio::test]
async fn download_rejects_empty_urls() {
    let router = test_router();
    let (status, body) = post_json(&router, "/download", json!({"urls": []})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn download_rejects_unknown_option_field() {
    let router = test_router();
    let (status, _) = post_json(
        &router,
        "/download",
        json!({"urls": ["u1"], "options": {"bogus-field": true}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn download_rejects_disallowed_output_template() {
    let router = test_router();
    let (status, _) = post_json(
        &router,
        "/download",
        json!({"urls": ["u1"], "options": {"output": "../escape"}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn job_reaches_complete_and_is_queryable_then_deletable() {
    let router = test_router();
    let (_, body) = post_json(&router, "/download", json!({"urls": ["u1"]})).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let mut snapshot = Value::Null;
    for _ in 0..100 {
        let (status, got) = get_json(&router, &format!("/jobs/{job_id}")).await;
        assert_eq!(status, StatusCode::OK);
        if got["status"] == "complete" {
            snapshot = got;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(snapshot["status"], "complete");
    assert_eq!(snapshot["stats"]["succeeded"], 1);

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/jobs/{job_id}"))
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (status, _) = get_json(&router, &format!("/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn duplicate_prompt_resolves_by_choice_then_rejects_second_resolve() {
    let router = test_router();
    let (_, body) = post_json(&router, "/download", json!({"urls": ["dup"]})).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let mut prompt_id = None;
    for _ in 0..100 {
        let (_, snapshot) = get_json(&router, &format!("/jobs/{job_id}")).await;
        if let Some(first) = snapshot["duplicates"].as_array().and_then(|d| d.first()) {
            prompt_id = first["prompt_id"].as_str().map(str::to_string);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let prompt_id = prompt_id.expect("duplicate prompt registered");

    let (status, body) = post_json(
        &router,
        "/download/duplicate-response",
        json!({"jobId": job_id, "promptId": prompt_id, "choice": "overwrite"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "resolved");

    let (status, _) = post_json(
        &router,
        "/download/duplicate-response",
        json!({"jobId": job_id, "promptId": prompt_id, "choice": "overwrite"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_transitions_running_job_to_error() {
    let router = test_router();
    let (_, body) = post_json(&router, "/download", json!({"urls": ["slow"]})).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    for _ in 0..100 {
        let (_, snapshot) = get_json(&router, &format!("/jobs/{job_id}")).await;
        if snapshot["status"] == "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (status, _) = post_json(&router, "/download/cancel", json!({"jobId": job_id})).await;
    assert_eq!(status, StatusCode::OK);

    let mut snapshot = Value::Null;
    for _ in 0..200 {
        let (_, got) = get_json(&router, &format!("/jobs/{job_id}")).await;
        if got["status"] == "error" {
            snapshot = got;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(snapshot["status"], "error");
    assert_eq!(snapshot["exitCode"], 130);
}

#[tokio::test]
async fn cancel_of_unknown_job_is_not_found() {
    let router = test_router();
    let (status, _) = post_json(&router, "/download/cancel", json!({"jobId": "job_999"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_reports_active_job_count() {
    let router = test_router();
    let (status, body) = get_json(&router, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active_jobs"], 0);

    post_json(&router, "/download", json!({"urls": ["slow"]})).await;
    let (_, body) = get_json(&router, "/status").await;
    assert_eq!(body["active_jobs"], 1);
}
