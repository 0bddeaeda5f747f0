//! Default stub Executor: the documented extension point a real
//! implementation plugs into the `WorkerPool` in place of this one.
//!
//! Grounded directly in `autotube::worker::download_video`: same
//! temp-directory-then-rename strategy, same reliance on shelling out to
//! `yt-dlp`, same `DirBuilder` mode. What's new here is wiring that shape
//! through the `Renderer`/`DuplicateArbiter` contract instead of only
//! logging via `tracing`, and honoring cancellation and the request's
//! duplicate policy.

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::arbiter::{Decision, DuplicateArbiter};
use crate::event::{LogLevel, UrlResult};
use crate::job::Renderer;
use crate::options::{DownloadOptions, DuplicatePolicy};
use crate::pool::ExecutorFn;

/// Builds an `ExecutorFn` that downloads each URL with `yt-dlp`, placing
/// finished files under `media_root/video` (or `media_root/audio` when
/// `options.audio` is set).
pub fn stub_executor(media_root: PathBuf, tmp_dir: PathBuf) -> ExecutorFn {
    Arc::new(move |cancel, urls, options, renderer, arbiter| {
        let media_root = media_root.clone();
        let tmp_dir = tmp_dir.clone();
        Box::pin(async move {
            run_all(&media_root, &tmp_dir, cancel, urls, options, renderer, arbiter).await
        }) as BoxFuture<'static, (Vec<UrlResult>, i32)>
    })
}

async fn run_all(
    media_root: &Path,
    tmp_dir: &Path,
    cancel: CancellationToken,
    urls: Vec<String>,
    options: DownloadOptions,
    renderer: Renderer,
    arbiter: DuplicateArbiter,
) -> (Vec<UrlResult>, i32) {
    let policy = options.duplicate_policy().unwrap_or(DuplicatePolicy::Skip);
    // The `*_all` variants are this Executor's responsibility to remember
    // across conflicts within the same job; a plain local captured by this
    // async block is sufficient since one Executor invocation owns exactly
    // one job's urls.
    let mut remembered_all: Option<Decision> = None;

    let mut results = Vec::with_capacity(urls.len());
    let mut any_failed = false;

    for url in urls {
        if cancel.is_cancelled() {
            results.push(UrlResult {
                url,
                success: false,
                error: Some("canceled".to_string()),
            });
            any_failed = true;
            continue;
        }

        let dest_dir = if options.audio {
            media_root.join("audio")
        } else {
            media_root.join("video")
        };

        let outcome = download_one(
            &dest_dir,
            tmp_dir,
            &url,
            &cancel,
            policy,
            &mut remembered_all,
            &renderer,
            &arbiter,
        )
        .await;

        if let Err(error) = &outcome {
            any_failed = true;
            renderer.log(LogLevel::Warn, &format!("{url}: {error}"));
        }

        results.push(UrlResult {
            url,
            success: outcome.is_ok(),
            error: outcome.err(),
        });
    }

    let exit_code = if cancel.is_cancelled() {
        130
    } else if any_failed {
        1
    } else {
        0
    };
    (results, exit_code)
}

#[allow(clippy::too_many_arguments)]
async fn download_one(
    dest_dir: &Path,
    tmp_dir: &Path,
    url: &str,
    cancel: &CancellationToken,
    policy: DuplicatePolicy,
    remembered_all: &mut Option<Decision>,
    renderer: &Renderer,
    arbiter: &DuplicateArbiter,
) -> Result<(), String> {
    let task_id = renderer.register(url, 0);

    let now_unix_ms = chrono::Utc::now().timestamp_micros().to_string();
    let work_dir = tmp_dir.join(&now_unix_ms);
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&work_dir)
        .map_err(|e| format!("failed to create working directory: {e}"))?;

    let run = async {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err("canceled".to_string()),
            result = run_ytdlp(&work_dir, url) => result,
        }
    };
    let ytdlp_result = run.await;

    let cleanup = |work_dir: &Path| {
        let _ = std::fs::remove_dir_all(work_dir);
    };

    let downloaded = match ytdlp_result {
        Ok(path) => path,
        Err(e) => {
            cleanup(&work_dir);
            return Err(e);
        }
    };

    let Some(final_path) = destination_for(dest_dir, &downloaded) else {
        cleanup(&work_dir);
        return Err("could not determine destination filename".to_string());
    };

    let final_path = if final_path.exists() {
        match resolve_duplicate(&final_path, policy, remembered_all, arbiter, cancel).await {
            Decision::Skip | Decision::SkipAll => {
                cleanup(&work_dir);
                renderer.finish(&task_id);
                return Ok(());
            }
            Decision::Rename | Decision::RenameAll => renamed_path(&final_path),
            Decision::Overwrite | Decision::OverwriteAll => final_path,
        }
    } else {
        final_path
    };

    if let Some(parent) = final_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if std::fs::rename(&downloaded, &final_path).is_err() {
        cleanup(&work_dir);
        return Err("failed to move downloaded file into place".to_string());
    }

    cleanup(&work_dir);
    renderer.finish(&task_id);
    Ok(())
}

async fn resolve_duplicate(
    path: &Path,
    policy: DuplicatePolicy,
    remembered_all: &mut Option<Decision>,
    arbiter: &DuplicateArbiter,
    cancel: &CancellationToken,
) -> Decision {
    if let Some(remembered) = remembered_all {
        return *remembered;
    }
    if let Some(decision) = policy.pre_resolved() {
        if matches!(
            decision,
            Decision::OverwriteAll | Decision::SkipAll | Decision::RenameAll
        ) {
            *remembered_all = Some(decision);
        }
        return decision;
    }

    let decision = arbiter.prompt_duplicate(&path.to_string_lossy(), cancel).await;
    if matches!(
        decision,
        Decision::OverwriteAll | Decision::SkipAll | Decision::RenameAll
    ) {
        *remembered_all = Some(decision);
    }
    decision
}

fn renamed_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = path.extension().and_then(|s| s.to_str());
    let suffix = chrono::Utc::now().timestamp_micros();
    let new_name = match ext {
        Some(ext) => format!("{stem}_{suffix}.{ext}"),
        None => format!("{stem}_{suffix}"),
    };
    path.with_file_name(new_name)
}

/// Runs `yt-dlp` inside `work_dir` and returns the path to the single
/// downloaded file it produced.
async fn run_ytdlp(work_dir: &Path, url: &str) -> Result<PathBuf, String> {
    let output = tokio::process::Command::new("yt-dlp")
        .env_clear()
        .current_dir(work_dir)
        .arg("--quiet")
        .arg("--no-simulate")
        .arg("--no-warnings")
        .arg("--no-progress")
        .arg("--output")
        .arg(work_dir.join("download"))
        .arg(url)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("failed to invoke yt-dlp: {e}"))?;

    if !output.status.success() {
        event!(Level::WARN, "yt-dlp exited unsuccessfully for {url}");
        return Err("yt-dlp exited unsuccessfully".to_string());
    }

    let entries = std::fs::read_dir(work_dir).map_err(|e| format!("failed to list {work_dir:?}: {e}"))?;
    entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .find(|p| p.file_stem().and_then(|s| s.to_str()) == Some("download"))
        .ok_or_else(|| "yt-dlp produced no output file".to_string())
}

fn destination_for(dest_dir: &Path, downloaded: &Path) -> Option<PathBuf> {
    let ext = downloaded.extension()?;
    let now = chrono::Utc::now().format("%Y-%m-%d-%H-%M-%S").to_string();
    Some(dest_dir.join(format!("{now}.{}", ext.to_str()?)))
}
