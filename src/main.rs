use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fetchcore::{exec, http, pool::WorkerPool, tracker::JobTracker};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};
use tracing_subscriber::prelude::*;

const MEDIA_SUBFOLDERS: [&str; 4] = ["audio", "video", "playlist", "data"];
const MAX_PORT_RETRIES: u16 = 20;

#[derive(Debug, Parser)]
#[command(about, author, version, next_line_help = true)]
struct Args {
    #[arg(long, env, default_value = "127.0.0.1")]
    /// The IP address the HTTP listener will bind to.
    listen_ip: String,

    #[arg(long, env, default_value = "22408")]
    /// The port number the HTTP listener will bind to. On EADDRINUSE, higher
    /// ports are tried sequentially up to a fixed cap.
    listen_port: u16,

    #[arg(long, env)]
    /// File system path to the media root. Sub-folders `audio`, `video`,
    /// `playlist`, `data` are created under it on startup if missing.
    /// Defaults to `./media` relative to the current working directory.
    media_root: Option<PathBuf>,

    #[arg(long, env)]
    /// File system path underneath which the bundled Executor will create
    /// temporary directories for individual download attempts.
    tmp_dir: Option<PathBuf>,

    #[arg(long, env, default_value = "4")]
    /// Number of worker pool slots bounding concurrent Executor invocations.
    worker_count: usize,

    #[arg(long, env, default_value = "60")]
    /// Interval, in seconds, at which the job tracker reaps expired jobs.
    cleanup_interval_secs: u64,

    #[arg(long, env, default_value = "900")]
    /// Age, in seconds, after which a `complete` job becomes eligible for
    /// cleanup.
    complete_ttl_secs: u64,

    #[arg(long, env, default_value = "1800")]
    /// Age, in seconds, after which an `error` job becomes eligible for
    /// cleanup.
    error_ttl_secs: u64,
}

fn resolve_media_root(args: &Args) -> anyhow::Result<PathBuf> {
    let root = match &args.media_root {
        Some(root) => root.clone(),
        None => std::env::current_dir()?.join("media"),
    };
    for folder in MEDIA_SUBFOLDERS {
        std::fs::create_dir_all(root.join(folder))?;
    }
    Ok(root)
}

/// Waits for ctrl+c, then cancels `cancel` so every component observing it
/// (cleanup ticker, worker pool watchdog, job brokers/arbiters) winds down.
async fn shutdown_upon_signal(cancel: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    event!(Level::INFO, "Received signal to shut down gracefully");
    cancel.cancel();
}

/// Binds a `TcpListener`, retrying on successively higher ports if the
/// configured one is already in use.
async fn bind_with_retry(ip: &str, port: u16) -> anyhow::Result<tokio::net::TcpListener> {
    let mut attempt_port = port;
    for attempt in 0..=MAX_PORT_RETRIES {
        match tokio::net::TcpListener::bind(format!("{ip}:{attempt_port}")).await {
            Ok(listener) => {
                if attempt > 0 {
                    event!(
                        Level::INFO,
                        "port {port} was in use, bound to {attempt_port} instead"
                    );
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < MAX_PORT_RETRIES => {
                event!(Level::DEBUG, "port {attempt_port} in use, trying next");
                attempt_port += 1;
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to bind {ip}:{attempt_port} after {attempt} retries: {e}"
                ));
            }
        }
    }
    unreachable!("loop always returns by the final iteration")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let format_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .compact();
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))?;
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(format_layer)
        .init();
    event!(Level::DEBUG, "Launching...");

    let media_root = resolve_media_root(&args)?;
    event!(Level::INFO, "Media root at {}", media_root.display());

    let tmp_dir = args
        .tmp_dir
        .unwrap_or_else(|| std::env::temp_dir().join("fetchcore"));
    std::fs::create_dir_all(&tmp_dir)?;

    let cancel = CancellationToken::new();

    let tracker = JobTracker::new();
    let cleanup_handle = tokio::task::spawn({
        let tracker = tracker.clone();
        let cancel = cancel.clone();
        async move {
            tracker
                .start_cleanup(
                    cancel,
                    Duration::from_secs(args.cleanup_interval_secs),
                    Duration::from_secs(args.complete_ttl_secs),
                    Duration::from_secs(args.error_ttl_secs),
                )
                .await;
        }
    });

    let pool = WorkerPool::new(args.worker_count);
    pool.start(cancel.clone());

    let execute = exec::stub_executor(media_root.clone(), tmp_dir);

    let state = http::AppState::new(tracker, Arc::clone(&pool), execute, media_root);
    let router = http::build_router(state);

    let listener = bind_with_retry(&args.listen_ip, args.listen_port).await?;
    event!(
        Level::INFO,
        "Listening for HTTP requests on {}...",
        listener.local_addr()?
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_upon_signal(cancel.clone()))
        .await?;

    pool.shutdown().await;
    cleanup_handle.await?;

    Ok(())
}
