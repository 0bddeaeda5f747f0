//! Bounded-parallelism worker pool.
//!
//! `worker_count` workers share one submission queue; each pulls a task,
//! derives a per-task cancellation token from the job, and invokes the
//! pluggable Executor with a `Renderer` bound to that job's broker. The
//! queue itself is unbounded so `add_task` can never lose a task once
//! accepted; a bounded-with-backpressure queue would work too, but this
//! crate takes the simpler unbounded route.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::arbiter::DuplicateArbiter;
use crate::event::UrlResult;
use crate::job::{Job, Renderer};
use crate::options::DownloadOptions;

/// `execute(ctx, urls, options) -> (results, exit_code)`, given a `Renderer`
/// to report progress through and the job's `DuplicateArbiter` to resolve
/// duplicate-file conflicts.
pub type ExecutorFn = Arc<
    dyn Fn(
            CancellationToken,
            Vec<String>,
            DownloadOptions,
            Renderer,
            DuplicateArbiter,
        ) -> BoxFuture<'static, (Vec<UrlResult>, i32)>
        + Send
        + Sync,
>;

pub struct Task {
    pub job: Arc<Job>,
    pub options: DownloadOptions,
    pub execute: ExecutorFn,
}

struct SharedReceiver {
    rx: Mutex<mpsc::UnboundedReceiver<Task>>,
}

pub struct WorkerPool {
    worker_count: usize,
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    shared_rx: Arc<SharedReceiver>,
    accepting: AtomicBool,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            worker_count,
            tx: Mutex::new(Some(tx)),
            shared_rx: Arc::new(SharedReceiver { rx: Mutex::new(rx) }),
            accepting: AtomicBool::new(true),
        })
    }

    /// Spawns `worker_count` worker loops bound to `cancel`.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        for worker_id in 0..self.worker_count {
            let pool = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.run_worker(worker_id, cancel).await });
        }
    }

    async fn run_worker(&self, worker_id: usize, cancel: CancellationToken) {
        loop {
            let task = {
                let mut rx = self.shared_rx.rx.lock().await;
                rx.recv().await
            };
            let Some(task) = task else {
                event!(Level::DEBUG, "worker {worker_id} exiting, queue drained");
                return;
            };
            let Task { job, options, execute } = task;

            event!(Level::DEBUG, "worker {worker_id} picked up job {}", job.id());
            job.set_running().await;

            let task_token = job.cancel_token().child_token();
            // Also retire the task promptly on process-wide shutdown.
            let pool_cancel = cancel.clone();
            let watchdog = tokio::spawn({
                let combined = task_token.clone();
                async move {
                    pool_cancel.cancelled().await;
                    combined.cancel();
                }
            });

            let renderer = Renderer::new(job.id().to_string(), job.broker().clone());
            let arbiter = job.arbiter().clone();
            let urls = job.urls().to_vec();

            let (results, exit_code) = execute(task_token, urls, options, renderer, arbiter).await;

            watchdog.abort();
            job.set_outcome(results, exit_code).await;
            event!(Level::DEBUG, "worker {worker_id} finished job {}", job.id());
        }
    }

    /// Enqueues a task; never loses it once this returns `Ok`. Rejects new
    /// work after `shutdown()`, which stops accepting new work and lets
    /// in-flight/queued tasks drain.
    pub fn add_task(&self, task: Task) -> Result<(), Task> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(task);
        }
        let guard = self.tx.try_lock();
        let Ok(guard) = guard else {
            // Rare contention with a concurrent shutdown(); treat as rejected
            // rather than blocking the HTTP handler calling this.
            return Err(task);
        };
        match guard.as_ref() {
            Some(sender) => sender.send(task).map_err(|e| e.0),
            None => Err(task),
        }
    }

    /// Stops accepting new work and drops the submission side so worker
    /// loops drain whatever is already queued, then exit naturally.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.tx.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::options::DownloadOptions;

    fn noop_executor() -> ExecutorFn {
        Arc::new(|_cancel, urls, _options, _renderer, _arbiter| {
            Box::pin(async move {
                let results = urls
                    .into_iter()
                    .map(|url| crate::event::UrlResult {
                        url,
                        success: true,
                        error: None,
                    })
                    .collect();
                (results, 0)
            }) as BoxFuture<'static, (Vec<crate::event::UrlResult>, i32)>
        })
    }

    #[tokio::test]
    async fn task_runs_and_job_reaches_complete() {
        let pool = WorkerPool::new(2);
        pool.start(CancellationToken::new());

        let job = Job::new("job_1".to_string(), vec!["u1".to_string()]);
        pool.add_task(Task {
            job: job.clone(),
            options: DownloadOptions::default(),
            execute: noop_executor(),
        })
        .expect("task accepted");

        for _ in 0..100 {
            if job.status().await.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(job.status().await, crate::event::JobStatus::Complete);
    }

    #[tokio::test]
    async fn add_task_after_shutdown_is_rejected() {
        let pool = WorkerPool::new(1);
        pool.shutdown().await;

        let job = Job::new("job_1".to_string(), vec!["u1".to_string()]);
        let result = pool.add_task(Task {
            job,
            options: DownloadOptions::default(),
            execute: noop_executor(),
        });
        assert!(result.is_err());
    }
}
