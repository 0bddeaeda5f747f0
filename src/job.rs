//! The `Job` aggregate and the `Renderer` facade an Executor uses to report
//! progress.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::arbiter::DuplicateArbiter;
use crate::broker::{self, EventBroker, JobSnapshotFields, Subscription};
use crate::event::{Event, JobStatus, LogLevel, Stats, UrlResult};

struct JobState {
    status: JobStatus,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    results: Vec<UrlResult>,
    exit_code: i32,
    error: Option<String>,
}

/// A user-facing unit of work. Owns its broker, its arbiter, and the
/// cancellation token its worker task will observe.
pub struct Job {
    id: String,
    urls: Vec<String>,
    state: RwLock<JobState>,
    broker: EventBroker,
    arbiter: DuplicateArbiter,
    cancel: CancellationToken,
}

impl Job {
    /// Constructs a job with its broker task already running and emits the
    /// initial `status=queued` event.
    pub fn new(id: String, urls: Vec<String>) -> Arc<Self> {
        let broker = EventBroker::spawn(&id);
        let arbiter = DuplicateArbiter::new(&id, broker.clone());
        let created_at = Utc::now();

        let job = Arc::new(Self {
            id: id.clone(),
            urls,
            state: RwLock::new(JobState {
                status: JobStatus::Queued,
                created_at,
                completed_at: None,
                results: Vec::new(),
                exit_code: 0,
                error: None,
            }),
            broker,
            arbiter,
            cancel: CancellationToken::new(),
        });

        job.broker.enqueue(Event::status(&id, JobStatus::Queued));
        job
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn broker(&self) -> &EventBroker {
        &self.broker
    }

    pub fn arbiter(&self) -> &DuplicateArbiter {
        &self.arbiter
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels the in-flight task without tearing down the broker; the
    /// Executor is expected to notice and return promptly. A no-op on an
    /// already-terminal job.
    pub async fn cancel(&self) {
        if self.state.read().await.status.is_terminal() {
            return;
        }
        self.cancel.cancel();
    }

    pub async fn status(&self) -> JobStatus {
        self.state.read().await.status.clone()
    }

    /// Monotonic `queued -> running` transition; status never regresses.
    /// Silently ignored if the job is already running or terminal, which can
    /// legitimately race with `cancel()`.
    pub async fn set_running(&self) {
        let mut guard = self.state.write().await;
        if guard.status != JobStatus::Queued {
            return;
        }
        guard.status = JobStatus::Running;
        drop(guard);
        self.broker
            .enqueue_critical(
                Event::status(&self.id, JobStatus::Running),
                broker::DEFAULT_CRITICAL_WAIT,
            )
            .await;
    }

    /// Records the Executor's outcome and performs the one-directional
    /// terminal transition. Closes pending duplicate prompts to `skip` and
    /// emits the terminal `done` event.
    pub async fn set_outcome(&self, results: Vec<UrlResult>, exit_code: i32) {
        let (status, stats, error) = {
            let mut guard = self.state.write().await;
            if guard.status.is_terminal() {
                return;
            }

            let succeeded = results.iter().filter(|r| r.success).count() as u32;
            let failed = results.iter().filter(|r| !r.success).count() as u32;
            let stats = Stats {
                total: results.len() as u32,
                succeeded,
                failed,
            };
            let error = results
                .iter()
                .find_map(|r| r.error.clone().filter(|e| !e.is_empty()));

            let status = if exit_code == 0 && failed == 0 {
                JobStatus::Complete
            } else {
                JobStatus::Error
            };

            guard.results = results;
            guard.exit_code = exit_code;
            guard.error = error.clone();
            guard.status = status.clone();
            guard.completed_at = Some(Utc::now());

            (status, stats, error)
        };

        self.arbiter.close(crate::arbiter::Decision::Skip);

        self.broker
            .enqueue_critical(
                Event::status(&self.id, status.clone()),
                broker::DEFAULT_CRITICAL_WAIT,
            )
            .await;
        self.broker
            .enqueue_critical(
                Event::done(&self.id, status, exit_code, error, stats),
                broker::DEFAULT_CRITICAL_WAIT,
            )
            .await;
    }

    pub async fn snapshot_fields(&self) -> JobSnapshotFields {
        let guard = self.state.read().await;
        JobSnapshotFields {
            status: guard.status.clone(),
            created_at: guard.created_at,
            completed_at: guard.completed_at,
            exit_code: guard.status.is_terminal().then_some(guard.exit_code),
            error: guard.error.clone(),
            stats: if guard.status.is_terminal() {
                Stats {
                    total: guard.results.len() as u32,
                    succeeded: guard.results.iter().filter(|r| r.success).count() as u32,
                    failed: guard.results.iter().filter(|r| !r.success).count() as u32,
                }
            } else {
                Stats::default()
            },
        }
    }

    pub async fn snapshot(&self) -> Event {
        let fields = self.snapshot_fields().await;
        self.broker.snapshot(fields)
    }

    pub async fn subscribe(&self, after_seq: u64) -> Subscription {
        let fields = self.snapshot_fields().await;
        self.broker.subscribe(after_seq, fields)
    }

    pub async fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.completed_at
    }
}

/// Bound to one job's broker; handed to the Executor so it can report
/// progress without knowing anything about brokers, subscribers, or
/// sequence numbers.
#[derive(Clone)]
pub struct Renderer {
    job_id: String,
    broker: EventBroker,
}

impl Renderer {
    pub fn new(job_id: String, broker: EventBroker) -> Self {
        Self { job_id, broker }
    }

    pub fn register(&self, label: &str, total: u64) -> String {
        let id = self.broker.next_task_id();
        self.broker
            .enqueue(Event::register(&self.job_id, &id, label, total));
        id
    }

    pub fn update(&self, task_id: &str, current: u64, total: u64) {
        self.broker
            .enqueue(Event::progress(&self.job_id, task_id, current, total));
    }

    pub fn finish(&self, task_id: &str) {
        self.broker.enqueue(Event::finish(&self.job_id, task_id));
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        self.broker.enqueue(Event::log(&self.job_id, level, message));
    }
}

/// Recommended rate limit an Executor should self-impose between `update`
/// calls for the same task.
pub const RECOMMENDED_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_result(url: &str) -> UrlResult {
        UrlResult {
            url: url.to_string(),
            success: true,
            error: None,
        }
    }

    #[tokio::test]
    async fn status_progresses_queued_running_complete() {
        let job = Job::new("job_1".to_string(), vec!["u1".to_string()]);
        assert_eq!(job.status().await, JobStatus::Queued);

        job.set_running().await;
        assert_eq!(job.status().await, JobStatus::Running);

        job.set_outcome(vec![ok_result("u1")], 0).await;
        assert_eq!(job.status().await, JobStatus::Complete);
        assert!(job.completed_at().await.is_some());
    }

    #[tokio::test]
    async fn set_outcome_is_one_directional() {
        let job = Job::new("job_1".to_string(), vec!["u1".to_string()]);
        job.set_running().await;
        job.set_outcome(vec![ok_result("u1")], 0).await;
        let first_completed_at = job.completed_at().await;

        // A second outcome report (e.g. a stray late call) must not regress
        // the terminal state or overwrite completed_at.
        job.set_outcome(
            vec![UrlResult {
                url: "u1".to_string(),
                success: false,
                error: Some("late".to_string()),
            }],
            1,
        )
        .await;
        assert_eq!(job.status().await, JobStatus::Complete);
        assert_eq!(job.completed_at().await, first_completed_at);
    }

    #[tokio::test]
    async fn cancel_on_terminal_job_is_a_no_op() {
        let job = Job::new("job_1".to_string(), vec!["u1".to_string()]);
        job.set_outcome(vec![ok_result("u1")], 0).await;
        job.cancel().await;
        assert!(!job.cancel_token().is_cancelled());
    }
}
