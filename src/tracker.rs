//! Job tracker: the live set of jobs, opaque id allocation, active-job
//! counting, and age-based reaping of terminal jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::job::Job;

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_COMPLETE_TTL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_ERROR_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Clone)]
pub struct JobTracker {
    jobs: Arc<RwLock<HashMap<String, Arc<Job>>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Allocates a monotonic id, constructs a `Job` with its broker already
    /// running, and stores it.
    pub async fn create(&self, urls: Vec<String>) -> Arc<Job> {
        let id = format!("job_{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let job = Job::new(id.clone(), urls);
        self.jobs.write().await.insert(id, Arc::clone(&job));
        job
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        let mut count = 0;
        for job in self.jobs.read().await.values() {
            if !job.status().await.is_terminal() {
                count += 1;
            }
        }
        count
    }

    /// Closes the job's broker (evicting any remaining subscribers) and
    /// removes it from the registry.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.jobs.write().await.remove(id);
        if let Some(job) = &removed {
            job.broker().close();
        }
        removed.is_some()
    }

    /// Removes every terminal job whose `completed_at` is older than the
    /// TTL appropriate to its status; returns the count removed.
    pub async fn remove_expired(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        complete_ttl: Duration,
        error_ttl: Duration,
    ) -> usize {
        use crate::event::JobStatus;

        let mut to_remove = Vec::new();
        {
            let jobs = self.jobs.read().await;
            for (id, job) in jobs.iter() {
                let status = job.status().await;
                let Some(completed_at) = job.completed_at().await else {
                    continue;
                };
                let ttl = match status {
                    JobStatus::Complete => complete_ttl,
                    JobStatus::Error => error_ttl,
                    _ => continue,
                };
                let Ok(ttl_chrono) = chrono::Duration::from_std(ttl) else {
                    continue;
                };
                if now - completed_at >= ttl_chrono {
                    to_remove.push(id.clone());
                }
            }
        }

        let mut jobs = self.jobs.write().await;
        let mut removed = 0;
        for id in to_remove {
            if let Some(job) = jobs.remove(&id) {
                job.broker().close();
                removed += 1;
            }
        }
        removed
    }

    /// Runs `remove_expired` on a ticker until `cancel` fires.
    pub async fn start_cleanup(
        &self,
        cancel: CancellationToken,
        interval: Duration,
        complete_ttl: Duration,
        error_ttl: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.remove_expired(chrono::Utc::now(), complete_ttl, error_ttl).await;
                    if removed > 0 {
                        event!(Level::DEBUG, "cleanup removed {removed} expired job(s)");
                    }
                }
                () = cancel.cancelled() => {
                    event!(Level::DEBUG, "job tracker cleanup shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_roundtrip() {
        let tracker = JobTracker::new();
        let job = tracker.create(vec!["u1".to_string()]).await;
        let got = tracker.get(job.id()).await.expect("job present");
        assert_eq!(got.id(), job.id());
    }

    #[tokio::test]
    async fn unknown_id_returns_none() {
        let tracker = JobTracker::new();
        assert!(tracker.get("job_999").await.is_none());
    }

    #[tokio::test]
    async fn active_count_excludes_terminal_jobs() {
        let tracker = JobTracker::new();
        let job_a = tracker.create(vec!["u1".to_string()]).await;
        let _job_b = tracker.create(vec!["u2".to_string()]).await;
        assert_eq!(tracker.active_count().await, 2);

        job_a
            .set_outcome(
                vec![crate::event::UrlResult {
                    url: "u1".to_string(),
                    success: true,
                    error: None,
                }],
                0,
            )
            .await;
        assert_eq!(tracker.active_count().await, 1);
    }

    #[tokio::test]
    async fn delete_removes_job() {
        let tracker = JobTracker::new();
        let job = tracker.create(vec!["u1".to_string()]).await;
        assert!(tracker.delete(job.id()).await);
        assert!(tracker.get(job.id()).await.is_none());
        assert!(!tracker.delete(job.id()).await);
    }

    #[tokio::test]
    async fn remove_expired_respects_status_specific_ttl() {
        let tracker = JobTracker::new();
        let job = tracker.create(vec!["u1".to_string()]).await;
        job.set_outcome(
            vec![crate::event::UrlResult {
                url: "u1".to_string(),
                success: true,
                error: None,
            }],
            0,
        )
        .await;

        let removed = tracker
            .remove_expired(chrono::Utc::now(), Duration::from_secs(3600), Duration::from_secs(3600))
            .await;
        assert_eq!(removed, 0);
        assert!(tracker.get(job.id()).await.is_some());

        let far_future = chrono::Utc::now() + chrono::Duration::hours(2);
        let removed = tracker
            .remove_expired(far_future, Duration::from_secs(3600), Duration::from_secs(3600))
            .await;
        assert_eq!(removed, 1);
        assert!(tracker.get(job.id()).await.is_none());
    }
}
