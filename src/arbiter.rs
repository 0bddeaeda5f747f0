//! Duplicate-file prompt arbiter.
//!
//! Bridges a synchronous question raised from inside an Executor ("this file
//! exists, what do I do?") with an asynchronous decision that arrives later
//! over HTTP. Each pending prompt gets its own single-slot `oneshot` channel,
//! which is the natural Rust shape for "written to exactly once, then
//! closed".

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::broker::EventBroker;
use crate::event::Event;

pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(120);

/// The closed set of decisions an arbiter will deliver. Note this is
/// narrower than the request-side `on-duplicate` policy in
/// `crate::options`, which additionally allows `prompt`/`prompt_all` to
/// *request* interactive resolution rather than name an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Overwrite,
    Skip,
    Rename,
    OverwriteAll,
    SkipAll,
    RenameAll,
}

impl Decision {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "overwrite" => Some(Decision::Overwrite),
            "skip" => Some(Decision::Skip),
            "rename" => Some(Decision::Rename),
            "overwrite_all" => Some(Decision::OverwriteAll),
            "skip_all" => Some(Decision::SkipAll),
            "rename_all" => Some(Decision::RenameAll),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Overwrite => "overwrite",
            Decision::Skip => "skip",
            Decision::Rename => "rename",
            Decision::OverwriteAll => "overwrite_all",
            Decision::SkipAll => "skip_all",
            Decision::RenameAll => "rename_all",
        }
    }
}

pub enum ResolveError {
    NotFound,
    Closed,
}

struct Pending {
    tx: oneshot::Sender<Decision>,
}

struct Inner {
    pending: HashMap<String, Pending>,
}

/// Per-job arbiter. Cheaply cloneable; every clone shares the same pending
/// map and the same `closed` flag.
#[derive(Clone)]
pub struct DuplicateArbiter {
    job_id: std::sync::Arc<str>,
    broker: EventBroker,
    inner: std::sync::Arc<Mutex<Inner>>,
    closed: std::sync::Arc<AtomicBool>,
    counter: std::sync::Arc<AtomicU64>,
}

impl DuplicateArbiter {
    pub fn new(job_id: &str, broker: EventBroker) -> Self {
        Self {
            job_id: std::sync::Arc::from(job_id),
            broker,
            inner: std::sync::Arc::new(Mutex::new(Inner {
                pending: HashMap::new(),
            })),
            closed: std::sync::Arc::new(AtomicBool::new(false)),
            counter: std::sync::Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Allocates a new prompt id and its response channel. Fails once the
    /// arbiter has been closed (job reached a terminal state or shut down).
    fn register(&self) -> Result<(String, oneshot::Receiver<Decision>), ()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(());
        }
        let id = format!("dup_{}", self.counter.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.lock().pending.insert(id.clone(), Pending { tx });
        Ok((id, rx))
    }

    /// Called from the HTTP surface when a client POSTs a decision.
    pub fn resolve(&self, prompt_id: &str, decision: Decision) -> Result<(), ResolveError> {
        let pending = self.lock().pending.remove(prompt_id);
        let Some(pending) = pending else {
            return if self.closed.load(Ordering::SeqCst) {
                Err(ResolveError::Closed)
            } else {
                Err(ResolveError::NotFound)
            };
        };
        // Single-slot channel constructed by us; send never blocks and a
        // dropped receiver (prompter already timed out) is not an error here.
        let _ = pending.tx.send(decision);
        self.broker.enqueue(Event::duplicate_resolved(
            &self.job_id,
            prompt_id,
            decision.as_str(),
        ));
        Ok(())
    }

    /// Called when the prompter gives up waiting (timeout or cancellation).
    fn expire(&self, prompt_id: &str) {
        let removed = self.lock().pending.remove(prompt_id);
        if removed.is_some() {
            self.broker
                .enqueue(Event::duplicate_resolved(&self.job_id, prompt_id, "skip"));
        }
    }

    /// Idempotent shutdown: marks the arbiter closed and resolves every
    /// still-pending prompt to `default_decision` so no caller is left
    /// waiting forever.
    pub fn close(&self, default_decision: Decision) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<(String, Pending)> = self.lock().pending.drain().collect();
        for (id, pending) in drained {
            let _ = pending.tx.send(default_decision);
            self.broker.enqueue(Event::duplicate_resolved(
                &self.job_id,
                &id,
                default_decision.as_str(),
            ));
        }
    }

    /// The Executor-facing facade: ask the user what to do about a duplicate
    /// destination path, blocking until a decision, a timeout, or executor
    /// cancellation resolves it.
    pub async fn prompt_duplicate(&self, path: &str, cancel: &CancellationToken) -> Decision {
        let Ok((prompt_id, rx)) = self.register() else {
            return Decision::Skip;
        };

        let filename = path.rsplit('/').next().unwrap_or(path).to_string();
        let sent = self
            .broker
            .enqueue_critical(
                Event::duplicate(&self.job_id, &prompt_id, path, &filename),
                crate::broker::DEFAULT_CRITICAL_WAIT,
            )
            .await;
        if !sent {
            event!(
                Level::WARN,
                "duplicate prompt {prompt_id} for job {} could not be delivered, defaulting to skip",
                self.job_id
            );
            self.expire(&prompt_id);
            return Decision::Skip;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.expire(&prompt_id);
                Decision::Skip
            }
            () = tokio::time::sleep(DEFAULT_PROMPT_TIMEOUT) => {
                self.expire(&prompt_id);
                Decision::Skip
            }
            received = rx => {
                received.unwrap_or(Decision::Skip)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EventBroker;

    #[tokio::test]
    async fn resolve_then_resolve_again_returns_not_found() {
        let arbiter = DuplicateArbiter::new("job_1", EventBroker::spawn("job_1"));
        let cancel = CancellationToken::new();

        let arbiter2 = arbiter.clone();
        let resolver = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            arbiter2.resolve("dup_1", Decision::Overwrite)
        });

        let decision = arbiter.prompt_duplicate("/m/video/a.mp4", &cancel).await;
        assert_eq!(decision, Decision::Overwrite);
        assert!(resolver.await.unwrap().is_ok());

        assert!(matches!(
            arbiter.resolve("dup_1", Decision::Skip),
            Err(ResolveError::NotFound)
        ));
    }

    #[tokio::test]
    async fn cancellation_resolves_to_skip() {
        let arbiter = DuplicateArbiter::new("job_1", EventBroker::spawn("job_1"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let decision = arbiter.prompt_duplicate("/m/video/a.mp4", &cancel).await;
        assert_eq!(decision, Decision::Skip);
    }

    #[tokio::test]
    async fn closing_resolves_every_pending_prompt_to_the_default() {
        let arbiter = DuplicateArbiter::new("job_1", EventBroker::spawn("job_1"));
        let cancel = CancellationToken::new();

        let arbiter2 = arbiter.clone();
        let waiter = tokio::spawn(async move { arbiter2.prompt_duplicate("/m/video/a.mp4", &cancel).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        arbiter.close(Decision::Skip);

        assert_eq!(waiter.await.unwrap(), Decision::Skip);
        assert!(matches!(
            arbiter.resolve("dup_1", Decision::Overwrite),
            Err(ResolveError::Closed)
        ));
    }
}
