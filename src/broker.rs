//! Per-job event broker: sequencing, bounded history, and subscriber fan-out.
//!
//! One broker is owned by each `Job`. A single background task is the
//! "consumer" that assigns sequence numbers and mutates derived state
//! (`task_state`, `logs`, `duplicate_prompts`, `history`); everything else
//! (producers, `subscribe`, `snapshot`) only ever touches that state through
//! a `std::sync::Mutex` held for the duration of one synchronous operation,
//! never across an `.await` — a single fine-grained mutex rather than a mix
//! of primitives, since nothing here needs to hold the lock while waiting.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{Level, event};

use crate::event::{DuplicateSnapshot, Event, EventKind, JobStatus, LogLine, Stats, TaskState};

pub const DEFAULT_MAX_HISTORY: usize = 4096;
pub const DEFAULT_MAX_LOGS: usize = 200;
pub const DEFAULT_CRITICAL_WAIT: Duration = Duration::from_millis(200);
pub const DEFAULT_SUBSCRIBER_BASE_BUFFER: usize = 128;
const INCOMING_CAPACITY: usize = 256;

/// Everything needed to render a `snapshot` event, supplied by the owning
/// `Job` rather than duplicated inside the broker.
#[derive(Debug, Clone)]
pub struct JobSnapshotFields {
    pub status: JobStatus,
    pub created_at: chrono::DateTime<Utc>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub stats: Stats,
}

struct Inner {
    seq: u64,
    history: VecDeque<Event>,
    task_state: HashMap<String, TaskState>,
    logs: VecDeque<LogLine>,
    duplicate_prompts: HashMap<String, DuplicateSnapshot>,
    subscribers: HashMap<u64, mpsc::Sender<Event>>,
    next_subscriber_id: u64,
    closed: bool,
    max_history: usize,
    max_logs: usize,
    base_buffer: usize,
    critical_wait: Duration,
}

impl Inner {
    fn push_history(&mut self, event: Event) {
        if self.history.len() >= self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(event);
    }

    fn apply_normalization(&mut self, event: &Event) {
        match event.kind {
            EventKind::Register => {
                if let Some(id) = &event.id {
                    self.task_state.insert(
                        id.clone(),
                        TaskState {
                            id: id.clone(),
                            label: event.label.clone().unwrap_or_else(|| id.clone()),
                            current: event.current.unwrap_or(0),
                            total: event.total.unwrap_or(0),
                            percent: 0,
                            done: false,
                        },
                    );
                }
            }
            EventKind::Progress => {
                if let Some(id) = &event.id
                    && let Some(task) = self.task_state.get_mut(id)
                {
                    if let Some(total) = event.total {
                        task.total = total;
                    }
                    if let Some(current) = event.current {
                        task.current = current;
                    }
                    task.percent = if task.total > 0 {
                        percent_of(task.current, task.total)
                    } else {
                        event.percent.unwrap_or(task.percent)
                    };
                }
            }
            EventKind::Finish => {
                if let Some(id) = &event.id
                    && let Some(task) = self.task_state.get_mut(id)
                {
                    task.done = true;
                    if task.total > 0 {
                        task.current = task.total;
                    }
                    if task.percent < 100 {
                        task.percent = 100;
                    }
                }
            }
            EventKind::Log => {
                if self.logs.len() >= self.max_logs {
                    self.logs.pop_front();
                }
                self.logs.push_back(LogLine {
                    level: event.level.unwrap_or(crate::event::LogLevel::Info),
                    message: event.message.clone().unwrap_or_default(),
                    at: event.at,
                });
            }
            EventKind::Duplicate => {
                if let (Some(prompt_id), Some(path), Some(filename)) =
                    (&event.prompt_id, &event.path, &event.filename)
                {
                    self.duplicate_prompts.insert(
                        prompt_id.clone(),
                        DuplicateSnapshot {
                            prompt_id: prompt_id.clone(),
                            path: path.clone(),
                            filename: filename.clone(),
                        },
                    );
                }
            }
            EventKind::DuplicateResolved => {
                if let Some(prompt_id) = &event.prompt_id {
                    self.duplicate_prompts.remove(prompt_id);
                }
            }
            EventKind::Status | EventKind::Done | EventKind::Snapshot => {}
        }
    }

    fn snapshot_event(&self, job_id: &str, fields: &JobSnapshotFields) -> Event {
        let mut tasks: Vec<TaskState> = self.task_state.values().cloned().collect();
        tasks.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.id.cmp(&b.id)));

        let mut duplicates: Vec<DuplicateSnapshot> =
            self.duplicate_prompts.values().cloned().collect();
        duplicates.sort_by(|a, b| {
            a.filename
                .cmp(&b.filename)
                .then_with(|| a.prompt_id.cmp(&b.prompt_id))
        });

        Event {
            kind: EventKind::Snapshot,
            job_id: job_id.to_string(),
            seq: 0,
            at: Utc::now(),
            id: None,
            label: None,
            current: None,
            total: None,
            percent: None,
            level: None,
            message: None,
            prompt_id: None,
            path: None,
            filename: None,
            status: Some(fields.status.clone()),
            stats: Some(fields.stats),
            exit_code: fields.exit_code,
            error: fields.error.clone(),
            created_at: Some(fields.created_at),
            completed_at: fields.completed_at,
            last_seq: Some(self.seq),
            tasks: Some(tasks),
            logs: Some(self.logs.iter().cloned().collect()),
            duplicates: Some(duplicates),
        }
    }
}

fn percent_of(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let p = (current.saturating_mul(100)) / total;
    u8::try_from(p.min(100)).unwrap_or(100)
}

/// Cheaply cloneable handle to a job's broker. Producers (the Executor via
/// `Renderer`, the Arbiter, HTTP handlers) only ever see this handle, never
/// the background task itself.
#[derive(Clone)]
pub struct EventBroker {
    job_id: Arc<str>,
    tx: mpsc::Sender<Event>,
    inner: Arc<Mutex<Inner>>,
    next_task_id: Arc<AtomicU64>,
}

pub struct Subscription {
    pub receiver: mpsc::Receiver<Event>,
}

impl EventBroker {
    /// Spawns the single consumer task and returns the handle producers use.
    /// Snapshot fields (status/created_at/...) are supplied by the caller at
    /// `subscribe`/`snapshot` time rather than cached here, so the broker
    /// never goes stale relative to the job's own status/results.
    pub fn spawn(job_id: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(INCOMING_CAPACITY);
        let inner = Arc::new(Mutex::new(Inner {
            seq: 0,
            history: VecDeque::new(),
            task_state: HashMap::new(),
            logs: VecDeque::new(),
            duplicate_prompts: HashMap::new(),
            subscribers: HashMap::new(),
            next_subscriber_id: 0,
            closed: false,
            max_history: DEFAULT_MAX_HISTORY,
            max_logs: DEFAULT_MAX_LOGS,
            base_buffer: DEFAULT_SUBSCRIBER_BASE_BUFFER,
            critical_wait: DEFAULT_CRITICAL_WAIT,
        }));

        let broker = Self {
            job_id: Arc::from(job_id),
            tx,
            inner: Arc::clone(&inner),
            next_task_id: Arc::new(AtomicU64::new(1)),
        };

        let loop_job_id = broker.job_id.clone();
        tokio::spawn(async move {
            while let Some(mut incoming) = rx.recv().await {
                let subscriber_fanout: Vec<(u64, mpsc::Sender<Event>)>;
                let critical_wait;
                {
                    let mut guard = match inner.lock() {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };

                    if incoming.kind != EventKind::Snapshot {
                        guard.seq += 1;
                        incoming.seq = guard.seq;
                    }
                    guard.apply_normalization(&incoming);
                    guard.push_history(incoming.clone());

                    subscriber_fanout = guard
                        .subscribers
                        .iter()
                        .map(|(id, tx)| (*id, tx.clone()))
                        .collect();
                    critical_wait = guard.critical_wait;
                }

                let critical = incoming.kind.is_critical();
                let mut dead: Vec<u64> = Vec::new();
                for (sub_id, sub_tx) in subscriber_fanout {
                    let outcome = if critical {
                        sub_tx
                            .send_timeout(incoming.clone(), critical_wait)
                            .await
                    } else {
                        sub_tx.try_send(incoming.clone()).map_err(|e| match e {
                            mpsc::error::TrySendError::Full(_) => {
                                mpsc::error::SendTimeoutError::Timeout(())
                            }
                            mpsc::error::TrySendError::Closed(_) => {
                                mpsc::error::SendTimeoutError::Closed(())
                            }
                        })
                    };
                    if let Err(mpsc::error::SendTimeoutError::Closed(())) = outcome {
                        dead.push(sub_id);
                    } else if outcome.is_err() {
                        event!(
                            Level::DEBUG,
                            "dropped {:?} event for job {} subscriber {sub_id}: buffer full",
                            incoming.kind,
                            loop_job_id,
                        );
                    }
                }

                if !dead.is_empty() {
                    let mut guard = match inner.lock() {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    for id in dead {
                        guard.subscribers.remove(&id);
                    }
                }
            }

            let mut guard = match inner.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.closed = true;
            guard.subscribers.clear();
            event!(Level::DEBUG, "broker for job {loop_job_id} closed");
        });

        broker
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn next_task_id(&self) -> String {
        format!("task_{}", self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Non-blocking enqueue; drops on full or closed buffer. Rust's `mpsc`
    /// never panics on a closed send (unlike the channel-panic hazard this
    /// operation guards against in other languages), so there is nothing to
    /// catch here beyond logging the drop.
    pub fn enqueue(&self, event: Event) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::event!(Level::DEBUG, "dropped non-critical event for job {}: {e}", self.job_id);
        }
    }

    /// Guarded send with a bounded wait; used for status transitions and
    /// terminal events so they never silently vanish.
    pub async fn enqueue_critical(&self, event: Event, max_wait: Duration) -> bool {
        match self.tx.send_timeout(event, max_wait).await {
            Ok(()) => true,
            Err(e) => {
                tracing::event!(Level::WARN, "critical event dropped for job {}: {e}", self.job_id);
                false
            }
        }
    }

    /// Build a snapshot for the given job fields plus whatever replay is
    /// owed to `after_seq`, and either attach a live subscriber or (if the
    /// broker already closed) hand back a pre-filled, already-closing
    /// channel.
    pub fn subscribe(&self, after_seq: u64, fields: JobSnapshotFields) -> Subscription {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let snapshot = guard.snapshot_event(&self.job_id, &fields);
        let replay: Vec<Event> = guard
            .history
            .iter()
            .filter(|e| e.seq > after_seq)
            .cloned()
            .collect();

        let capacity = guard.base_buffer + replay.len() + 1;
        let (sub_tx, sub_rx) = mpsc::channel::<Event>(capacity.max(1));

        // Sized to fit snapshot + full replay without blocking.
        let _ = sub_tx.try_send(snapshot);
        for event in replay {
            let _ = sub_tx.try_send(event);
        }

        if guard.closed {
            drop(sub_tx);
        } else {
            let id = guard.next_subscriber_id;
            guard.next_subscriber_id += 1;
            guard.subscribers.insert(id, sub_tx);
        }

        Subscription { receiver: sub_rx }
    }

    pub fn snapshot(&self, fields: JobSnapshotFields) -> Event {
        let guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.snapshot_event(&self.job_id, &fields)
    }

    /// Drop the producer side; the consumer task observes channel closure,
    /// marks itself closed and releases all subscribers.
    pub fn close(&self) {
        // `tx` itself is cloned into every `Renderer`/handler, so dropping this
        // one reference doesn't close the channel by itself. Closing is done
        // by the owning `Job` dropping its `EventBroker` entirely; this method
        // exists for explicit early teardown (tracker.delete) where the job
        // wants to force subscribers off immediately without waiting for the
        // last clone to drop.
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.closed = true;
        guard.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::JobStatus;

    fn blank_fields() -> JobSnapshotFields {
        JobSnapshotFields {
            status: JobStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
            exit_code: None,
            error: None,
            stats: Stats::default(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_snapshot_then_live_events_in_order() {
        let broker = EventBroker::spawn("job_1");
        let mut sub = broker.subscribe(0, blank_fields());

        let snapshot = sub.receiver.recv().await.expect("snapshot");
        assert_eq!(snapshot.kind, EventKind::Snapshot);
        assert_eq!(snapshot.seq, 0);

        broker.enqueue(Event::register("job_1", "t1", "t1", 100));
        broker.enqueue(Event::progress("job_1", "t1", 50, 100));

        let e1 = sub.receiver.recv().await.expect("register");
        let e2 = sub.receiver.recv().await.expect("progress");
        assert_eq!(e1.kind, EventKind::Register);
        assert_eq!(e2.kind, EventKind::Progress);
        assert!(e1.seq < e2.seq);
        assert!(e1.seq >= 1);
    }

    #[tokio::test]
    async fn reconnect_with_since_replays_only_newer_events() {
        let broker = EventBroker::spawn("job_1");
        broker.enqueue(Event::register("job_1", "t1", "t1", 100));
        broker.enqueue(Event::progress("job_1", "t1", 25, 100));
        // Give the consumer task a chance to assign sequence numbers.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let after = broker.snapshot(blank_fields()).last_seq.unwrap_or(0);
        assert_eq!(after, 2);

        let mut sub = broker.subscribe(after, blank_fields());
        let snapshot = sub.receiver.recv().await.expect("snapshot");
        assert_eq!(snapshot.kind, EventKind::Snapshot);

        broker.enqueue(Event::finish("job_1", "t1"));
        let next = sub.receiver.recv().await.expect("finish only, no replay");
        assert_eq!(next.kind, EventKind::Finish);
    }

    #[tokio::test]
    async fn history_cap_retains_only_the_most_recent_events() {
        let broker = EventBroker::spawn("job_1");
        for i in 0..(DEFAULT_MAX_HISTORY as u64 + 100) {
            broker.enqueue(Event::progress("job_1", "t1", i, 200));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let guard = broker.inner.lock().expect("lock");
        assert_eq!(guard.history.len(), DEFAULT_MAX_HISTORY);
    }

    #[tokio::test]
    async fn closing_the_broker_releases_subscribers() {
        let inner = Arc::new(Mutex::new(Inner {
            seq: 0,
            history: VecDeque::new(),
            task_state: HashMap::new(),
            logs: VecDeque::new(),
            duplicate_prompts: HashMap::new(),
            subscribers: HashMap::new(),
            next_subscriber_id: 0,
            closed: false,
            max_history: DEFAULT_MAX_HISTORY,
            max_logs: DEFAULT_MAX_LOGS,
            base_buffer: DEFAULT_SUBSCRIBER_BASE_BUFFER,
            critical_wait: DEFAULT_CRITICAL_WAIT,
        }));
        let broker = EventBroker {
            job_id: Arc::from("job_1"),
            tx: mpsc::channel(1).0,
            inner,
            next_task_id: Arc::new(AtomicU64::new(1)),
        };
        broker.close();
        let mut sub = broker.subscribe(0, blank_fields());
        assert!(sub.receiver.recv().await.is_some()); // snapshot still delivered
        assert!(sub.receiver.recv().await.is_none()); // then closed, no live events
    }
}
