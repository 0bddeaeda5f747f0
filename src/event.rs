//! Event envelope and derived per-job state.
//!
//! The envelope is a flat, mostly-optional struct rather than a tagged enum
//! with per-variant payload structs: the wire format puts type-specific
//! fields directly on the envelope next to `type`/`jobId`/`seq`/`at`, and
//! `#[serde(skip_serializing_if = "Option::is_none")]` keeps each concrete
//! event small on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Status,
    Register,
    Progress,
    Finish,
    Log,
    Duplicate,
    DuplicateResolved,
    Done,
    Snapshot,
}

impl EventKind {
    /// Critical events get a bounded-wait fan-out; everything else is
    /// best-effort and may be dropped under backpressure.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            EventKind::Status | EventKind::Done | EventKind::Duplicate | EventKind::DuplicateResolved
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlResult {
    pub url: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-task progress snapshot maintained by applying `register`/`progress`/
/// `finish` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub label: String,
    pub current: u64,
    pub total: u64,
    pub percent: u8,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateSnapshot {
    pub prompt_id: String,
    pub path: String,
    pub filename: String,
}

/// The envelope fanned out to subscribers. Construction goes through the
/// `new_*` helpers below rather than literal struct construction at call
/// sites, so that every producer fills in the same set of fields for a given
/// kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub job_id: String,
    pub seq: u64,
    pub at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    // snapshot-only fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskState>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<LogLine>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicates: Option<Vec<DuplicateSnapshot>>,
}

impl Event {
    /// Placeholder envelope; `seq`/`at` are overwritten by the broker when
    /// the event is recorded, so producers never have to guess a sequence
    /// number.
    fn blank(job_id: &str, kind: EventKind) -> Self {
        Self {
            kind,
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
            status: None,
            stats: None,
            exit_code: None,
            error: None,
            created_at: None,
            completed_at: None,
            last_seq: None,
            tasks: None,
            logs: None,
            duplicates: None,
        }
    }

    pub fn status(job_id: &str, status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::blank(job_id, EventKind::Status)
        }
    }

    pub fn register(job_id: &str, id: &str, label: &str, total: u64) -> Self {
        Self {
            id: Some(id.to_string()),
            label: Some(label.to_string()),
            total: Some(total),
            current: Some(0),
            ..Self::blank(job_id, EventKind::Register)
        }
    }

    pub fn progress(job_id: &str, id: &str, current: u64, total: u64) -> Self {
        Self {
            id: Some(id.to_string()),
            current: Some(current),
            total: Some(total),
            ..Self::blank(job_id, EventKind::Progress)
        }
    }

    pub fn finish(job_id: &str, id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::blank(job_id, EventKind::Finish)
        }
    }

    pub fn log(job_id: &str, level: LogLevel, message: &str) -> Self {
        Self {
            level: Some(level),
            message: Some(message.to_string()),
            ..Self::blank(job_id, EventKind::Log)
        }
    }

    pub fn duplicate(job_id: &str, prompt_id: &str, path: &str, filename: &str) -> Self {
        Self {
            prompt_id: Some(prompt_id.to_string()),
            path: Some(path.to_string()),
            filename: Some(filename.to_string()),
            ..Self::blank(job_id, EventKind::Duplicate)
        }
    }

    pub fn duplicate_resolved(job_id: &str, prompt_id: &str, decision: &str) -> Self {
        Self {
            prompt_id: Some(prompt_id.to_string()),
            message: Some(decision.to_string()),
            ..Self::blank(job_id, EventKind::DuplicateResolved)
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn done(
        job_id: &str,
        status: JobStatus,
        exit_code: i32,
        error: Option<String>,
        stats: Stats,
    ) -> Self {
        Self {
            status: Some(status),
            exit_code: Some(exit_code),
            error,
            stats: Some(stats),
            ..Self::blank(job_id, EventKind::Done)
        }
    }
}
