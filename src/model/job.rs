//! Job record, lifecycle status, and the builder used to defer new jobs.
//!
//! A job is one durable unit of work bound to a task name and a queue. Only
//! the status, the timestamps, and the abort flag change after insertion,
//! and only through the job manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Task arguments: an insertion-ordered JSON object.
pub type Args = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A job as stored by a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Assigned by storage on insert.
    pub id: JobId,

    /// Name of the registered task that executes this job.
    pub task_name: String,

    /// Queue the job was deferred to.
    pub queue: String,

    /// Arguments passed to the task.
    pub args: Args,

    /// Stored lifecycle status. See [`Job::reported_status`] for the
    /// abort-aware view.
    pub status: Status,

    /// Higher is claimed first.
    pub priority: i32,

    /// At most one DOING job per lock at any time.
    pub lock: Option<String>,

    /// Deferring fails while a TODO or DOING job holds the same key.
    pub queueing_lock: Option<String>,

    /// Not claimable before this instant.
    pub scheduled_at: DateTime<Utc>,

    /// Number of times the job has been claimed.
    pub attempts: u32,

    /// Set by an abort request while the job is DOING.
    pub abort_requested: bool,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Status as callers observe it: a DOING job with the abort flag set
    /// reports [`Status::Aborting`].
    pub fn reported_status(&self) -> Status {
        Status::reported(self.status, self.abort_requested)
    }

    /// `task_name[id](key=value, ...)` with arguments in insertion order.
    pub fn call_string(&self) -> String {
        let args = self
            .args
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}[{}]({args})", self.task_name, self.id)
    }

    /// Structured description of the job for log payloads.
    pub fn log_context(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut context = serde_json::Map::new();
        context.insert("id".into(), self.id.0.into());
        context.insert("queue".into(), self.queue.clone().into());
        context.insert("task_name".into(), self.task_name.clone().into());
        context.insert("args".into(), serde_json::Value::Object(self.args.clone()));
        context.insert("status".into(), self.reported_status().to_string().into());
        context.insert("priority".into(), self.priority.into());
        context.insert("lock".into(), self.lock.clone().into());
        context.insert("queueing_lock".into(), self.queueing_lock.clone().into());
        context.insert("scheduled_at".into(), self.scheduled_at.to_rfc3339().into());
        context.insert("attempts".into(), self.attempts.into());
        context.insert("call_string".into(), self.call_string().into());
        context
    }
}

/// Newtype for job IDs. Storage assigns them on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting to be claimed.
    Todo,
    /// Claimed by a worker and running.
    Doing,
    /// DOING with an abort request pending. Reported, never stored.
    Aborting,
    /// Task returned successfully. Terminal.
    Succeeded,
    /// Task failed with no retry left. Terminal.
    Failed,
    /// Cancelled before any worker claimed it. Terminal.
    Cancelled,
    /// Task observed an abort request and exited early. Terminal.
    Aborted,
}

impl Status {
    /// Can a stored job move from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Todo, Doing)
                | (Todo, Cancelled)
                | (Doing, Succeeded)
                | (Doing, Failed)
                | (Doing, Aborted)
                | (Doing, Todo)     // retry after a failed attempt
                | (Failed, Todo) // manual retry
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Failed | Status::Cancelled | Status::Aborted
        )
    }

    /// Fold the abort flag into a stored status.
    pub fn reported(stored: Status, abort_requested: bool) -> Status {
        if stored == Status::Doing && abort_requested {
            Status::Aborting
        } else {
            stored
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Todo => "todo",
            Status::Doing => "doing",
            Status::Aborting => "aborting",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
            Status::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "todo" => Ok(Status::Todo),
            "doing" => Ok(Status::Doing),
            "aborting" => Ok(Status::Aborting),
            "succeeded" => Ok(Status::Succeeded),
            "failed" => Ok(Status::Failed),
            "cancelled" => Ok(Status::Cancelled),
            "aborted" => Ok(Status::Aborted),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for jobs to defer. The job manager's input for `defer_job`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) task_name: String,
    pub(crate) queue: String,
    pub(crate) args: Args,
    pub(crate) priority: i32,
    pub(crate) lock: Option<String>,
    pub(crate) queueing_lock: Option<String>,
    pub(crate) scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(task_name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            queue: queue.into(),
            args: Args::new(),
            priority: 0,
            lock: None,
            queueing_lock: None,
            scheduled_at: None,
        }
    }

    /// Add one argument. Order of calls is kept.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    /// Replace all arguments.
    pub fn args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    pub fn queueing_lock(mut self, key: impl Into<String>) -> Self {
        self.queueing_lock = Some(key.into());
        self
    }

    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Schedule `delay` from now. Fails when the time is out of range.
    pub fn schedule_in(mut self, delay: chrono::TimeDelta) -> Result<Self> {
        let at = Utc::now()
            .checked_add_signed(delay)
            .ok_or_else(|| Error::Config(format!("schedule delay out of range: {delay}")))?;
        self.scheduled_at = Some(at);
        Ok(self)
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Materialise the row a connector stores for this builder.
    pub(crate) fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            task_name: self.task_name,
            queue: self.queue,
            args: self.args,
            status: Status::Todo,
            priority: self.priority,
            lock: self.lock,
            queueing_lock: self.queueing_lock,
            scheduled_at: self.scheduled_at.unwrap_or(now),
            attempts: 0,
            abort_requested: false,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Filters for `list_jobs`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilters {
    pub id: Option<JobId>,
    pub queue: Option<String>,
    pub task_name: Option<String>,
    /// Reported status; `Aborting` matches flagged DOING jobs.
    pub status: Option<Status>,
    pub lock: Option<String>,
    pub queueing_lock: Option<String>,
}

impl JobFilters {
    pub fn matches(&self, job: &Job) -> bool {
        self.id.is_none_or(|id| job.id == id)
            && self.queue.as_ref().is_none_or(|q| &job.queue == q)
            && self.task_name.as_ref().is_none_or(|t| &job.task_name == t)
            && self.status.is_none_or(|s| job.reported_status() == s)
            && self.lock.as_ref().is_none_or(|l| job.lock.as_ref() == Some(l))
            && self
                .queueing_lock
                .as_ref()
                .is_none_or(|l| job.queueing_lock.as_ref() == Some(l))
    }
}

/// Job counts for one queue, per reported status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    pub todo: u64,
    pub doing: u64,
    pub aborting: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub aborted: u64,
}

impl QueueStats {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    pub fn add(&mut self, status: Status, count: u64) {
        let slot = match status {
            Status::Todo => &mut self.todo,
            Status::Doing => &mut self.doing,
            Status::Aborting => &mut self.aborting,
            Status::Succeeded => &mut self.succeeded,
            Status::Failed => &mut self.failed,
            Status::Cancelled => &mut self.cancelled,
            Status::Aborted => &mut self.aborted,
        };
        *slot += count;
    }
}
