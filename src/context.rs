//! Per-attempt execution context handed to task code.
//!
//! A context describes the worker slot running the job, carries the timing
//! of the current attempt, and answers "should this job stop?" with a
//! small cache so long-running tasks can poll often without hammering the
//! store. A context is owned by one slot for one attempt; derived contexts
//! are copies, never shared.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::manager::JobManager;
use crate::model::result::seconds;
use crate::model::{Job, JobResult, Status};

/// Last abort-check verdict and when it was fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbortCache {
    pub last_checked: Option<DateTime<Utc>>,
    pub status: Option<Status>,
}

#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub worker_name: Option<String>,
    /// Slot index within the worker.
    pub worker_id: Option<usize>,
    /// `None` when the worker watches every queue.
    pub worker_queues: Option<Vec<String>>,
    /// Extra fields merged into the `job` entry of log payloads.
    pub additional_context: Map<String, Value>,
    pub job: Option<Job>,
    pub job_result: JobResult,
    pub manager: Option<JobManager>,
    pub abort_cache: AbortCache,
}

impl JobContext {
    /// Context for a worker slot with no job attached yet.
    pub fn for_worker(
        name: impl Into<String>,
        id: usize,
        queues: Option<Vec<String>>,
        manager: JobManager,
    ) -> Self {
        Self {
            worker_name: Some(name.into()),
            worker_id: Some(id),
            worker_queues: queues,
            manager: Some(manager),
            ..Self::default()
        }
    }

    /// Copy of this context with `overrides` applied to the copy only.
    pub fn evolve(&self, overrides: impl FnOnce(&mut JobContext)) -> JobContext {
        let mut next = self.clone();
        overrides(&mut next);
        next
    }

    /// Same worker, fresh attempt of `job` started at `started`.
    pub fn with_job(&self, job: Job, started: DateTime<Utc>) -> JobContext {
        self.evolve(|ctx| {
            ctx.job = Some(job);
            ctx.job_result = JobResult::started(started);
            ctx.abort_cache = AbortCache::default();
        })
    }

    pub fn queues_display(&self) -> String {
        match self.worker_queues {
            None => "all queues".to_string(),
            Some(ref queues) => format!("queues {}", queues.join(", ")),
        }
    }

    /// One-line summary, e.g. `worker 2: sum[12](a=1, b=2) (started 1.500 s ago)`.
    pub fn job_description(&self, now: DateTime<Utc>) -> String {
        let worker = match (self.worker_id, self.worker_name.as_deref()) {
            (Some(id), _) => id.to_string(),
            (None, Some(name)) => name.to_string(),
            (None, None) => "-".to_string(),
        };

        let Some(ref job) = self.job else {
            return format!("worker {worker}: no current job");
        };

        let mut description = format!("worker {worker}: {}", job.call_string());
        if let Some(start) = self.job_result.start_timestamp {
            description.push_str(&format!(" (started {:.3} s ago)", seconds(now - start)));
        }
        description
    }

    /// Structured log payload: `action`, the object `fields` merged at the
    /// top level, the attached job (if any), and the owning worker.
    pub fn log_extra(&self, action: &str, fields: Value) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert("action".into(), action.into());

        match fields {
            Value::Object(fields) => extra.extend(fields),
            Value::Null => {}
            other => {
                extra.insert("data".into(), other);
            }
        }

        if let Some(ref job) = self.job {
            let mut context = job.log_context();
            context.extend(self.additional_context.clone());
            extra.insert("job".into(), Value::Object(context));
        }

        let mut worker = Map::new();
        worker.insert("name".into(), self.worker_name.clone().into());
        worker.insert("id".into(), self.worker_id.into());
        worker.insert("queues".into(), self.worker_queues.clone().into());
        extra.insert("worker".into(), Value::Object(worker));

        extra
    }

    /// Has an abort been requested for the attached job?
    ///
    /// Without `cache_ttl` every call reads the live status. With it, a call
    /// less than `cache_ttl` after the last read returns the remembered
    /// verdict; later calls read again and refresh the cache.
    pub async fn should_abort(&mut self, cache_ttl: Option<Duration>) -> Result<bool> {
        self.should_abort_at(Utc::now(), cache_ttl).await
    }

    /// [`should_abort`](Self::should_abort) evaluated at `now`.
    pub async fn should_abort_at(
        &mut self,
        now: DateTime<Utc>,
        cache_ttl: Option<Duration>,
    ) -> Result<bool> {
        let job_id = self.job.as_ref().ok_or(Error::NoJob)?.id;

        if let (Some(ttl), Some(checked), Some(status)) = (
            cache_ttl,
            self.abort_cache.last_checked,
            self.abort_cache.status,
        ) {
            let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
            if now - checked < ttl {
                return Ok(status == Status::Aborting);
            }
        }

        let manager = self
            .manager
            .as_ref()
            .ok_or_else(|| Error::Other("execution context has no job manager".to_string()))?;
        let status = manager.get_job_status(job_id).await?;

        self.abort_cache = AbortCache {
            last_checked: Some(now),
            status: Some(status),
        };
        Ok(status == Status::Aborting)
    }

    /// Blocking form of [`should_abort`](Self::should_abort), for
    /// [`Task::blocking`](crate::task::Task::blocking) bodies running on
    /// the runtime's blocking pool.
    pub fn should_abort_blocking(&mut self, cache_ttl: Option<Duration>) -> Result<bool> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("no runtime for abort check: {e}")))?;
        handle.block_on(self.should_abort(cache_ttl))
    }
}
