//! Job manager. The public API for deferring, inspecting and cancelling jobs.
//!
//! The manager holds no state beyond a connector handle; all transitions
//! are conditional writes in the connector. Losing a race is reported as
//! `Ok(false)`, never as an error.

pub mod blocking;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{debug, info};

use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::model::{Job, JobFilters, JobId, NewJob, QueueStats, Status};
use crate::telemetry::metrics;

/// How an execution attempt ended, as reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Task returned normally.
    Success,
    /// Task saw an abort request and exited early.
    Aborted,
    /// Task failed; `retry_at` is set when the retry policy grants another
    /// attempt.
    Failure { retry_at: Option<DateTime<Utc>> },
}

/// Stateless façade over a [`Connector`].
#[derive(Clone)]
pub struct JobManager {
    connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager").finish_non_exhaustive()
    }
}

impl JobManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Insert a new TODO job and wake workers listening on its queue.
    pub async fn defer_job(&self, job: NewJob) -> Result<JobId> {
        let queue = job.queue().to_string();
        let task_name = job.task_name().to_string();

        let result = self.connector.insert_job(job).await;
        let label = match &result {
            Ok(_) => "ok",
            Err(Error::AlreadyEnqueued { .. }) => "already_enqueued",
            Err(_) => "error",
        };
        metrics::jobs_deferred().add(
            1,
            &[
                KeyValue::new("queue", queue.clone()),
                KeyValue::new("result", label),
            ],
        );

        let id = result?;
        info!(job_id = %id, task = %task_name, queue = %queue, "job deferred");
        Ok(id)
    }

    /// Claim one job from `queues` (every queue when `None`).
    pub async fn fetch_job(&self, queues: Option<&[String]>) -> Result<Option<Job>> {
        let job = self.connector.claim_job(queues).await?;
        metrics::job_claims().add(
            1,
            &[KeyValue::new(
                "result",
                if job.is_some() { "claimed" } else { "empty" },
            )],
        );
        if let Some(ref job) = job {
            record_transition(Status::Todo, Status::Doing);
            debug!(job_id = %job.id, task = %job.task_name, attempt = job.attempts, "job claimed");
        }
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        self.connector
            .get_job(id)
            .await?
            .ok_or(Error::JobNotFound(id))
    }

    /// Reported status of a job; `Aborting` for running jobs with a
    /// pending abort request.
    pub async fn get_job_status(&self, id: JobId) -> Result<Status> {
        self.connector
            .get_status(id)
            .await?
            .ok_or(Error::JobNotFound(id))
    }

    pub async fn list_jobs(&self, filters: &JobFilters) -> Result<Vec<Job>> {
        self.connector.list_jobs(filters).await
    }

    pub async fn list_queues(&self) -> Result<Vec<QueueStats>> {
        self.connector.list_queues().await
    }

    /// Cancel a TODO job, or with `abort` flag a DOING one for
    /// cooperative abort. Returns `false` when neither applies, including
    /// for unknown ids.
    pub async fn cancel_job_by_id(&self, id: JobId, abort: bool) -> Result<bool> {
        if self
            .connector
            .set_status_if(id, Status::Todo, Status::Cancelled)
            .await?
        {
            record_transition(Status::Todo, Status::Cancelled);
            info!(job_id = %id, "job cancelled");
            return Ok(true);
        }

        if abort && self.connector.request_abort(id).await? {
            info!(job_id = %id, "abort requested");
            return Ok(true);
        }

        debug!(job_id = %id, abort, "nothing to cancel");
        Ok(false)
    }

    /// Record the end of an attempt on a DOING job.
    ///
    /// Returns `false` if the job was no longer DOING.
    pub async fn finish_job(&self, job: &Job, outcome: JobOutcome) -> Result<bool> {
        let (to, done) = match outcome {
            JobOutcome::Success => (
                Status::Succeeded,
                self.connector
                    .set_status_if(job.id, Status::Doing, Status::Succeeded)
                    .await?,
            ),
            JobOutcome::Aborted => (
                Status::Aborted,
                self.connector
                    .set_status_if(job.id, Status::Doing, Status::Aborted)
                    .await?,
            ),
            JobOutcome::Failure {
                retry_at: Some(at),
            } => (
                Status::Todo,
                self.connector.requeue_if(job.id, Status::Doing, at).await?,
            ),
            JobOutcome::Failure { retry_at: None } => (
                Status::Failed,
                self.connector
                    .set_status_if(job.id, Status::Doing, Status::Failed)
                    .await?,
            ),
        };

        if done {
            record_transition(Status::Doing, to);
        }
        Ok(done)
    }

    /// Put a FAILED job back in its queue, due at `at` (now when `None`).
    pub async fn retry_job_by_id(&self, id: JobId, at: Option<DateTime<Utc>>) -> Result<bool> {
        let done = self
            .connector
            .requeue_if(id, Status::Failed, at.unwrap_or_else(Utc::now))
            .await?;
        if done {
            record_transition(Status::Failed, Status::Todo);
            info!(job_id = %id, "failed job requeued");
        }
        Ok(done)
    }
}

fn record_transition(from: Status, to: Status) {
    metrics::job_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}
