//! Storage contract for job persistence and wake-ups.
//!
//! A connector owns the durable job rows. Every state change is a
//! conditional write against the current status so that concurrent callers
//! can never both win the same transition: a mismatch returns `Ok(false)`.
//!
//! Two implementations ship with the crate: [`postgres::PgConnector`] for
//! deployments and [`memory::MemoryConnector`] for tests and single-process
//! use. Callers only depend on [`Connector`].

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;
use crate::model::{Job, JobFilters, JobId, NewJob, QueueStats, Status};

pub use memory::MemoryConnector;
pub use postgres::PgConnector;

/// Order in which claimable jobs are handed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClaimOrder {
    /// Highest priority first, then earliest `scheduled_at`, then lowest id.
    #[default]
    PriorityThenAge,
    /// Lowest id first, ignoring priority and schedule.
    Fifo,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Insert a TODO job and publish a wake-up for its queue.
    ///
    /// Fails with `AlreadyEnqueued` when the job carries a queueing lock
    /// already held by a TODO or DOING job. The check and the insert are
    /// one atomic step.
    async fn insert_job(&self, job: NewJob) -> Result<JobId>;

    /// Atomically claim one claimable job: TODO, due, in one of `queues`
    /// (any queue when `None`), and not sharing a lock with a DOING job.
    /// The claimed row is DOING with `started_at` set and `attempts`
    /// incremented.
    async fn claim_job(&self, queues: Option<&[String]>) -> Result<Option<Job>>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    /// Reported status (`Aborting` for flagged DOING rows).
    async fn get_status(&self, id: JobId) -> Result<Option<Status>>;

    /// Move `id` from `expected` to `new` if it is still in `expected`.
    /// Terminal targets stamp `finished_at`.
    async fn set_status_if(&self, id: JobId, expected: Status, new: Status) -> Result<bool>;

    /// Set the abort flag on a DOING job.
    async fn request_abort(&self, id: JobId) -> Result<bool>;

    /// Move `id` from `expected` back to TODO, due at `scheduled_at`, and
    /// publish a wake-up for its queue.
    async fn requeue_if(
        &self,
        id: JobId,
        expected: Status,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn list_jobs(&self, filters: &JobFilters) -> Result<Vec<Job>>;

    async fn list_queues(&self) -> Result<Vec<QueueStats>>;

    /// Subscribe to wake-ups for `queues` (all queues when `None`).
    async fn listen(&self, queues: Option<&[String]>) -> Result<Box<dyn Listener>>;
}

#[async_trait]
pub trait Listener: Send {
    /// Wait for a wake-up. Returns `false` when `timeout` elapses first.
    async fn wait(&mut self, timeout: Duration) -> Result<bool>;
}

/// Does `queue` belong to the watched set?
pub(crate) fn watches(queues: Option<&[String]>, queue: &str) -> bool {
    queues.is_none_or(|qs| qs.iter().any(|q| q == queue))
}
