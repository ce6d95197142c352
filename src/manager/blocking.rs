//! Blocking job manager for synchronous callers.
//!
//! Wraps [`JobManager`] with a private current-thread runtime. Must not be
//! used from inside an async context: `block_on` panics there.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

use super::{JobManager, JobOutcome};
use crate::connector::{Connector, PgConnector};
use crate::error::Result;
use crate::model::{Job, JobFilters, JobId, NewJob, QueueStats, Status};

pub struct BlockingJobManager {
    inner: JobManager,
    runtime: Runtime,
}

impl BlockingJobManager {
    pub fn new(connector: Arc<dyn Connector>) -> Result<Self> {
        Ok(Self {
            inner: JobManager::new(connector),
            runtime: runtime()?,
        })
    }

    /// Connect to Postgres on this manager's own runtime, so the pool's
    /// I/O is driven by the runtime that will use it.
    pub fn connect_postgres(url: &str) -> Result<Self> {
        let runtime = runtime()?;
        let connector = runtime.block_on(PgConnector::connect(url))?;
        Ok(Self {
            inner: JobManager::new(Arc::new(connector)),
            runtime,
        })
    }

    /// The async manager sharing this manager's connector.
    pub fn as_async(&self) -> &JobManager {
        &self.inner
    }

    pub fn defer_job(&self, job: NewJob) -> Result<JobId> {
        self.runtime.block_on(self.inner.defer_job(job))
    }

    pub fn fetch_job(&self, queues: Option<&[String]>) -> Result<Option<Job>> {
        self.runtime.block_on(self.inner.fetch_job(queues))
    }

    pub fn get_job(&self, id: JobId) -> Result<Job> {
        self.runtime.block_on(self.inner.get_job(id))
    }

    pub fn get_job_status(&self, id: JobId) -> Result<Status> {
        self.runtime.block_on(self.inner.get_job_status(id))
    }

    pub fn list_jobs(&self, filters: &JobFilters) -> Result<Vec<Job>> {
        self.runtime.block_on(self.inner.list_jobs(filters))
    }

    pub fn list_queues(&self) -> Result<Vec<QueueStats>> {
        self.runtime.block_on(self.inner.list_queues())
    }

    pub fn cancel_job_by_id(&self, id: JobId, abort: bool) -> Result<bool> {
        self.runtime.block_on(self.inner.cancel_job_by_id(id, abort))
    }

    pub fn finish_job(&self, job: &Job, outcome: JobOutcome) -> Result<bool> {
        self.runtime.block_on(self.inner.finish_job(job, outcome))
    }

    pub fn retry_job_by_id(&self, id: JobId, at: Option<DateTime<Utc>>) -> Result<bool> {
        self.runtime.block_on(self.inner.retry_job_by_id(id, at))
    }
}

fn runtime() -> Result<Runtime> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}
