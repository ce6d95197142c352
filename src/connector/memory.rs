//! In-process connector.
//!
//! All rows live behind one mutex, which makes every claim and transition
//! trivially atomic. Wake-ups go through a broadcast channel carrying the
//! queue name. Nothing survives the process; use it for tests, demos and
//! embedded single-process queues.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::{ClaimOrder, Connector, Listener, watches};
use crate::error::{Error, Result};
use crate::model::{Job, JobFilters, JobId, NewJob, QueueStats, Status};

const WAKEUP_CAPACITY: usize = 1024;

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<JobId, Job>,
    next_id: i64,
}

pub struct MemoryConnector {
    inner: Mutex<Inner>,
    wakeups: broadcast::Sender<String>,
    order: ClaimOrder,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        let (wakeups, _) = broadcast::channel(WAKEUP_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            wakeups,
            order: ClaimOrder::default(),
        }
    }

    pub fn with_claim_order(mut self, order: ClaimOrder) -> Self {
        self.order = order;
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("memory connector state poisoned".to_string()))
    }

    fn notify(&self, queue: &str) {
        // No subscribers is fine: pollers will find the job anyway.
        let _ = self.wakeups.send(queue.to_string());
    }
}

/// Does a TODO or DOING job other than `except` hold `key`?
fn queueing_lock_taken(state: &Inner, key: &str, except: Option<JobId>) -> bool {
    state.jobs.values().any(|j| {
        Some(j.id) != except
            && j.queueing_lock.as_deref() == Some(key)
            && matches!(j.status, Status::Todo | Status::Doing)
    })
}

fn compare(order: ClaimOrder, a: &Job, b: &Job) -> Ordering {
    match order {
        ClaimOrder::PriorityThenAge => b
            .priority
            .cmp(&a.priority)
            .then(a.scheduled_at.cmp(&b.scheduled_at))
            .then(a.id.cmp(&b.id)),
        ClaimOrder::Fifo => a.id.cmp(&b.id),
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn insert_job(&self, job: NewJob) -> Result<JobId> {
        let queue = job.queue.clone();
        let id = {
            let mut state = self.state()?;

            if let Some(ref key) = job.queueing_lock {
                if queueing_lock_taken(&state, key, None) {
                    return Err(Error::AlreadyEnqueued {
                        queueing_lock: key.clone(),
                    });
                }
            }

            state.next_id += 1;
            let id = JobId(state.next_id);
            state.jobs.insert(id, job.into_job(id, Utc::now()));
            id
        };

        self.notify(&queue);
        Ok(id)
    }

    async fn claim_job(&self, queues: Option<&[String]>) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut state = self.state()?;

        let busy: HashSet<&str> = state
            .jobs
            .values()
            .filter(|j| j.status == Status::Doing)
            .filter_map(|j| j.lock.as_deref())
            .collect();

        let candidate = state
            .jobs
            .values()
            .filter(|j| {
                j.status == Status::Todo
                    && j.scheduled_at <= now
                    && watches(queues, &j.queue)
                    && j.lock.as_deref().is_none_or(|l| !busy.contains(l))
            })
            .min_by(|a, b| compare(self.order, a, b))
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::Other(format!("claimed job {id} vanished")))?;
        job.status = Status::Doing;
        job.started_at = Some(now);
        job.attempts += 1;
        Ok(Some(job.clone()))
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.state()?.jobs.get(&id).cloned())
    }

    async fn get_status(&self, id: JobId) -> Result<Option<Status>> {
        Ok(self.state()?.jobs.get(&id).map(Job::reported_status))
    }

    async fn set_status_if(&self, id: JobId, expected: Status, new: Status) -> Result<bool> {
        let mut state = self.state()?;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != expected {
            return Ok(false);
        }
        job.status = new;
        if new.is_terminal() {
            job.finished_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn request_abort(&self, id: JobId) -> Result<bool> {
        let mut state = self.state()?;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == Status::Doing => {
                job.abort_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_if(
        &self,
        id: JobId,
        expected: Status,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let queue = {
            let mut state = self.state()?;
            let Some(current) = state.jobs.get(&id) else {
                return Ok(false);
            };
            if current.status != expected {
                return Ok(false);
            }

            if let Some(key) = current.queueing_lock.clone() {
                if queueing_lock_taken(&state, &key, Some(id)) {
                    return Err(Error::AlreadyEnqueued { queueing_lock: key });
                }
            }

            let job = state
                .jobs
                .get_mut(&id)
                .ok_or_else(|| Error::Other(format!("requeued job {id} vanished")))?;
            job.status = Status::Todo;
            job.scheduled_at = scheduled_at;
            job.abort_requested = false;
            job.finished_at = None;
            job.queue.clone()
        };

        self.notify(&queue);
        Ok(true)
    }

    async fn list_jobs(&self, filters: &JobFilters) -> Result<Vec<Job>> {
        Ok(self
            .state()?
            .jobs
            .values()
            .filter(|j| filters.matches(j))
            .cloned()
            .collect())
    }

    async fn list_queues(&self) -> Result<Vec<QueueStats>> {
        let state = self.state()?;
        let mut stats: BTreeMap<&str, QueueStats> = BTreeMap::new();
        for job in state.jobs.values() {
            stats
                .entry(job.queue.as_str())
                .or_insert_with(|| QueueStats::new(job.queue.as_str()))
                .add(job.reported_status(), 1);
        }
        Ok(stats.into_values().collect())
    }

    async fn listen(&self, queues: Option<&[String]>) -> Result<Box<dyn Listener>> {
        Ok(Box::new(MemoryListener {
            rx: self.wakeups.subscribe(),
            queues: queues.map(<[String]>::to_vec),
        }))
    }
}

struct MemoryListener {
    rx: broadcast::Receiver<String>,
    queues: Option<Vec<String>>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn wait(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Ok(false),
                Ok(Ok(queue)) => {
                    if watches(self.queues.as_deref(), &queue) {
                        return Ok(true);
                    }
                }
                // Missed messages may have been for us.
                Ok(Err(RecvError::Lagged(_))) => return Ok(true),
                Ok(Err(RecvError::Closed)) => {
                    tokio::time::sleep_until(deadline).await;
                    return Ok(false);
                }
            }
        }
    }
}
