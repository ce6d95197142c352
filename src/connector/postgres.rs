//! Postgres connector via direct SQLx.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never select
//! the same row. Lock serialisation rides on a partial unique index over
//! `lock` for DOING rows; wake-ups are `pg_notify` on commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::{ClaimOrder, Connector, Listener, watches};
use crate::error::{Error, Result};
use crate::model::{Args, Job, JobFilters, JobId, NewJob, QueueStats, Status};

/// NOTIFY channel; the payload is the queue name.
const CHANNEL: &str = "deferq_jobs";

const LOCK_INDEX: &str = "deferq_jobs_lock_idx";
const QUEUEING_LOCK_INDEX: &str = "deferq_jobs_queueing_lock_idx";

/// Claims retried after losing a lock race before reporting "none".
const MAX_CLAIM_ATTEMPTS: usize = 5;

const JOB_COLUMNS: &str = "id, task_name, queue_name, args, status, priority, lock, queueing_lock, \
     scheduled_at, attempts, abort_requested, created_at, started_at, finished_at";

/// Postgres-backed connector. Owns the connection pool.
#[derive(Clone)]
pub struct PgConnector {
    pool: PgPool,
    claim_sql: String,
}

impl PgConnector {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            claim_sql: claim_sql(ClaimOrder::default()),
        }
    }

    pub fn with_claim_order(mut self, order: ClaimOrder) -> Self {
        self.claim_sql = claim_sql(order);
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Round-trip a `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn claim_sql(order: ClaimOrder) -> String {
    let order_by = match order {
        ClaimOrder::PriorityThenAge => "j.priority DESC, j.scheduled_at ASC, j.id ASC",
        ClaimOrder::Fifo => "j.id ASC",
    };
    format!(
        "UPDATE deferq_jobs
         SET status = 'doing', started_at = now(), attempts = attempts + 1
         WHERE id = (
             SELECT j.id FROM deferq_jobs AS j
             WHERE j.status = 'todo'
               AND j.scheduled_at <= now()
               AND ($1::text[] IS NULL OR j.queue_name = ANY($1))
               AND (j.lock IS NULL OR NOT EXISTS (
                   SELECT 1 FROM deferq_jobs AS d
                   WHERE d.lock = j.lock AND d.status = 'doing'
               ))
             ORDER BY {order_by}
             LIMIT 1
             FOR UPDATE SKIP LOCKED
         )
         RETURNING {JOB_COLUMNS}"
    )
}

fn violates(err: &sqlx::Error, index: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => db.constraint() == Some(index),
        _ => false,
    }
}

/// Split a reported status into the stored status and abort flag to match.
fn stored_filter(status: Status) -> (&'static str, Option<bool>) {
    match status {
        Status::Aborting => ("doing", Some(true)),
        Status::Doing => ("doing", Some(false)),
        other => (other.as_str(), None),
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn insert_job(&self, job: NewJob) -> Result<JobId> {
        let mut tx = self.pool.begin().await?;

        let inserted: std::result::Result<(i64,), sqlx::Error> = sqlx::query_as(
            "INSERT INTO deferq_jobs (task_name, queue_name, args, priority, lock, queueing_lock, scheduled_at)
             VALUES ($1, $2, $3, $4, $5, $6, COALESCE($7, now()))
             RETURNING id",
        )
        .bind(&job.task_name)
        .bind(&job.queue)
        .bind(sqlx::types::Json(&job.args))
        .bind(job.priority)
        .bind(&job.lock)
        .bind(&job.queueing_lock)
        .bind(job.scheduled_at)
        .fetch_one(&mut *tx)
        .await;

        let id = match inserted {
            Ok((id,)) => id,
            Err(e) if violates(&e, QUEUEING_LOCK_INDEX) => {
                return Err(Error::AlreadyEnqueued {
                    queueing_lock: job.queueing_lock.unwrap_or_default(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        // NOTIFY fires on commit only.
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANNEL)
            .bind(&job.queue)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(JobId(id))
    }

    async fn claim_job(&self, queues: Option<&[String]>) -> Result<Option<Job>> {
        let queues = queues.map(<[String]>::to_vec);

        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let claimed: std::result::Result<Option<JobRow>, sqlx::Error> =
                sqlx::query_as(&self.claim_sql)
                    .bind(&queues)
                    .fetch_optional(&self.pool)
                    .await;

            match claimed {
                Ok(row) => return row.map(JobRow::try_into_job).transpose(),
                // Another worker claimed a job with the same lock between our
                // check and our update; the next round will skip that lock.
                Err(e) if violates(&e, LOCK_INDEX) => {
                    debug!(attempt, "lost lock race while claiming, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM deferq_jobs WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(JobRow::try_into_job).transpose()
    }

    async fn get_status(&self, id: JobId) -> Result<Option<Status>> {
        let row: Option<(String, bool)> =
            sqlx::query_as("SELECT status, abort_requested FROM deferq_jobs WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(status, abort)| -> Result<Status> {
            Ok(Status::reported(status.parse()?, abort))
        })
        .transpose()
    }

    async fn set_status_if(&self, id: JobId, expected: Status, new: Status) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE deferq_jobs
             SET status = $1, finished_at = CASE WHEN $2 THEN now() ELSE finished_at END
             WHERE id = $3 AND status = $4",
        )
        .bind(new.as_str())
        .bind(new.is_terminal())
        .bind(id.0)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn request_abort(&self, id: JobId) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE deferq_jobs SET abort_requested = true WHERE id = $1 AND status = 'doing'",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    async fn requeue_if(
        &self,
        id: JobId,
        expected: Status,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let requeued: std::result::Result<Option<(String,)>, sqlx::Error> = sqlx::query_as(
            "UPDATE deferq_jobs
             SET status = 'todo', scheduled_at = $1, abort_requested = false, finished_at = NULL
             WHERE id = $2 AND status = $3
             RETURNING queue_name",
        )
        .bind(scheduled_at)
        .bind(id.0)
        .bind(expected.as_str())
        .fetch_optional(&mut *tx)
        .await;

        let queue = match requeued {
            Ok(queue) => queue,
            Err(e) if violates(&e, QUEUEING_LOCK_INDEX) => {
                drop(tx);
                let key: Option<(Option<String>,)> =
                    sqlx::query_as("SELECT queueing_lock FROM deferq_jobs WHERE id = $1")
                        .bind(id.0)
                        .fetch_optional(&self.pool)
                        .await?;
                return Err(Error::AlreadyEnqueued {
                    queueing_lock: key.and_then(|(key,)| key).unwrap_or_default(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let Some((queue,)) = queue else {
            return Ok(false);
        };

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANNEL)
            .bind(&queue)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_jobs(&self, filters: &JobFilters) -> Result<Vec<Job>> {
        let (status, abort) = match filters.status.map(stored_filter) {
            Some((status, abort)) => (Some(status), abort),
            None => (None, None),
        };

        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM deferq_jobs
             WHERE ($1::bigint IS NULL OR id = $1)
               AND ($2::text IS NULL OR queue_name = $2)
               AND ($3::text IS NULL OR task_name = $3)
               AND ($4::text IS NULL OR status = $4)
               AND ($5::boolean IS NULL OR abort_requested = $5)
               AND ($6::text IS NULL OR lock = $6)
               AND ($7::text IS NULL OR queueing_lock = $7)
             ORDER BY id ASC"
        ))
        .bind(filters.id.map(|id| id.0))
        .bind(filters.queue.as_deref())
        .bind(filters.task_name.as_deref())
        .bind(status)
        .bind(abort)
        .bind(filters.lock.as_deref())
        .bind(filters.queueing_lock.as_deref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    async fn list_queues(&self) -> Result<Vec<QueueStats>> {
        let rows: Vec<(String, String, bool, i64)> = sqlx::query_as(
            "SELECT queue_name, status, abort_requested, count(*)
             FROM deferq_jobs
             GROUP BY queue_name, status, abort_requested",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats: BTreeMap<String, QueueStats> = BTreeMap::new();
        for (queue, status, abort, count) in rows {
            let status = Status::reported(status.parse()?, abort);
            stats
                .entry(queue.clone())
                .or_insert_with(|| QueueStats::new(queue))
                .add(status, count as u64);
        }
        Ok(stats.into_values().collect())
    }

    async fn listen(&self, queues: Option<&[String]>) -> Result<Box<dyn Listener>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANNEL).await?;
        Ok(Box::new(PgWakeups {
            listener,
            queues: queues.map(<[String]>::to_vec),
        }))
    }
}

struct PgWakeups {
    listener: PgListener,
    queues: Option<Vec<String>>,
}

#[async_trait]
impl Listener for PgWakeups {
    async fn wait(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.listener.recv()).await {
                Err(_) => return Ok(false),
                Ok(Ok(notification)) => {
                    if watches(self.queues.as_deref(), notification.payload()) {
                        return Ok(true);
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    task_name: String,
    queue_name: String,
    args: serde_json::Value,
    status: String,
    priority: i32,
    lock: Option<String>,
    queueing_lock: Option<String>,
    scheduled_at: DateTime<Utc>,
    attempts: i32,
    abort_requested: bool,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        let args = match self.args {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => Args::new(),
            other => {
                return Err(Error::Other(format!(
                    "job {} has non-object args: {other}",
                    self.id
                )));
            }
        };

        Ok(Job {
            id: JobId(self.id),
            task_name: self.task_name,
            queue: self.queue_name,
            args,
            status: self.status.parse()?,
            priority: self.priority,
            lock: self.lock,
            queueing_lock: self.queueing_lock,
            scheduled_at: self.scheduled_at,
            attempts: self.attempts.max(0) as u32,
            abort_requested: self.abort_requested,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}
