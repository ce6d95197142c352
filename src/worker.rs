//! Worker: claims jobs from a set of queues and runs them in bounded slots.
//!
//! Each slot loops fetch -> execute -> finish. Idle slots sleep until a
//! wake-up arrives for the watched queues or the polling interval elapses,
//! whichever comes first, so a lost notification costs at most one
//! interval. Storage errors back the slot off; they never end the loop.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::context::JobContext;
use crate::error::{Error, Result};
use crate::manager::{JobManager, JobOutcome};
use crate::model::{Args, Job, Status};
use crate::model::result::seconds;
use crate::task::{Task, TaskError, TaskRegistry, TaskResult};
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name reported in logs and contexts.
    pub name: String,
    /// Queues to claim from. `None` watches every queue.
    pub queues: Option<Vec<String>>,
    /// Maximum jobs running at once.
    pub concurrency: usize,
    /// Keep running when idle. `false` drains claimable work and returns.
    pub wait: bool,
    /// Fallback poll interval when no wake-up arrives.
    pub polling_interval: Duration,
    /// Subscribe to connector wake-ups. Polling alone is used otherwise.
    pub listen_notify: bool,
    /// Pause after a storage error before the next fetch.
    pub error_backoff: Duration,
    /// Merged into every job's log context.
    pub additional_context: Map<String, Value>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            queues: None,
            concurrency: 1,
            wait: true,
            polling_interval: Duration::from_secs(5),
            listen_notify: true,
            error_backoff: Duration::from_secs(1),
            additional_context: Map::new(),
        }
    }
}

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct WorkerFile {
    worker: WorkerSection,
}

#[derive(Debug, Deserialize)]
struct WorkerSection {
    name: Option<String>,
    queues: Option<Vec<String>>,
    concurrency: Option<usize>,
    wait: Option<bool>,
    polling_interval_secs: Option<f64>,
    listen_notify: Option<bool>,
    error_backoff_secs: Option<f64>,
    #[serde(default)]
    additional_context: Map<String, Value>,
}

impl WorkerConfig {
    /// Parse a `[worker]` table. Missing keys keep their defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: WorkerFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad worker config: {e}")))?;
        let section = file.worker;
        let defaults = Self::default();

        let config = Self {
            name: section.name.unwrap_or(defaults.name),
            queues: section.queues.or(defaults.queues),
            concurrency: section.concurrency.unwrap_or(defaults.concurrency),
            wait: section.wait.unwrap_or(defaults.wait),
            polling_interval: secs(section.polling_interval_secs, "polling_interval_secs")?
                .unwrap_or(defaults.polling_interval),
            listen_notify: section.listen_notify.unwrap_or(defaults.listen_notify),
            error_backoff: secs(section.error_backoff_secs, "error_backoff_secs")?
                .unwrap_or(defaults.error_backoff),
            additional_context: section.additional_context,
        };

        if config.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        Ok(config)
    }

    /// Load a worker config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read worker config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }
}

fn secs(value: Option<f64>, key: &str) -> Result<Option<Duration>> {
    value
        .map(|v| {
            Duration::try_from_secs_f64(v)
                .map_err(|e| Error::Config(format!("invalid {key} = {v}: {e}")))
        })
        .transpose()
}

/// Run a worker until it drains (`wait = false`) or forever (`wait = true`).
pub async fn run_worker(
    manager: JobManager,
    registry: Arc<TaskRegistry>,
    queues: Option<Vec<String>>,
    concurrency: usize,
    wait: bool,
) -> Result<()> {
    let config = WorkerConfig {
        queues,
        concurrency,
        wait,
        ..WorkerConfig::default()
    };
    Worker::new(manager, registry, config).run().await
}

/// The worker loop: fetch jobs, run them in slots, record outcomes.
#[derive(Clone)]
pub struct Worker {
    manager: JobManager,
    registry: Arc<TaskRegistry>,
    config: Arc<WorkerConfig>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Worker {
    pub fn new(manager: JobManager, registry: Arc<TaskRegistry>, config: WorkerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            manager,
            registry,
            config: Arc::new(config),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Stop fetching. Jobs already running finish first.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run until shutdown, or until drained when `wait` is off.
    pub async fn run(&self) -> Result<()> {
        let concurrency = self.config.concurrency.max(1);
        let queues_display = JobContext {
            worker_queues: self.config.queues.clone(),
            ..JobContext::default()
        }
        .queues_display();

        info!(
            worker = %self.config.name,
            concurrency,
            wait = self.config.wait,
            "starting worker on {queues_display}"
        );

        let wake = Arc::new(Notify::new());
        let listener = (self.config.wait && self.config.listen_notify)
            .then(|| tokio::spawn(self.clone().listen(Arc::clone(&wake))));

        let mut slots = JoinSet::new();
        for slot in 0..concurrency {
            slots.spawn(self.clone().run_slot(slot, Arc::clone(&wake)));
        }
        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                error!(worker = %self.config.name, "worker slot crashed: {e}");
            }
        }

        if let Some(listener) = listener {
            listener.abort();
        }
        info!(worker = %self.config.name, "worker stopped");
        Ok(())
    }

    /// Forward connector wake-ups to idle slots.
    async fn listen(self, wake: Arc<Notify>) {
        let mut shutdown = self.shutdown.subscribe();
        let queues = self.config.queues.as_deref();

        let mut listener = match self.manager.connector().listen(queues).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("cannot subscribe to wake-ups: {e}, falling back to polling");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => return,
                woke = listener.wait(self.config.polling_interval) => match woke {
                    Ok(true) => {
                        debug!("woken by new job");
                        wake.notify_waiters();
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("wake-up listener error: {e}, falling back to poll");
                        tokio::time::sleep(self.config.error_backoff).await;
                    }
                },
            }
        }
    }

    async fn run_slot(self, slot: usize, wake: Arc<Notify>) {
        let mut shutdown = self.shutdown.subscribe();
        let queues = self.config.queues.as_deref();
        let base = JobContext::for_worker(
            self.config.name.clone(),
            slot,
            self.config.queues.clone(),
            self.manager.clone(),
        )
        .evolve(|ctx| ctx.additional_context = self.config.additional_context.clone());

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Register interest before fetching so a wake-up sent between
            // an empty fetch and the wait below is not lost.
            let notified = wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.manager.fetch_job(queues).await {
                Ok(Some(job)) => self.process_job(&base, job).await,
                Ok(None) if !self.config.wait => {
                    debug!(slot, "no job available, slot done");
                    break;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(self.config.polling_interval) => {}
                        _ = stopped(&mut shutdown) => {}
                    }
                }
                Err(e) => {
                    error!(slot, "fetching job failed: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                        _ = stopped(&mut shutdown) => {}
                    }
                }
            }
        }
    }

    /// Run one claimed job and record how it ended.
    async fn process_job(&self, base: &JobContext, job: Job) {
        let slot = base.worker_id.unwrap_or_default();
        let span = start_job_span(&job.task_name, job.id, job.attempts, slot);

        async {
            let started = Utc::now();
            let mut ctx = base.with_job(job.clone(), started);
            let extra = Value::Object(ctx.log_extra("start_job", Value::Null));
            info!(%extra, "starting job {}", ctx.job_description(started));

            let outcome = match self.registry.get(&job.task_name) {
                None => {
                    let extra = Value::Object(ctx.log_extra("task_not_found", Value::Null));
                    error!(%extra, "{}", Error::TaskNotFound(job.task_name.clone()));
                    metrics::unknown_tasks()
                        .add(1, &[KeyValue::new("task", job.task_name.clone())]);
                    JobOutcome::Failure { retry_at: None }
                }
                Some(task) => {
                    let (result, retry_at) =
                        run_attempt(task.clone(), ctx.clone(), job.attempts, job.args.clone())
                            .await;

                    let ended = Utc::now();
                    ctx.job_result.end_timestamp = Some(ended);
                    metrics::job_duration_ms().record(
                        seconds(ended - started) * 1000.0,
                        &[
                            KeyValue::new("task", job.task_name.clone()),
                            KeyValue::new("outcome", outcome_label(&result)),
                        ],
                    );

                    match result {
                        Ok(value) => {
                            ctx.job_result.result = Some(value);
                            let timing = Value::Object(ctx.job_result.as_dict(ended));
                            let extra = Value::Object(ctx.log_extra("job_success", timing));
                            info!(%extra, "job {} succeeded", job.call_string());
                            JobOutcome::Success
                        }
                        Err(TaskError::Aborted) => {
                            let timing = Value::Object(ctx.job_result.as_dict(ended));
                            let extra = Value::Object(ctx.log_extra("job_aborted", timing));
                            info!(%extra, "job {} aborted", job.call_string());
                            JobOutcome::Aborted
                        }
                        Err(TaskError::Failed(e)) => {
                            let action = if retry_at.is_some() {
                                "job_error_retry"
                            } else {
                                "job_error"
                            };
                            let fields = json!({
                                "error": format!("{e:#}"),
                                "retry_at": retry_at.map(|at| at.to_rfc3339()),
                            });
                            let extra = Value::Object(ctx.log_extra(action, fields));
                            warn!(%extra, "job {} failed: {e:#}", job.call_string());
                            JobOutcome::Failure { retry_at }
                        }
                    }
                }
            };

            let to = match outcome {
                JobOutcome::Success => Status::Succeeded,
                JobOutcome::Aborted => Status::Aborted,
                JobOutcome::Failure { retry_at: Some(_) } => Status::Todo,
                JobOutcome::Failure { retry_at: None } => Status::Failed,
            };
            match self.manager.finish_job(&job, outcome).await {
                Ok(true) => record_state_transition(&tracing::Span::current(), "doing", to.as_str()),
                Ok(false) => warn!(job_id = %job.id, "job was no longer running when finished"),
                Err(e) => error!(job_id = %job.id, "recording job outcome failed: {e}"),
            }
        }
        .instrument(span)
        .await
    }
}

/// Run the task body and its retry decision in their own task. A panic in
/// either ends the attempt as a failure with no retry.
async fn run_attempt(
    task: Task,
    ctx: JobContext,
    attempts: u32,
    args: Args,
) -> (TaskResult, Option<DateTime<Utc>>) {
    let attempt = tokio::spawn(async move {
        let result = task.call(ctx, args).await;
        let retry_at = match result {
            Err(TaskError::Failed(ref e)) => {
                task.retry_policy().next_retry(attempts, e, Utc::now())
            }
            _ => None,
        };
        (result, retry_at)
    });

    match attempt.await {
        Ok(done) => done,
        Err(e) => (Err(TaskError::msg(format!("task panicked: {e}"))), None),
    }
}

/// Resolves once shutdown has been requested.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn outcome_label(result: &TaskResult) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(TaskError::Aborted) => "aborted",
        Err(TaskError::Failed(_)) => "failure",
    }
}
