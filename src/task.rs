//! Task descriptors and the registry workers dispatch through.
//!
//! A task binds a name and a default queue to a callable. Registration is
//! explicit: build a [`TaskRegistry`] at process start and hand it to the
//! worker. Tasks receive their [`JobContext`] and the job's arguments.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

use crate::context::JobContext;
use crate::error::Result;
use crate::manager::JobManager;
use crate::model::{Args, JobId, NewJob};
use crate::retry::{NoRetry, RetryPolicy};

/// How a task run can fail.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task noticed an abort request and stopped early.
    #[error("job aborted")]
    Aborted,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl TaskError {
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self::Failed(anyhow::Error::msg(message.to_string()))
    }
}

pub type TaskResult = std::result::Result<Value, TaskError>;
pub type TaskFuture = Pin<Box<dyn Future<Output = TaskResult> + Send>>;
type Handler = Arc<dyn Fn(JobContext, Args) -> TaskFuture + Send + Sync>;

/// Deserialize a job's arguments into a typed struct.
pub fn parse_args<T: DeserializeOwned>(args: Args) -> std::result::Result<T, TaskError> {
    serde_json::from_value(Value::Object(args))
        .map_err(|e| TaskError::Failed(anyhow::Error::new(e).context("invalid task arguments")))
}

/// A registered task.
#[derive(Clone)]
pub struct Task {
    name: String,
    queue: String,
    retry: Arc<dyn RetryPolicy>,
    handler: Handler,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Task {
    /// An async task.
    pub fn new<F, Fut>(name: impl Into<String>, queue: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            queue: queue.into(),
            retry: Arc::new(NoRetry),
            handler: Arc::new(move |ctx: JobContext, args: Args| -> TaskFuture {
                Box::pin(f(ctx, args))
            }),
        }
    }

    /// A synchronous task. Runs on the blocking pool and holds its worker
    /// slot until it returns; use [`JobContext::should_abort_blocking`]
    /// inside it.
    pub fn blocking<F>(name: impl Into<String>, queue: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext, Args) -> TaskResult + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, queue, move |ctx, args| {
            let f = Arc::clone(&f);
            async move {
                match tokio::task::spawn_blocking(move || f(ctx, args)).await {
                    Ok(result) => result,
                    Err(e) => Err(TaskError::msg(format!("blocking task did not complete: {e}"))),
                }
            }
        })
    }

    pub fn retry(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Arc::new(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn retry_policy(&self) -> &dyn RetryPolicy {
        self.retry.as_ref()
    }

    /// A job builder pre-filled with this task's name and queue.
    pub fn configure(&self) -> NewJob {
        NewJob::new(&self.name, &self.queue)
    }

    /// Defer a call with `args` on the task's default queue.
    pub async fn defer(&self, manager: &JobManager, args: Args) -> Result<JobId> {
        manager.defer_job(self.configure().args(args)).await
    }

    pub(crate) fn call(&self, ctx: JobContext, args: Args) -> TaskFuture {
        (self.handler)(ctx, args)
    }
}

/// Tasks indexed by name.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Task>,
}

impl TaskRegistry {
    /// Create an empty registry with no tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task, replacing any task with the same name.
    pub fn register(&mut self, task: Task) -> &mut Self {
        self.tasks.insert(task.name.clone(), task);
        self
    }

    /// Look up a task by name.
    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
