//! Demo tasks served by `deferq worker`.
//!
//! `sum` adds two numbers, `defer` enqueues a `sum` from inside a job, and
//! `count` runs for a while and stops early when aborted.

use anyhow::Context as _;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::info;

use crate::task::{Task, TaskError, TaskRegistry, parse_args};

/// Iterations `count` runs before succeeding.
pub const COUNT_ITERATIONS: u64 = 20;

#[derive(Debug, Deserialize)]
struct SumArgs {
    a: i64,
    b: i64,
}

pub fn sum() -> Task {
    Task::new("sum", "sums", |_ctx, args| async move {
        let SumArgs { a, b } = parse_args(args)?;
        Ok(json!(a + b))
    })
}

pub fn defer() -> Task {
    Task::new("defer", "defer", |ctx, _args| async move {
        let manager = ctx
            .manager
            .as_ref()
            .context("no job manager in context")?;
        let job = sum().configure().arg("a", 1).arg("b", 2);
        let id = manager.defer_job(job).await.context("deferring sum")?;
        info!(job_id = %id, "deferred sum from inside a job");
        Ok(json!(id.0))
    })
}

pub fn count() -> Task {
    Task::new("count", "count", |mut ctx, _args| async move {
        for i in 0..COUNT_ITERATIONS {
            if ctx
                .should_abort(Some(Duration::from_secs(1)))
                .await
                .context("abort check")?
            {
                return Err(TaskError::Aborted);
            }
            info!(iteration = i, "counting");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(Value::from(COUNT_ITERATIONS))
    })
}

/// Registry with every demo task.
pub fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(sum()).register(defer()).register(count());
    registry
}
