//! # deferq
//!
//! Persistent task queue with cooperative cancellation.
//!
//! Producers defer jobs through a [`JobManager`]; workers claim them from
//! a [`Connector`] (Postgres or in-memory), run the registered [`Task`],
//! and record the outcome with retry and abort support. Tracing and
//! OpenTelemetry cover the whole lifecycle.

pub mod config;
pub mod connector;
pub mod context;
pub mod demo;
pub mod error;
pub mod manager;
pub mod model;
pub mod retry;
pub mod task;
pub mod telemetry;
pub mod worker;

pub use connector::{ClaimOrder, Connector, MemoryConnector, PgConnector};
pub use context::JobContext;
pub use error::{Error, Result};
pub use manager::blocking::BlockingJobManager;
pub use manager::{JobManager, JobOutcome};
pub use model::{Args, Job, JobFilters, JobId, JobResult, NewJob, QueueStats, Status};
pub use retry::{Backoff, NoRetry, RetryPolicy, RetryStrategy};
pub use task::{Task, TaskError, TaskRegistry, TaskResult, parse_args};
pub use worker::{Worker, WorkerConfig, run_worker};
