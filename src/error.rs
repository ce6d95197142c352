//! Error types for deferq.

use thiserror::Error;

use crate::model::JobId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("a job with queueing lock {queueing_lock:?} is already enqueued")]
    AlreadyEnqueued { queueing_lock: String },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("execution context has no attached job")]
    NoJob,

    #[error("invalid job status: {0}")]
    InvalidStatus(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
