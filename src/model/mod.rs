//! Core data model.
//!
//! A job is a deferred call to a named task on a named queue. Its status
//! moves `todo -> doing -> {succeeded, failed, aborted}` or
//! `todo -> cancelled`; failed attempts may be requeued.

pub mod job;
pub mod result;

pub use job::{Args, Job, JobFilters, JobId, NewJob, QueueStats, Status};
pub use result::JobResult;
