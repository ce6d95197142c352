//! Integration tests for the job manager over the in-memory connector.

use chrono::{TimeDelta, Utc};
use deferq::{
    Error, JobFilters, JobId, JobManager, JobOutcome, MemoryConnector, NewJob, Status,
};
use std::collections::HashSet;
use std::sync::Arc;

fn test_manager() -> JobManager {
    JobManager::new(Arc::new(MemoryConnector::new()))
}

fn sum_job(a: i64, b: i64) -> NewJob {
    NewJob::new("sum", "sums").arg("a", a).arg("b", b)
}

// ---------------------------------------------------------------------------
// Defer / fetch / status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn defer_then_fetch_claims_the_job() {
    let manager = test_manager();

    let id = manager.defer_job(sum_job(1, 2)).await.unwrap();
    assert_eq!(manager.get_job_status(id).await.unwrap(), Status::Todo);

    let job = manager.fetch_job(None).await.unwrap().expect("should claim");
    assert_eq!(job.id, id);
    assert_eq!(job.status, Status::Doing);
    assert_eq!(job.attempts, 1);
    assert!(job.started_at.is_some());
    assert_eq!(manager.get_job_status(id).await.unwrap(), Status::Doing);

    assert!(manager.fetch_job(None).await.unwrap().is_none());
}

#[tokio::test]
async fn fetch_only_watches_requested_queues() {
    let manager = test_manager();
    manager.defer_job(sum_job(1, 2)).await.unwrap();

    let other = vec!["other".to_string()];
    assert!(manager.fetch_job(Some(&other)).await.unwrap().is_none());

    let sums = vec!["sums".to_string()];
    assert!(manager.fetch_job(Some(&sums)).await.unwrap().is_some());
}

#[tokio::test]
async fn higher_priority_is_claimed_first() {
    let manager = test_manager();
    let low = manager.defer_job(sum_job(1, 1)).await.unwrap();
    let high = manager
        .defer_job(sum_job(2, 2).priority(10))
        .await
        .unwrap();

    assert_eq!(manager.fetch_job(None).await.unwrap().unwrap().id, high);
    assert_eq!(manager.fetch_job(None).await.unwrap().unwrap().id, low);
}

#[tokio::test]
async fn future_job_is_not_claimable() {
    let manager = test_manager();
    let id = manager
        .defer_job(sum_job(1, 2).schedule_in(TimeDelta::hours(1)).unwrap())
        .await
        .unwrap();

    assert!(manager.fetch_job(None).await.unwrap().is_none());
    assert_eq!(manager.get_job_status(id).await.unwrap(), Status::Todo);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let manager = test_manager();

    assert!(matches!(
        manager.get_job_status(JobId(42)).await,
        Err(Error::JobNotFound(JobId(42)))
    ));
    assert!(matches!(
        manager.get_job(JobId(42)).await,
        Err(Error::JobNotFound(_))
    ));
}

#[tokio::test]
async fn list_jobs_applies_filters() {
    let manager = test_manager();
    let a = manager.defer_job(sum_job(1, 2)).await.unwrap();
    manager
        .defer_job(NewJob::new("count", "count").lock("k"))
        .await
        .unwrap();

    let all = manager.list_jobs(&JobFilters::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let sums = manager
        .list_jobs(&JobFilters {
            task_name: Some("sum".to_string()),
            ..JobFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(sums.len(), 1);
    assert_eq!(sums[0].id, a);
    assert_eq!(sums[0].args["a"], 1);

    let locked = manager
        .list_jobs(&JobFilters {
            lock: Some("k".to_string()),
            ..JobFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(locked.len(), 1);
    assert_eq!(locked[0].task_name, "count");
}

// ---------------------------------------------------------------------------
// Cancel / abort
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_todo_job() {
    let manager = test_manager();
    let id = manager.defer_job(sum_job(1, 2)).await.unwrap();

    assert!(manager.cancel_job_by_id(id, false).await.unwrap());
    assert_eq!(manager.get_job_status(id).await.unwrap(), Status::Cancelled);

    let job = manager.get_job(id).await.unwrap();
    assert!(job.finished_at.is_some());

    // A cancelled job is never claimed.
    assert!(manager.fetch_job(None).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_doing_job_without_abort_is_refused() {
    let manager = test_manager();
    let id = manager.defer_job(sum_job(1, 2)).await.unwrap();
    manager.fetch_job(None).await.unwrap().unwrap();

    assert!(!manager.cancel_job_by_id(id, false).await.unwrap());
    assert_eq!(manager.get_job_status(id).await.unwrap(), Status::Doing);
}

#[tokio::test]
async fn cancel_unknown_id_leaves_others_alone() {
    let manager = test_manager();
    let id = manager.defer_job(sum_job(1, 2)).await.unwrap();

    assert!(!manager.cancel_job_by_id(JobId(id.0 + 1), false).await.unwrap());
    assert_eq!(manager.get_job_status(id).await.unwrap(), Status::Todo);
}

#[tokio::test]
async fn abort_doing_job_reports_aborting() {
    let manager = test_manager();
    let id = manager.defer_job(sum_job(1, 2)).await.unwrap();
    let job = manager.fetch_job(None).await.unwrap().unwrap();

    assert!(manager.cancel_job_by_id(id, true).await.unwrap());
    assert_eq!(manager.get_job_status(id).await.unwrap(), Status::Aborting);

    // The stored status is still DOING until the worker finishes it.
    let stored = manager.get_job(id).await.unwrap();
    assert_eq!(stored.status, Status::Doing);
    assert!(stored.abort_requested);

    assert!(manager.finish_job(&job, JobOutcome::Aborted).await.unwrap());
    assert_eq!(manager.get_job_status(id).await.unwrap(), Status::Aborted);
}

#[tokio::test]
async fn cancel_terminal_job_is_refused() {
    let manager = test_manager();
    let id = manager.defer_job(sum_job(1, 2)).await.unwrap();
    let job = manager.fetch_job(None).await.unwrap().unwrap();
    manager.finish_job(&job, JobOutcome::Success).await.unwrap();

    assert!(!manager.cancel_job_by_id(id, false).await.unwrap());
    assert!(!manager.cancel_job_by_id(id, true).await.unwrap());
    assert_eq!(manager.get_job_status(id).await.unwrap(), Status::Succeeded);
}

// ---------------------------------------------------------------------------
// Finish / retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn finish_is_conditional_on_doing() {
    let manager = test_manager();
    manager.defer_job(sum_job(1, 2)).await.unwrap();
    let job = manager.fetch_job(None).await.unwrap().unwrap();

    assert!(manager.finish_job(&job, JobOutcome::Success).await.unwrap());
    // Second finish loses the compare-and-swap.
    assert!(!manager
        .finish_job(&job, JobOutcome::Failure { retry_at: None })
        .await
        .unwrap());
    assert_eq!(
        manager.get_job_status(job.id).await.unwrap(),
        Status::Succeeded
    );
}

#[tokio::test]
async fn failure_with_retry_requeues() {
    let manager = test_manager();
    manager.defer_job(sum_job(1, 2)).await.unwrap();
    let job = manager.fetch_job(None).await.unwrap().unwrap();

    let retry_at = Utc::now();
    assert!(manager
        .finish_job(
            &job,
            JobOutcome::Failure {
                retry_at: Some(retry_at)
            }
        )
        .await
        .unwrap());
    assert_eq!(manager.get_job_status(job.id).await.unwrap(), Status::Todo);

    let again = manager.fetch_job(None).await.unwrap().unwrap();
    assert_eq!(again.id, job.id);
    assert_eq!(again.attempts, 2);
}

#[tokio::test]
async fn failed_job_can_be_retried_manually() {
    let manager = test_manager();
    let id = manager.defer_job(sum_job(1, 2)).await.unwrap();
    let job = manager.fetch_job(None).await.unwrap().unwrap();

    // Only FAILED jobs are retryable.
    assert!(!manager.retry_job_by_id(id, None).await.unwrap());

    manager
        .finish_job(&job, JobOutcome::Failure { retry_at: None })
        .await
        .unwrap();
    assert_eq!(manager.get_job_status(id).await.unwrap(), Status::Failed);

    assert!(manager.retry_job_by_id(id, None).await.unwrap());
    assert_eq!(manager.get_job_status(id).await.unwrap(), Status::Todo);
    assert!(manager.get_job(id).await.unwrap().finished_at.is_none());
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queueing_lock_rejects_duplicate_while_pending() {
    let manager = test_manager();
    let first = manager
        .defer_job(sum_job(1, 2).queueing_lock("daily"))
        .await
        .unwrap();

    let second = manager.defer_job(sum_job(3, 4).queueing_lock("daily")).await;
    assert!(matches!(
        second,
        Err(Error::AlreadyEnqueued { ref queueing_lock }) if queueing_lock == "daily"
    ));

    // Still held while DOING.
    let job = manager.fetch_job(None).await.unwrap().unwrap();
    assert_eq!(job.id, first);
    assert!(manager
        .defer_job(sum_job(3, 4).queueing_lock("daily"))
        .await
        .is_err());

    // Released once the holder is terminal.
    manager.finish_job(&job, JobOutcome::Success).await.unwrap();
    assert!(manager
        .defer_job(sum_job(3, 4).queueing_lock("daily"))
        .await
        .is_ok());
}

#[tokio::test]
async fn manual_retry_respects_queueing_lock() {
    let manager = test_manager();
    let first = manager
        .defer_job(sum_job(1, 2).queueing_lock("k"))
        .await
        .unwrap();
    let job = manager.fetch_job(None).await.unwrap().unwrap();
    manager
        .finish_job(&job, JobOutcome::Failure { retry_at: None })
        .await
        .unwrap();

    // The failed job released the key; a new job takes it.
    let second = manager
        .defer_job(sum_job(3, 4).queueing_lock("k"))
        .await
        .unwrap();

    let retried = manager.retry_job_by_id(first, None).await;
    assert!(matches!(
        retried,
        Err(Error::AlreadyEnqueued { ref queueing_lock }) if queueing_lock == "k"
    ));
    assert_eq!(manager.get_job_status(first).await.unwrap(), Status::Failed);

    let holders = manager
        .list_jobs(&JobFilters {
            queueing_lock: Some("k".to_string()),
            status: Some(Status::Todo),
            ..JobFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].id, second);

    // Once the new holder is done the old job can be retried.
    assert!(manager.cancel_job_by_id(second, false).await.unwrap());
    assert!(manager.retry_job_by_id(first, None).await.unwrap());
}

#[tokio::test]
async fn lock_serializes_claims() {
    let manager = test_manager();
    let first = manager.defer_job(sum_job(1, 2).lock("acct-7")).await.unwrap();
    let second = manager.defer_job(sum_job(3, 4).lock("acct-7")).await.unwrap();
    let free = manager.defer_job(sum_job(5, 6)).await.unwrap();

    let job = manager.fetch_job(None).await.unwrap().unwrap();
    assert_eq!(job.id, first);

    // The second locked job waits; the unlocked one does not.
    assert_eq!(manager.fetch_job(None).await.unwrap().unwrap().id, free);
    assert!(manager.fetch_job(None).await.unwrap().is_none());

    manager.finish_job(&job, JobOutcome::Success).await.unwrap();
    assert_eq!(manager.fetch_job(None).await.unwrap().unwrap().id, second);
}

#[tokio::test]
async fn list_queues_counts_by_status() {
    let manager = test_manager();
    let a = manager.defer_job(sum_job(1, 2)).await.unwrap();
    manager.defer_job(sum_job(3, 4)).await.unwrap();
    manager.defer_job(NewJob::new("count", "count")).await.unwrap();
    manager.cancel_job_by_id(a, false).await.unwrap();

    let queues = manager.list_queues().await.unwrap();
    let sums = queues.iter().find(|q| q.queue == "sums").unwrap();
    assert_eq!(sums.todo, 1);
    assert_eq!(sums.cancelled, 1);
    let count = queues.iter().find(|q| q.queue == "count").unwrap();
    assert_eq!(count.todo, 1);
}

// ---------------------------------------------------------------------------
// Concurrent claims
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_fetchers_never_claim_twice() {
    const JOBS: i64 = 200;
    const FETCHERS: usize = 8;

    let manager = test_manager();
    for i in 0..JOBS {
        manager.defer_job(sum_job(i, i)).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..FETCHERS {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = manager.fetch_job(None).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    let unique: HashSet<JobId> = all.iter().copied().collect();
    assert_eq!(all.len(), JOBS as usize);
    assert_eq!(unique.len(), JOBS as usize);
}
