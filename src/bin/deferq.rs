//! deferq CLI: operator interface to the job queue.

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use deferq::config::{Config, ExposeSecret};
use deferq::telemetry::{TelemetryConfig, init_telemetry};
use deferq::{
    Args, JobFilters, JobId, JobManager, NewJob, PgConnector, Status, Worker, WorkerConfig, demo,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "deferq", about = "Persistent task queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Run a worker serving the demo tasks
    Worker {
        /// Worker config file with a [worker] table
        #[arg(long)]
        config: Option<PathBuf>,
        /// Queues to watch (all queues when omitted)
        #[arg(long = "queue", short = 'q')]
        queues: Vec<String>,
        /// Maximum concurrent jobs
        #[arg(long)]
        concurrency: Option<usize>,
        /// Exit once no job is claimable
        #[arg(long)]
        one_shot: bool,
    },
    /// Defer a job
    Defer {
        /// Task name
        task: String,
        /// JSON object of arguments
        #[arg(long)]
        args: Option<String>,
        /// Queue (defaults to the task's queue for demo tasks)
        #[arg(long)]
        queue: Option<String>,
        /// Priority (higher = claimed first)
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Serialize with other jobs holding this lock
        #[arg(long)]
        lock: Option<String>,
        /// Refuse if a waiting or running job holds this key
        #[arg(long)]
        queueing_lock: Option<String>,
        /// Delay in seconds before the job is claimable
        #[arg(long)]
        delay: Option<i64>,
    },
    /// Cancel a waiting job, or abort a running one
    Cancel {
        id: i64,
        /// Request cooperative abort if the job is already running
        #[arg(long)]
        abort: bool,
    },
    /// Show a job
    Status { id: i64 },
    /// List jobs
    List {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        task: Option<String>,
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        lock: Option<String>,
    },
    /// Per-queue job counts
    Queues,
    /// Requeue a failed job
    Retry { id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "deferq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let connector = PgConnector::connect(config.database_url.expose_secret()).await?;

    if let Command::Migrate = cli.command {
        connector.migrate().await?;
        println!("Migrations applied.");
        return Ok(());
    }

    let manager = JobManager::new(Arc::new(connector));

    match cli.command {
        Command::Migrate => Ok(()),
        Command::Worker {
            config,
            queues,
            concurrency,
            one_shot,
        } => cmd_worker(manager, config, queues, concurrency, one_shot).await,
        Command::Defer {
            task,
            args,
            queue,
            priority,
            lock,
            queueing_lock,
            delay,
        } => {
            cmd_defer(
                &manager,
                task,
                args,
                queue,
                priority,
                lock,
                queueing_lock,
                delay,
            )
            .await
        }
        Command::Cancel { id, abort } => {
            if manager.cancel_job_by_id(JobId(id), abort).await? {
                println!("Job {id}: {}", manager.get_job_status(JobId(id)).await?);
            } else {
                println!("Job {id} could not be cancelled.");
            }
            Ok(())
        }
        Command::Status { id } => cmd_status(&manager, JobId(id)).await,
        Command::List {
            queue,
            task,
            status,
            lock,
        } => cmd_list(&manager, queue, task, status, lock).await,
        Command::Queues => cmd_queues(&manager).await,
        Command::Retry { id } => {
            if manager.retry_job_by_id(JobId(id), None).await? {
                println!("Job {id} requeued.");
            } else {
                println!("Job {id} is not failed; nothing to retry.");
            }
            Ok(())
        }
    }
}

async fn cmd_worker(
    manager: JobManager,
    path: Option<PathBuf>,
    queues: Vec<String>,
    concurrency: Option<usize>,
    one_shot: bool,
) -> anyhow::Result<()> {
    let mut config = match path {
        Some(path) => WorkerConfig::load(&path)?,
        None => WorkerConfig::default(),
    };
    if !queues.is_empty() {
        config.queues = Some(queues);
    }
    if let Some(concurrency) = concurrency {
        config.concurrency = concurrency.max(1);
    }
    if one_shot {
        config.wait = false;
    }

    let worker = Worker::new(manager, Arc::new(demo::registry()), config);

    let w = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        w.shutdown();
    });

    worker.run().await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_defer(
    manager: &JobManager,
    task: String,
    args: Option<String>,
    queue: Option<String>,
    priority: i32,
    lock: Option<String>,
    queueing_lock: Option<String>,
    delay: Option<i64>,
) -> anyhow::Result<()> {
    let args: Args = match args {
        Some(json) => serde_json::from_str(&json).context("--args must be a JSON object")?,
        None => Args::new(),
    };

    let queue = queue
        .or_else(|| {
            demo::registry()
                .get(&task)
                .map(|known| known.queue().to_string())
        })
        .unwrap_or_else(|| "default".to_string());

    let mut job = NewJob::new(&task, queue).args(args).priority(priority);
    if let Some(lock) = lock {
        job = job.lock(lock);
    }
    if let Some(key) = queueing_lock {
        job = job.queueing_lock(key);
    }
    if let Some(secs) = delay {
        let delay = chrono::TimeDelta::try_seconds(secs)
            .with_context(|| format!("delay of {secs} seconds is out of range"))?;
        job = job.schedule_in(delay)?;
    }

    let id = manager.defer_job(job).await?;
    println!("Deferred: {id}");
    Ok(())
}

async fn cmd_status(manager: &JobManager, id: JobId) -> anyhow::Result<()> {
    let job = manager.get_job(id).await?;

    println!("ID:         {}", job.id);
    println!("Task:       {}", job.task_name);
    println!("Queue:      {}", job.queue);
    println!("Status:     {}", job.reported_status());
    println!("Priority:   {}", job.priority);
    println!("Lock:       {}", job.lock.as_deref().unwrap_or("-"));
    println!(
        "Queue Lock: {}",
        job.queueing_lock.as_deref().unwrap_or("-")
    );
    println!(
        "Args:       {}",
        serde_json::to_string_pretty(&job.args)?
    );
    println!("Attempts:   {}", job.attempts);
    println!("Scheduled:  {}", job.scheduled_at);
    println!("Created:    {}", job.created_at);
    if let Some(started) = job.started_at {
        println!("Started:    {started}");
    }
    if let Some(finished) = job.finished_at {
        println!("Finished:   {finished}");
    }
    if let (Some(started), None) = (job.started_at, job.finished_at) {
        let running = (Utc::now() - started).to_std().unwrap_or(Duration::ZERO);
        println!("Running:    {:.1}s", running.as_secs_f64());
    }
    Ok(())
}

async fn cmd_list(
    manager: &JobManager,
    queue: Option<String>,
    task_name: Option<String>,
    status: Option<String>,
    lock: Option<String>,
) -> anyhow::Result<()> {
    let status: Option<Status> = status.map(|s| s.parse()).transpose()?;
    let filters = JobFilters {
        queue,
        task_name,
        status,
        lock,
        ..JobFilters::default()
    };

    let jobs = manager.list_jobs(&filters).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<16}  {:<12}  {:<10}  {:<4}  {:<4}  SCHEDULED",
        "ID", "TASK", "QUEUE", "STATUS", "PRI", "TRY"
    );
    println!("{}", "-".repeat(84));

    for job in &jobs {
        println!(
            "{:<8}  {:<16}  {:<12}  {:<10}  {:<4}  {:<4}  {}",
            job.id,
            job.task_name,
            job.queue,
            job.reported_status(),
            job.priority,
            job.attempts,
            job.scheduled_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_queues(manager: &JobManager) -> anyhow::Result<()> {
    let queues = manager.list_queues().await?;
    if queues.is_empty() {
        println!("No queues found.");
        return Ok(());
    }

    println!(
        "{:<16}  {:>6}  {:>6}  {:>8}  {:>9}  {:>6}  {:>9}  {:>7}",
        "QUEUE", "TODO", "DOING", "ABORTING", "SUCCEEDED", "FAILED", "CANCELLED", "ABORTED"
    );
    for q in &queues {
        println!(
            "{:<16}  {:>6}  {:>6}  {:>8}  {:>9}  {:>6}  {:>9}  {:>7}",
            q.queue, q.todo, q.doing, q.aborting, q.succeeded, q.failed, q.cancelled, q.aborted
        );
    }
    Ok(())
}
