//! jobq CLI — run workers, submit jobs, and recover dead letters.

use clap::{Parser, Subcommand};
use jobq::broker::Broker;
use jobq::config::Config;
use jobq::config::secrets::ExposeSecret;
use jobq::db::Db;
use jobq::engine::{RetryPromoter, Worker};
use jobq::handler::HandlerRegistry;
use jobq::model::{Job, JobId, NewJob, Status};
use jobq::service::JobService;
use jobq::store::JobStore;
use jobq::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

#[derive(Parser)]
#[command(name = "jobq", about = "Job queue with retries and a dead-letter queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run workers and the retry promoter
    Serve {
        /// Number of worker loops in this process
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Dead-letter queue operations
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a new job
    Submit {
        /// Job type (selects the handler); defaults to DEFAULT
        #[arg(long = "type")]
        job_type: Option<String>,
        /// Opaque payload passed to the handler
        #[arg(long)]
        payload: Option<String>,
    },
    /// Show a job
    Show { id: String },
    /// List jobs, newest first
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Reset a job to PENDING and re-enqueue it (attempts kept)
    Requeue { id: String },
}

#[derive(Subcommand)]
enum DlqAction {
    /// List dead-lettered jobs
    List,
    /// Requeue a dead-lettered job with attempts reset to 0
    Requeue { id: String },
}

/// Process-wide connections, opened at startup and closed on exit.
struct Backend {
    db: Arc<Db>,
    broker: Arc<dyn Broker>,
}

impl Backend {
    async fn connect(config: &Config) -> anyhow::Result<Self> {
        let db = Db::connect(config.database_url.expose_secret()).await?;
        db.prepare().await?;
        let db = Arc::new(db);
        let broker = select_broker(config, &db).await?;
        Ok(Self { db, broker })
    }

    fn store(&self) -> Arc<dyn JobStore> {
        self.db.clone()
    }

    fn service(&self) -> JobService {
        JobService::new(self.store(), Arc::clone(&self.broker))
    }

    async fn close(self) {
        self.db.close().await;
    }
}

#[cfg(feature = "redis")]
async fn select_broker(config: &Config, db: &Arc<Db>) -> anyhow::Result<Arc<dyn Broker>> {
    match config.redis_url {
        Some(ref url) => {
            let broker: Arc<dyn Broker> =
                Arc::new(jobq::broker::redis::RedisBroker::connect(url.expose_secret()).await?);
            info!("using redis broker");
            Ok(broker)
        }
        None => {
            let broker: Arc<dyn Broker> = db.clone();
            Ok(broker)
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn select_broker(config: &Config, db: &Arc<Db>) -> anyhow::Result<Arc<dyn Broker>> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL set but built without the redis feature; using postgres broker");
    }
    let broker: Arc<dyn Broker> = db.clone();
    Ok(broker)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _guard = telemetry(&config, matches!(cli.command, Command::Serve { .. }))?;

    let backend = Backend::connect(&config).await?;
    let result = match cli.command {
        Command::Serve { workers } => cmd_serve(&backend, &config, workers).await,
        Command::Job { action } => cmd_job(&backend.service(), action).await,
        Command::Dlq { action } => cmd_dlq(&backend.service(), action).await,
    };
    backend.close().await;
    result
}

/// Only the daemon exports OTLP; one-shot commands just log to stderr.
fn telemetry(config: &Config, serving: bool) -> anyhow::Result<TelemetryGuard> {
    let guard = init_telemetry(TelemetryConfig {
        endpoint: if serving {
            config.otel_endpoint.clone()
        } else {
            None
        },
        service_name: "jobq".to_string(),
        log_level: if serving {
            config.log_level.clone()
        } else {
            "warn".to_string()
        },
    })?;
    Ok(guard)
}

async fn cmd_serve(backend: &Backend, config: &Config, workers: usize) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let registry = Arc::new(HandlerRegistry::with_defaults(config.simulated_work));
    let tracker = TaskTracker::new();

    for n in 0..workers.max(1) {
        let worker = Worker::new(
            format!("worker-{n}"),
            backend.store(),
            Arc::clone(&backend.broker),
            Arc::clone(&registry),
            config.worker.clone(),
            shutdown.clone(),
        );
        tracker.spawn(async move { worker.run().await });
    }

    let promoter = RetryPromoter::new(
        Arc::clone(&backend.broker),
        config.promoter.clone(),
        shutdown.clone(),
    );
    tracker.spawn(async move { promoter.run().await });
    tracker.close();

    info!(workers = workers.max(1), "jobq serving");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.cancel();
    tracker.wait().await;
    Ok(())
}

async fn cmd_job(service: &JobService, action: JobAction) -> anyhow::Result<()> {
    match action {
        JobAction::Submit { job_type, payload } => {
            let mut new = NewJob::new();
            if let Some(t) = job_type {
                new = new.job_type(t);
            }
            if let Some(p) = payload {
                new = new.payload(p);
            }
            let result = service.submit(new).await?;
            println!("{}", serde_json::to_string(&result)?);
        }
        JobAction::Show { id } => {
            let job = service.get(&JobId(id)).await?;
            print_job(&job);
        }
        JobAction::List { status, limit } => {
            let status: Option<Status> = status.map(|s| s.parse()).transpose()?;
            let jobs = service.list(status, limit).await?;
            print_table(&jobs);
        }
        JobAction::Requeue { id } => {
            let job = service.requeue(&JobId(id)).await?;
            println!("Requeued: {} (attempts: {})", job.id, job.attempts);
        }
    }
    Ok(())
}

async fn cmd_dlq(service: &JobService, action: DlqAction) -> anyhow::Result<()> {
    match action {
        DlqAction::List => {
            let jobs = service.list_dead_letter().await?;
            print_table(&jobs);
        }
        DlqAction::Requeue { id } => {
            let job = service.requeue_dead_letter(&JobId(id)).await?;
            println!("Requeued from DLQ: {}", job.id);
        }
    }
    Ok(())
}

fn print_table(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }

    println!(
        "{:<36}  {:<12}  {:<11}  {:<8}  CREATED",
        "ID", "TYPE", "STATUS", "ATTEMPTS"
    );
    println!("{}", "-".repeat(90));
    for job in jobs {
        println!(
            "{:<36}  {:<12}  {:<11}  {:<8}  {}",
            job.id,
            job.job_type,
            job.status,
            job.attempts,
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} job(s)", jobs.len());
}

fn print_job(job: &Job) {
    println!("ID:        {}", job.id);
    println!("Type:      {}", job.job_type);
    println!("Status:    {}", job.status);
    println!("Attempts:  {}", job.attempts);
    println!("Payload:   {}", job.payload);
    println!("Created:   {}", job.created_at);
    println!("Updated:   {}", job.updated_at);
}
