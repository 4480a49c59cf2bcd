use chrono::Utc;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use cron_lite::config::WorkerConfig;
use cron_lite::coord::{keys, CoordinationClient, MemoryCluster};
use cron_lite::node::WorkerNode;
use cron_lite::scheduler::cron::CronExpr;
use cron_lite::scheduler::{Job, JobStatus};
use cron_lite::shutdown::install_shutdown_handler;
use cron_lite::store::{JobRecord, MemoryStore, RelationalStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "cron-lite")]
#[command(version)]
#[command(about = "A distributed cron worker with lease-based job locking")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a standalone worker against an in-process coordination store
    Worker(WorkerArgs),

    /// Print the upcoming trigger times of a cron expression
    Next {
        /// Cron expression, e.g. "*/5 * * * *"
        expr: String,

        /// Number of trigger times to print
        #[arg(long, short = 'n', default_value = "5")]
        count: usize,
    },
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// JSON file holding an array of jobs to seed the coordination store with
    #[arg(long)]
    jobs: Option<PathBuf>,

    /// SQLite database URL for status and logs (in-memory store when unset)
    /// Example: "sqlite://cron.db"
    #[arg(long)]
    database: Option<String>,

    /// Shell used to run job commands
    #[arg(long, default_value = "/bin/bash")]
    shell: PathBuf,

    /// Address to register under /cron/workers/ (auto-detected when unset)
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Lock lease TTL in seconds
    #[arg(long, default_value = "5")]
    lock_ttl_secs: u64,

    /// Upper bound of the random delay before each lock attempt, in milliseconds
    #[arg(long, default_value = "1000")]
    max_jitter_ms: u64,

    /// Flush execution logs once this many are buffered
    #[arg(long, default_value = "100")]
    log_batch_size: usize,

    /// Flush buffered execution logs after this many milliseconds
    #[arg(long, default_value = "1000")]
    log_commit_ms: u64,

    /// Schedule re-evaluation interval when no recurring job is planned, in seconds
    #[arg(long, default_value = "60")]
    idle_secs: u64,
}

impl WorkerArgs {
    fn to_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::default()
            .with_shell(&self.shell)
            .with_lock(
                Duration::from_secs(self.lock_ttl_secs),
                Duration::from_millis(self.max_jitter_ms),
            )
            .with_log_batching(self.log_batch_size, Duration::from_millis(self.log_commit_ms));
        if let Some(addr) = &self.advertise_addr {
            config = config.with_advertise_addr(addr);
        }
        config.idle_schedule_interval = Duration::from_secs(self.idle_secs);
        config
    }
}

// =============================================================================
// Worker Implementation
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.to_config();

    let store: Arc<dyn RelationalStore> = match &args.database {
        Some(url) => Arc::new(SqliteStore::connect(url).await?),
        None => Arc::new(MemoryStore::new()),
    };

    let cluster = MemoryCluster::new();
    let client = cluster.client();

    let jobs = match &args.jobs {
        Some(path) => load_jobs(path).await?,
        None => Vec::new(),
    };
    for job in &jobs {
        client.put(&keys::job_key(&job.name), job.encode()?, None).await?;
        store.upsert_job(&job_record(job)).await?;
    }

    tracing::info!(
        jobs = jobs.len(),
        database = ?args.database,
        shell = %config.shell.display(),
        "Starting cron-lite worker"
    );

    let shutdown = install_shutdown_handler()?;
    let node = WorkerNode::new(config, Arc::new(client), store);
    node.run(shutdown).await?;

    Ok(())
}

async fn load_jobs(path: &Path) -> Result<Vec<Job>, Box<dyn std::error::Error>> {
    let data = tokio::fs::read(path).await?;
    let jobs: Vec<Job> = serde_json::from_slice(&data)?;
    Ok(jobs)
}

fn job_record(job: &Job) -> JobRecord {
    JobRecord {
        name: job.name.clone(),
        command: job.command.clone(),
        cron_expr: job.cron_expr.clone(),
        kind: job.kind,
        status: JobStatus::PendingSchedule,
        next_time: None,
        executions: job.executions,
    }
}

// =============================================================================
// Next Implementation
// =============================================================================

fn print_next(expr: &str, count: usize) -> Result<(), Box<dyn std::error::Error>> {
    let parsed = CronExpr::parse(expr)?;
    let upcoming = parsed.upcoming(Utc::now(), count);
    if upcoming.is_empty() {
        println!("No upcoming trigger for \"{}\"", parsed.as_str());
        return Ok(());
    }
    for time in upcoming {
        println!("{}", time.to_rfc3339());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Worker(worker_args) => run_worker(worker_args).await,
        Commands::Next { expr, count } => print_next(&expr, count),
    }
}
