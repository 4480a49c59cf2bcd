use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::CronError;
use crate::job_mgr::JobMgr;
use crate::scheduler::job::{JobExecuteInfo, JobExecuteResult};
use crate::worker::lock::random_jitter;

/// Output of one command run.
#[derive(Debug)]
pub struct CommandOutput {
    /// Combined stdout and stderr, in arrival order.
    pub output: Vec<u8>,
    pub exit_code: Option<i32>,
    pub error: Option<CronError>,
}

/// Runs shell commands in their own process group.
///
/// Cancelling the token passed to [`CommandRunner::run`] sends SIGTERM to the
/// whole group, then SIGKILL once `kill_grace` has passed.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    shell: PathBuf,
    kill_grace: Duration,
}

impl CommandRunner {
    pub fn new(shell: impl Into<PathBuf>, kill_grace: Duration) -> Self {
        Self {
            shell: shell.into(),
            kill_grace,
        }
    }

    pub async fn run(&self, command: &str, cancel: &CancellationToken) -> CommandOutput {
        let spawned = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(command, shell = %self.shell.display(), error = %e, "Failed to spawn command");
                return CommandOutput {
                    output: Vec::new(),
                    exit_code: None,
                    error: Some(e.into()),
                };
            }
        };

        let collector = tokio::spawn(collect_output(child.stdout.take(), child.stderr.take()));

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let (status, cancelled) = match waited {
            Some(status) => (status, false),
            None => (self.terminate(&mut child).await, true),
        };

        let output = collector.await.unwrap_or_default();
        Self::process_output(output, status, cancelled)
    }

    /// SIGTERM the process group, escalating to SIGKILL after the grace period.
    async fn terminate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        let Some(pid) = child.id() else {
            return child.wait().await;
        };
        let group = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            tracing::debug!(pid, error = %e, "SIGTERM to process group failed");
        }
        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(pid, "Command ignored SIGTERM, killing process group");
                if let Err(e) = killpg(group, Signal::SIGKILL) {
                    tracing::debug!(pid, error = %e, "SIGKILL to process group failed");
                    child.start_kill()?;
                }
                child.wait().await
            }
        }
    }

    fn process_output(
        output: Vec<u8>,
        status: std::io::Result<ExitStatus>,
        cancelled: bool,
    ) -> CommandOutput {
        match status {
            Ok(status) => {
                let exit_code = status.code();
                let error = if cancelled {
                    Some(CronError::Cancelled)
                } else if status.success() {
                    None
                } else {
                    Some(CronError::CommandFailed(exit_code))
                };
                CommandOutput {
                    output,
                    exit_code,
                    error,
                }
            }
            Err(e) => CommandOutput {
                output,
                exit_code: None,
                error: Some(if cancelled { CronError::Cancelled } else { e.into() }),
            },
        }
    }
}

/// Read stdout and stderr concurrently into one buffer until both close.
async fn collect_output(
    stdout: Option<impl AsyncRead + Send + Unpin + 'static>,
    stderr: Option<impl AsyncRead + Send + Unpin + 'static>,
) -> Vec<u8> {
    let mut streams = Vec::new();
    if let Some(stdout) = stdout {
        streams.push(ReaderStream::new(stdout).boxed());
    }
    if let Some(stderr) = stderr {
        streams.push(ReaderStream::new(stderr).boxed());
    }

    let mut merged = futures::stream::select_all(streams);
    let mut output = Vec::new();
    while let Some(chunk) = merged.next().await {
        match chunk {
            Ok(bytes) => output.extend_from_slice(&bytes),
            Err(e) => tracing::debug!(error = %e, "Command output read failed"),
        }
    }
    output
}

/// Starts job executions without blocking the scheduler.
///
/// Every execution runs in its own task: take the job lock (after a random
/// jitter), run the command, release the lock, and send exactly one
/// [`JobExecuteResult`] back to the scheduler.
#[derive(Clone)]
pub struct Executor {
    job_mgr: JobMgr,
    runner: CommandRunner,
    max_jitter: Duration,
    result_tx: mpsc::Sender<JobExecuteResult>,
}

impl Executor {
    pub fn new(
        config: &WorkerConfig,
        job_mgr: JobMgr,
        result_tx: mpsc::Sender<JobExecuteResult>,
    ) -> Self {
        Self {
            job_mgr,
            runner: CommandRunner::new(config.shell.clone(), config.kill_grace),
            max_jitter: config.lock.max_jitter,
            result_tx,
        }
    }

    pub fn execute(&self, info: JobExecuteInfo) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.run(info).await;
            if this.result_tx.send(result).await.is_err() {
                tracing::warn!("Scheduler is gone, execution result dropped");
            }
        })
    }

    async fn run(&self, info: JobExecuteInfo) -> JobExecuteResult {
        let mut lock = self.job_mgr.create_lock(&info.job.name);
        let mut start_time = Utc::now();

        tokio::time::sleep(random_jitter(self.max_jitter)).await;

        if let Err(e) = lock.try_lock().await {
            return JobExecuteResult {
                info,
                output: Vec::new(),
                error: Some(e),
                start_time,
                end_time: Utc::now(),
            };
        }

        start_time = Utc::now();
        tracing::info!(job = %info.job.name, execution = %info.id, command = %info.job.command, "Executing job");
        let outcome = self.runner.run(&info.job.command, &info.cancel).await;
        let end_time = Utc::now();
        lock.unlock().await;

        match &outcome.error {
            None => tracing::info!(job = %info.job.name, execution = %info.id, "Job finished"),
            Some(e) => tracing::warn!(
                job = %info.job.name,
                execution = %info.id,
                exit_code = ?outcome.exit_code,
                error = %e,
                "Job failed"
            ),
        }

        JobExecuteResult {
            info,
            output: outcome.output,
            error: outcome.error,
            start_time,
            end_time,
        }
    }
}
