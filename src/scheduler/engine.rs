use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::job_mgr::JobMgr;
use crate::persist::{LogSink, StatusSender};
use crate::scheduler::job::{
    Job, JobEvent, JobExecuteInfo, JobExecuteResult, JobKind, JobSchedulePlan, JobStatus,
    JobStatusEvent,
};
use crate::store::JobLog;
use crate::worker::executor::Executor;

/// The worker's scheduling state machine.
///
/// Owns the schedule table (job name -> plan) and the executing table
/// (job name -> in-flight attempt). Both are only touched from the event
/// loop in [`Scheduler::run`], which waits on three sources:
///
/// - job events from [`JobMgr`]
/// - a timer armed for the earliest recurring trigger
/// - execution results from the [`Executor`]
///
/// After every dispatch the schedule is re-evaluated and the timer re-armed.
pub struct Scheduler {
    plans: HashMap<String, JobSchedulePlan>,
    executing: HashMap<String, JobExecuteInfo>,
    event_rx: mpsc::Receiver<JobEvent>,
    result_rx: mpsc::Receiver<JobExecuteResult>,
    executor: Executor,
    job_mgr: JobMgr,
    status: StatusSender,
    logs: LogSink,
    idle_interval: Duration,
}

impl Scheduler {
    /// Build the scheduler together with its executor. Returns the sender
    /// that feeds it job events.
    pub fn new(
        config: &WorkerConfig,
        job_mgr: JobMgr,
        status: StatusSender,
        logs: LogSink,
    ) -> (Self, mpsc::Sender<JobEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let (result_tx, result_rx) = mpsc::channel(config.result_channel_capacity);
        let executor = Executor::new(config, job_mgr.clone(), result_tx);

        let scheduler = Self {
            plans: HashMap::new(),
            executing: HashMap::new(),
            event_rx,
            result_rx,
            executor,
            job_mgr,
            status,
            logs,
            idle_interval: config.idle_schedule_interval,
        };
        (scheduler, event_tx)
    }

    /// Run until shutdown or until every event sender is dropped.
    ///
    /// Executions still in flight at shutdown are cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let timer = tokio::time::sleep(self.try_schedule());
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.event_rx.recv() => {
                    let Some(event) = event else {
                        tracing::info!("Job event channel closed");
                        break;
                    };
                    self.handle_job_event(event);
                }
                _ = &mut timer => {}
                Some(result) = self.result_rx.recv() => {
                    self.handle_job_result(result).await;
                }
            }

            let after = self.try_schedule();
            timer.as_mut().reset(tokio::time::Instant::now() + after);
        }

        for (name, info) in self.executing.drain() {
            tracing::info!(job = %name, execution = %info.id, "Cancelling execution on shutdown");
            info.cancel.cancel();
        }
        tracing::info!("Scheduler stopped");
    }

    pub fn handle_job_event(&mut self, event: JobEvent) {
        match event {
            JobEvent::Save(job) => self.save_job(job),
            JobEvent::Delete { name } => match self.plans.remove(&name) {
                Some(plan) => {
                    self.status.push(JobStatusEvent::new(
                        JobStatus::Deleted,
                        plan.job.clone(),
                        plan.next_time,
                        false,
                    ));
                    tracing::info!(job = %name, "Job removed from schedule");
                }
                None => tracing::info!(job = %name, "Delete for a job that is not scheduled"),
            },
            JobEvent::Kill { name } => match self.executing.get(&name) {
                Some(info) => {
                    info.cancel.cancel();
                    self.status.push(JobStatusEvent::new(
                        JobStatus::ExecutionError,
                        info.job.clone(),
                        info.plan_time,
                        true,
                    ));
                    tracing::info!(job = %name, execution = %info.id, "Execution killed");
                }
                None => tracing::info!(job = %name, "Kill for a job that is not executing"),
            },
        }
    }

    fn save_job(&mut self, job: Job) {
        let name = job.name.clone();
        let plan = match JobSchedulePlan::build(job, Utc::now()) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(job = %name, error = %e, "Cannot schedule job");
                return;
            }
        };

        self.status.push(JobStatusEvent::new(
            JobStatus::PendingExecution,
            plan.job.clone(),
            plan.next_time,
            false,
        ));
        tracing::info!(job = %name, next_time = %plan.next_time, "Job scheduled");
        self.plans.insert(name, plan);
    }

    /// Start every due plan and return how long to sleep before the next
    /// evaluation.
    pub fn try_schedule(&mut self) -> Duration {
        self.try_schedule_at(Utc::now())
    }

    pub fn try_schedule_at(&mut self, now: DateTime<Utc>) -> Duration {
        if self.plans.is_empty() {
            return self.idle_interval;
        }

        let due: Vec<String> = self
            .plans
            .iter()
            .filter(|(_, plan)| plan.next_time <= now)
            .map(|(name, _)| name.clone())
            .collect();

        for name in due {
            self.try_start_job(&name);

            let exhausted = match self.plans.get_mut(&name) {
                Some(plan) => !plan.advance(now),
                None => false,
            };
            if exhausted {
                self.plans.remove(&name);
                tracing::warn!(job = %name, "Cron expression has no further triggers, job unscheduled");
            }
        }

        let nearest = self
            .plans
            .values()
            .filter(|plan| plan.is_recurring())
            .map(|plan| plan.next_time)
            .min();

        match nearest {
            Some(next) => (next - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.idle_interval),
            None => self.idle_interval,
        }
    }

    fn try_start_job(&mut self, name: &str) {
        let Some(plan) = self.plans.get(name) else {
            return;
        };
        if let Some(running) = self.executing.get(name) {
            tracing::info!(
                job = %name,
                execution = %running.id,
                "Previous execution still running, skipping this tick"
            );
            return;
        }

        let info = JobExecuteInfo::from_plan(plan);
        self.status.push(JobStatusEvent::new(
            JobStatus::Executing,
            plan.job.clone(),
            plan.next_time,
            false,
        ));
        tracing::debug!(job = %name, execution = %info.id, plan_time = %info.plan_time, "Starting execution");

        self.executing.insert(name.to_string(), info.clone());
        self.executor.execute(info);
    }

    pub async fn handle_job_result(&mut self, result: JobExecuteResult) {
        let job = result.info.job.clone();
        self.executing.remove(&job.name);

        if job.kind == JobKind::OneShot {
            self.plans.remove(&job.name);
            if let Err(e) = self.job_mgr.delete_job(&job.name).await {
                tracing::error!(job = %job.name, error = %e, "Failed to delete finished one-shot job");
            }
        }

        if result.is_lock_contention() {
            tracing::debug!(job = %job.name, "Another worker ran this tick");
            return;
        }

        let status = match (&result.error, job.kind) {
            (Some(e), _) => {
                tracing::warn!(job = %job.name, execution = %result.info.id, error = %e, "Execution failed");
                JobStatus::ExecutionError
            }
            (None, JobKind::Recurring) => JobStatus::PendingExecution,
            (None, JobKind::OneShot) => JobStatus::Completed,
        };

        self.status
            .push(JobStatusEvent::new(status, job.clone(), result.info.plan_time, true));
        self.logs.append(JobLog::from_result(&result));
    }

    /// Wait for the next execution result without handling it.
    pub async fn recv_result(&mut self) -> Option<JobExecuteResult> {
        self.result_rx.recv().await
    }

    pub fn is_executing(&self, name: &str) -> bool {
        self.executing.contains_key(name)
    }

    pub fn executing_count(&self) -> usize {
        self.executing.len()
    }

    pub fn plan(&self, name: &str) -> Option<&JobSchedulePlan> {
        self.plans.get(name)
    }

    pub fn plan_count(&self) -> usize {
        self.plans.len()
    }
}
