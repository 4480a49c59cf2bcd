use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CronError, Result};
use crate::scheduler::cron::CronExpr;

/// Whether a job is re-planned after every run or retired after its first.
///
/// Encoded as `typ` on the wire: `0` recurring, `1` one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum JobKind {
    #[default]
    Recurring,
    OneShot,
}

impl From<JobKind> for u8 {
    fn from(kind: JobKind) -> Self {
        match kind {
            JobKind::Recurring => 0,
            JobKind::OneShot => 1,
        }
    }
}

impl TryFrom<u8> for JobKind {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(JobKind::Recurring),
            1 => Ok(JobKind::OneShot),
            other => Err(format!("unknown job type {other}")),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Recurring => write!(f, "recurring"),
            JobKind::OneShot => write!(f, "one-shot"),
        }
    }
}

/// Job status as persisted for the control plane. The integer codes are
/// part of the control plane's listing API and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Stored but not yet picked up by any worker.
    PendingSchedule,
    PendingExecution,
    Executing,
    /// Killed, or the command failed.
    ExecutionError,
    /// One-shot job finished successfully.
    Completed,
    Deleted,
}

impl JobStatus {
    pub fn code(self) -> i64 {
        match self {
            JobStatus::PendingSchedule => 0,
            JobStatus::PendingExecution => 1,
            JobStatus::Executing => 2,
            JobStatus::ExecutionError => 3,
            JobStatus::Completed => 4,
            JobStatus::Deleted => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(JobStatus::PendingSchedule),
            1 => Some(JobStatus::PendingExecution),
            2 => Some(JobStatus::Executing),
            3 => Some(JobStatus::ExecutionError),
            4 => Some(JobStatus::Completed),
            5 => Some(JobStatus::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::PendingSchedule => write!(f, "pending-schedule"),
            JobStatus::PendingExecution => write!(f, "pending-execution"),
            JobStatus::Executing => write!(f, "executing"),
            JobStatus::ExecutionError => write!(f, "execution-error"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// A job definition as stored under the jobs prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub command: String,
    #[serde(rename = "cronExpr", default)]
    pub cron_expr: String,
    #[serde(rename = "typ", default)]
    pub kind: JobKind,
    /// Number of completed executions.
    #[serde(rename = "num", default)]
    pub executions: i64,
}

impl Job {
    pub fn recurring(name: impl Into<String>, command: impl Into<String>, cron_expr: &str) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cron_expr: cron_expr.to_string(),
            kind: JobKind::Recurring,
            executions: 0,
        }
    }

    pub fn one_shot(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cron_expr: String::new(),
            kind: JobKind::OneShot,
            executions: 0,
        }
    }

    pub fn decode(value: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(value)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A change to the Scheduler's view of jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Save(Job),
    Delete { name: String },
    Kill { name: String },
}

impl JobEvent {
    pub fn job_name(&self) -> &str {
        match self {
            JobEvent::Save(job) => &job.name,
            JobEvent::Delete { name } | JobEvent::Kill { name } => name,
        }
    }
}

/// When a job runs next.
#[derive(Debug, Clone)]
pub struct JobSchedulePlan {
    pub job: Arc<Job>,
    /// `None` for a one-shot job that has never run; it is due immediately.
    pub expr: Option<CronExpr>,
    pub next_time: DateTime<Utc>,
}

impl JobSchedulePlan {
    pub fn build(job: Job, now: DateTime<Utc>) -> Result<Self> {
        let no_expr = job.cron_expr.trim().is_empty();
        if no_expr && job.kind == JobKind::Recurring {
            return Err(CronError::InvalidCron {
                expr: job.cron_expr.clone(),
                reason: "recurring job has no cron expression".to_string(),
            });
        }
        if no_expr && job.executions < 1 {
            return Ok(Self {
                job: Arc::new(job),
                expr: None,
                next_time: now,
            });
        }

        let expr = CronExpr::parse(&job.cron_expr)?;
        let next_time = expr.next_after(now).ok_or_else(|| CronError::InvalidCron {
            expr: job.cron_expr.clone(),
            reason: "expression has no upcoming trigger".to_string(),
        })?;

        Ok(Self {
            job: Arc::new(job),
            expr: Some(expr),
            next_time,
        })
    }

    /// Recurring plans are advanced after every due tick and bound the
    /// scheduler's timer; one-shot plans keep their original trigger time.
    pub fn is_recurring(&self) -> bool {
        self.job.kind == JobKind::Recurring && self.expr.is_some()
    }

    /// Move a recurring plan to its first trigger after `now`. Returns false
    /// when the expression is exhausted.
    pub fn advance(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_recurring() {
            return true;
        }
        match self.expr.as_ref().and_then(|expr| expr.next_after(now)) {
            Some(next) => {
                self.next_time = next;
                true
            }
            None => {
                self.expr = None;
                self.next_time = DateTime::<Utc>::MAX_UTC;
                false
            }
        }
    }
}

/// One execution attempt in flight.
#[derive(Debug, Clone)]
pub struct JobExecuteInfo {
    pub id: Uuid,
    pub job: Arc<Job>,
    /// Trigger time the plan asked for.
    pub plan_time: DateTime<Utc>,
    /// Time the Scheduler actually started the attempt.
    pub real_time: DateTime<Utc>,
    /// Shared with the Executor; cancelling it terminates the command.
    pub cancel: CancellationToken,
}

impl JobExecuteInfo {
    pub fn from_plan(plan: &JobSchedulePlan) -> Self {
        Self {
            id: Uuid::new_v4(),
            job: plan.job.clone(),
            plan_time: plan.next_time,
            real_time: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Outcome of one execution attempt.
#[derive(Debug)]
pub struct JobExecuteResult {
    pub info: JobExecuteInfo,
    /// Combined stdout and stderr.
    pub output: Vec<u8>,
    pub error: Option<CronError>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl JobExecuteResult {
    pub fn is_lock_contention(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(CronError::is_lock_contention)
    }
}

/// A status transition to persist.
#[derive(Debug, Clone)]
pub struct JobStatusEvent {
    pub status: JobStatus,
    pub job: Arc<Job>,
    /// Whether this transition marks a finished execution attempt.
    pub add_num: bool,
    pub next_time: DateTime<Utc>,
}

impl JobStatusEvent {
    pub fn new(status: JobStatus, job: Arc<Job>, next_time: DateTime<Utc>, add_num: bool) -> Self {
        Self {
            status,
            job,
            add_num,
            next_time,
        }
    }
}
