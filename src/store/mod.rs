//! Relational store capability.
//!
//! The worker writes job status transitions and execution logs; the control
//! plane reads them back. [`RelationalStore`] is the seam, with an in-memory
//! implementation for tests and standalone runs and a SQLite one for
//! persistence.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::scheduler::job::{JobExecuteResult, JobKind, JobStatus};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A job row as the control plane sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub name: String,
    pub command: String,
    pub cron_expr: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub next_time: Option<DateTime<Utc>>,
    pub executions: i64,
}

/// A status write produced by the status manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub job_name: String,
    pub status: JobStatus,
    pub next_time: DateTime<Utc>,
    /// Bump the execution counter by one.
    pub increment: bool,
}

/// One execution log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLog {
    pub job_name: String,
    pub command: String,
    pub output: String,
    pub err: String,
    pub plan_time: DateTime<Utc>,
    pub schedule_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub success: bool,
}

impl JobLog {
    pub fn from_result(result: &JobExecuteResult) -> Self {
        Self {
            job_name: result.info.job.name.clone(),
            command: result.info.job.command.clone(),
            output: String::from_utf8_lossy(&result.output).into_owned(),
            err: result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
            plan_time: result.info.plan_time,
            schedule_time: result.info.real_time,
            start_time: result.start_time,
            end_time: result.end_time,
            success: result.error.is_none(),
        }
    }
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Apply a status transition. Updates for unknown jobs are ignored.
    async fn update_job_status(&self, update: &StatusUpdate) -> Result<()>;

    /// Insert all records in one write.
    async fn insert_logs(&self, logs: &[JobLog]) -> Result<()>;

    /// Most recent logs of a job, newest first.
    async fn list_logs(&self, job_name: &str, limit: u32) -> Result<Vec<JobLog>>;

    async fn get_job(&self, name: &str) -> Result<Option<JobRecord>>;

    async fn upsert_job(&self, job: &JobRecord) -> Result<()>;
}
