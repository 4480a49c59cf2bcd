use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{CronError, Result};
use crate::store::{JobLog, JobRecord, RelationalStore, StatusUpdate};

/// Relational store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<String, JobRecord>>,
    logs: RwLock<Vec<JobLog>>,
    log_inserts: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail, to exercise the lossy persistence paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful `insert_logs` calls.
    pub fn log_insert_count(&self) -> usize {
        self.log_inserts.load(Ordering::SeqCst)
    }

    pub async fn all_logs(&self) -> Vec<JobLog> {
        self.logs.read().await.clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CronError::Internal("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn update_job_status(&self, update: &StatusUpdate) -> Result<()> {
        self.check_writable()?;
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&update.job_name) {
            job.status = update.status;
            job.next_time = Some(update.next_time);
            if update.increment {
                job.executions += 1;
            }
        }
        Ok(())
    }

    async fn insert_logs(&self, logs: &[JobLog]) -> Result<()> {
        self.check_writable()?;
        self.logs.write().await.extend_from_slice(logs);
        self.log_inserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_logs(&self, job_name: &str, limit: u32) -> Result<Vec<JobLog>> {
        let logs = self.logs.read().await;
        Ok(logs
            .iter()
            .rev()
            .filter(|log| log.job_name == job_name)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get_job(&self, name: &str) -> Result<Option<JobRecord>> {
        Ok(self.jobs.read().await.get(name).cloned())
    }

    async fn upsert_job(&self, job: &JobRecord) -> Result<()> {
        self.check_writable()?;
        self.jobs
            .write()
            .await
            .insert(job.name.clone(), job.clone());
        Ok(())
    }
}
