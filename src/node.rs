use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::coord::CoordinationClient;
use crate::error::Result;
use crate::job_mgr::JobMgr;
use crate::persist::{LogMgr, StatusMgr};
use crate::scheduler::Scheduler;
use crate::store::RelationalStore;
use crate::worker::Register;

/// A worker that wires every component together.
pub struct WorkerNode {
    pub config: WorkerConfig,
    client: Arc<dyn CoordinationClient>,
    store: Arc<dyn RelationalStore>,
}

impl WorkerNode {
    pub fn new(
        config: WorkerConfig,
        client: Arc<dyn CoordinationClient>,
        store: Arc<dyn RelationalStore>,
    ) -> Self {
        Self {
            config,
            client,
            store,
        }
    }

    /// Run the worker until `shutdown` fires.
    ///
    /// Starts, in order:
    /// 1. the status and log persistence loops
    /// 2. worker registration
    /// 3. the scheduler loop
    /// 4. the job and killer watches, after pushing the stored jobs
    ///
    /// # Errors
    ///
    /// Fails if the advertised address cannot be resolved or the initial job
    /// read fails. Everything started before the failure is stopped first.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let stop = shutdown.child_token();
        let register = Register::new(self.client.clone(), &self.config.register)?;

        let (status_mgr, status) = StatusMgr::new(self.store.clone(), self.config.status_channel_capacity);
        let (log_mgr, logs) = LogMgr::new(self.store.clone(), &self.config.log);
        let job_mgr = JobMgr::new(self.client.clone(), &self.config);
        let (scheduler, events) = Scheduler::new(&self.config, job_mgr.clone(), status, logs);

        let mut handles = status_mgr.spawn(stop.clone());
        handles.push(tokio::spawn(log_mgr.run(stop.clone())));
        handles.push(tokio::spawn(register.run(stop.clone())));
        let scheduler_handle = tokio::spawn(scheduler.run(stop.clone()));

        tracing::info!(shell = %self.config.shell.display(), "Worker started");

        match job_mgr.start(events, stop.clone()).await {
            Ok(watches) => handles.extend(watches),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load jobs");
                stop.cancel();
                let _ = scheduler_handle.await;
                futures::future::join_all(handles).await;
                return Err(e);
            }
        }

        stop.cancelled().await;
        tracing::info!("Shutting down worker");

        if let Err(e) = scheduler_handle.await {
            tracing::error!(error = %e, "Scheduler task failed");
        }
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task failed");
            }
        }
        tracing::info!("Worker stopped");
        Ok(())
    }
}
