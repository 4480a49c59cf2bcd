use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scheduler::job::{JobKind, JobStatusEvent};
use crate::store::{RelationalStore, StatusUpdate};

/// Producer side of the status manager. Never blocks.
#[derive(Debug, Clone)]
pub struct StatusSender {
    recurring_tx: mpsc::Sender<JobStatusEvent>,
    one_shot_tx: mpsc::Sender<JobStatusEvent>,
}

impl StatusSender {
    /// Queue a status event on the queue matching the job's kind. Dropped
    /// with a warning when that queue is full.
    pub fn push(&self, event: JobStatusEvent) {
        let tx = match event.job.kind {
            JobKind::Recurring => &self.recurring_tx,
            JobKind::OneShot => &self.one_shot_tx,
        };
        if let Err(e) = tx.try_send(event) {
            let event = match e {
                mpsc::error::TrySendError::Full(event) | mpsc::error::TrySendError::Closed(event) => event,
            };
            tracing::warn!(
                job = %event.job.name,
                status = %event.status,
                "Status queue unavailable, status event dropped"
            );
        }
    }
}

/// Persists job status transitions to the relational store.
///
/// Recurring and one-shot jobs have separate queues, each drained by its own
/// task, so a slow write for one kind does not hold up the other.
pub struct StatusMgr {
    store: Arc<dyn RelationalStore>,
    recurring_rx: mpsc::Receiver<JobStatusEvent>,
    one_shot_rx: mpsc::Receiver<JobStatusEvent>,
}

impl StatusMgr {
    pub fn new(store: Arc<dyn RelationalStore>, capacity: usize) -> (Self, StatusSender) {
        let (recurring_tx, recurring_rx) = mpsc::channel(capacity);
        let (one_shot_tx, one_shot_rx) = mpsc::channel(capacity);
        (
            Self {
                store,
                recurring_rx,
                one_shot_rx,
            },
            StatusSender {
                recurring_tx,
                one_shot_tx,
            },
        )
    }

    /// Spawn the two drain loops. They stop on shutdown or once every sender
    /// is gone.
    pub fn spawn(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Self::update_loop(
                self.store.clone(),
                self.recurring_rx,
                JobKind::Recurring,
                shutdown.clone(),
            )),
            tokio::spawn(Self::update_loop(
                self.store,
                self.one_shot_rx,
                JobKind::OneShot,
                shutdown,
            )),
        ]
    }

    async fn update_loop(
        store: Arc<dyn RelationalStore>,
        mut rx: mpsc::Receiver<JobStatusEvent>,
        kind: JobKind,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let update = Self::to_update(&event, kind);
                    if let Err(e) = store.update_job_status(&update).await {
                        tracing::error!(
                            job = %update.job_name,
                            status = %update.status,
                            error = %e,
                            "Failed to persist job status"
                        );
                    }
                }
            }
        }
        tracing::debug!(%kind, "Status update loop stopped");
    }

    /// Only recurring jobs count executions; a one-shot job runs at most once.
    fn to_update(event: &JobStatusEvent, kind: JobKind) -> StatusUpdate {
        StatusUpdate {
            job_name: event.job.name.clone(),
            status: event.status,
            next_time: event.next_time,
            increment: kind == JobKind::Recurring && event.add_num,
        }
    }
}
