use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LogConfig;
use crate::store::{JobLog, RelationalStore};

/// Producer side of the log manager.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::Sender<JobLog>,
}

impl LogSink {
    /// Queue a log record. Returns false if it was dropped because the
    /// queue is full; execution is never held up by logging.
    pub fn append(&self, log: JobLog) -> bool {
        match self.tx.try_send(log) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Log queue unavailable, log record dropped");
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBatch {
    pub id: u64,
    pub logs: Vec<JobLog>,
}

/// What happened when a record was added to the batcher.
#[derive(Debug, Default)]
pub struct Pushed {
    /// A new batch was opened; its commit timer must be armed.
    pub opened: Option<u64>,
    /// The batch reached its size limit and must be flushed now.
    pub full: Option<LogBatch>,
}

/// Batch bookkeeping of the log manager, free of I/O and timers.
#[derive(Debug)]
pub struct LogBatcher {
    batch_size: usize,
    current: Option<LogBatch>,
    next_id: u64,
}

impl LogBatcher {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            current: None,
            next_id: 0,
        }
    }

    pub fn push(&mut self, log: JobLog) -> Pushed {
        let mut pushed = Pushed::default();

        if self.current.is_none() {
            self.next_id += 1;
            pushed.opened = Some(self.next_id);
        }
        let (id, capacity) = (self.next_id, self.batch_size);
        let batch = self.current.get_or_insert_with(|| LogBatch {
            id,
            logs: Vec::with_capacity(capacity),
        });
        batch.logs.push(log);

        if batch.logs.len() >= self.batch_size {
            pushed.full = self.current.take();
        }
        pushed
    }

    /// Take the batch for a fired commit timer, unless that batch was already
    /// flushed by the size trigger.
    pub fn take_expired(&mut self, id: u64) -> Option<LogBatch> {
        match &self.current {
            Some(batch) if batch.id == id => self.current.take(),
            _ => None,
        }
    }

    pub fn take_current(&mut self) -> Option<LogBatch> {
        self.current.take()
    }

    pub fn pending(&self) -> usize {
        self.current.as_ref().map_or(0, |b| b.logs.len())
    }
}

/// Writes execution logs to the relational store in batches.
///
/// A batch is flushed when it reaches `batch_size` records or when
/// `commit_timeout` has passed since its first record, whichever comes first.
/// Failed flushes are logged and the records are lost.
pub struct LogMgr {
    store: Arc<dyn RelationalStore>,
    commit_timeout: Duration,
    batcher: LogBatcher,
    log_rx: mpsc::Receiver<JobLog>,
    auto_commit_tx: mpsc::Sender<u64>,
    auto_commit_rx: mpsc::Receiver<u64>,
    commit_timer: Option<JoinHandle<()>>,
}

impl LogMgr {
    pub fn new(store: Arc<dyn RelationalStore>, config: &LogConfig) -> (Self, LogSink) {
        let (tx, log_rx) = mpsc::channel(config.queue_capacity);
        let (auto_commit_tx, auto_commit_rx) = mpsc::channel(config.auto_commit_capacity);
        (
            Self {
                store,
                commit_timeout: config.commit_timeout,
                batcher: LogBatcher::new(config.batch_size),
                log_rx,
                auto_commit_tx,
                auto_commit_rx,
                commit_timer: None,
            },
            LogSink { tx },
        )
    }

    /// Run the write loop until shutdown or until every sink is dropped. The
    /// batch in progress is flushed on the way out.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                log = self.log_rx.recv() => {
                    let Some(log) = log else { break };
                    self.on_log(log).await;
                }
                Some(id) = self.auto_commit_rx.recv() => {
                    match self.batcher.take_expired(id) {
                        Some(batch) => self.flush(batch).await,
                        None => tracing::debug!(batch = id, "Commit timer fired for a flushed batch"),
                    }
                }
            }
        }

        self.cancel_timer();
        if let Some(batch) = self.batcher.take_current() {
            self.flush(batch).await;
        }
        tracing::debug!("Log write loop stopped");
    }

    async fn on_log(&mut self, log: JobLog) {
        let pushed = self.batcher.push(log);
        if let Some(id) = pushed.opened {
            self.arm_timer(id);
        }
        if let Some(batch) = pushed.full {
            self.cancel_timer();
            self.flush(batch).await;
        }
    }

    fn arm_timer(&mut self, id: u64) {
        let tx = self.auto_commit_tx.clone();
        let timeout = self.commit_timeout;
        self.commit_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(id).await;
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.commit_timer.take() {
            timer.abort();
        }
    }

    async fn flush(&self, batch: LogBatch) {
        let count = batch.logs.len();
        match self.store.insert_logs(&batch.logs).await {
            Ok(()) => tracing::debug!(batch = batch.id, count, "Log batch flushed"),
            Err(e) => tracing::error!(batch = batch.id, count, error = %e, "Failed to flush log batch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn log(name: &str) -> JobLog {
        let now = Utc::now();
        JobLog {
            job_name: name.to_string(),
            command: "true".to_string(),
            output: String::new(),
            err: String::new(),
            plan_time: now,
            schedule_time: now,
            start_time: now,
            end_time: now,
            success: true,
        }
    }

    #[test]
    fn first_log_opens_a_batch() {
        let mut batcher = LogBatcher::new(3);
        let pushed = batcher.push(log("a"));
        assert_eq!(pushed.opened, Some(1));
        assert!(pushed.full.is_none());

        let pushed = batcher.push(log("b"));
        assert!(pushed.opened.is_none());
        assert_eq!(batcher.pending(), 2);
    }

    #[test]
    fn size_trigger_flushes_exactly_batch_size() {
        let mut batcher = LogBatcher::new(3);
        let mut flushed = Vec::new();
        for i in 0..5 {
            if let Some(batch) = batcher.push(log(&i.to_string())).full {
                flushed.push(batch);
            }
        }
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].logs.len(), 3);
        assert_eq!(batcher.pending(), 2);
    }

    #[test]
    fn stale_timer_is_a_no_op() {
        let mut batcher = LogBatcher::new(2);
        batcher.push(log("a"));
        let full = batcher.push(log("b")).full.unwrap();
        assert_eq!(full.id, 1);

        assert!(batcher.take_expired(1).is_none());

        let pushed = batcher.push(log("c"));
        assert_eq!(pushed.opened, Some(2));
        assert!(batcher.take_expired(1).is_none());
        assert_eq!(batcher.take_expired(2).unwrap().logs.len(), 1);
    }

    #[test]
    fn batch_size_one_opens_and_fills() {
        let mut batcher = LogBatcher::new(1);
        let pushed = batcher.push(log("a"));
        assert_eq!(pushed.opened, Some(1));
        assert_eq!(pushed.full.unwrap().logs.len(), 1);
        assert_eq!(batcher.pending(), 0);
    }
}
