//! Job definition synchronization.
//!
//! [`JobMgr`] turns the contents of the jobs and killer prefixes into
//! [`JobEvent`]s for the scheduler: one baseline read at startup, then two
//! watches that resume from the last revision they saw if their stream
//! breaks. When that revision has been compacted away, the watch re-reads its
//! prefix and reports what changed since instead.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::coord::{keys, CoordinationClient, EventKind, WatchEvent};
use crate::error::{CronError, Result};
use crate::scheduler::job::{Job, JobEvent};
use crate::worker::lock::JobLock;

#[derive(Clone)]
pub struct JobMgr {
    client: Arc<dyn CoordinationClient>,
    lock_ttl: Duration,
    watch_retry_backoff: Duration,
}

/// Which prefix a watch loop follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchTarget {
    Jobs,
    Killer,
}

impl WatchTarget {
    fn prefix(self) -> &'static str {
        match self {
            WatchTarget::Jobs => keys::JOB_SAVE_DIR,
            WatchTarget::Killer => keys::JOB_KILLER_DIR,
        }
    }
}

impl JobMgr {
    pub fn new(client: Arc<dyn CoordinationClient>, config: &WorkerConfig) -> Self {
        Self {
            client,
            lock_ttl: config.lock.ttl,
            watch_retry_backoff: config.watch_retry_backoff,
        }
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    /// Read every stored job. Values that fail to decode are skipped.
    /// Returns the jobs and the store revision of the read.
    pub async fn load_jobs(&self) -> Result<(Vec<Job>, i64)> {
        let resp = self.client.range(keys::JOB_SAVE_DIR).await?;
        let mut jobs = Vec::with_capacity(resp.kvs.len());
        for kv in resp.kvs {
            match Job::decode(&kv.value) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!(key = %kv.key, error = %e, "Skipping undecodable job"),
            }
        }
        Ok((jobs, resp.revision))
    }

    /// Push the baseline Save events, then start both watches.
    ///
    /// Only the baseline read can fail; once the watch tasks are running they
    /// retry on their own until `shutdown` fires.
    pub async fn start(
        &self,
        events: mpsc::Sender<JobEvent>,
        shutdown: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>> {
        let (jobs, revision) = self.load_jobs().await?;
        tracing::info!(count = jobs.len(), revision, "Loaded stored jobs");
        let known: HashSet<String> = jobs.iter().map(|job| job.name.clone()).collect();
        for job in jobs {
            if events.send(JobEvent::Save(job)).await.is_err() {
                return Ok(Vec::new());
            }
        }

        let handles = [WatchTarget::Jobs, WatchTarget::Killer]
            .into_iter()
            .map(|target| {
                let mgr = self.clone();
                let events = events.clone();
                let shutdown = shutdown.clone();
                let known = match target {
                    WatchTarget::Jobs => known.clone(),
                    WatchTarget::Killer => HashSet::new(),
                };
                tokio::spawn(async move {
                    mgr.watch_loop(target, revision + 1, known, events, shutdown).await;
                })
            })
            .collect();
        Ok(handles)
    }

    async fn watch_loop(
        &self,
        target: WatchTarget,
        mut from_revision: i64,
        mut known: HashSet<String>,
        events: mpsc::Sender<JobEvent>,
        shutdown: CancellationToken,
    ) {
        let prefix = target.prefix();

        loop {
            match self.client.watch(prefix, Some(from_revision)).await {
                Ok(mut stream) => {
                    tracing::debug!(prefix, from_revision, "Watch opened");
                    loop {
                        let event = tokio::select! {
                            _ = shutdown.cancelled() => return,
                            event = stream.next() => event,
                        };
                        let Some(event) = event else {
                            tracing::warn!(prefix, from_revision, "Watch stream ended");
                            break;
                        };
                        from_revision = event.kv.mod_revision + 1;

                        let Some(job_event) = Self::translate(target, event) else {
                            continue;
                        };
                        match &job_event {
                            JobEvent::Save(job) => {
                                known.insert(job.name.clone());
                            }
                            JobEvent::Delete { name } => {
                                known.remove(name);
                            }
                            JobEvent::Kill { .. } => {}
                        }
                        if events.send(job_event).await.is_err() {
                            tracing::debug!(prefix, "Scheduler is gone, stopping watch");
                            return;
                        }
                    }
                }
                Err(CronError::Compacted { compacted, .. }) => {
                    tracing::warn!(prefix, from_revision, compacted, "Watch history compacted, re-reading prefix");
                    match self.resync(target, from_revision, &mut known, &events).await {
                        Ok(Some(revision)) => {
                            from_revision = revision + 1;
                            continue;
                        }
                        Ok(None) => return,
                        Err(e) => tracing::warn!(prefix, error = %e, "Failed to re-read prefix"),
                    }
                }
                Err(e) => tracing::warn!(prefix, error = %e, "Failed to open watch"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.watch_retry_backoff) => {}
            }
        }
    }

    /// Catch up on a prefix whose watch history is gone.
    ///
    /// Emits a Save or Kill for every key modified at or after `since`, and a
    /// Delete for every known job that no longer exists. Returns the revision
    /// of the read, or `None` if the scheduler has gone away.
    async fn resync(
        &self,
        target: WatchTarget,
        since: i64,
        known: &mut HashSet<String>,
        events: &mpsc::Sender<JobEvent>,
    ) -> Result<Option<i64>> {
        let resp = self.client.range(target.prefix()).await?;
        let mut pending = Vec::new();

        match target {
            WatchTarget::Jobs => {
                let mut present = HashSet::new();
                for kv in resp.kvs {
                    present.insert(keys::extract_job_name(&kv.key).to_string());
                    if kv.mod_revision < since {
                        continue;
                    }
                    match Job::decode(&kv.value) {
                        Ok(job) => pending.push(JobEvent::Save(job)),
                        Err(e) => tracing::warn!(key = %kv.key, error = %e, "Skipping undecodable job"),
                    }
                }
                let mut gone: Vec<_> = known.difference(&present).cloned().collect();
                gone.sort();
                pending.extend(gone.into_iter().map(|name| JobEvent::Delete { name }));
                *known = present;
            }
            WatchTarget::Killer => {
                pending.extend(
                    resp.kvs
                        .iter()
                        .filter(|kv| kv.mod_revision >= since)
                        .map(|kv| JobEvent::Kill {
                            name: keys::extract_killer_name(&kv.key).to_string(),
                        }),
                );
            }
        }

        for event in pending {
            if events.send(event).await.is_err() {
                return Ok(None);
            }
        }
        Ok(Some(resp.revision))
    }

    fn translate(target: WatchTarget, event: WatchEvent) -> Option<JobEvent> {
        match (target, event.kind) {
            (WatchTarget::Jobs, EventKind::Put) => match Job::decode(&event.kv.value) {
                Ok(job) => Some(JobEvent::Save(job)),
                Err(e) => {
                    tracing::warn!(key = %event.kv.key, error = %e, "Ignoring undecodable job update");
                    None
                }
            },
            (WatchTarget::Jobs, EventKind::Delete) => Some(JobEvent::Delete {
                name: keys::extract_job_name(&event.kv.key).to_string(),
            }),
            (WatchTarget::Killer, EventKind::Put) => Some(JobEvent::Kill {
                name: keys::extract_killer_name(&event.kv.key).to_string(),
            }),
            (WatchTarget::Killer, EventKind::Delete) => {
                tracing::debug!(key = %event.kv.key, "Kill marker removed");
                None
            }
        }
    }

    /// Delete a stored job, returning it if it existed.
    pub async fn delete_job(&self, name: &str) -> Result<Option<Job>> {
        let Some(prev) = self.client.delete(&keys::job_key(name)).await? else {
            return Ok(None);
        };
        match Job::decode(&prev.value) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                tracing::warn!(job = %name, error = %e, "Deleted job had an undecodable value");
                Ok(None)
            }
        }
    }

    pub fn create_lock(&self, job_name: &str) -> JobLock {
        JobLock::new(self.client.clone(), job_name, self.lock_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::KeyValue;

    fn event(kind: EventKind, key: &str, value: &[u8]) -> WatchEvent {
        WatchEvent {
            kind,
            kv: KeyValue {
                key: key.to_string(),
                value: value.to_vec(),
                create_revision: 1,
                mod_revision: 1,
                lease: None,
            },
        }
    }

    #[test]
    fn job_put_becomes_save() {
        let value = Job::recurring("ping", "true", "* * * * *").encode().unwrap();
        let translated = JobMgr::translate(WatchTarget::Jobs, event(EventKind::Put, "/cron/jobs/ping", &value));
        assert!(matches!(translated, Some(JobEvent::Save(job)) if job.name == "ping"));
    }

    #[test]
    fn malformed_job_put_is_skipped() {
        let translated = JobMgr::translate(WatchTarget::Jobs, event(EventKind::Put, "/cron/jobs/bad", b"{oops"));
        assert!(translated.is_none());
    }

    #[test]
    fn job_delete_uses_key_suffix() {
        let translated = JobMgr::translate(WatchTarget::Jobs, event(EventKind::Delete, "/cron/jobs/ping", b""));
        assert_eq!(translated, Some(JobEvent::Delete { name: "ping".to_string() }));
    }

    #[test]
    fn killer_put_becomes_kill_and_delete_is_ignored() {
        let kill = JobMgr::translate(WatchTarget::Killer, event(EventKind::Put, "/cron/killer/ping", b""));
        assert_eq!(kill, Some(JobEvent::Kill { name: "ping".to_string() }));
        assert!(JobMgr::translate(WatchTarget::Killer, event(EventKind::Delete, "/cron/killer/ping", b"")).is_none());
    }
}
