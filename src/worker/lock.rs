use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::coord::{keys, CoordinationClient, LeaseId, Txn};
use crate::error::{CronError, Result};

/// Random delay in `[0, max)` taken before a lock attempt, so co-located
/// workers do not race the transaction in lock-step.
pub fn random_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..max.as_millis().max(1) as u64))
}

/// Distributed mutex for one job name.
///
/// The lock key lives under a lease that is renewed for as long as the lock
/// is held. If the holder crashes or is partitioned the lease expires and the
/// key disappears, so the lock is never held for longer than one TTL past
/// the holder's last renewal.
pub struct JobLock {
    client: Arc<dyn CoordinationClient>,
    job_name: String,
    ttl: Duration,
    lease: Option<LeaseId>,
    renewal: Option<CancellationToken>,
}

impl JobLock {
    pub fn new(client: Arc<dyn CoordinationClient>, job_name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client,
            job_name: job_name.into(),
            ttl,
            lease: None,
            renewal: None,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn is_locked(&self) -> bool {
        self.lease.is_some()
    }

    /// Lease backing the lock while held.
    pub fn lease_id(&self) -> Option<LeaseId> {
        self.lease
    }

    /// Try to take the lock once. Fails with [`CronError::LockAlreadyHeld`]
    /// when another holder has it; the lease granted for the attempt is
    /// revoked on every failure path.
    pub async fn try_lock(&mut self) -> Result<()> {
        if self.is_locked() {
            return Ok(());
        }

        let lease = self.client.grant(self.ttl).await?;
        let renewal = CancellationToken::new();

        match self.acquire(lease, &renewal).await {
            Ok(()) => {
                tracing::debug!(job = %self.job_name, lease, "Lock acquired");
                self.lease = Some(lease);
                self.renewal = Some(renewal);
                Ok(())
            }
            Err(e) => {
                renewal.cancel();
                if let Err(revoke_err) = self.client.revoke(lease).await {
                    tracing::warn!(job = %self.job_name, lease, error = %revoke_err, "Failed to revoke lock lease");
                }
                if e.is_lock_contention() {
                    tracing::debug!(job = %self.job_name, "Lock held by another worker");
                } else {
                    tracing::warn!(job = %self.job_name, error = %e, "Failed to acquire lock");
                }
                Err(e)
            }
        }
    }

    async fn acquire(&self, lease: LeaseId, renewal: &CancellationToken) -> Result<()> {
        let mut acks = self.client.keep_alive(lease).await?;
        let token = renewal.clone();
        let job_name = self.job_name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    ack = acks.next() => {
                        if ack.is_none() {
                            tracing::warn!(job = %job_name, lease, "Lock lease renewal ended");
                            break;
                        }
                    }
                }
            }
        });

        let key = keys::lock_key(&self.job_name);
        let resp = self
            .client
            .txn(Txn::create_if_absent(&key, Vec::new(), lease))
            .await?;
        if !resp.succeeded {
            return Err(CronError::LockAlreadyHeld);
        }
        Ok(())
    }

    /// Release the lock. A no-op unless `try_lock` succeeded.
    pub async fn unlock(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        if let Some(renewal) = self.renewal.take() {
            renewal.cancel();
        }
        if let Err(e) = self.client.revoke(lease).await {
            // The lease still runs out on its own once renewal has stopped.
            tracing::warn!(job = %self.job_name, lease, error = %e, "Failed to revoke lock lease");
        } else {
            tracing::debug!(job = %self.job_name, lease, "Lock released");
        }
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.cancel();
        }
    }
}
