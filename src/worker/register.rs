use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::RegisterConfig;
use crate::coord::{keys, CoordinationClient, KeepAliveStream, LeaseId};
use crate::error::{CronError, Result};

/// Keeps this worker listed under the workers prefix.
///
/// The registration key is bound to a lease that is renewed while the worker
/// is alive. When renewal stops (crash, partition, store restart) the key
/// vanishes with the lease, and the loop re-registers under a fresh lease
/// after `retry_backoff`.
pub struct Register {
    client: Arc<dyn CoordinationClient>,
    addr: String,
    lease_ttl: Duration,
    retry_backoff: Duration,
}

impl Register {
    /// Resolve the advertised address. Failing to find one is fatal.
    pub fn new(client: Arc<dyn CoordinationClient>, config: &RegisterConfig) -> Result<Self> {
        let addr = match &config.advertise_addr {
            Some(addr) => addr.clone(),
            None => local_ipv4()?.to_string(),
        };
        Ok(Self {
            client,
            addr,
            lease_ttl: config.lease_ttl,
            retry_backoff: config.retry_backoff,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn key(&self) -> String {
        keys::worker_key(&self.addr)
    }

    /// Register and keep the registration alive until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(addr = %self.addr, "Worker registration started");

        loop {
            match self.register().await {
                Ok(mut acks) => {
                    tracing::debug!(addr = %self.addr, "Worker registered");
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                tracing::info!(addr = %self.addr, "Worker registration stopped");
                                return;
                            }
                            ack = acks.next() => {
                                if ack.is_none() {
                                    tracing::warn!(addr = %self.addr, "Registration lease lost, re-registering");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(addr = %self.addr, error = %e, "Worker registration failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.retry_backoff) => {}
            }
        }
    }

    async fn register(&self) -> Result<KeepAliveStream> {
        let lease = self.client.grant(self.lease_ttl).await?;
        let acks = match self.client.keep_alive(lease).await {
            Ok(acks) => acks,
            Err(e) => {
                self.release(lease).await;
                return Err(e);
            }
        };

        let registered_at = Local::now().format("%Y/%m/%d %H:%M:%S").to_string();
        if let Err(e) = self
            .client
            .put(&self.key(), registered_at.into_bytes(), Some(lease))
            .await
        {
            drop(acks);
            self.release(lease).await;
            return Err(e);
        }
        Ok(acks)
    }

    async fn release(&self, lease: LeaseId) {
        if let Err(e) = self.client.revoke(lease).await {
            tracing::warn!(key = %self.key(), lease, error = %e, "Failed to revoke registration lease");
        }
    }
}

/// Primary non-loopback IPv4 address of this host.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel which
/// source address it would route from.
pub fn local_ipv4() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket
        .connect("8.8.8.8:80")
        .map_err(|_| CronError::NoLocalAddress)?;
    let ip = socket.local_addr()?.ip();
    if ip.is_loopback() || ip.is_unspecified() || !ip.is_ipv4() {
        return Err(CronError::NoLocalAddress);
    }
    Ok(ip)
}
