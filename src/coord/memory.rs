//! In-process coordination store.
//!
//! [`MemoryCluster`] holds the shared state; each worker talks to it through
//! its own [`MemoryClient`]. Leases expire on their TTL unless renewed, which
//! deletes their keys and notifies watchers exactly like a real store would.
//! A client can be partitioned to simulate a worker losing connectivity.
//!
//! Change history is kept for a bounded window of recent events so that a
//! watch can resume from a past revision. Older events are compacted away and
//! a watch from before the window fails with [`CronError::Compacted`].

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_stream::StreamExt;

use crate::coord::{
    Compare, CoordinationClient, EventKind, KeepAliveResponse, KeepAliveStream, KeyValue,
    LeaseId, RangeResponse, Txn, TxnOp, TxnResponse, WatchEvent, WatchStream,
};
use crate::error::{CronError, Result};

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Events retained for watches that resume from a past revision.
pub const DEFAULT_HISTORY_LIMIT: usize = 4096;

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct ClusterState {
    revision: i64,
    next_lease: LeaseId,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, Lease>,
    history: VecDeque<WatchEvent>,
    history_limit: usize,
    /// Highest revision dropped from `history`.
    compacted: i64,
    watchers: Vec<Watcher>,
}

impl ClusterState {
    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|w| {
            if !event.kv.key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx.send(event.clone()).is_ok()
        });
        self.history.push_back(event);
        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.kv.mod_revision;
            }
        }
    }

    fn put(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(CronError::LeaseNotFound(id));
            }
        }

        self.revision += 1;
        let revision = self.revision;

        let previous = self.kvs.get(key).cloned();
        if let Some(old_lease) = previous.as_ref().and_then(|kv| kv.lease) {
            if Some(old_lease) != lease {
                if let Some(l) = self.leases.get_mut(&old_lease) {
                    l.keys.remove(key);
                }
            }
        }
        if let Some(id) = lease {
            if let Some(l) = self.leases.get_mut(&id) {
                l.keys.insert(key.to_string());
            }
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: previous.map(|kv| kv.create_revision).unwrap_or(revision),
            mod_revision: revision,
            lease,
        };
        self.kvs.insert(key.to_string(), kv.clone());
        self.notify(WatchEvent {
            kind: EventKind::Put,
            kv,
        });
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Option<KeyValue> {
        let previous = self.kvs.remove(key)?;
        self.revision += 1;

        if let Some(id) = previous.lease {
            if let Some(l) = self.leases.get_mut(&id) {
                l.keys.remove(key);
            }
        }

        self.notify(WatchEvent {
            kind: EventKind::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: Vec::new(),
                create_revision: previous.create_revision,
                mod_revision: self.revision,
                lease: None,
            },
        });
        Some(previous)
    }

    fn remove_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        for key in lease.keys {
            self.delete(&key);
        }
        true
    }
}

/// Shared state of an in-process coordination store.
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster that keeps at most `limit` past events for watch replay.
    pub fn with_history_limit(limit: usize) -> Self {
        let state = ClusterState {
            history_limit: limit,
            ..ClusterState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A new client handle with its own partition switch.
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            state: self.state.clone(),
            partitioned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn get(&self, key: &str) -> Option<KeyValue> {
        self.state.lock().await.kvs.get(key).cloned()
    }

    pub async fn revision(&self) -> i64 {
        self.state.lock().await.revision
    }

    pub async fn history_len(&self) -> usize {
        self.state.lock().await.history.len()
    }

    pub async fn lease_count(&self) -> usize {
        self.state.lock().await.leases.len()
    }

    /// End every open watch stream, as a store restart would.
    pub async fn close_watches(&self) {
        self.state.lock().await.watchers.clear();
    }
}

/// One worker's connection to a [`MemoryCluster`].
#[derive(Clone)]
pub struct MemoryClient {
    state: Arc<Mutex<ClusterState>>,
    partitioned: Arc<AtomicBool>,
}

impl MemoryClient {
    /// While partitioned, every request fails and lease renewal stops.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::SeqCst);
    }

    fn check_connected(&self) -> Result<()> {
        if self.partitioned.load(Ordering::SeqCst) {
            return Err(CronError::Coordination("client is partitioned".to_string()));
        }
        Ok(())
    }

    fn spawn_expiry(&self, id: LeaseId) {
        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                let deadline = match state.lock().await.leases.get(&id) {
                    Some(lease) => lease.deadline,
                    None => return,
                };
                tokio::time::sleep_until(deadline).await;

                let mut guard = state.lock().await;
                let expired = match guard.leases.get(&id) {
                    Some(lease) => lease.deadline <= Instant::now(),
                    None => return,
                };
                if expired {
                    guard.remove_lease(id);
                    tracing::debug!(lease = id, "Lease expired");
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    async fn range(&self, prefix: &str) -> Result<RangeResponse> {
        self.check_connected()?;
        let state = self.state.lock().await;
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(RangeResponse {
            kvs,
            revision: state.revision,
        })
    }

    async fn watch(&self, prefix: &str, from_revision: Option<i64>) -> Result<WatchStream> {
        self.check_connected()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;

        if let Some(from) = from_revision {
            if from <= state.compacted {
                return Err(CronError::Compacted {
                    requested: from,
                    compacted: state.compacted,
                });
            }
            for event in state
                .history
                .iter()
                .filter(|e| e.kv.mod_revision >= from && e.kv.key.starts_with(prefix))
            {
                // Receiver is alive, it is held below.
                let _ = tx.send(event.clone());
            }
        }
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        self.check_connected()?;
        let id = {
            let mut state = self.state.lock().await;
            state.next_lease += 1;
            let id = state.next_lease;
            state.leases.insert(
                id,
                Lease {
                    ttl,
                    deadline: Instant::now() + ttl,
                    keys: BTreeSet::new(),
                },
            );
            id
        };
        self.spawn_expiry(id);
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        self.check_connected()?;
        let ttl = match self.state.lock().await.leases.get(&lease) {
            Some(l) => l.ttl,
            None => return Err(CronError::LeaseNotFound(lease)),
        };

        let (tx, rx) = mpsc::channel(16);
        let state = self.state.clone();
        let partitioned = self.partitioned.clone();
        let period = (ttl / 3).max(MIN_RENEW_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if tx.is_closed() || partitioned.load(Ordering::SeqCst) {
                    break;
                }

                let renewed = {
                    let mut guard = state.lock().await;
                    match guard.leases.get_mut(&lease) {
                        Some(l) if l.deadline > Instant::now() => {
                            l.deadline = Instant::now() + l.ttl;
                            Some(l.ttl)
                        }
                        _ => None,
                    }
                };
                let Some(ttl) = renewed else {
                    break;
                };

                if tx.send(KeepAliveResponse { lease, ttl }).await.is_err() {
                    break;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx).fuse()))
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        self.check_connected()?;
        if self.state.lock().await.remove_lease(lease) {
            Ok(())
        } else {
            Err(CronError::LeaseNotFound(lease))
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        self.check_connected()?;
        self.state.lock().await.put(key, value, lease)
    }

    async fn delete(&self, key: &str) -> Result<Option<KeyValue>> {
        self.check_connected()?;
        Ok(self.state.lock().await.delete(key))
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        self.check_connected()?;
        let mut state = self.state.lock().await;

        let succeeded = match &txn.compare {
            Compare::CreateRevisionEquals { key, revision } => {
                state.kvs.get(key).map(|kv| kv.create_revision).unwrap_or(0) == *revision
            }
        };

        let ops = if succeeded { txn.success } else { txn.failure };
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    state.put(&key, value, lease)?;
                    responses.push(None);
                }
                TxnOp::Get { key } => responses.push(state.kvs.get(&key).cloned()),
            }
        }

        Ok(TxnResponse {
            succeeded,
            responses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_range_by_prefix() {
        let cluster = MemoryCluster::new();
        let client = cluster.client();
        client.put("/a/1", b"one".to_vec(), None).await.unwrap();
        client.put("/a/2", b"two".to_vec(), None).await.unwrap();
        client.put("/b/1", b"other".to_vec(), None).await.unwrap();

        let resp = client.range("/a/").await.unwrap();
        assert_eq!(resp.kvs.len(), 2);
        assert_eq!(resp.revision, 3);
        assert_eq!(resp.kvs[0].key, "/a/1");
    }

    #[tokio::test]
    async fn create_revision_survives_updates() {
        let cluster = MemoryCluster::new();
        let client = cluster.client();
        client.put("/k", b"v1".to_vec(), None).await.unwrap();
        client.put("/k", b"v2".to_vec(), None).await.unwrap();

        let kv = cluster.get("/k").await.unwrap();
        assert_eq!(kv.create_revision, 1);
        assert_eq!(kv.mod_revision, 2);
        assert_eq!(kv.value, b"v2");
    }

    #[tokio::test]
    async fn delete_returns_previous_value() {
        let cluster = MemoryCluster::new();
        let client = cluster.client();
        client.put("/k", b"v".to_vec(), None).await.unwrap();

        let prev = client.delete("/k").await.unwrap().unwrap();
        assert_eq!(prev.value, b"v");
        assert!(client.delete("/k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_replays_from_revision() {
        let cluster = MemoryCluster::new();
        let client = cluster.client();
        client.put("/w/a", b"1".to_vec(), None).await.unwrap();
        client.put("/w/b", b"2".to_vec(), None).await.unwrap();

        let mut stream = client.watch("/w/", Some(2)).await.unwrap();
        client.delete("/w/a").await.unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.kind, EventKind::Put);
        assert_eq!(first.kv.key, "/w/b");
        let second = stream.next().await.unwrap();
        assert_eq!(second.kind, EventKind::Delete);
        assert_eq!(second.kv.key, "/w/a");
    }

    #[tokio::test]
    async fn history_is_compacted_to_its_limit() {
        let cluster = MemoryCluster::with_history_limit(3);
        let client = cluster.client();
        for i in 0..10 {
            let lease = client.grant(Duration::from_secs(30)).await.unwrap();
            client.put("/lock/a", i.to_string().into_bytes(), Some(lease)).await.unwrap();
            client.revoke(lease).await.unwrap();
        }
        assert_eq!(cluster.history_len().await, 3);
        assert_eq!(cluster.revision().await, 20);

        let err = client.watch("/lock/", Some(17)).await.err().unwrap();
        assert!(matches!(err, CronError::Compacted { requested: 17, compacted: 17 }));

        let mut stream = client.watch("/lock/", Some(18)).await.unwrap();
        assert_eq!(stream.next().await.unwrap().kv.mod_revision, 18);
        // Live watches are not limited by the window
        assert!(client.watch("/lock/", None).await.is_ok());
    }

    #[tokio::test]
    async fn put_under_unknown_lease_fails() {
        let client = MemoryCluster::new().client();
        let err = client.put("/k", Vec::new(), Some(42)).await.unwrap_err();
        assert!(matches!(err, CronError::LeaseNotFound(42)));
    }

    #[tokio::test]
    async fn revoke_deletes_attached_keys() {
        let cluster = MemoryCluster::new();
        let client = cluster.client();
        let lease = client.grant(Duration::from_secs(30)).await.unwrap();
        client.put("/k", Vec::new(), Some(lease)).await.unwrap();

        client.revoke(lease).await.unwrap();
        assert!(cluster.get("/k").await.is_none());
        assert_eq!(cluster.lease_count().await, 0);
    }

    #[tokio::test]
    async fn lease_expires_without_keep_alive() {
        let cluster = MemoryCluster::new();
        let client = cluster.client();
        let lease = client.grant(Duration::from_millis(100)).await.unwrap();
        client.put("/k", Vec::new(), Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(cluster.get("/k").await.is_none());
    }

    #[tokio::test]
    async fn keep_alive_holds_lease_past_ttl() {
        let cluster = MemoryCluster::new();
        let client = cluster.client();
        let lease = client.grant(Duration::from_millis(150)).await.unwrap();
        client.put("/k", Vec::new(), Some(lease)).await.unwrap();
        let mut acks = client.keep_alive(lease).await.unwrap();

        let drain = tokio::spawn(async move { while acks.next().await.is_some() {} });
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(cluster.get("/k").await.is_some());
        drain.abort();
    }

    #[tokio::test]
    async fn partitioned_client_rejects_requests() {
        let client = MemoryCluster::new().client();
        client.set_partitioned(true);
        assert!(client.range("/").await.is_err());
        client.set_partitioned(false);
        assert!(client.range("/").await.is_ok());
    }
}
