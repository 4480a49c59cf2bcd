//! Coordination store capability.
//!
//! Workers never talk to a concrete store directly; everything goes through
//! [`CoordinationClient`], which models a hierarchical key-value store with
//! revisions, prefix watches, leases and compare-and-swap transactions.
//!
//! # Key namespaces
//!
//! | Prefix            | Key suffix     | Value                        |
//! |-------------------|----------------|------------------------------|
//! | `/cron/jobs/`     | job name       | JSON-encoded job             |
//! | `/cron/killer/`   | job name       | ignored, presence is the signal |
//! | `/cron/lock/`     | job name       | empty, bound to the holder's lease |
//! | `/cron/workers/`  | worker address | registration time            |

pub mod keys;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub use memory::{MemoryClient, MemoryCluster};

pub type LeaseId = i64;

/// A stored key and its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was created. Zero means the key is absent.
    pub create_revision: i64,
    pub mod_revision: i64,
    pub lease: Option<LeaseId>,
}

/// Result of a prefix range read.
#[derive(Debug, Clone)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    /// Store revision at the time of the read.
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single change observed by a watch. For deletes, `kv.value` is empty and
/// `kv.mod_revision` is the revision of the deletion.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub kv: KeyValue,
}

/// Acknowledgement of a lease renewal.
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveResponse {
    pub lease: LeaseId,
    pub ttl: Duration,
}

/// Stream of watch events. Ends when the watch is broken.
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Stream of keep-alive acks. Renewal continues while the stream is held and
/// stops when it is dropped; the stream ends when renewal fails.
pub type KeepAliveStream = BoxStream<'static, KeepAliveResponse>;

/// Condition of a transaction.
#[derive(Debug, Clone)]
pub enum Compare {
    CreateRevisionEquals { key: String, revision: i64 },
}

/// Operation run in one branch of a transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Get {
        key: String,
    },
}

#[derive(Debug, Clone)]
pub struct Txn {
    pub compare: Compare,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    /// Create `key` under `lease` only if it does not exist yet, otherwise read it.
    pub fn create_if_absent(key: &str, value: Vec<u8>, lease: LeaseId) -> Self {
        Self {
            compare: Compare::CreateRevisionEquals {
                key: key.to_string(),
                revision: 0,
            },
            success: vec![TxnOp::Put {
                key: key.to_string(),
                value,
                lease: Some(lease),
            }],
            failure: vec![TxnOp::Get {
                key: key.to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone)]
pub struct TxnResponse {
    /// True when the success branch executed.
    pub succeeded: bool,
    /// One entry per executed op; `Get` yields the key if present, `Put` yields `None`.
    pub responses: Vec<Option<KeyValue>>,
}

/// Client side of the coordination store.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Read every key under `prefix`.
    async fn range(&self, prefix: &str) -> Result<RangeResponse>;

    /// Stream changes under `prefix`. With `from_revision`, events at or after
    /// that revision are replayed first; otherwise only future changes arrive.
    async fn watch(&self, prefix: &str, from_revision: Option<i64>) -> Result<WatchStream>;

    async fn grant(&self, ttl: Duration) -> Result<LeaseId>;

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Revoke a lease, deleting every key attached to it.
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()>;

    /// Delete `key`, returning its previous value if it existed.
    async fn delete(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;
}
