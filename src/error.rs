use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Lock already held by another worker")]
    LockAlreadyHeld,

    #[error("Coordination store error: {0}")]
    Coordination(String),

    #[error("Revision {requested} has been compacted (history starts after {compacted})")]
    Compacted { requested: i64, compacted: i64 },

    #[error("Lease not found: {0}")]
    LeaseNotFound(i64),

    #[error("Invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Failed to decode job: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Command exited with code {0:?}")]
    CommandFailed(Option<i32>),

    #[error("Command was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No routable local address found")]
    NoLocalAddress,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CronError {
    /// Lock contention is steady-state behavior, not a failure worth reporting.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, CronError::LockAlreadyHeld)
    }
}

pub type Result<T> = std::result::Result<T, CronError>;
