use std::path::PathBuf;
use std::time::Duration;

/// Settings for the per-job distributed lock.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// TTL of the lease backing a held lock. A crashed holder releases the
    /// lock once this elapses without renewal.
    pub ttl: Duration,
    /// Upper bound of the random sleep taken before each lock attempt.
    pub max_jitter: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            max_jitter: Duration::from_secs(1),
        }
    }
}

/// Settings for batched execution-log persistence.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Flush as soon as a batch holds this many records.
    pub batch_size: usize,
    /// Flush a non-empty batch this long after its first record arrived.
    pub commit_timeout: Duration,
    /// Capacity of the intake queue; records beyond it are dropped.
    pub queue_capacity: usize,
    pub auto_commit_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            commit_timeout: Duration::from_secs(1),
            queue_capacity: 2000,
            auto_commit_capacity: 200,
        }
    }
}

/// Settings for worker liveness registration.
#[derive(Debug, Clone)]
pub struct RegisterConfig {
    pub lease_ttl: Duration,
    pub retry_backoff: Duration,
    /// Address advertised under the workers prefix. Resolved from the
    /// primary network interface when unset.
    pub advertise_addr: Option<String>,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(3),
            advertise_addr: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Shell used to run job commands as `<shell> -c <command>`.
    pub shell: PathBuf,
    /// Timer duration used when no recurring job is planned.
    pub idle_schedule_interval: Duration,
    /// How long a cancelled job gets between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Delay before re-opening a watch stream that ended.
    pub watch_retry_backoff: Duration,
    pub event_channel_capacity: usize,
    pub result_channel_capacity: usize,
    pub status_channel_capacity: usize,
    pub lock: LockConfig,
    pub log: LogConfig,
    pub register: RegisterConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/bash"),
            idle_schedule_interval: Duration::from_secs(60),
            kill_grace: Duration::from_secs(2),
            watch_retry_backoff: Duration::from_secs(1),
            event_channel_capacity: 1000,
            result_channel_capacity: 1000,
            status_channel_capacity: 1000,
            lock: LockConfig::default(),
            log: LogConfig::default(),
            register: RegisterConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.register.advertise_addr = Some(addr.into());
        self
    }

    pub fn with_log_batching(mut self, batch_size: usize, commit_timeout: Duration) -> Self {
        self.log.batch_size = batch_size;
        self.log.commit_timeout = commit_timeout;
        self
    }

    pub fn with_lock(mut self, ttl: Duration, max_jitter: Duration) -> Self {
        self.lock = LockConfig { ttl, max_jitter };
        self
    }
}
