//! Asynchronous persistence of scheduler output.
//!
//! - [`StatusMgr`]: job status transitions, one queue per job kind
//! - [`LogMgr`]: execution logs, flushed in size- or time-bounded batches
//!
//! Both are fed through non-blocking handles ([`StatusSender`], [`LogSink`])
//! so the scheduler loop never waits on the store.

pub mod log;
pub mod status;

pub use log::{LogBatch, LogBatcher, LogMgr, LogSink};
pub use status::{StatusMgr, StatusSender};
