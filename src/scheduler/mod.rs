//! Job model and the scheduling state machine.
//!
//! - [`job`]: job definitions, plans, execution records and status events
//! - [`cron`]: cron expression parsing
//! - [`engine`]: the [`Scheduler`] event loop

pub mod cron;
pub mod engine;
pub mod job;

pub use engine::Scheduler;
pub use job::{Job, JobEvent, JobKind, JobStatus};
