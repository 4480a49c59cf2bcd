//! Worker-side execution.
//!
//! - [`JobLock`]: lease-backed distributed lock, one per job name
//! - [`Executor`]: takes the lock and runs a job's command under a
//!   cancellation token
//! - [`Register`]: advertises this worker under the workers prefix
//!
//! # Execution Flow
//!
//! 1. The scheduler hands a [`JobExecuteInfo`](crate::scheduler::job::JobExecuteInfo) to [`Executor::execute`]
//! 2. After a random jitter the executor tries the job lock
//! 3. The holder runs `<shell> -c <command>` in its own process group
//! 4. stdout and stderr are captured, the lock released, and one result sent back
//!
//! Commands run without sandboxing, with the worker's privileges.

pub mod executor;
pub mod lock;
pub mod register;

pub use executor::{CommandRunner, Executor};
pub use lock::JobLock;
pub use register::Register;
