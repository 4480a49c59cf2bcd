pub mod config;
pub mod coord;
pub mod error;
pub mod job_mgr;
pub mod node;
pub mod persist;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;
