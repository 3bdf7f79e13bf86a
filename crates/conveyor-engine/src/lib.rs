//! # Conveyor engine
//!
//! Runtime loops for the workflow engine:
//!
//! - [`ExecutorRuntime`]: registers an executor session and drives the
//!   lease -> dispatch -> report loop against the store
//! - [`HttpTaskDriver`]: the `reqwest` implementation of the remote
//!   task-service contract
//! - [`JobScheduler`]: settles terminated runs and fires due jobs
//! - [`ExecutorReaper`]: recovers work from executors whose session vanished
//!
//! All loops are notification-driven with interval polling as the fallback,
//! and stop on a `watch` shutdown signal.

pub mod config;
pub mod executor;
pub mod http_driver;
pub mod reaper;
pub mod scheduler;

pub use config::{ExecutorConfig, ReaperConfig, SchedulerConfig};
pub use executor::{ExecutorError, ExecutorRuntime};
pub use http_driver::HttpTaskDriver;
pub use reaper::ExecutorReaper;
pub use scheduler::{JobScheduler, SchedulerError};
