//! # Conveyor store
//!
//! Durable state for the workflow engine: jobs, workflow runs, the per-run
//! task queue, executors, archives, and the notification bus.
//!
//! Two backends implement the same trait family:
//!
//! - [`PgEngineStore`]: PostgreSQL via sqlx. Row-level locks with
//!   `FOR UPDATE SKIP LOCKED` leases, per-run list partitions, `pg_notify`
//!   on commit, and `pg_stat_activity`-based executor liveness.
//! - [`MemoryEngineStore`]: the same semantics behind one mutex, used by the
//!   scenario test suite and anywhere a database is unavailable.
//!
//! The side effects of every run status change live in
//! `conveyor_core::transition`; both backends apply that one planner inside
//! their mutating transaction, mirroring a before-status-update trigger
//! without duplicating its rules.

mod error;
mod memory;
mod postgres;
mod store;

pub use error::StoreError;
pub use memory::{ArchivedTask, MemoryEngineStore};
pub use postgres::PgEngineStore;
pub use store::{
    EngineStore, ExecutorStore, JobStore, NewJob, NewTask, NotificationHub, RunStore,
    Subscription, WorkflowStore,
};

/// How a run transition treats the progress column
#[derive(Debug, Clone, Copy)]
pub(crate) enum ProgressChange {
    Keep,
    Set(Option<i16>),
}
