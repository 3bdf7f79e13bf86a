//! # Conveyor core
//!
//! Storage-agnostic domain model for the Conveyor workflow engine: status
//! domains, task rules, job schedules, the run-transition planner, the
//! notification topic namespace, and the remote task-service driver contract.
//!
//! Everything here is shared by the store backends (`conveyor-store`) and the
//! runtime loops (`conveyor-engine`) so each state-machine rule exists in
//! exactly one place.

pub mod driver;
pub mod models;
pub mod rule;
pub mod schedule;
pub mod status;
pub mod topic;
pub mod transition;

pub use driver::{DriverError, TaskOutcome, TaskServiceDriver};
pub use models::{
    effective_url, normalize_output, run_progress, Executor, Job, JobView, LeasedRun, NextTask,
    QueuedJob, Task, TaskQueueEntry, TaskService, TaskView, Workflow, WorkflowRun,
    WorkflowRunView, WorkflowTask, WorkflowView, EXECUTOR_CANCELED_OUTPUT,
};
pub use rule::{any_rule_failed, validate_rules, RuleError, TaskRule};
pub use schedule::{next_run_weekly, validate_schedule, JobPlan, ScheduleEntry, ScheduleError};
pub use status::{
    ExecutorSignal, ExecutorStatus, JobType, StatusParseError, TaskStatus, WorkflowRunStatus,
};
pub use topic::{Notification, Topic};
pub use transition::{
    plan_progress_change, plan_status_change, settle_run, task_terminal_status, RunSnapshot,
    TaskTally, TransitionPlan,
};
