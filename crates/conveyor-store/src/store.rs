//! Store trait family
//!
//! These traits define the interface every backend must provide.
//! Implementations must be thread-safe, support concurrent access, and keep
//! each compound operation all-or-nothing. Lease operations are non-blocking
//! with respect to contended rows: they skip locked rows and may return
//! `None` while work still exists elsewhere.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use conveyor_core::{
    Executor, Job, JobPlan, JobView, LeasedRun, NextTask, Notification, QueuedJob, Task, TaskRule,
    TaskService, Topic, Workflow, WorkflowRunView, WorkflowTask, WorkflowView,
};

use crate::error::StoreError;

/// Input for `create_task`
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub description: String,
    pub task_service_id: Uuid,
    pub url: String,
}

/// Input for `create_job`
#[derive(Debug, Clone)]
pub struct NewJob {
    pub workflow_id: Uuid,
    pub maintainer: String,
    pub plan: JobPlan,
    /// Must be strictly in the future at insert
    pub next_run: DateTime<Utc>,
}

/// Workflow templates and the task/service registry
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Create an empty workflow template
    async fn create_workflow(&self, name: &str) -> Result<Workflow, StoreError>;

    /// Mark a template deprecated, optionally pointing at its successor.
    /// The successor reference is guidance only and is never followed during
    /// run initialization.
    async fn deprecate_workflow(
        &self,
        workflow_id: Uuid,
        new_workflow: Option<Uuid>,
    ) -> Result<(), StoreError>;

    /// Template with its ordered task rows (the `v_workflows` shape)
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowView, StoreError>;

    async fn list_workflows(&self) -> Result<Vec<WorkflowView>, StoreError>;

    /// Insert one template row. The workflow's `task_order` sequence must
    /// remain dense and 1-based or the operation is rejected.
    async fn insert_workflow_task(&self, task: WorkflowTask) -> Result<(), StoreError>;

    /// Replace the task reference and parameters of one template row
    async fn update_workflow_task(
        &self,
        workflow_id: Uuid,
        task_order: i32,
        task_id: Uuid,
        parameters: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Delete one template row; rejected unless the order sequence stays dense
    async fn delete_workflow_task(
        &self,
        workflow_id: Uuid,
        task_order: i32,
    ) -> Result<(), StoreError>;

    async fn create_task_service(
        &self,
        name: &str,
        base_url: &str,
    ) -> Result<TaskService, StoreError>;

    async fn create_task(&self, new: NewTask) -> Result<Task, StoreError>;

    /// Task joined to its service with the effective URL (the `v_tasks` shape)
    async fn get_task(&self, task_id: Uuid) -> Result<conveyor_core::TaskView, StoreError>;

    async fn list_tasks(&self) -> Result<Vec<conveyor_core::TaskView>, StoreError>;
}

/// Workflow runs and their task queues
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Snapshot a workflow template into a new run with its own task-queue
    /// partition. Rejects deprecated templates, suggesting the successor.
    /// All-or-nothing.
    async fn initialize_workflow_run(&self, workflow_id: Uuid) -> Result<Uuid, StoreError>;

    /// Waiting -> Scheduled; the transition auto-assigns a live executor when
    /// one exists and publishes its `wr_scheduled_*` topic
    async fn schedule_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError>;

    /// Scheduled -> Running for the calling executor; progress starts at 0
    async fn start_workflow_run(
        &self,
        workflow_run_id: Uuid,
        executor_id: Uuid,
    ) -> Result<(), StoreError>;

    /// First phase of a hand-off: bookmark the earliest Waiting task as Paused
    async fn start_workflow_run_move(&self, workflow_run_id: Uuid) -> Result<(), StoreError>;

    /// Second phase of a hand-off: restore the bookmark to Waiting and
    /// re-schedule the run so the transition picks a new executor
    async fn complete_workflow_run_move(&self, workflow_run_id: Uuid) -> Result<(), StoreError>;

    /// Scheduled | Waiting -> Canceled
    async fn cancel_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError>;

    /// Archive and reset every task-queue row, then return the run to
    /// Waiting. Invalid while the run is Running. All-or-nothing.
    async fn restart_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError>;

    /// Settle the run from its task-queue distribution (completion cascade);
    /// always releases the owning executor
    async fn complete_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError>;

    /// First Scheduled run available to this executor, locked with
    /// skip-locked semantics. `is_valid` reports whether every task of the
    /// run is within `{Waiting, Complete}`; invalid runs are returned as-is
    /// for the caller to settle.
    async fn lease_next_workflow_run(
        &self,
        executor_id: Uuid,
    ) -> Result<Option<LeasedRun>, StoreError>;

    /// Run with its task rows in order (the `v_workflow_runs` shape)
    async fn get_workflow_run(&self, workflow_run_id: Uuid)
        -> Result<WorkflowRunView, StoreError>;

    async fn list_workflow_runs(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowRunView>, StoreError>;

    /// Drop a non-active run, its archive rows, and its task-queue partition
    async fn purge_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError>;

    // =========================================================================
    // Task dispatch
    // =========================================================================

    /// Lease the run's next Waiting task and mark it Running in one
    /// transaction. Returns `None` when no task is available, which includes
    /// any sibling being in `{Running, Paused, Failed, Rule Broken}` - the
    /// serialization point within a run.
    async fn acquire_next_task(
        &self,
        workflow_run_id: Uuid,
    ) -> Result<Option<NextTask>, StoreError>;

    /// Waiting -> Running with `task_start` stamped; a no-op if the task is
    /// already Running
    async fn start_task_run(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
    ) -> Result<(), StoreError>;

    /// Terminal status for a Running task: any failed rule forces
    /// `Rule Broken`, else `is_paused` parks it, else Complete. Recomputes
    /// the run's progress.
    async fn complete_task_run(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
        is_paused: bool,
        output: Option<String>,
    ) -> Result<(), StoreError>;

    /// Running -> Failed with a non-blank message as output
    async fn fail_task_run(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
        message: &str,
    ) -> Result<(), StoreError>;

    /// Append one rule to a Running task's rules array
    async fn append_task_rule(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
        rule: TaskRule,
    ) -> Result<(), StoreError>;

    /// Progress report for a Running task, 0..=100
    async fn set_task_progress(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
        progress: i16,
    ) -> Result<(), StoreError>;

    /// Manually complete a Paused task and return the run to Scheduled
    async fn complete_task(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
    ) -> Result<(), StoreError>;

    /// Archive a Failed or Rule Broken task, reset it to Waiting, and return
    /// the run to Scheduled. All-or-nothing.
    async fn retry_task(&self, workflow_run_id: Uuid, task_order: i32) -> Result<(), StoreError>;
}

/// Recurring jobs
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError>;

    /// Job joined to its workflow and current-run status (the `v_jobs` shape)
    async fn get_job(&self, job_id: Uuid) -> Result<JobView, StoreError>;

    async fn list_jobs(&self) -> Result<Vec<JobView>, StoreError>;

    /// The due-set (the `v_queued_jobs` shape): not paused, with no current
    /// run or a Complete one, ordered by `next_run`
    async fn queued_jobs(&self) -> Result<Vec<QueuedJob>, StoreError>;

    /// Under a job row lock: reject paused jobs, initialize and schedule a
    /// run, stamp it as current, and advance `next_run`. Returns the new run
    /// id. All-or-nothing.
    async fn run_job(&self, job_id: Uuid) -> Result<Uuid, StoreError>;

    /// Settle a job after its run terminated. A Complete run clears the
    /// current-run reference and unpauses the job (returns `None`); any other
    /// terminal status keeps the reference and pauses the job (returns the
    /// reason). Refused while the run is Scheduled or Running.
    async fn complete_job(&self, job_id: Uuid) -> Result<Option<String>, StoreError>;

    async fn pause_job(&self, job_id: Uuid) -> Result<(), StoreError>;

    async fn resume_job(&self, job_id: Uuid) -> Result<(), StoreError>;
}

/// Executor sessions and liveness
#[async_trait]
pub trait ExecutorStore: Send + Sync {
    /// Register the calling session as a live executor
    async fn register_executor(&self) -> Result<Uuid, StoreError>;

    /// Request graceful shutdown; publishes `shutdown` on the executor's
    /// status topic
    async fn shutdown_executor(&self, executor_id: Uuid) -> Result<(), StoreError>;

    /// Request forced cancellation; publishes `cancel` on the executor's
    /// status topic
    async fn cancel_executor(&self, executor_id: Uuid) -> Result<(), StoreError>;

    /// Stamp `exec_end`, set the terminal status, and cancel every Running
    /// run (and its Running tasks) still owned by this executor
    async fn close_executor(&self, executor_id: Uuid, is_cancelled: bool)
        -> Result<(), StoreError>;

    /// The liveness reaper: mark Active executors whose session vanished as
    /// Canceled and cancel their orphaned runs and tasks. Returns the reaped
    /// executor ids.
    async fn clean_executors(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Least-loaded live executor, or `None` when none exist
    async fn next_executor(&self) -> Result<Option<Uuid>, StoreError>;

    async fn get_executor(&self, executor_id: Uuid) -> Result<Executor, StoreError>;

    async fn list_executors(&self) -> Result<Vec<Executor>, StoreError>;

    /// Executors that are Active with a live backing session
    async fn list_active_executors(&self) -> Result<Vec<Executor>, StoreError>;
}

/// A live topic subscription
#[async_trait]
pub trait Subscription: Send {
    /// Next notification on any subscribed topic. Delivery is best-effort;
    /// consumers reconcile by polling the authoritative views.
    async fn recv(&mut self) -> Result<Notification, StoreError>;
}

/// Topic-addressed best-effort wake-ups
#[async_trait]
pub trait NotificationHub: Send + Sync {
    async fn subscribe(&self, topics: &[Topic]) -> Result<Box<dyn Subscription>, StoreError>;
}

/// The full store surface
pub trait EngineStore:
    WorkflowStore + RunStore + JobStore + ExecutorStore + NotificationHub
{
}

impl<T> EngineStore for T where
    T: WorkflowStore + RunStore + JobStore + ExecutorStore + NotificationHub
{
}
