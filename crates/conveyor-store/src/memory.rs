//! In-memory implementation of the store trait family
//!
//! Primarily for testing. All data lives behind one mutex, which gives every
//! operation the same atomicity the PostgreSQL backend gets from row locks
//! and transactions; the semantics (lease predicates, transition side
//! effects, archive-and-reset, liveness) are identical. Executor "sessions"
//! are synthetic pids that tests can kill to simulate a vanished process.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use conveyor_core::{
    any_rule_failed, effective_url, normalize_output, plan_progress_change, plan_status_change,
    run_progress, settle_run, task_terminal_status, Executor, ExecutorSignal, ExecutorStatus, Job,
    JobView, LeasedRun, NextTask, Notification, QueuedJob, RunSnapshot, Task,
    TaskQueueEntry, TaskRule, TaskService, TaskStatus, TaskTally, TaskView, Topic, Workflow,
    WorkflowRun, WorkflowRunStatus, WorkflowRunView, WorkflowTask, WorkflowView,
    EXECUTOR_CANCELED_OUTPUT,
};

use crate::error::StoreError;
use crate::store::{
    ExecutorStore, JobStore, NewJob, NewTask, NotificationHub, RunStore, Subscription,
    WorkflowStore,
};
use crate::ProgressChange;

/// An archived task-queue snapshot
#[derive(Debug, Clone)]
pub struct ArchivedTask {
    pub entry: TaskQueueEntry,
    pub archived_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    workflows: BTreeMap<Uuid, Workflow>,
    workflow_tasks: BTreeMap<(Uuid, i32), WorkflowTask>,
    services: BTreeMap<Uuid, TaskService>,
    tasks: BTreeMap<Uuid, Task>,
    jobs: BTreeMap<Uuid, Job>,
    runs: BTreeMap<Uuid, WorkflowRun>,
    /// One "partition" per run
    queues: HashMap<Uuid, BTreeMap<i32, TaskQueueEntry>>,
    archive: Vec<ArchivedTask>,
    executors: BTreeMap<Uuid, Executor>,
    live_pids: HashSet<i32>,
    next_pid: i32,
}

/// In-memory engine store
///
/// # Example
///
/// ```
/// use conveyor_store::MemoryEngineStore;
///
/// let store = MemoryEngineStore::new();
/// ```
#[derive(Clone)]
pub struct MemoryEngineStore {
    inner: Arc<Mutex<Inner>>,
    notify_tx: broadcast::Sender<Notification>,
    principal: Option<String>,
}

impl MemoryEngineStore {
    pub fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            notify_tx,
            principal: None,
        }
    }

    /// Matches the PostgreSQL handle's surface; the label only shows up as
    /// the registered executor's application name here.
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Drop an executor's backing session without closing it, simulating a
    /// process that vanished mid-run. The reaper is the only recovery path.
    pub fn kill_session(&self, executor_id: Uuid) {
        let mut inner = self.inner.lock();
        let pid = inner.executors.get(&executor_id).map(|e| e.pid);
        if let Some(pid) = pid {
            inner.live_pids.remove(&pid);
        }
    }

    /// Archived snapshots for one run, oldest first
    pub fn archived_tasks(&self, workflow_run_id: Uuid) -> Vec<ArchivedTask> {
        self.inner
            .lock()
            .archive
            .iter()
            .filter(|a| a.entry.workflow_run_id == workflow_run_id)
            .cloned()
            .collect()
    }

    fn publish(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            // Fire-and-forget: no subscriber is not an error
            let _ = self.notify_tx.send(notification);
        }
    }

    fn notify_jobs(job_id: Uuid, out: &mut Vec<Notification>) {
        out.push(Notification::new(Topic::Jobs, job_id.to_string()));
    }
}

impl Default for MemoryEngineStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Shared internals
// ============================================================================

impl Inner {
    fn next_executor(&self) -> Option<Uuid> {
        self.executors
            .values()
            .filter(|e| e.status == ExecutorStatus::Active && self.live_pids.contains(&e.pid))
            .min_by_key(|e| {
                let owned = self
                    .runs
                    .values()
                    .filter(|r| r.executor_id == Some(e.executor_id) && r.status.is_active())
                    .count();
                (owned, e.exec_start)
            })
            .map(|e| e.executor_id)
    }

    fn owning_job(&self, workflow_run_id: Uuid) -> Option<Uuid> {
        self.jobs
            .values()
            .find(|j| j.current_workflow_run_id == Some(workflow_run_id))
            .map(|j| j.job_id)
    }

    /// The single transition hook: mirrors `PgEngineStore::apply_run_status`
    fn apply_run_status(
        &mut self,
        workflow_run_id: Uuid,
        new_status: WorkflowRunStatus,
        progress: ProgressChange,
        clear_executor: bool,
        out: &mut Vec<Notification>,
    ) -> Result<(), StoreError> {
        let run = self
            .runs
            .get(&workflow_run_id)
            .ok_or(StoreError::RunNotFound(workflow_run_id))?
            .clone();

        let owner_for_plan = if clear_executor && new_status == WorkflowRunStatus::Scheduled {
            None
        } else {
            run.executor_id
        };
        let candidate = if new_status == WorkflowRunStatus::Scheduled && owner_for_plan.is_none() {
            self.next_executor()
        } else {
            None
        };

        let snapshot = RunSnapshot {
            workflow_run_id,
            status: run.status,
            executor_id: owner_for_plan,
            owning_job: self.owning_job(workflow_run_id),
        };
        let plan = plan_status_change(&snapshot, new_status, candidate);

        let new_executor = if clear_executor {
            plan.assign_executor
        } else {
            plan.assign_executor.or(run.executor_id)
        };
        let new_progress = match progress {
            ProgressChange::Keep => run.progress,
            ProgressChange::Set(p) => p,
        };

        let stored = self
            .runs
            .get_mut(&workflow_run_id)
            .ok_or(StoreError::RunNotFound(workflow_run_id))?;
        stored.status = new_status;
        stored.executor_id = new_executor;
        stored.progress = new_progress;

        out.extend(plan.notifications);
        if let Some(notification) =
            plan_progress_change(workflow_run_id, run.progress, new_progress)
        {
            out.push(notification);
        }
        Ok(())
    }

    fn initialize_run(&mut self, workflow_id: Uuid) -> Result<Uuid, StoreError> {
        let workflow = self
            .workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        if workflow.is_deprecated {
            let suggestion = workflow
                .new_workflow
                .map(|successor| {
                    let name = self
                        .workflows
                        .get(&successor)
                        .map(|w| w.name.clone())
                        .unwrap_or_else(|| successor.to_string());
                    format!("; use its successor {name}")
                })
                .unwrap_or_default();
            return Err(StoreError::precondition(format!(
                "workflow {:?} is deprecated{suggestion}",
                workflow.name
            )));
        }

        let workflow_run_id = Uuid::now_v7();
        self.runs.insert(
            workflow_run_id,
            WorkflowRun {
                workflow_run_id,
                workflow_id,
                status: WorkflowRunStatus::Waiting,
                executor_id: None,
                progress: None,
            },
        );

        let queue: BTreeMap<i32, TaskQueueEntry> = self
            .workflow_tasks
            .range((workflow_id, i32::MIN)..=(workflow_id, i32::MAX))
            .map(|((_, task_order), wt)| {
                (
                    *task_order,
                    TaskQueueEntry {
                        workflow_run_id,
                        task_order: *task_order,
                        task_id: wt.task_id,
                        status: TaskStatus::Waiting,
                        parameters: wt.parameters.clone(),
                        output: None,
                        rules: None,
                        task_start: None,
                        task_end: None,
                        progress: None,
                    },
                )
            })
            .collect();
        self.queues.insert(workflow_run_id, queue);
        Ok(workflow_run_id)
    }

    fn archive_and_reset(&mut self, workflow_run_id: Uuid, task_order: Option<i32>) {
        let now = Utc::now();
        if let Some(queue) = self.queues.get_mut(&workflow_run_id) {
            for entry in queue.values_mut() {
                if task_order.is_some_and(|order| order != entry.task_order) {
                    continue;
                }
                self.archive.push(ArchivedTask {
                    entry: entry.clone(),
                    archived_at: now,
                });
                entry.status = TaskStatus::Waiting;
                entry.output = None;
                entry.rules = None;
                entry.task_start = None;
                entry.task_end = None;
                entry.progress = None;
            }
        }
    }

    fn refresh_run_progress(
        &mut self,
        workflow_run_id: Uuid,
        out: &mut Vec<Notification>,
    ) -> Result<(), StoreError> {
        let (complete, total) = match self.queues.get(&workflow_run_id) {
            Some(queue) => (
                queue
                    .values()
                    .filter(|t| t.status == TaskStatus::Complete)
                    .count(),
                queue.len(),
            ),
            None => (0, 0),
        };
        let new_progress = run_progress(complete, total);

        let run = self
            .runs
            .get_mut(&workflow_run_id)
            .ok_or(StoreError::RunNotFound(workflow_run_id))?;
        let old_progress = run.progress;
        if old_progress != new_progress {
            run.progress = new_progress;
            if let Some(notification) =
                plan_progress_change(workflow_run_id, old_progress, new_progress)
            {
                out.push(notification);
            }
        }
        Ok(())
    }

    fn cancel_owned_runs(
        &mut self,
        executor_id: Uuid,
        out: &mut Vec<Notification>,
    ) -> Result<(), StoreError> {
        let owned: Vec<Uuid> = self
            .runs
            .values()
            .filter(|r| {
                r.executor_id == Some(executor_id) && r.status == WorkflowRunStatus::Running
            })
            .map(|r| r.workflow_run_id)
            .collect();

        for workflow_run_id in owned {
            if let Some(queue) = self.queues.get_mut(&workflow_run_id) {
                for entry in queue.values_mut() {
                    if entry.status == TaskStatus::Running {
                        entry.status = TaskStatus::Canceled;
                        entry.task_end = Some(Utc::now());
                        entry.output = Some(EXECUTOR_CANCELED_OUTPUT.to_string());
                    }
                }
            }
            self.apply_run_status(
                workflow_run_id,
                WorkflowRunStatus::Canceled,
                ProgressChange::Keep,
                true,
                out,
            )?;
        }
        Ok(())
    }

    fn repool_scheduled_runs(
        &mut self,
        executor_id: Uuid,
        out: &mut Vec<Notification>,
    ) -> Result<(), StoreError> {
        let owned: Vec<Uuid> = self
            .runs
            .values()
            .filter(|r| {
                r.executor_id == Some(executor_id) && r.status == WorkflowRunStatus::Scheduled
            })
            .map(|r| r.workflow_run_id)
            .collect();

        for workflow_run_id in owned {
            self.apply_run_status(
                workflow_run_id,
                WorkflowRunStatus::Scheduled,
                ProgressChange::Keep,
                true,
                out,
            )?;
        }
        Ok(())
    }

    fn dense_order(&self, workflow_id: Uuid) -> bool {
        let orders: Vec<i32> = self
            .workflow_tasks
            .range((workflow_id, i32::MIN)..=(workflow_id, i32::MAX))
            .map(|((_, order), _)| *order)
            .collect();
        orders.is_empty()
            || (orders.first() == Some(&1) && orders.last() == Some(&(orders.len() as i32)))
    }

    fn task_view(&self, task: &Task) -> Result<TaskView, StoreError> {
        let service = self
            .services
            .get(&task.task_service_id)
            .ok_or(StoreError::TaskServiceNotFound(task.task_service_id))?;
        Ok(TaskView {
            task: task.clone(),
            service_name: service.name.clone(),
            effective_url: effective_url(&service.base_url, &task.url),
        })
    }
}

// ============================================================================
// WorkflowStore
// ============================================================================

#[async_trait]
impl WorkflowStore for MemoryEngineStore {
    async fn create_workflow(&self, name: &str) -> Result<Workflow, StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::validation("workflow name must not be blank"));
        }
        let mut inner = self.inner.lock();
        if inner.workflows.values().any(|w| w.name == name) {
            return Err(StoreError::validation(format!(
                "workflow name {name:?} already exists"
            )));
        }
        let workflow = Workflow {
            workflow_id: Uuid::now_v7(),
            name: name.to_string(),
            is_deprecated: false,
            new_workflow: None,
        };
        inner.workflows.insert(workflow.workflow_id, workflow.clone());
        Ok(workflow)
    }

    async fn deprecate_workflow(
        &self,
        workflow_id: Uuid,
        new_workflow: Option<Uuid>,
    ) -> Result<(), StoreError> {
        if new_workflow == Some(workflow_id) {
            return Err(StoreError::validation(
                "a workflow cannot be its own successor",
            ));
        }
        let mut inner = self.inner.lock();
        if let Some(successor) = new_workflow {
            if !inner.workflows.contains_key(&successor) {
                return Err(StoreError::WorkflowNotFound(successor));
            }
        }
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        workflow.is_deprecated = true;
        workflow.new_workflow = new_workflow;
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowView, StoreError> {
        let inner = self.inner.lock();
        let workflow = inner
            .workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?
            .clone();
        let tasks = inner
            .workflow_tasks
            .range((workflow_id, i32::MIN)..=(workflow_id, i32::MAX))
            .map(|(_, wt)| wt.clone())
            .collect();
        Ok(WorkflowView { workflow, tasks })
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowView>, StoreError> {
        let inner = self.inner.lock();
        let mut views: Vec<WorkflowView> = inner
            .workflows
            .values()
            .map(|workflow| WorkflowView {
                workflow: workflow.clone(),
                tasks: inner
                    .workflow_tasks
                    .range((workflow.workflow_id, i32::MIN)..=(workflow.workflow_id, i32::MAX))
                    .map(|(_, wt)| wt.clone())
                    .collect(),
            })
            .collect();
        views.sort_by(|a, b| a.workflow.name.cmp(&b.workflow.name));
        Ok(views)
    }

    async fn insert_workflow_task(&self, task: WorkflowTask) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if !inner.workflows.contains_key(&task.workflow_id) {
            return Err(StoreError::WorkflowNotFound(task.workflow_id));
        }
        let key = (task.workflow_id, task.task_order);
        if inner.workflow_tasks.contains_key(&key) {
            return Err(StoreError::validation(format!(
                "workflow {} already has a task at order {}",
                task.workflow_id, task.task_order
            )));
        }

        inner.workflow_tasks.insert(key, task.clone());
        if !inner.dense_order(task.workflow_id) {
            inner.workflow_tasks.remove(&key);
            return Err(StoreError::validation(format!(
                "workflow {} task orders must form a dense 1-based sequence",
                task.workflow_id
            )));
        }
        Ok(())
    }

    async fn update_workflow_task(
        &self,
        workflow_id: Uuid,
        task_order: i32,
        task_id: Uuid,
        parameters: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .workflow_tasks
            .get_mut(&(workflow_id, task_order))
            .ok_or_else(|| {
                StoreError::precondition(format!(
                    "workflow {workflow_id} has no task at order {task_order}"
                ))
            })?;
        entry.task_id = task_id;
        entry.parameters = parameters;
        Ok(())
    }

    async fn delete_workflow_task(
        &self,
        workflow_id: Uuid,
        task_order: i32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let key = (workflow_id, task_order);
        let removed = inner.workflow_tasks.remove(&key).ok_or_else(|| {
            StoreError::precondition(format!(
                "workflow {workflow_id} has no task at order {task_order}"
            ))
        })?;

        if !inner.dense_order(workflow_id) {
            inner.workflow_tasks.insert(key, removed);
            return Err(StoreError::validation(format!(
                "workflow {workflow_id} task orders must form a dense 1-based sequence"
            )));
        }
        Ok(())
    }

    async fn create_task_service(
        &self,
        name: &str,
        base_url: &str,
    ) -> Result<TaskService, StoreError> {
        if name.trim().is_empty() || base_url.trim().is_empty() {
            return Err(StoreError::validation(
                "task service name and base URL must not be blank",
            ));
        }
        let mut inner = self.inner.lock();
        if inner.services.values().any(|s| s.name == name) {
            return Err(StoreError::validation(format!(
                "task service name {name:?} already exists"
            )));
        }
        let service = TaskService {
            service_id: Uuid::now_v7(),
            name: name.to_string(),
            base_url: base_url.to_string(),
        };
        inner.services.insert(service.service_id, service.clone());
        Ok(service)
    }

    async fn create_task(&self, new: NewTask) -> Result<Task, StoreError> {
        if new.name.trim().is_empty() {
            return Err(StoreError::validation("task name must not be blank"));
        }
        let mut inner = self.inner.lock();
        if !inner.services.contains_key(&new.task_service_id) {
            return Err(StoreError::TaskServiceNotFound(new.task_service_id));
        }
        let task = Task {
            task_id: Uuid::now_v7(),
            name: new.name,
            description: new.description,
            task_service_id: new.task_service_id,
            url: new.url,
        };
        inner.tasks.insert(task.task_id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<TaskView, StoreError> {
        let inner = self.inner.lock();
        let task = inner
            .tasks
            .get(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        inner.task_view(task)
    }

    async fn list_tasks(&self) -> Result<Vec<TaskView>, StoreError> {
        let inner = self.inner.lock();
        let mut views = inner
            .tasks
            .values()
            .map(|task| inner.task_view(task))
            .collect::<Result<Vec<_>, _>>()?;
        views.sort_by(|a, b| a.task.name.cmp(&b.task.name));
        Ok(views)
    }
}

// ============================================================================
// RunStore
// ============================================================================

#[async_trait]
impl RunStore for MemoryEngineStore {
    async fn initialize_workflow_run(&self, workflow_id: Uuid) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.lock();
        inner.initialize_run(workflow_id)
    }

    async fn schedule_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock();
            let run = inner
                .runs
                .get(&workflow_run_id)
                .ok_or(StoreError::RunNotFound(workflow_run_id))?;
            if run.status != WorkflowRunStatus::Waiting {
                return Err(StoreError::precondition(format!(
                    "cannot schedule workflow run {workflow_run_id} in status {}",
                    run.status
                )));
            }
            inner.apply_run_status(
                workflow_run_id,
                WorkflowRunStatus::Scheduled,
                ProgressChange::Keep,
                false,
                &mut notifications,
            )?;
        }
        self.publish(notifications);
        Ok(())
    }

    async fn start_workflow_run(
        &self,
        workflow_run_id: Uuid,
        executor_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock();
            let run = inner
                .runs
                .get_mut(&workflow_run_id)
                .ok_or(StoreError::RunNotFound(workflow_run_id))?;
            if run.status != WorkflowRunStatus::Scheduled {
                return Err(StoreError::precondition(format!(
                    "cannot start workflow run {workflow_run_id} in status {}",
                    run.status
                )));
            }
            if run.executor_id.is_some() && run.executor_id != Some(executor_id) {
                return Err(StoreError::precondition(format!(
                    "workflow run {workflow_run_id} is owned by another executor"
                )));
            }
            let old_progress = run.progress;
            run.status = WorkflowRunStatus::Running;
            run.executor_id = Some(executor_id);
            run.progress = Some(0);
            if let Some(notification) =
                plan_progress_change(workflow_run_id, old_progress, Some(0))
            {
                notifications.push(notification);
            }
        }
        self.publish(notifications);
        Ok(())
    }

    async fn start_workflow_run_move(&self, workflow_run_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let queue = inner.queues.get_mut(&workflow_run_id).ok_or_else(|| {
            StoreError::precondition(format!(
                "workflow run {workflow_run_id} has no waiting task to move"
            ))
        })?;
        let bookmark = queue
            .values_mut()
            .find(|t| t.status == TaskStatus::Waiting)
            .ok_or_else(|| {
                StoreError::precondition(format!(
                    "workflow run {workflow_run_id} has no waiting task to move"
                ))
            })?;
        bookmark.status = TaskStatus::Paused;
        Ok(())
    }

    async fn complete_workflow_run_move(&self, workflow_run_id: Uuid) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock();
            let queue = inner.queues.get_mut(&workflow_run_id).ok_or_else(|| {
                StoreError::precondition(format!(
                    "workflow run {workflow_run_id} has no paused task to restore"
                ))
            })?;
            let bookmark = queue
                .values_mut()
                .find(|t| t.status == TaskStatus::Paused)
                .ok_or_else(|| {
                    StoreError::precondition(format!(
                        "workflow run {workflow_run_id} has no paused task to restore"
                    ))
                })?;
            bookmark.status = TaskStatus::Waiting;

            inner.apply_run_status(
                workflow_run_id,
                WorkflowRunStatus::Scheduled,
                ProgressChange::Keep,
                true,
                &mut notifications,
            )?;
        }
        self.publish(notifications);
        Ok(())
    }

    async fn cancel_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock();
            let run = inner
                .runs
                .get(&workflow_run_id)
                .ok_or(StoreError::RunNotFound(workflow_run_id))?;
            if !matches!(
                run.status,
                WorkflowRunStatus::Waiting | WorkflowRunStatus::Scheduled
            ) {
                return Err(StoreError::precondition(format!(
                    "cannot cancel workflow run {workflow_run_id} in status {}",
                    run.status
                )));
            }
            inner.apply_run_status(
                workflow_run_id,
                WorkflowRunStatus::Canceled,
                ProgressChange::Keep,
                true,
                &mut notifications,
            )?;
        }
        self.publish(notifications);
        Ok(())
    }

    async fn restart_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock();
            let run = inner
                .runs
                .get(&workflow_run_id)
                .ok_or(StoreError::RunNotFound(workflow_run_id))?;
            if run.status == WorkflowRunStatus::Running {
                return Err(StoreError::precondition(format!(
                    "cannot restart workflow run {workflow_run_id} while it is running"
                )));
            }
            inner.archive_and_reset(workflow_run_id, None);
            inner.apply_run_status(
                workflow_run_id,
                WorkflowRunStatus::Waiting,
                ProgressChange::Set(None),
                true,
                &mut notifications,
            )?;
        }
        self.publish(notifications);
        Ok(())
    }

    async fn complete_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.runs.contains_key(&workflow_run_id) {
                return Err(StoreError::RunNotFound(workflow_run_id));
            }
            let mut tally = TaskTally::default();
            if let Some(queue) = inner.queues.get(&workflow_run_id) {
                for entry in queue.values() {
                    tally.count(entry.status);
                }
            }
            let (new_status, new_progress) = settle_run(&tally);
            inner.apply_run_status(
                workflow_run_id,
                new_status,
                ProgressChange::Set(new_progress),
                true,
                &mut notifications,
            )?;
        }
        self.publish(notifications);
        Ok(())
    }

    async fn lease_next_workflow_run(
        &self,
        executor_id: Uuid,
    ) -> Result<Option<LeasedRun>, StoreError> {
        let inner = self.inner.lock();
        let leased = inner
            .runs
            .values()
            .find(|r| {
                r.status == WorkflowRunStatus::Scheduled
                    && (r.executor_id.is_none() || r.executor_id == Some(executor_id))
            })
            .map(|run| {
                let is_valid = inner
                    .queues
                    .get(&run.workflow_run_id)
                    .map(|queue| queue.values().all(|t| t.status.is_settled()))
                    .unwrap_or(true);
                LeasedRun {
                    run: run.clone(),
                    is_valid,
                }
            });
        Ok(leased)
    }

    async fn get_workflow_run(
        &self,
        workflow_run_id: Uuid,
    ) -> Result<WorkflowRunView, StoreError> {
        let inner = self.inner.lock();
        let run = inner
            .runs
            .get(&workflow_run_id)
            .ok_or(StoreError::RunNotFound(workflow_run_id))?
            .clone();
        let tasks = inner
            .queues
            .get(&workflow_run_id)
            .map(|queue| queue.values().cloned().collect())
            .unwrap_or_default();
        Ok(WorkflowRunView { run, tasks })
    }

    async fn list_workflow_runs(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowRunView>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .runs
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .map(|run| WorkflowRunView {
                run: run.clone(),
                tasks: inner
                    .queues
                    .get(&run.workflow_run_id)
                    .map(|queue| queue.values().cloned().collect())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn purge_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get(&workflow_run_id)
            .ok_or(StoreError::RunNotFound(workflow_run_id))?;
        if run.status.is_active() {
            return Err(StoreError::precondition(format!(
                "cannot purge workflow run {workflow_run_id} in status {}",
                run.status
            )));
        }
        if let Some(job_id) = inner.owning_job(workflow_run_id) {
            return Err(StoreError::precondition(format!(
                "job {job_id} still references workflow run {workflow_run_id}"
            )));
        }
        inner
            .archive
            .retain(|a| a.entry.workflow_run_id != workflow_run_id);
        inner.queues.remove(&workflow_run_id);
        inner.runs.remove(&workflow_run_id);
        Ok(())
    }

    async fn acquire_next_task(
        &self,
        workflow_run_id: Uuid,
    ) -> Result<Option<NextTask>, StoreError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(queue) = inner.queues.get_mut(&workflow_run_id) else {
            return Ok(None);
        };

        if queue.values().any(|t| t.status.blocks_run()) {
            return Ok(None);
        }
        let Some(entry) = queue.values_mut().find(|t| t.status == TaskStatus::Waiting) else {
            return Ok(None);
        };
        entry.status = TaskStatus::Running;
        entry.task_start = Some(Utc::now());

        let task_order = entry.task_order;
        let task_id = entry.task_id;
        let parameters = entry.parameters.clone();

        let task = inner
            .tasks
            .get(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        let service = inner
            .services
            .get(&task.task_service_id)
            .ok_or(StoreError::TaskServiceNotFound(task.task_service_id))?;

        Ok(Some(NextTask {
            workflow_run_id,
            task_order,
            task_id,
            parameters,
            url: effective_url(&service.base_url, &task.url),
        }))
    }

    async fn start_task_run(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .queues
            .get_mut(&workflow_run_id)
            .and_then(|queue| queue.get_mut(&task_order))
            .ok_or(StoreError::QueuedTaskNotFound {
                workflow_run_id,
                task_order,
            })?;
        match entry.status {
            TaskStatus::Waiting => {
                entry.status = TaskStatus::Running;
                entry.task_start = Some(Utc::now());
                Ok(())
            }
            TaskStatus::Running => Ok(()),
            status => Err(StoreError::precondition(format!(
                "cannot start task {task_order} of workflow run {workflow_run_id} in status {status}"
            ))),
        }
    }

    async fn complete_task_run(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
        is_paused: bool,
        output: Option<String>,
    ) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock();
            let entry = inner
                .queues
                .get_mut(&workflow_run_id)
                .and_then(|queue| queue.get_mut(&task_order))
                .ok_or(StoreError::QueuedTaskNotFound {
                    workflow_run_id,
                    task_order,
                })?;
            if entry.status != TaskStatus::Running {
                return Err(StoreError::precondition(format!(
                    "cannot complete task {task_order} of workflow run {workflow_run_id} in status {}",
                    entry.status
                )));
            }

            let terminal = task_terminal_status(any_rule_failed(entry.rules.as_deref()), is_paused);
            entry.status = terminal;
            entry.output = normalize_output(output);
            entry.task_end = Some(Utc::now());
            entry.progress = Some(100);

            inner.refresh_run_progress(workflow_run_id, &mut notifications)?;
        }
        self.publish(notifications);
        Ok(())
    }

    async fn fail_task_run(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
        message: &str,
    ) -> Result<(), StoreError> {
        if message.trim().is_empty() {
            return Err(StoreError::precondition("fail message must not be blank"));
        }
        let mut inner = self.inner.lock();
        let entry = inner
            .queues
            .get_mut(&workflow_run_id)
            .and_then(|queue| queue.get_mut(&task_order))
            .ok_or(StoreError::QueuedTaskNotFound {
                workflow_run_id,
                task_order,
            })?;
        if entry.status != TaskStatus::Running {
            return Err(StoreError::precondition(format!(
                "cannot fail task {task_order} of workflow run {workflow_run_id} in status {}",
                entry.status
            )));
        }
        entry.status = TaskStatus::Failed;
        entry.output = Some(message.to_string());
        entry.task_end = Some(Utc::now());
        Ok(())
    }

    async fn append_task_rule(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
        rule: TaskRule,
    ) -> Result<(), StoreError> {
        rule.validate()?;
        let mut inner = self.inner.lock();
        let entry = inner
            .queues
            .get_mut(&workflow_run_id)
            .and_then(|queue| queue.get_mut(&task_order))
            .ok_or(StoreError::QueuedTaskNotFound {
                workflow_run_id,
                task_order,
            })?;
        if entry.status != TaskStatus::Running {
            return Err(StoreError::precondition(format!(
                "cannot append a rule to task {task_order} of workflow run {workflow_run_id} in status {}",
                entry.status
            )));
        }
        entry.rules.get_or_insert_with(Vec::new).push(rule);
        Ok(())
    }

    async fn set_task_progress(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
        progress: i16,
    ) -> Result<(), StoreError> {
        if !(0..=100).contains(&progress) {
            return Err(StoreError::validation(
                "task progress must be between 0 and 100",
            ));
        }
        let mut inner = self.inner.lock();
        let entry = inner
            .queues
            .get_mut(&workflow_run_id)
            .and_then(|queue| queue.get_mut(&task_order))
            .ok_or(StoreError::QueuedTaskNotFound {
                workflow_run_id,
                task_order,
            })?;
        if entry.status != TaskStatus::Running {
            return Err(StoreError::precondition(format!(
                "cannot report progress for task {task_order} of workflow run {workflow_run_id} in status {}",
                entry.status
            )));
        }
        entry.progress = Some(progress);
        Ok(())
    }

    async fn complete_task(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
    ) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock();
            let entry = inner
                .queues
                .get_mut(&workflow_run_id)
                .and_then(|queue| queue.get_mut(&task_order))
                .ok_or(StoreError::QueuedTaskNotFound {
                    workflow_run_id,
                    task_order,
                })?;
            if entry.status != TaskStatus::Paused {
                return Err(StoreError::precondition(format!(
                    "cannot manually complete task {task_order} of workflow run {workflow_run_id} in status {}",
                    entry.status
                )));
            }
            entry.status = TaskStatus::Complete;

            inner.apply_run_status(
                workflow_run_id,
                WorkflowRunStatus::Scheduled,
                ProgressChange::Keep,
                false,
                &mut notifications,
            )?;
        }
        self.publish(notifications);
        Ok(())
    }

    async fn retry_task(&self, workflow_run_id: Uuid, task_order: i32) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock();
            let entry = inner
                .queues
                .get(&workflow_run_id)
                .and_then(|queue| queue.get(&task_order))
                .ok_or(StoreError::QueuedTaskNotFound {
                    workflow_run_id,
                    task_order,
                })?;
            if !matches!(entry.status, TaskStatus::Failed | TaskStatus::RuleBroken) {
                return Err(StoreError::precondition(format!(
                    "cannot retry task {task_order} of workflow run {workflow_run_id} in status {}",
                    entry.status
                )));
            }
            inner.archive_and_reset(workflow_run_id, Some(task_order));
            inner.apply_run_status(
                workflow_run_id,
                WorkflowRunStatus::Scheduled,
                ProgressChange::Keep,
                false,
                &mut notifications,
            )?;
        }
        self.publish(notifications);
        Ok(())
    }
}

// ============================================================================
// JobStore
// ============================================================================

#[async_trait]
impl JobStore for MemoryEngineStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        new.plan.validate()?;
        if new.maintainer.trim().is_empty() {
            return Err(StoreError::validation("job maintainer must not be blank"));
        }
        if new.next_run <= Utc::now() {
            return Err(StoreError::validation("job next run must be in the future"));
        }

        let job = Job {
            job_id: Uuid::now_v7(),
            workflow_id: new.workflow_id,
            maintainer: new.maintainer,
            plan: new.plan,
            is_paused: false,
            next_run: new.next_run,
            current_workflow_run_id: None,
        };
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.workflows.contains_key(&new.workflow_id) {
                return Err(StoreError::WorkflowNotFound(new.workflow_id));
            }
            inner.jobs.insert(job.job_id, job.clone());
            Self::notify_jobs(job.job_id, &mut notifications);
        }
        self.publish(notifications);
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<JobView, StoreError> {
        let inner = self.inner.lock();
        let job = inner
            .jobs
            .get(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        let workflow_name = inner
            .workflows
            .get(&job.workflow_id)
            .map(|w| w.name.clone())
            .unwrap_or_default();
        let current_run_status = job
            .current_workflow_run_id
            .and_then(|run_id| inner.runs.get(&run_id))
            .map(|run| run.status);
        Ok(JobView {
            job: job.clone(),
            workflow_name,
            current_run_status,
        })
    }

    async fn list_jobs(&self) -> Result<Vec<JobView>, StoreError> {
        let inner = self.inner.lock();
        let mut views: Vec<JobView> = inner
            .jobs
            .values()
            .map(|job| JobView {
                job: job.clone(),
                workflow_name: inner
                    .workflows
                    .get(&job.workflow_id)
                    .map(|w| w.name.clone())
                    .unwrap_or_default(),
                current_run_status: job
                    .current_workflow_run_id
                    .and_then(|run_id| inner.runs.get(&run_id))
                    .map(|run| run.status),
            })
            .collect();
        views.sort_by_key(|v| v.job.next_run);
        Ok(views)
    }

    async fn queued_jobs(&self) -> Result<Vec<QueuedJob>, StoreError> {
        let inner = self.inner.lock();
        let mut queued: Vec<QueuedJob> = inner
            .jobs
            .values()
            .filter(|job| {
                if job.is_paused {
                    return false;
                }
                match job.current_workflow_run_id {
                    None => true,
                    Some(run_id) => inner
                        .runs
                        .get(&run_id)
                        .is_some_and(|run| run.status == WorkflowRunStatus::Complete),
                }
            })
            .map(|job| QueuedJob {
                job_id: job.job_id,
                workflow_id: job.workflow_id,
                next_run: job.next_run,
            })
            .collect();
        queued.sort_by_key(|q| q.next_run);
        Ok(queued)
    }

    async fn run_job(&self, job_id: Uuid) -> Result<Uuid, StoreError> {
        let mut notifications = Vec::new();
        let workflow_run_id;
        {
            let mut inner = self.inner.lock();
            let job = inner
                .jobs
                .get(&job_id)
                .ok_or(StoreError::JobNotFound(job_id))?
                .clone();
            if job.is_paused {
                return Err(StoreError::precondition(format!("job {job_id} is paused")));
            }

            workflow_run_id = inner.initialize_run(job.workflow_id)?;
            let next_run = job.plan.advance(job.next_run, Utc::now())?;
            if let Some(job) = inner.jobs.get_mut(&job_id) {
                job.current_workflow_run_id = Some(workflow_run_id);
                job.next_run = next_run;
            }

            inner.apply_run_status(
                workflow_run_id,
                WorkflowRunStatus::Scheduled,
                ProgressChange::Keep,
                false,
                &mut notifications,
            )?;
            Self::notify_jobs(job_id, &mut notifications);
        }
        self.publish(notifications);
        Ok(workflow_run_id)
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<Option<String>, StoreError> {
        let mut notifications = Vec::new();
        let outcome;
        {
            let mut inner = self.inner.lock();
            let job = inner
                .jobs
                .get(&job_id)
                .ok_or(StoreError::JobNotFound(job_id))?;
            let Some(workflow_run_id) = job.current_workflow_run_id else {
                return Ok(None);
            };
            let status = inner
                .runs
                .get(&workflow_run_id)
                .ok_or(StoreError::RunNotFound(workflow_run_id))?
                .status;

            if status.is_active() {
                return Err(StoreError::precondition(format!(
                    "cannot complete job {job_id} while workflow run {workflow_run_id} is {status}"
                )));
            }

            let job = inner
                .jobs
                .get_mut(&job_id)
                .ok_or(StoreError::JobNotFound(job_id))?;
            outcome = if status == WorkflowRunStatus::Complete {
                job.current_workflow_run_id = None;
                job.is_paused = false;
                None
            } else {
                job.is_paused = true;
                Some(format!(
                    "workflow run {workflow_run_id} finished with status {status}; job paused"
                ))
            };
            Self::notify_jobs(job_id, &mut notifications);
        }
        self.publish(notifications);
        Ok(outcome)
    }

    async fn pause_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock();
            let job = inner
                .jobs
                .get_mut(&job_id)
                .ok_or(StoreError::JobNotFound(job_id))?;
            job.is_paused = true;
            Self::notify_jobs(job_id, &mut notifications);
        }
        self.publish(notifications);
        Ok(())
    }

    async fn resume_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock();
            let job = inner
                .jobs
                .get_mut(&job_id)
                .ok_or(StoreError::JobNotFound(job_id))?;
            job.is_paused = false;
            Self::notify_jobs(job_id, &mut notifications);
        }
        self.publish(notifications);
        Ok(())
    }
}

// ============================================================================
// ExecutorStore
// ============================================================================

#[async_trait]
impl ExecutorStore for MemoryEngineStore {
    async fn register_executor(&self) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.lock();
        inner.next_pid += 1;
        let pid = inner.next_pid;
        inner.live_pids.insert(pid);

        let executor = Executor {
            executor_id: Uuid::now_v7(),
            pid,
            username: "conveyor".to_string(),
            application_name: self
                .principal
                .clone()
                .unwrap_or_else(|| "conveyor".to_string()),
            client_addr: None,
            client_port: None,
            exec_start: Utc::now(),
            exec_end: None,
            status: ExecutorStatus::Active,
            error_message: None,
        };
        let executor_id = executor.executor_id;
        inner.executors.insert(executor_id, executor);
        Ok(executor_id)
    }

    async fn shutdown_executor(&self, executor_id: Uuid) -> Result<(), StoreError> {
        self.signal_executor(executor_id, ExecutorStatus::Shutdown, ExecutorSignal::Shutdown)
    }

    async fn cancel_executor(&self, executor_id: Uuid) -> Result<(), StoreError> {
        self.signal_executor(executor_id, ExecutorStatus::Canceled, ExecutorSignal::Cancel)
    }

    async fn close_executor(
        &self,
        executor_id: Uuid,
        is_cancelled: bool,
    ) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock();
            let executor = inner
                .executors
                .get_mut(&executor_id)
                .ok_or(StoreError::ExecutorNotFound(executor_id))?;
            executor.status = if is_cancelled {
                ExecutorStatus::Canceled
            } else {
                ExecutorStatus::Shutdown
            };
            executor.exec_end = Some(Utc::now());
            let pid = executor.pid;
            inner.live_pids.remove(&pid);

            inner.cancel_owned_runs(executor_id, &mut notifications)?;
            inner.repool_scheduled_runs(executor_id, &mut notifications)?;
        }
        self.publish(notifications);
        Ok(())
    }

    async fn clean_executors(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut notifications = Vec::new();
        let reaped;
        {
            let mut inner = self.inner.lock();
            let ghosts: Vec<Uuid> = inner
                .executors
                .values()
                .filter(|e| {
                    e.status == ExecutorStatus::Active && !inner.live_pids.contains(&e.pid)
                })
                .map(|e| e.executor_id)
                .collect();

            for executor_id in &ghosts {
                if let Some(executor) = inner.executors.get_mut(executor_id) {
                    executor.status = ExecutorStatus::Canceled;
                    executor.exec_end = Some(Utc::now());
                    executor.error_message = Some("executor session vanished".to_string());
                }
                inner.cancel_owned_runs(*executor_id, &mut notifications)?;
                inner.repool_scheduled_runs(*executor_id, &mut notifications)?;
            }
            reaped = ghosts;
        }
        self.publish(notifications);
        Ok(reaped)
    }

    async fn next_executor(&self) -> Result<Option<Uuid>, StoreError> {
        Ok(self.inner.lock().next_executor())
    }

    async fn get_executor(&self, executor_id: Uuid) -> Result<Executor, StoreError> {
        self.inner
            .lock()
            .executors
            .get(&executor_id)
            .cloned()
            .ok_or(StoreError::ExecutorNotFound(executor_id))
    }

    async fn list_executors(&self) -> Result<Vec<Executor>, StoreError> {
        let mut executors: Vec<Executor> = self.inner.lock().executors.values().cloned().collect();
        executors.sort_by_key(|e| e.exec_start);
        Ok(executors)
    }

    async fn list_active_executors(&self) -> Result<Vec<Executor>, StoreError> {
        let inner = self.inner.lock();
        let mut executors: Vec<Executor> = inner
            .executors
            .values()
            .filter(|e| e.status == ExecutorStatus::Active && inner.live_pids.contains(&e.pid))
            .cloned()
            .collect();
        executors.sort_by_key(|e| e.exec_start);
        Ok(executors)
    }
}

impl MemoryEngineStore {
    fn signal_executor(
        &self,
        executor_id: Uuid,
        status: ExecutorStatus,
        signal: ExecutorSignal,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            let executor = inner
                .executors
                .get_mut(&executor_id)
                .ok_or(StoreError::ExecutorNotFound(executor_id))?;
            if executor.status != ExecutorStatus::Active {
                return Err(StoreError::precondition(format!(
                    "executor {executor_id} is not active (status {})",
                    executor.status
                )));
            }
            executor.status = status;
        }
        self.publish(vec![Notification::new(
            Topic::ExecutorStatus(executor_id),
            signal.as_str(),
        )]);
        Ok(())
    }
}

// ============================================================================
// NotificationHub
// ============================================================================

struct MemorySubscription {
    rx: broadcast::Receiver<Notification>,
    topics: HashSet<Topic>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Result<Notification, StoreError> {
        loop {
            match self.rx.recv().await {
                Ok(notification) if self.topics.contains(&notification.topic) => {
                    return Ok(notification)
                }
                Ok(_) => continue,
                // Best-effort delivery: a lagged subscriber just misses some
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(StoreError::Subscription("store dropped".to_string()))
                }
            }
        }
    }
}

#[async_trait]
impl NotificationHub for MemoryEngineStore {
    async fn subscribe(&self, topics: &[Topic]) -> Result<Box<dyn Subscription>, StoreError> {
        Ok(Box::new(MemorySubscription {
            rx: self.notify_tx.subscribe(),
            topics: topics.iter().copied().collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn workflow_with_tasks(store: &MemoryEngineStore, count: i32) -> (Uuid, Vec<Uuid>) {
        let service = store
            .create_task_service("runner", "http://runner:8080")
            .await
            .unwrap();
        let workflow = store.create_workflow("nightly-load").await.unwrap();
        let mut task_ids = Vec::new();
        for order in 1..=count {
            let task = store
                .create_task(NewTask {
                    name: format!("step-{order}"),
                    description: String::new(),
                    task_service_id: service.service_id,
                    url: format!("/tasks/step-{order}"),
                })
                .await
                .unwrap();
            store
                .insert_workflow_task(WorkflowTask {
                    workflow_id: workflow.workflow_id,
                    task_order: order,
                    task_id: task.task_id,
                    parameters: None,
                })
                .await
                .unwrap();
            task_ids.push(task.task_id);
        }
        (workflow.workflow_id, task_ids)
    }

    #[tokio::test]
    async fn test_dense_order_enforced() {
        let store = MemoryEngineStore::new();
        let (workflow_id, task_ids) = workflow_with_tasks(&store, 2).await;

        // A gap is rejected
        let result = store
            .insert_workflow_task(WorkflowTask {
                workflow_id,
                task_order: 4,
                task_id: task_ids[0],
                parameters: None,
            })
            .await;
        assert!(matches!(result, Err(StoreError::Validation(_))));

        // Deleting from the middle is rejected, deleting the tail is fine
        let result = store.delete_workflow_task(workflow_id, 1).await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
        store.delete_workflow_task(workflow_id, 2).await.unwrap();

        let view = store.get_workflow(workflow_id).await.unwrap();
        assert_eq!(view.tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_rejects_deprecated_workflow() {
        let store = MemoryEngineStore::new();
        let old = store.create_workflow("load-v1").await.unwrap();
        let new = store.create_workflow("load-v2").await.unwrap();
        store
            .deprecate_workflow(old.workflow_id, Some(new.workflow_id))
            .await
            .unwrap();

        let err = store
            .initialize_workflow_run(old.workflow_id)
            .await
            .unwrap_err();
        match err {
            StoreError::Precondition(message) => {
                assert!(message.contains("deprecated"));
                assert!(message.contains("load-v2"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lease_skips_runs_owned_by_others() {
        let store = MemoryEngineStore::new();
        let (workflow_id, _) = workflow_with_tasks(&store, 1).await;
        let mine = store.register_executor().await.unwrap();
        let theirs = store.register_executor().await.unwrap();

        let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();
        store.schedule_workflow_run(run_id).await.unwrap();

        // The schedule transition assigned the least-loaded executor
        let run = store.get_workflow_run(run_id).await.unwrap().run;
        let owner = run.executor_id.unwrap();
        let (other, _owner_is_mine) = if owner == mine {
            (theirs, true)
        } else {
            (mine, false)
        };

        assert!(store.lease_next_workflow_run(other).await.unwrap().is_none());
        let leased = store.lease_next_workflow_run(owner).await.unwrap().unwrap();
        assert_eq!(leased.run.workflow_run_id, run_id);
        assert!(leased.is_valid);
    }

    #[tokio::test]
    async fn test_next_executor_prefers_least_loaded() {
        let store = MemoryEngineStore::new();
        let (workflow_id, _) = workflow_with_tasks(&store, 1).await;
        let first = store.register_executor().await.unwrap();
        let second = store.register_executor().await.unwrap();

        // Load the first executor with a running run
        let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();
        store.schedule_workflow_run(run_id).await.unwrap();
        let owner = store
            .get_workflow_run(run_id)
            .await
            .unwrap()
            .run
            .executor_id
            .unwrap();
        store.start_workflow_run(run_id, owner).await.unwrap();

        let next = store.next_executor().await.unwrap().unwrap();
        assert_eq!(next, if owner == first { second } else { first });
    }

    #[tokio::test]
    async fn test_dead_session_excluded_from_selection() {
        let store = MemoryEngineStore::new();
        let executor_id = store.register_executor().await.unwrap();
        assert_eq!(store.next_executor().await.unwrap(), Some(executor_id));

        store.kill_session(executor_id);
        assert_eq!(store.next_executor().await.unwrap(), None);
        assert!(store.list_active_executors().await.unwrap().is_empty());
    }
}
