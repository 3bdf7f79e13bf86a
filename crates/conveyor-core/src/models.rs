//! Domain entities and read-model shapes
//!
//! These are the storage-agnostic forms shared by the store backends and the
//! runtime. Database row structs live with the PostgreSQL store; the view
//! structs here are the contract consumed by the portal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rule::TaskRule;
use crate::schedule::JobPlan;
use crate::status::{ExecutorStatus, TaskStatus, WorkflowRunStatus};

/// An immutable ordered template of task references
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: Uuid,
    pub name: String,
    pub is_deprecated: bool,
    /// Successor template suggested when this one is deprecated. Never
    /// followed during run initialization.
    pub new_workflow: Option<Uuid>,
}

/// One row of a workflow template. `task_order` is dense and 1-based per
/// workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub workflow_id: Uuid,
    pub task_order: i32,
    pub task_id: Uuid,
    pub parameters: Option<serde_json::Value>,
}

/// A remote service hosting task endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskService {
    pub service_id: Uuid,
    pub name: String,
    pub base_url: String,
}

/// A dispatchable task definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub name: String,
    pub description: String,
    pub task_service_id: Uuid,
    pub url: String,
}

/// Join a service base URL and a task path into the URL the executor invokes
pub fn effective_url(base_url: &str, url: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        url.trim_start_matches('/')
    )
}

/// A recurring job owning at most one non-terminal workflow run at a time
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: Uuid,
    pub workflow_id: Uuid,
    pub maintainer: String,
    pub plan: JobPlan,
    pub is_paused: bool,
    pub next_run: DateTime<Utc>,
    pub current_workflow_run_id: Option<Uuid>,
}

/// A stateful instance of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub workflow_run_id: Uuid,
    pub workflow_id: Uuid,
    pub status: WorkflowRunStatus,
    pub executor_id: Option<Uuid>,
    pub progress: Option<i16>,
}

/// Per-run, per-order state record for one task of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueEntry {
    pub workflow_run_id: Uuid,
    pub task_order: i32,
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub parameters: Option<serde_json::Value>,
    pub output: Option<String>,
    pub rules: Option<Vec<TaskRule>>,
    pub task_start: Option<DateTime<Utc>>,
    pub task_end: Option<DateTime<Utc>>,
    pub progress: Option<i16>,
}

/// A registered executor session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executor {
    pub executor_id: Uuid,
    pub pid: i32,
    pub username: String,
    pub application_name: String,
    pub client_addr: Option<String>,
    pub client_port: Option<i32>,
    pub exec_start: DateTime<Utc>,
    pub exec_end: Option<DateTime<Utc>>,
    pub status: ExecutorStatus,
    pub error_message: Option<String>,
}

/// Fixed output stamped on tasks canceled because their executor went away
pub const EXECUTOR_CANCELED_OUTPUT: &str = "Task executor canceled workflow run";

// ============================================================================
// Lease and dispatch shapes
// ============================================================================

/// Result of `lease_next_workflow_run`
#[derive(Debug, Clone)]
pub struct LeasedRun {
    pub run: WorkflowRun,
    /// True when no task of this run is outside `{Waiting, Complete}`. An
    /// invalid run is returned as-is; the caller decides how to settle it.
    pub is_valid: bool,
}

/// The unit of work handed to the executor's task loop
#[derive(Debug, Clone)]
pub struct NextTask {
    pub workflow_run_id: Uuid,
    pub task_order: i32,
    pub task_id: Uuid,
    pub parameters: Option<serde_json::Value>,
    /// Effective URL of the remote task service endpoint
    pub url: String,
}

// ============================================================================
// Read-model views
// ============================================================================

/// `v_workflow_runs`: a run together with its task-queue rows in order
#[derive(Debug, Clone)]
pub struct WorkflowRunView {
    pub run: WorkflowRun,
    pub tasks: Vec<TaskQueueEntry>,
}

/// `v_tasks`: a task joined to its service
#[derive(Debug, Clone)]
pub struct TaskView {
    pub task: Task,
    pub service_name: String,
    pub effective_url: String,
}

/// `v_workflows`: a template with its ordered task rows
#[derive(Debug, Clone)]
pub struct WorkflowView {
    pub workflow: Workflow,
    pub tasks: Vec<WorkflowTask>,
}

/// `v_jobs`: a job joined to its workflow and current-run status
#[derive(Debug, Clone)]
pub struct JobView {
    pub job: Job,
    pub workflow_name: String,
    pub current_run_status: Option<WorkflowRunStatus>,
}

/// `v_queued_jobs`: one due-set row
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub workflow_id: Uuid,
    pub next_run: DateTime<Utc>,
}

/// Workflow-run progress as a 0..=100 percentage
pub fn run_progress(complete_count: usize, total_count: usize) -> Option<i16> {
    if total_count == 0 {
        return None;
    }
    Some(((complete_count as f64 / total_count as f64) * 100.0).round() as i16)
}

/// Normalize an opaque output text: blank strings become null so stored
/// output is never blank when non-null.
pub fn normalize_output(output: Option<String>) -> Option<String> {
    output.filter(|o| !o.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_url_joins_on_single_slash() {
        assert_eq!(
            effective_url("http://svc:8080/", "/tasks/refresh"),
            "http://svc:8080/tasks/refresh"
        );
        assert_eq!(
            effective_url("http://svc:8080", "tasks/refresh"),
            "http://svc:8080/tasks/refresh"
        );
        assert_eq!(
            effective_url("http://svc:8080///", "///tasks/refresh"),
            "http://svc:8080/tasks/refresh"
        );
    }

    #[test]
    fn test_run_progress_rounds() {
        assert_eq!(run_progress(1, 2), Some(50));
        assert_eq!(run_progress(2, 2), Some(100));
        assert_eq!(run_progress(0, 2), Some(0));
        assert_eq!(run_progress(1, 3), Some(33));
        assert_eq!(run_progress(2, 3), Some(67));
        assert_eq!(run_progress(0, 0), None);
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output(None), None);
        assert_eq!(normalize_output(Some("  ".to_string())), None);
        assert_eq!(
            normalize_output(Some("done".to_string())),
            Some("done".to_string())
        );
    }
}
