//! Database row structs (internal, converted to the domain shapes)

use chrono::{DateTime, Utc};
use sqlx::postgres::types::PgInterval;
use sqlx::FromRow;
use uuid::Uuid;

use conveyor_core::{
    effective_url, Executor, Job, JobPlan, JobType, ScheduleEntry, Task, TaskQueueEntry, TaskRule,
    TaskView, Workflow, WorkflowRun, WorkflowTask,
};

use crate::error::StoreError;

#[derive(Debug, Clone, FromRow)]
pub(crate) struct WorkflowRow {
    pub workflow_id: Uuid,
    pub name: String,
    pub is_deprecated: bool,
    pub new_workflow: Option<Uuid>,
}

impl WorkflowRow {
    pub fn into_domain(self) -> Workflow {
        Workflow {
            workflow_id: self.workflow_id,
            name: self.name,
            is_deprecated: self.is_deprecated,
            new_workflow: self.new_workflow,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct WorkflowTaskRow {
    pub workflow_id: Uuid,
    pub task_order: i32,
    pub task_id: Uuid,
    pub parameters: Option<serde_json::Value>,
}

impl WorkflowTaskRow {
    pub fn into_domain(self) -> WorkflowTask {
        WorkflowTask {
            workflow_id: self.workflow_id,
            task_order: self.task_order,
            task_id: self.task_id,
            parameters: self.parameters,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct TaskDefRow {
    pub task_id: Uuid,
    pub name: String,
    pub description: String,
    pub task_service_id: Uuid,
    pub url: String,
    pub service_name: String,
    pub base_url: String,
}

impl TaskDefRow {
    pub fn into_view(self) -> TaskView {
        let effective_url = effective_url(&self.base_url, &self.url);
        TaskView {
            task: Task {
                task_id: self.task_id,
                name: self.name,
                description: self.description,
                task_service_id: self.task_service_id,
                url: self.url,
            },
            service_name: self.service_name,
            effective_url,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct RunRow {
    pub workflow_run_id: Uuid,
    pub workflow_id: Uuid,
    pub status: String,
    pub executor_id: Option<Uuid>,
    pub progress: Option<i16>,
}

impl RunRow {
    pub fn into_domain(self) -> Result<WorkflowRun, StoreError> {
        Ok(WorkflowRun {
            workflow_run_id: self.workflow_run_id,
            workflow_id: self.workflow_id,
            status: self.status.parse()?,
            executor_id: self.executor_id,
            progress: self.progress,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct TaskRow {
    pub workflow_run_id: Uuid,
    pub task_order: i32,
    pub task_id: Uuid,
    pub status: String,
    pub parameters: Option<serde_json::Value>,
    pub output: Option<String>,
    pub rules: Option<serde_json::Value>,
    pub task_start: Option<DateTime<Utc>>,
    pub task_end: Option<DateTime<Utc>>,
    pub progress: Option<i16>,
}

impl TaskRow {
    pub fn parse_rules(&self) -> Result<Option<Vec<TaskRule>>, StoreError> {
        Ok(self
            .rules
            .clone()
            .map(serde_json::from_value)
            .transpose()?)
    }

    pub fn into_domain(self) -> Result<TaskQueueEntry, StoreError> {
        let rules = self.parse_rules()?;
        Ok(TaskQueueEntry {
            workflow_run_id: self.workflow_run_id,
            task_order: self.task_order,
            task_id: self.task_id,
            status: self.status.parse()?,
            parameters: self.parameters,
            output: self.output,
            rules,
            task_start: self.task_start,
            task_end: self.task_end,
            progress: self.progress,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ExecutorRow {
    pub executor_id: Uuid,
    pub pid: i32,
    pub username: String,
    pub application_name: String,
    pub client_addr: Option<String>,
    pub client_port: Option<i32>,
    pub exec_start: DateTime<Utc>,
    pub exec_end: Option<DateTime<Utc>>,
    pub status: String,
    pub error_message: Option<String>,
}

impl ExecutorRow {
    pub fn into_domain(self) -> Result<Executor, StoreError> {
        Ok(Executor {
            executor_id: self.executor_id,
            pid: self.pid,
            username: self.username,
            application_name: self.application_name,
            client_addr: self.client_addr,
            client_port: self.client_port,
            exec_start: self.exec_start,
            exec_end: self.exec_end,
            status: self.status.parse()?,
            error_message: self.error_message,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct JobRow {
    pub job_id: Uuid,
    pub workflow_id: Uuid,
    pub job_type: String,
    pub maintainer: String,
    pub is_paused: bool,
    pub job_interval: Option<PgInterval>,
    pub job_schedule: Option<serde_json::Value>,
    pub next_run: DateTime<Utc>,
    pub current_workflow_run_id: Option<Uuid>,
}

impl JobRow {
    pub fn plan(&self) -> Result<JobPlan, StoreError> {
        let job_type: JobType = self.job_type.parse()?;
        match job_type {
            JobType::Interval => {
                let interval = self.job_interval.as_ref().ok_or_else(|| {
                    StoreError::Database(format!("interval job {} has no interval", self.job_id))
                })?;
                Ok(JobPlan::Interval(duration_from_interval(interval)))
            }
            JobType::Scheduled => {
                let schedule = self.job_schedule.clone().ok_or_else(|| {
                    StoreError::Database(format!("scheduled job {} has no schedule", self.job_id))
                })?;
                let entries: Vec<ScheduleEntry> = serde_json::from_value(schedule)?;
                Ok(JobPlan::Weekly(entries))
            }
        }
    }

    pub fn into_domain(self) -> Result<Job, StoreError> {
        let plan = self.plan()?;
        Ok(Job {
            job_id: self.job_id,
            workflow_id: self.workflow_id,
            maintainer: self.maintainer,
            plan,
            is_paused: self.is_paused,
            next_run: self.next_run,
            current_workflow_run_id: self.current_workflow_run_id,
        })
    }
}

/// Interval bindings: schedules never carry calendar months, so a month read
/// back from the store is treated as 30 days.
pub(crate) fn interval_from_duration(d: chrono::Duration) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: d.num_microseconds().unwrap_or(i64::MAX),
    }
}

pub(crate) fn duration_from_interval(i: &PgInterval) -> chrono::Duration {
    chrono::Duration::microseconds(i.microseconds)
        + chrono::Duration::days(i.days as i64 + i.months as i64 * 30)
}
