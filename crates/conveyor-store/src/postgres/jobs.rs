//! Recurring jobs

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Postgres, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use conveyor_core::{
    Job, JobPlan, JobView, Notification, QueuedJob, Topic, WorkflowRunStatus,
};

use crate::error::StoreError;
use crate::store::{JobStore, NewJob};

use super::rows::{interval_from_duration, JobRow};
use super::{PgEngineStore, ProgressChange};

#[derive(Debug, sqlx::FromRow)]
struct JobViewRow {
    job_id: Uuid,
    workflow_id: Uuid,
    job_type: String,
    maintainer: String,
    is_paused: bool,
    job_interval: Option<sqlx::postgres::types::PgInterval>,
    job_schedule: Option<serde_json::Value>,
    next_run: chrono::DateTime<Utc>,
    current_workflow_run_id: Option<Uuid>,
    workflow_name: String,
    current_run_status: Option<String>,
}

impl JobViewRow {
    fn into_view(self) -> Result<JobView, StoreError> {
        let current_run_status = self
            .current_run_status
            .as_deref()
            .map(str::parse::<WorkflowRunStatus>)
            .transpose()?;
        let job = JobRow {
            job_id: self.job_id,
            workflow_id: self.workflow_id,
            job_type: self.job_type,
            maintainer: self.maintainer,
            is_paused: self.is_paused,
            job_interval: self.job_interval,
            job_schedule: self.job_schedule,
            next_run: self.next_run,
            current_workflow_run_id: self.current_workflow_run_id,
        }
        .into_domain()?;
        Ok(JobView {
            job,
            workflow_name: self.workflow_name,
            current_run_status,
        })
    }
}

const JOB_VIEW_SELECT: &str = r#"
    SELECT j.job_id, j.workflow_id, j.job_type, j.maintainer, j.is_paused,
           j.job_interval, j.job_schedule, j.next_run, j.current_workflow_run_id,
           w.name AS workflow_name, wr.status AS current_run_status
    FROM jobs j
    JOIN workflows w ON w.workflow_id = j.workflow_id
    LEFT JOIN workflow_runs wr ON wr.workflow_run_id = j.current_workflow_run_id
"#;

impl PgEngineStore {
    /// Fetch and lock one job row. This is a plain blocking lock: job-level
    /// operations serialize rather than skip.
    async fn lock_job(
        tx: &mut Transaction<'_, Postgres>,
        job_id: Uuid,
    ) -> Result<JobRow, StoreError> {
        sqlx::query_as::<_, JobRow>(
            r#"
            SELECT job_id, workflow_id, job_type, maintainer, is_paused,
                   job_interval, job_schedule, next_run, current_workflow_run_id
            FROM jobs
            WHERE job_id = $1
            FOR UPDATE
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn notify_jobs(
        tx: &mut Transaction<'_, Postgres>,
        job_id: Uuid,
    ) -> Result<(), StoreError> {
        Self::notify_in(tx, &Notification::new(Topic::Jobs, job_id.to_string())).await
    }
}

#[async_trait]
impl JobStore for PgEngineStore {
    #[instrument(skip(self, new), fields(workflow_id = %new.workflow_id))]
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        new.plan.validate()?;
        if new.maintainer.trim().is_empty() {
            return Err(StoreError::validation("job maintainer must not be blank"));
        }
        if new.next_run <= Utc::now() {
            return Err(StoreError::validation("job next run must be in the future"));
        }

        let (job_interval, job_schedule) = match &new.plan {
            JobPlan::Interval(interval) => (Some(interval_from_duration(*interval)), None),
            JobPlan::Weekly(entries) => (None, Some(serde_json::to_value(entries)?)),
        };

        let job_id = Uuid::now_v7();
        let mut tx = self.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO jobs (job_id, workflow_id, job_type, maintainer, job_interval,
                              job_schedule, next_run)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job_id)
        .bind(new.workflow_id)
        .bind(new.plan.job_type().as_str())
        .bind(&new.maintainer)
        .bind(&job_interval)
        .bind(&job_schedule)
        .bind(new.next_run)
        .execute(&mut *tx)
        .await?;
        Self::notify_jobs(&mut tx, job_id).await?;
        tx.commit().await?;

        debug!(%job_id, job_type = %new.plan.job_type(), "created job");
        Ok(Job {
            job_id,
            workflow_id: new.workflow_id,
            maintainer: new.maintainer,
            plan: new.plan,
            is_paused: false,
            next_run: new.next_run,
            current_workflow_run_id: None,
        })
    }

    async fn get_job(&self, job_id: Uuid) -> Result<JobView, StoreError> {
        let row = sqlx::query_as::<_, JobViewRow>(&format!("{JOB_VIEW_SELECT} WHERE j.job_id = $1"))
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        row.into_view()
    }

    async fn list_jobs(&self) -> Result<Vec<JobView>, StoreError> {
        let rows =
            sqlx::query_as::<_, JobViewRow>(&format!("{JOB_VIEW_SELECT} ORDER BY j.next_run"))
                .fetch_all(self.pool())
                .await?;
        rows.into_iter().map(JobViewRow::into_view).collect()
    }

    async fn queued_jobs(&self) -> Result<Vec<QueuedJob>, StoreError> {
        let rows: Vec<(Uuid, Uuid, chrono::DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT j.job_id, j.workflow_id, j.next_run
            FROM jobs j
            LEFT JOIN workflow_runs wr ON wr.workflow_run_id = j.current_workflow_run_id
            WHERE NOT j.is_paused
              AND (j.current_workflow_run_id IS NULL OR wr.status = 'Complete')
            ORDER BY j.next_run
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(job_id, workflow_id, next_run)| QueuedJob {
                job_id,
                workflow_id,
                next_run,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn run_job(&self, job_id: Uuid) -> Result<Uuid, StoreError> {
        let mut tx = self.begin().await?;
        let job = Self::lock_job(&mut tx, job_id).await?;
        if job.is_paused {
            return Err(StoreError::precondition(format!("job {job_id} is paused")));
        }
        let plan = job.plan()?;

        let workflow_run_id = Self::initialize_run_in(&mut tx, job.workflow_id).await?;
        let next_run = plan.advance(job.next_run, Utc::now())?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET current_workflow_run_id = $2, next_run = $3
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(workflow_run_id)
        .bind(next_run)
        .execute(&mut *tx)
        .await?;

        let run = Self::lock_run(&mut tx, workflow_run_id).await?;
        Self::apply_run_status(
            &mut tx,
            &run,
            WorkflowRunStatus::Scheduled,
            ProgressChange::Keep,
            false,
        )
        .await?;

        Self::notify_jobs(&mut tx, job_id).await?;
        tx.commit().await?;
        debug!(%job_id, %workflow_run_id, %next_run, "fired job");
        Ok(workflow_run_id)
    }

    #[instrument(skip(self))]
    async fn complete_job(&self, job_id: Uuid) -> Result<Option<String>, StoreError> {
        let mut tx = self.begin().await?;
        let job = Self::lock_job(&mut tx, job_id).await?;

        let Some(workflow_run_id) = job.current_workflow_run_id else {
            return Ok(None);
        };
        let run = Self::lock_run(&mut tx, workflow_run_id).await?;
        let status: WorkflowRunStatus = run.status.parse()?;

        if status.is_active() {
            return Err(StoreError::precondition(format!(
                "cannot complete job {job_id} while workflow run {workflow_run_id} is {status}"
            )));
        }

        let outcome = if status == WorkflowRunStatus::Complete {
            sqlx::query(
                r#"
                UPDATE jobs
                SET current_workflow_run_id = NULL, is_paused = false
                WHERE job_id = $1
                "#,
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
            None
        } else {
            sqlx::query("UPDATE jobs SET is_paused = true WHERE job_id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            Some(format!(
                "workflow run {workflow_run_id} finished with status {status}; job paused"
            ))
        };

        Self::notify_jobs(&mut tx, job_id).await?;
        tx.commit().await?;
        debug!(%job_id, settled = outcome.is_none(), "settled job");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn pause_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let result = sqlx::query("UPDATE jobs SET is_paused = true WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Self::notify_jobs(&mut tx, job_id).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resume_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let result = sqlx::query("UPDATE jobs SET is_paused = false WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Self::notify_jobs(&mut tx, job_id).await?;
        tx.commit().await?;
        Ok(())
    }
}
