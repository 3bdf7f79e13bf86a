//! Workflow runs and task dispatch

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use conveyor_core::{
    any_rule_failed, effective_url, normalize_output, plan_progress_change, run_progress,
    settle_run, task_terminal_status, LeasedRun, NextTask, TaskStatus, TaskTally,
    WorkflowRunStatus, WorkflowRunView,
};

use crate::error::StoreError;
use crate::store::RunStore;

use super::rows::{RunRow, TaskRow};
use super::{PgEngineStore, ProgressChange};

/// Lease shape for `lease_next_workflow_run`
#[derive(Debug, sqlx::FromRow)]
struct LeasedRunRow {
    workflow_run_id: Uuid,
    workflow_id: Uuid,
    status: String,
    executor_id: Option<Uuid>,
    progress: Option<i16>,
    is_valid: bool,
}

impl PgEngineStore {
    /// Snapshot a template into a fresh run inside an open transaction.
    /// Shared by `initialize_workflow_run` and `run_job`.
    pub(crate) async fn initialize_run_in(
        tx: &mut Transaction<'_, Postgres>,
        workflow_id: Uuid,
    ) -> Result<Uuid, StoreError> {
        let workflow: Option<(String, bool, Option<Uuid>)> = sqlx::query_as(
            r#"
            SELECT name, is_deprecated, new_workflow
            FROM workflows
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&mut **tx)
        .await?;
        let (name, is_deprecated, new_workflow) =
            workflow.ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        if is_deprecated {
            let suggestion = match new_workflow {
                Some(successor) => {
                    let successor_name: Option<String> =
                        sqlx::query_scalar("SELECT name FROM workflows WHERE workflow_id = $1")
                            .bind(successor)
                            .fetch_optional(&mut **tx)
                            .await?;
                    format!(
                        "; use its successor {}",
                        successor_name.unwrap_or_else(|| successor.to_string())
                    )
                }
                None => String::new(),
            };
            return Err(StoreError::precondition(format!(
                "workflow {name:?} is deprecated{suggestion}"
            )));
        }

        let workflow_run_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (workflow_run_id, workflow_id, status)
            VALUES ($1, $2, 'Waiting')
            "#,
        )
        .bind(workflow_run_id)
        .bind(workflow_id)
        .execute(&mut **tx)
        .await?;

        // Fresh partition: the unit of locality and bulk purge for this run
        let partition = Self::partition_name(workflow_run_id);
        sqlx::query(&format!(
            "CREATE TABLE {partition} PARTITION OF task_queue FOR VALUES IN ('{workflow_run_id}')"
        ))
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO task_queue (workflow_run_id, task_order, task_id, parameters)
            SELECT $1, wt.task_order, wt.task_id, wt.parameters
            FROM workflow_tasks wt
            WHERE wt.workflow_id = $2
            ORDER BY wt.task_order
            "#,
        )
        .bind(workflow_run_id)
        .bind(workflow_id)
        .execute(&mut **tx)
        .await?;

        debug!(%workflow_run_id, %workflow_id, "initialized workflow run");
        Ok(workflow_run_id)
    }

    /// Fetch and lock one task-queue row
    async fn lock_task(
        tx: &mut Transaction<'_, Postgres>,
        workflow_run_id: Uuid,
        task_order: i32,
    ) -> Result<TaskRow, StoreError> {
        sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT workflow_run_id, task_order, task_id, status, parameters, output,
                   rules, task_start, task_end, progress
            FROM task_queue
            WHERE workflow_run_id = $1 AND task_order = $2
            FOR UPDATE
            "#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::QueuedTaskNotFound {
            workflow_run_id,
            task_order,
        })
    }

    /// Snapshot rows into the archive ahead of a reset
    async fn archive_tasks_in(
        tx: &mut Transaction<'_, Postgres>,
        workflow_run_id: Uuid,
        task_order: Option<i32>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO task_queue_archive (workflow_run_id, task_order, task_id, status,
                                            parameters, output, rules, task_start, task_end, progress)
            SELECT workflow_run_id, task_order, task_id, status,
                   parameters, output, rules, task_start, task_end, progress
            FROM task_queue
            WHERE workflow_run_id = $1 AND ($2::integer IS NULL OR task_order = $2)
            "#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Return archived rows to a runnable state
    async fn reset_tasks_in(
        tx: &mut Transaction<'_, Postgres>,
        workflow_run_id: Uuid,
        task_order: Option<i32>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Waiting', output = NULL, rules = NULL,
                task_start = NULL, task_end = NULL, progress = NULL
            WHERE workflow_run_id = $1 AND ($2::integer IS NULL OR task_order = $2)
            "#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Recompute the run's percent-complete and publish `wr_progress` when it
    /// actually changed
    async fn refresh_run_progress(
        tx: &mut Transaction<'_, Postgres>,
        workflow_run_id: Uuid,
    ) -> Result<(), StoreError> {
        let (complete, total): (i64, i64) = sqlx::query_as(
            r#"
            SELECT count(*) FILTER (WHERE status = 'Complete'), count(*)
            FROM task_queue
            WHERE workflow_run_id = $1
            "#,
        )
        .bind(workflow_run_id)
        .fetch_one(&mut **tx)
        .await?;
        let new_progress = run_progress(complete as usize, total as usize);

        let old_progress: Option<Option<i16>> = sqlx::query_scalar(
            r#"
            SELECT progress FROM workflow_runs WHERE workflow_run_id = $1 FOR UPDATE
            "#,
        )
        .bind(workflow_run_id)
        .fetch_optional(&mut **tx)
        .await?;
        let old_progress = old_progress.ok_or(StoreError::RunNotFound(workflow_run_id))?;

        if old_progress != new_progress {
            sqlx::query("UPDATE workflow_runs SET progress = $2 WHERE workflow_run_id = $1")
                .bind(workflow_run_id)
                .bind(new_progress)
                .execute(&mut **tx)
                .await?;
            if let Some(notification) =
                plan_progress_change(workflow_run_id, old_progress, new_progress)
            {
                Self::notify_in(tx, &notification).await?;
            }
        }
        Ok(())
    }

    async fn task_view_rows(
        &self,
        workflow_run_id: Uuid,
    ) -> Result<Vec<TaskRow>, StoreError> {
        Ok(sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT workflow_run_id, task_order, task_id, status, parameters, output,
                   rules, task_start, task_end, progress
            FROM task_queue
            WHERE workflow_run_id = $1
            ORDER BY task_order
            "#,
        )
        .bind(workflow_run_id)
        .fetch_all(self.pool())
        .await?)
    }
}

#[async_trait]
impl RunStore for PgEngineStore {
    #[instrument(skip(self))]
    async fn initialize_workflow_run(&self, workflow_id: Uuid) -> Result<Uuid, StoreError> {
        let mut tx = self.begin().await?;
        let workflow_run_id = Self::initialize_run_in(&mut tx, workflow_id).await?;
        tx.commit().await?;
        Ok(workflow_run_id)
    }

    #[instrument(skip(self))]
    async fn schedule_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let run = Self::lock_run(&mut tx, workflow_run_id).await?;
        if run.status != WorkflowRunStatus::Waiting.as_str() {
            return Err(StoreError::precondition(format!(
                "cannot schedule workflow run {workflow_run_id} in status {}",
                run.status
            )));
        }
        Self::apply_run_status(
            &mut tx,
            &run,
            WorkflowRunStatus::Scheduled,
            ProgressChange::Keep,
            false,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_workflow_run(
        &self,
        workflow_run_id: Uuid,
        executor_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let run = Self::lock_run(&mut tx, workflow_run_id).await?;
        if run.status != WorkflowRunStatus::Scheduled.as_str() {
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

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'Running', executor_id = $2, progress = 0
            WHERE workflow_run_id = $1 AND status = 'Scheduled'
            "#,
        )
        .bind(workflow_run_id)
        .bind(executor_id)
        .execute(&mut *tx)
        .await?;

        if let Some(notification) = plan_progress_change(workflow_run_id, run.progress, Some(0)) {
            Self::notify_in(&mut tx, &notification).await?;
        }
        tx.commit().await?;
        debug!(%workflow_run_id, %executor_id, "started workflow run");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_workflow_run_move(&self, workflow_run_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let task_order: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT task_order
            FROM task_queue
            WHERE workflow_run_id = $1 AND status = 'Waiting'
            ORDER BY task_order
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(workflow_run_id)
        .fetch_optional(&mut *tx)
        .await?;
        let task_order = task_order.ok_or_else(|| {
            StoreError::precondition(format!(
                "workflow run {workflow_run_id} has no waiting task to move"
            ))
        })?;

        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Paused'
            WHERE workflow_run_id = $1 AND task_order = $2 AND status = 'Waiting'
            "#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        debug!(%workflow_run_id, task_order, "bookmarked run for move");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn complete_workflow_run_move(&self, workflow_run_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let task_order: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT task_order
            FROM task_queue
            WHERE workflow_run_id = $1 AND status = 'Paused'
            ORDER BY task_order
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(workflow_run_id)
        .fetch_optional(&mut *tx)
        .await?;
        let task_order = task_order.ok_or_else(|| {
            StoreError::precondition(format!(
                "workflow run {workflow_run_id} has no paused task to restore"
            ))
        })?;

        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Waiting'
            WHERE workflow_run_id = $1 AND task_order = $2 AND status = 'Paused'
            "#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .execute(&mut *tx)
        .await?;

        // Back to the scheduled pool; the transition picks a new executor.
        let run = Self::lock_run(&mut tx, workflow_run_id).await?;
        Self::apply_run_status(
            &mut tx,
            &run,
            WorkflowRunStatus::Scheduled,
            ProgressChange::Keep,
            true,
        )
        .await?;
        tx.commit().await?;
        debug!(%workflow_run_id, "completed run move");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let run = Self::lock_run(&mut tx, workflow_run_id).await?;
        let status: WorkflowRunStatus = run.status.parse()?;
        if !matches!(
            status,
            WorkflowRunStatus::Waiting | WorkflowRunStatus::Scheduled
        ) {
            return Err(StoreError::precondition(format!(
                "cannot cancel workflow run {workflow_run_id} in status {status}"
            )));
        }
        Self::apply_run_status(
            &mut tx,
            &run,
            WorkflowRunStatus::Canceled,
            ProgressChange::Keep,
            true,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn restart_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let run = Self::lock_run(&mut tx, workflow_run_id).await?;
        if run.status == WorkflowRunStatus::Running.as_str() {
            return Err(StoreError::precondition(format!(
                "cannot restart workflow run {workflow_run_id} while it is running"
            )));
        }

        Self::archive_tasks_in(&mut tx, workflow_run_id, None).await?;
        Self::reset_tasks_in(&mut tx, workflow_run_id, None).await?;
        Self::apply_run_status(
            &mut tx,
            &run,
            WorkflowRunStatus::Waiting,
            ProgressChange::Set(None),
            true,
        )
        .await?;
        tx.commit().await?;
        debug!(%workflow_run_id, "restarted workflow run");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn complete_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let run = Self::lock_run(&mut tx, workflow_run_id).await?;

        let counts: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, count(*)
            FROM task_queue
            WHERE workflow_run_id = $1
            GROUP BY status
            "#,
        )
        .bind(workflow_run_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut tally = TaskTally::default();
        for (status, count) in counts {
            let status: TaskStatus = status.parse()?;
            for _ in 0..count {
                tally.count(status);
            }
        }

        let (new_status, new_progress) = settle_run(&tally);
        Self::apply_run_status(
            &mut tx,
            &run,
            new_status,
            ProgressChange::Set(new_progress),
            true,
        )
        .await?;
        tx.commit().await?;
        debug!(%workflow_run_id, status = %new_status, "completed workflow run");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn lease_next_workflow_run(
        &self,
        executor_id: Uuid,
    ) -> Result<Option<LeasedRun>, StoreError> {
        let row = sqlx::query_as::<_, LeasedRunRow>(
            r#"
            SELECT wr.workflow_run_id, wr.workflow_id, wr.status, wr.executor_id, wr.progress,
                   NOT EXISTS (
                       SELECT 1 FROM task_queue tq
                       WHERE tq.workflow_run_id = wr.workflow_run_id
                         AND tq.status NOT IN ('Waiting', 'Complete')
                   ) AS is_valid
            FROM workflow_runs wr
            WHERE wr.status = 'Scheduled'
              AND (wr.executor_id IS NULL OR wr.executor_id = $1)
            ORDER BY wr.workflow_run_id
            LIMIT 1
            FOR UPDATE OF wr SKIP LOCKED
            "#,
        )
        .bind(executor_id)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => {
                let is_valid = row.is_valid;
                let run = RunRow {
                    workflow_run_id: row.workflow_run_id,
                    workflow_id: row.workflow_id,
                    status: row.status,
                    executor_id: row.executor_id,
                    progress: row.progress,
                }
                .into_domain()?;
                Ok(Some(LeasedRun { run, is_valid }))
            }
            None => Ok(None),
        }
    }

    async fn get_workflow_run(
        &self,
        workflow_run_id: Uuid,
    ) -> Result<WorkflowRunView, StoreError> {
        let run = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT workflow_run_id, workflow_id, status, executor_id, progress
            FROM workflow_runs
            WHERE workflow_run_id = $1
            "#,
        )
        .bind(workflow_run_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or(StoreError::RunNotFound(workflow_run_id))?;

        let tasks = self
            .task_view_rows(workflow_run_id)
            .await?
            .into_iter()
            .map(TaskRow::into_domain)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(WorkflowRunView {
            run: run.into_domain()?,
            tasks,
        })
    }

    async fn list_workflow_runs(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowRunView>, StoreError> {
        let runs = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT workflow_run_id, workflow_id, status, executor_id, progress
            FROM workflow_runs
            WHERE workflow_id = $1
            ORDER BY workflow_run_id
            "#,
        )
        .bind(workflow_id)
        .fetch_all(self.pool())
        .await?;

        let mut views = Vec::with_capacity(runs.len());
        for run in runs {
            let tasks = self
                .task_view_rows(run.workflow_run_id)
                .await?
                .into_iter()
                .map(TaskRow::into_domain)
                .collect::<Result<Vec<_>, _>>()?;
            views.push(WorkflowRunView {
                run: run.into_domain()?,
                tasks,
            });
        }
        Ok(views)
    }

    #[instrument(skip(self))]
    async fn purge_workflow_run(&self, workflow_run_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let run = Self::lock_run(&mut tx, workflow_run_id).await?;
        let status: WorkflowRunStatus = run.status.parse()?;
        if status.is_active() {
            return Err(StoreError::precondition(format!(
                "cannot purge workflow run {workflow_run_id} in status {status}"
            )));
        }
        let owning_job: Option<Uuid> =
            sqlx::query_scalar("SELECT job_id FROM jobs WHERE current_workflow_run_id = $1")
                .bind(workflow_run_id)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(job_id) = owning_job {
            return Err(StoreError::precondition(format!(
                "job {job_id} still references workflow run {workflow_run_id}"
            )));
        }

        sqlx::query("DELETE FROM task_queue_archive WHERE workflow_run_id = $1")
            .bind(workflow_run_id)
            .execute(&mut *tx)
            .await?;
        let partition = Self::partition_name(workflow_run_id);
        sqlx::query(&format!("DROP TABLE IF EXISTS {partition}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workflow_runs WHERE workflow_run_id = $1")
            .bind(workflow_run_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(%workflow_run_id, "purged workflow run");
        Ok(())
    }

    // =========================================================================
    // Task dispatch
    // =========================================================================

    #[instrument(skip(self))]
    async fn acquire_next_task(
        &self,
        workflow_run_id: Uuid,
    ) -> Result<Option<NextTask>, StoreError> {
        let mut tx = self.begin().await?;

        // The serialization point within a run: no task is leased while a
        // sibling is Running, Paused, Failed or Rule Broken.
        let leased: Option<(i32, Uuid, Option<serde_json::Value>)> = sqlx::query_as(
            r#"
            SELECT tq.task_order, tq.task_id, tq.parameters
            FROM task_queue tq
            WHERE tq.workflow_run_id = $1
              AND tq.status = 'Waiting'
              AND NOT EXISTS (
                  SELECT 1 FROM task_queue blocked
                  WHERE blocked.workflow_run_id = $1
                    AND blocked.status IN ('Running', 'Paused', 'Failed', 'Rule Broken')
              )
            ORDER BY tq.task_order
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(workflow_run_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((task_order, task_id, parameters)) = leased else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Running', task_start = now()
            WHERE workflow_run_id = $1 AND task_order = $2 AND status = 'Waiting'
            "#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .execute(&mut *tx)
        .await?;

        let (url, base_url): (String, String) = sqlx::query_as(
            r#"
            SELECT t.url, s.base_url
            FROM tasks t
            JOIN task_services s ON s.service_id = t.task_service_id
            WHERE t.task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(%workflow_run_id, task_order, "acquired next task");
        Ok(Some(NextTask {
            workflow_run_id,
            task_order,
            task_id,
            parameters,
            url: effective_url(&base_url, &url),
        }))
    }

    #[instrument(skip(self))]
    async fn start_task_run(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Running', task_start = now()
            WHERE workflow_run_id = $1 AND task_order = $2 AND status = 'Waiting'
            "#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .execute(self.pool())
        .await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM task_queue WHERE workflow_run_id = $1 AND task_order = $2",
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .fetch_optional(self.pool())
        .await?;
        match status.as_deref() {
            None => Err(StoreError::QueuedTaskNotFound {
                workflow_run_id,
                task_order,
            }),
            // Replays land here: starting a Running task is a no-op
            Some("Running") => Ok(()),
            Some(status) => Err(StoreError::precondition(format!(
                "cannot start task {task_order} of workflow run {workflow_run_id} in status {status}"
            ))),
        }
    }

    #[instrument(skip(self, output))]
    async fn complete_task_run(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
        is_paused: bool,
        output: Option<String>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let task = Self::lock_task(&mut tx, workflow_run_id, task_order).await?;
        if task.status != TaskStatus::Running.as_str() {
            return Err(StoreError::precondition(format!(
                "cannot complete task {task_order} of workflow run {workflow_run_id} in status {}",
                task.status
            )));
        }

        let rules = task.parse_rules()?;
        let terminal = task_terminal_status(any_rule_failed(rules.as_deref()), is_paused);
        let output = normalize_output(output);

        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = $3, output = $4, task_end = now(), progress = 100
            WHERE workflow_run_id = $1 AND task_order = $2 AND status = 'Running'
            "#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .bind(terminal.as_str())
        .bind(&output)
        .execute(&mut *tx)
        .await?;

        Self::refresh_run_progress(&mut tx, workflow_run_id).await?;
        tx.commit().await?;
        debug!(%workflow_run_id, task_order, status = %terminal, "completed task run");
        Ok(())
    }

    #[instrument(skip(self, message))]
    async fn fail_task_run(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
        message: &str,
    ) -> Result<(), StoreError> {
        if message.trim().is_empty() {
            return Err(StoreError::precondition(
                "fail message must not be blank",
            ));
        }

        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Failed', output = $3, task_end = now()
            WHERE workflow_run_id = $1 AND task_order = $2 AND status = 'Running'
            "#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .bind(message)
        .execute(self.pool())
        .await?;
        if result.rows_affected() > 0 {
            debug!(%workflow_run_id, task_order, "failed task run");
            return Ok(());
        }

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM task_queue WHERE workflow_run_id = $1 AND task_order = $2",
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .fetch_optional(self.pool())
        .await?;
        match status {
            None => Err(StoreError::QueuedTaskNotFound {
                workflow_run_id,
                task_order,
            }),
            Some(status) => Err(StoreError::precondition(format!(
                "cannot fail task {task_order} of workflow run {workflow_run_id} in status {status}"
            ))),
        }
    }

    #[instrument(skip(self, rule), fields(rule_name = %rule.name))]
    async fn append_task_rule(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
        rule: conveyor_core::TaskRule,
    ) -> Result<(), StoreError> {
        rule.validate()?;

        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET rules = coalesce(rules, '[]'::jsonb) || $3
            WHERE workflow_run_id = $1 AND task_order = $2 AND status = 'Running'
            "#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .bind(serde_json::to_value(&rule)?)
        .execute(self.pool())
        .await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM task_queue WHERE workflow_run_id = $1 AND task_order = $2",
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .fetch_optional(self.pool())
        .await?;
        match status {
            None => Err(StoreError::QueuedTaskNotFound {
                workflow_run_id,
                task_order,
            }),
            Some(status) => Err(StoreError::precondition(format!(
                "cannot append a rule to task {task_order} of workflow run {workflow_run_id} in status {status}"
            ))),
        }
    }

    #[instrument(skip(self))]
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

        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET progress = $3
            WHERE workflow_run_id = $1 AND task_order = $2 AND status = 'Running'
            "#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .bind(progress)
        .execute(self.pool())
        .await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM task_queue WHERE workflow_run_id = $1 AND task_order = $2",
        )
        .bind(workflow_run_id)
        .bind(task_order)
        .fetch_optional(self.pool())
        .await?;
        match status {
            None => Err(StoreError::QueuedTaskNotFound {
                workflow_run_id,
                task_order,
            }),
            Some(status) => Err(StoreError::precondition(format!(
                "cannot report progress for task {task_order} of workflow run {workflow_run_id} in status {status}"
            ))),
        }
    }

    #[instrument(skip(self))]
    async fn complete_task(
        &self,
        workflow_run_id: Uuid,
        task_order: i32,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let task = Self::lock_task(&mut tx, workflow_run_id, task_order).await?;
        if task.status != TaskStatus::Paused.as_str() {
            return Err(StoreError::precondition(format!(
                "cannot manually complete task {task_order} of workflow run {workflow_run_id} in status {}",
                task.status
            )));
        }

        sqlx::query(
            r#"
            UPDATE task_queue
            SET status = 'Complete'
            WHERE workflow_run_id = $1 AND task_order = $2 AND status = 'Paused'
            "#,
        )
        .bind(workflow_run_id)
        .bind(task_order)
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
        tx.commit().await?;
        debug!(%workflow_run_id, task_order, "manually completed paused task");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn retry_task(&self, workflow_run_id: Uuid, task_order: i32) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let task = Self::lock_task(&mut tx, workflow_run_id, task_order).await?;
        let status: TaskStatus = task.status.parse()?;
        if !matches!(status, TaskStatus::Failed | TaskStatus::RuleBroken) {
            return Err(StoreError::precondition(format!(
                "cannot retry task {task_order} of workflow run {workflow_run_id} in status {status}"
            )));
        }

        Self::archive_tasks_in(&mut tx, workflow_run_id, Some(task_order)).await?;
        Self::reset_tasks_in(&mut tx, workflow_run_id, Some(task_order)).await?;

        let run = Self::lock_run(&mut tx, workflow_run_id).await?;
        Self::apply_run_status(
            &mut tx,
            &run,
            WorkflowRunStatus::Scheduled,
            ProgressChange::Keep,
            false,
        )
        .await?;
        tx.commit().await?;
        debug!(%workflow_run_id, task_order, "archived and reset task for retry");
        Ok(())
    }
}
