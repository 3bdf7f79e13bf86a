//! PostgreSQL implementation of the store trait family
//!
//! All cross-process guarantees come from row-level locks: leases use
//! `FOR UPDATE SKIP LOCKED`, status transitions are single conditional
//! statements, and compound operations run in one transaction. Topic
//! notifications are `pg_notify` calls issued inside the mutating
//! transaction so delivery rides the commit.

mod executors;
mod jobs;
mod listener;
mod rows;
mod runs;
mod workflows;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use conveyor_core::{
    plan_progress_change, plan_status_change, Notification, RunSnapshot, WorkflowRunStatus,
};

use crate::error::StoreError;
pub(crate) use crate::ProgressChange;
use rows::RunRow;

/// PostgreSQL-backed engine store
///
/// Cheap to clone; clones share the connection pool and the executor session
/// anchors. Registered executors are anchored to a dedicated connection whose
/// backend pid is the liveness token consulted by `clean_executors` and
/// `next_executor`.
///
/// # Example
///
/// ```ignore
/// use conveyor_store::PgEngineStore;
///
/// let store = PgEngineStore::connect("postgres://localhost/conveyor").await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PgEngineStore {
    pool: PgPool,
    database_url: String,
    principal: Option<String>,
    sessions: Arc<Mutex<HashMap<Uuid, PgConnection>>>,
}

impl PgEngineStore {
    /// Connect a new store to the given database
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool, database_url))
    }

    /// Wrap an existing pool. The URL is kept for executor session anchors
    /// and notification listeners, which need dedicated connections.
    pub fn new(pool: PgPool, database_url: &str) -> Self {
        Self {
            pool,
            database_url: database_url.to_string(),
            principal: None,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Label mutations from this handle with an acting principal, propagated
    /// to the audit trail as a transaction-local setting.
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Apply embedded migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn database_url(&self) -> &str {
        &self.database_url
    }

    pub(crate) fn sessions(&self) -> &Mutex<HashMap<Uuid, PgConnection>> {
        &self.sessions
    }

    /// Drop an executor's session anchor without closing the executor. The
    /// backing pid disappears and only `clean_executors` can recover its
    /// work; used to exercise the reaper.
    pub fn drop_session_anchor(&self, executor_id: Uuid) {
        self.sessions.lock().remove(&executor_id);
    }

    /// Begin a transaction, stamping the acting principal when one is set
    pub(crate) async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await?;
        if let Some(principal) = &self.principal {
            sqlx::query("SELECT set_config('conveyor.principal', $1, true)")
                .bind(principal)
                .execute(&mut *tx)
                .await?;
        }
        Ok(tx)
    }

    /// Publish a notification inside the transaction; subscribers present at
    /// commit receive it.
    pub(crate) async fn notify_in(
        tx: &mut Transaction<'_, Postgres>,
        notification: &Notification,
    ) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(notification.topic.channel())
            .bind(&notification.payload)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Fetch and lock one run row
    pub(crate) async fn lock_run(
        tx: &mut Transaction<'_, Postgres>,
        workflow_run_id: Uuid,
    ) -> Result<RunRow, StoreError> {
        sqlx::query_as::<_, RunRow>(
            r#"
            SELECT workflow_run_id, workflow_id, status, executor_id, progress
            FROM workflow_runs
            WHERE workflow_run_id = $1
            FOR UPDATE
            "#,
        )
        .bind(workflow_run_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::RunNotFound(workflow_run_id))
    }

    /// Move a locked run to `new_status`, applying the transition plan: an
    /// executor is auto-assigned on a transition to Scheduled while the run
    /// is unowned, the old owner is told about cancellation, and a terminal
    /// status settles the owning job. `clear_executor` releases ownership as
    /// part of the transition.
    pub(crate) async fn apply_run_status(
        tx: &mut Transaction<'_, Postgres>,
        run: &RunRow,
        new_status: WorkflowRunStatus,
        progress: ProgressChange,
        clear_executor: bool,
    ) -> Result<(), StoreError> {
        let owning_job: Option<Uuid> =
            sqlx::query_scalar("SELECT job_id FROM jobs WHERE current_workflow_run_id = $1")
                .bind(run.workflow_run_id)
                .fetch_optional(&mut **tx)
                .await?;

        // A hand-off releases ownership before re-entering Scheduled, so the
        // planner sees an unowned run and picks a fresh executor.
        let owner_for_plan = if clear_executor && new_status == WorkflowRunStatus::Scheduled {
            None
        } else {
            run.executor_id
        };
        let candidate = if new_status == WorkflowRunStatus::Scheduled && owner_for_plan.is_none() {
            Self::next_executor_in(tx).await?
        } else {
            None
        };

        let snapshot = RunSnapshot {
            workflow_run_id: run.workflow_run_id,
            status: run.status.parse()?,
            executor_id: owner_for_plan,
            owning_job,
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

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2, executor_id = $3, progress = $4
            WHERE workflow_run_id = $1
            "#,
        )
        .bind(run.workflow_run_id)
        .bind(new_status.as_str())
        .bind(new_executor)
        .bind(new_progress)
        .execute(&mut **tx)
        .await?;

        for notification in &plan.notifications {
            Self::notify_in(tx, notification).await?;
        }
        if let Some(notification) =
            plan_progress_change(run.workflow_run_id, run.progress, new_progress)
        {
            Self::notify_in(tx, &notification).await?;
        }

        Ok(())
    }

    /// Least-loaded live executor inside a transaction
    pub(crate) async fn next_executor_in(
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<Option<Uuid>, StoreError> {
        let executor_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT e.executor_id
            FROM executors e
            WHERE e.status = 'Active'
              AND EXISTS (SELECT 1 FROM pg_stat_activity a WHERE a.pid = e.pid)
            ORDER BY (
                SELECT count(*)
                FROM workflow_runs wr
                WHERE wr.executor_id = e.executor_id
                  AND wr.status IN ('Scheduled', 'Running')
            ), e.exec_start
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut **tx)
        .await?;
        Ok(executor_id)
    }

    /// Name of a run's task-queue partition
    pub(crate) fn partition_name(workflow_run_id: Uuid) -> String {
        format!("task_queue_{}", workflow_run_id.simple())
    }

    /// Map a unique-constraint violation to a validation error
    pub(crate) fn map_unique(e: sqlx::Error, message: &str) -> StoreError {
        if let sqlx::Error::Database(db) = &e {
            if db.code().as_deref() == Some("23505") {
                return StoreError::validation(message);
            }
        }
        e.into()
    }
}
