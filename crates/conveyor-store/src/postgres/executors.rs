//! Executor registry and liveness

use async_trait::async_trait;
use sqlx::{Connection, PgConnection, Postgres, Transaction};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use conveyor_core::{
    Executor, ExecutorSignal, ExecutorStatus, Notification, Topic, WorkflowRunStatus,
    EXECUTOR_CANCELED_OUTPUT,
};

use crate::error::StoreError;
use crate::store::ExecutorStore;

use super::rows::{ExecutorRow, RunRow};
use super::{PgEngineStore, ProgressChange};

const EXECUTOR_SELECT: &str = r#"
    SELECT executor_id, pid, username, application_name, client_addr, client_port,
           exec_start, exec_end, status, error_message
    FROM executors
"#;

impl PgEngineStore {
    /// Cancel every Running run still owned by this executor, stamping its
    /// Running tasks with the fixed cancellation output
    async fn cancel_owned_runs(
        tx: &mut Transaction<'_, Postgres>,
        executor_id: Uuid,
    ) -> Result<(), StoreError> {
        let runs = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT workflow_run_id, workflow_id, status, executor_id, progress
            FROM workflow_runs
            WHERE executor_id = $1 AND status = 'Running'
            FOR UPDATE
            "#,
        )
        .bind(executor_id)
        .fetch_all(&mut **tx)
        .await?;

        for run in runs {
            sqlx::query(
                r#"
                UPDATE task_queue
                SET status = 'Canceled', task_end = now(), output = $2
                WHERE workflow_run_id = $1 AND status = 'Running'
                "#,
            )
            .bind(run.workflow_run_id)
            .bind(EXECUTOR_CANCELED_OUTPUT)
            .execute(&mut **tx)
            .await?;

            warn!(workflow_run_id = %run.workflow_run_id, %executor_id, "canceling orphaned workflow run");
            Self::apply_run_status(
                tx,
                &run,
                WorkflowRunStatus::Canceled,
                ProgressChange::Keep,
                true,
            )
            .await?;
        }
        Ok(())
    }

    /// Scheduled runs stamped with a gone executor would never be leased
    /// again; hand them back to the pool so the transition can pick a live
    /// executor.
    async fn repool_scheduled_runs(
        tx: &mut Transaction<'_, Postgres>,
        executor_id: Uuid,
    ) -> Result<(), StoreError> {
        let runs = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT workflow_run_id, workflow_id, status, executor_id, progress
            FROM workflow_runs
            WHERE executor_id = $1 AND status = 'Scheduled'
            FOR UPDATE
            "#,
        )
        .bind(executor_id)
        .fetch_all(&mut **tx)
        .await?;

        for run in runs {
            Self::apply_run_status(
                tx,
                &run,
                WorkflowRunStatus::Scheduled,
                ProgressChange::Keep,
                true,
            )
            .await?;
        }
        Ok(())
    }

    async fn lock_executor(
        tx: &mut Transaction<'_, Postgres>,
        executor_id: Uuid,
    ) -> Result<ExecutorRow, StoreError> {
        sqlx::query_as::<_, ExecutorRow>(&format!(
            "{EXECUTOR_SELECT} WHERE executor_id = $1 FOR UPDATE"
        ))
        .bind(executor_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::ExecutorNotFound(executor_id))
    }

    /// Flip an Active executor to a signaled status and publish the signal on
    /// its status topic
    async fn signal_executor(
        &self,
        executor_id: Uuid,
        status: ExecutorStatus,
        signal: ExecutorSignal,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let executor = Self::lock_executor(&mut tx, executor_id).await?;
        if executor.status != ExecutorStatus::Active.as_str() {
            return Err(StoreError::precondition(format!(
                "executor {executor_id} is not active (status {})",
                executor.status
            )));
        }

        sqlx::query("UPDATE executors SET status = $2 WHERE executor_id = $1")
            .bind(executor_id)
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?;
        Self::notify_in(
            &mut tx,
            &Notification::new(Topic::ExecutorStatus(executor_id), signal.as_str()),
        )
        .await?;
        tx.commit().await?;
        info!(%executor_id, signal = signal.as_str(), "signaled executor");
        Ok(())
    }
}

#[async_trait]
impl ExecutorStore for PgEngineStore {
    /// Registration anchors the executor to a dedicated database session;
    /// that session's backend pid is the liveness token. The connection is
    /// held until `close_executor` (or process death, which the reaper
    /// detects).
    #[instrument(skip(self))]
    async fn register_executor(&self) -> Result<Uuid, StoreError> {
        let mut conn = PgConnection::connect(self.database_url()).await?;

        let executor_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO executors (executor_id, pid, username, application_name,
                                   client_addr, client_port, exec_start, status)
            SELECT $1, a.pid, coalesce(a.usename::text, ''), coalesce(a.application_name, ''),
                   host(a.client_addr), a.client_port, now(), 'Active'
            FROM pg_stat_activity a
            WHERE a.pid = pg_backend_pid()
            "#,
        )
        .bind(executor_id)
        .execute(&mut conn)
        .await?;

        self.sessions().lock().insert(executor_id, conn);
        info!(%executor_id, "registered executor");
        Ok(executor_id)
    }

    async fn shutdown_executor(&self, executor_id: Uuid) -> Result<(), StoreError> {
        self.signal_executor(executor_id, ExecutorStatus::Shutdown, ExecutorSignal::Shutdown)
            .await
    }

    async fn cancel_executor(&self, executor_id: Uuid) -> Result<(), StoreError> {
        self.signal_executor(executor_id, ExecutorStatus::Canceled, ExecutorSignal::Cancel)
            .await
    }

    #[instrument(skip(self))]
    async fn close_executor(
        &self,
        executor_id: Uuid,
        is_cancelled: bool,
    ) -> Result<(), StoreError> {
        let terminal = if is_cancelled {
            ExecutorStatus::Canceled
        } else {
            ExecutorStatus::Shutdown
        };

        let mut tx = self.begin().await?;
        Self::lock_executor(&mut tx, executor_id).await?;
        sqlx::query(
            r#"
            UPDATE executors
            SET status = $2, exec_end = now()
            WHERE executor_id = $1
            "#,
        )
        .bind(executor_id)
        .bind(terminal.as_str())
        .execute(&mut *tx)
        .await?;

        Self::cancel_owned_runs(&mut tx, executor_id).await?;
        Self::repool_scheduled_runs(&mut tx, executor_id).await?;
        tx.commit().await?;

        // Release the session anchor; its pid disappears with the connection.
        self.sessions().lock().remove(&executor_id);
        info!(%executor_id, status = terminal.as_str(), "closed executor");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clean_executors(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut tx = self.begin().await?;
        let ghosts = sqlx::query_as::<_, ExecutorRow>(&format!(
            r#"
            {EXECUTOR_SELECT}
            WHERE status = 'Active'
              AND NOT EXISTS (SELECT 1 FROM pg_stat_activity a WHERE a.pid = executors.pid)
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .fetch_all(&mut *tx)
        .await?;

        let mut reaped = Vec::with_capacity(ghosts.len());
        for ghost in ghosts {
            sqlx::query(
                r#"
                UPDATE executors
                SET status = 'Canceled', exec_end = now(), error_message = $2
                WHERE executor_id = $1
                "#,
            )
            .bind(ghost.executor_id)
            .bind("executor session vanished")
            .execute(&mut *tx)
            .await?;

            Self::cancel_owned_runs(&mut tx, ghost.executor_id).await?;
            Self::repool_scheduled_runs(&mut tx, ghost.executor_id).await?;
            reaped.push(ghost.executor_id);
        }
        tx.commit().await?;

        if !reaped.is_empty() {
            warn!(count = reaped.len(), "reaped vanished executors");
        }
        Ok(reaped)
    }

    async fn next_executor(&self) -> Result<Option<Uuid>, StoreError> {
        let mut tx = self.begin().await?;
        let executor_id = Self::next_executor_in(&mut tx).await?;
        tx.commit().await?;
        debug!(?executor_id, "selected next executor");
        Ok(executor_id)
    }

    async fn get_executor(&self, executor_id: Uuid) -> Result<Executor, StoreError> {
        sqlx::query_as::<_, ExecutorRow>(&format!("{EXECUTOR_SELECT} WHERE executor_id = $1"))
            .bind(executor_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(StoreError::ExecutorNotFound(executor_id))?
            .into_domain()
    }

    async fn list_executors(&self) -> Result<Vec<Executor>, StoreError> {
        let rows =
            sqlx::query_as::<_, ExecutorRow>(&format!("{EXECUTOR_SELECT} ORDER BY exec_start"))
                .fetch_all(self.pool())
                .await?;
        rows.into_iter().map(ExecutorRow::into_domain).collect()
    }

    async fn list_active_executors(&self) -> Result<Vec<Executor>, StoreError> {
        let rows = sqlx::query_as::<_, ExecutorRow>(&format!(
            r#"
            {EXECUTOR_SELECT}
            WHERE status = 'Active'
              AND EXISTS (SELECT 1 FROM pg_stat_activity a WHERE a.pid = executors.pid)
            ORDER BY exec_start
            "#
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(ExecutorRow::into_domain).collect()
    }
}
