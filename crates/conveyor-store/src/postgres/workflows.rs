//! Workflow templates and the task/service registry

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use conveyor_core::{Task, TaskService, TaskView, Workflow, WorkflowTask, WorkflowView};

use crate::error::StoreError;
use crate::store::{NewTask, WorkflowStore};

use super::rows::{TaskDefRow, WorkflowRow, WorkflowTaskRow};
use super::PgEngineStore;

impl PgEngineStore {
    /// Reject any template mutation that leaves the workflow's task orders
    /// non-dense. Uniqueness of `(workflow_id, task_order)` is a table
    /// constraint, so dense == `min = 1` and `max = count`.
    async fn check_dense_order(
        tx: &mut Transaction<'_, Postgres>,
        workflow_id: Uuid,
    ) -> Result<(), StoreError> {
        let (n, lo, hi): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT count(*),
                   coalesce(min(task_order), 0)::bigint,
                   coalesce(max(task_order), 0)::bigint
            FROM workflow_tasks
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_one(&mut **tx)
        .await?;

        if n > 0 && (lo != 1 || hi != n) {
            return Err(StoreError::validation(format!(
                "workflow {workflow_id} task orders must form a dense 1-based sequence"
            )));
        }
        Ok(())
    }

    async fn workflow_tasks_of(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowTask>, StoreError> {
        let rows = sqlx::query_as::<_, WorkflowTaskRow>(
            r#"
            SELECT workflow_id, task_order, task_id, parameters
            FROM workflow_tasks
            WHERE workflow_id = $1
            ORDER BY task_order
            "#,
        )
        .bind(workflow_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(WorkflowTaskRow::into_domain).collect())
    }
}

#[async_trait]
impl WorkflowStore for PgEngineStore {
    #[instrument(skip(self))]
    async fn create_workflow(&self, name: &str) -> Result<Workflow, StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::validation("workflow name must not be blank"));
        }
        let workflow_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO workflows (workflow_id, name)
            VALUES ($1, $2)
            "#,
        )
        .bind(workflow_id)
        .bind(name)
        .execute(self.pool())
        .await
        .map_err(|e| Self::map_unique(e, &format!("workflow name {name:?} already exists")))?;

        debug!(%workflow_id, name, "created workflow");
        Ok(Workflow {
            workflow_id,
            name: name.to_string(),
            is_deprecated: false,
            new_workflow: None,
        })
    }

    #[instrument(skip(self))]
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
        if let Some(successor) = new_workflow {
            let exists: Option<Uuid> =
                sqlx::query_scalar("SELECT workflow_id FROM workflows WHERE workflow_id = $1")
                    .bind(successor)
                    .fetch_optional(self.pool())
                    .await?;
            if exists.is_none() {
                return Err(StoreError::WorkflowNotFound(successor));
            }
        }

        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET is_deprecated = true, new_workflow = $2
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .bind(new_workflow)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }
        debug!(%workflow_id, ?new_workflow, "deprecated workflow");
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowView, StoreError> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT workflow_id, name, is_deprecated, new_workflow
            FROM workflows
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let tasks = self.workflow_tasks_of(workflow_id).await?;
        Ok(WorkflowView {
            workflow: row.into_domain(),
            tasks,
        })
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowView>, StoreError> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT workflow_id, name, is_deprecated, new_workflow
            FROM workflows
            ORDER BY name
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            let tasks = self.workflow_tasks_of(row.workflow_id).await?;
            views.push(WorkflowView {
                workflow: row.into_domain(),
                tasks,
            });
        }
        Ok(views)
    }

    #[instrument(skip(self, task), fields(workflow_id = %task.workflow_id, task_order = task.task_order))]
    async fn insert_workflow_task(&self, task: WorkflowTask) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT workflow_id FROM workflows WHERE workflow_id = $1")
                .bind(task.workflow_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(StoreError::WorkflowNotFound(task.workflow_id));
        }

        sqlx::query(
            r#"
            INSERT INTO workflow_tasks (workflow_id, task_order, task_id, parameters)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(task.workflow_id)
        .bind(task.task_order)
        .bind(task.task_id)
        .bind(&task.parameters)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Self::map_unique(
                e,
                &format!(
                    "workflow {} already has a task at order {}",
                    task.workflow_id, task.task_order
                ),
            )
        })?;

        Self::check_dense_order(&mut tx, task.workflow_id).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, parameters))]
    async fn update_workflow_task(
        &self,
        workflow_id: Uuid,
        task_order: i32,
        task_id: Uuid,
        parameters: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_tasks
            SET task_id = $3, parameters = $4
            WHERE workflow_id = $1 AND task_order = $2
            "#,
        )
        .bind(workflow_id)
        .bind(task_order)
        .bind(task_id)
        .bind(&parameters)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::precondition(format!(
                "workflow {workflow_id} has no task at order {task_order}"
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_workflow_task(
        &self,
        workflow_id: Uuid,
        task_order: i32,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        let result = sqlx::query(
            r#"
            DELETE FROM workflow_tasks
            WHERE workflow_id = $1 AND task_order = $2
            "#,
        )
        .bind(workflow_id)
        .bind(task_order)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::precondition(format!(
                "workflow {workflow_id} has no task at order {task_order}"
            )));
        }

        Self::check_dense_order(&mut tx, workflow_id).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
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
        let service_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO task_services (service_id, name, base_url)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(service_id)
        .bind(name)
        .bind(base_url)
        .execute(self.pool())
        .await
        .map_err(|e| Self::map_unique(e, &format!("task service name {name:?} already exists")))?;

        Ok(TaskService {
            service_id,
            name: name.to_string(),
            base_url: base_url.to_string(),
        })
    }

    #[instrument(skip(self, new), fields(name = %new.name))]
    async fn create_task(&self, new: NewTask) -> Result<Task, StoreError> {
        if new.name.trim().is_empty() {
            return Err(StoreError::validation("task name must not be blank"));
        }
        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT service_id FROM task_services WHERE service_id = $1")
                .bind(new.task_service_id)
                .fetch_optional(self.pool())
                .await?;
        if exists.is_none() {
            return Err(StoreError::TaskServiceNotFound(new.task_service_id));
        }

        let task_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO tasks (task_id, name, description, task_service_id, url)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(task_id)
        .bind(&new.name)
        .bind(&new.description)
        .bind(new.task_service_id)
        .bind(&new.url)
        .execute(self.pool())
        .await?;

        Ok(Task {
            task_id,
            name: new.name,
            description: new.description,
            task_service_id: new.task_service_id,
            url: new.url,
        })
    }

    async fn get_task(&self, task_id: Uuid) -> Result<TaskView, StoreError> {
        let row = sqlx::query_as::<_, TaskDefRow>(
            r#"
            SELECT t.task_id, t.name, t.description, t.task_service_id, t.url,
                   s.name AS service_name, s.base_url
            FROM tasks t
            JOIN task_services s ON s.service_id = t.task_service_id
            WHERE t.task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or(StoreError::TaskNotFound(task_id))?;

        Ok(row.into_view())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskView>, StoreError> {
        let rows = sqlx::query_as::<_, TaskDefRow>(
            r#"
            SELECT t.task_id, t.name, t.description, t.task_service_id, t.url,
                   s.name AS service_name, s.base_url
            FROM tasks t
            JOIN task_services s ON s.service_id = t.task_service_id
            ORDER BY t.name
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(TaskDefRow::into_view).collect())
    }
}
