//! Store error type

use uuid::Uuid;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow template not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Task definition not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Task service not found
    #[error("task service not found: {0}")]
    TaskServiceNotFound(Uuid),

    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Workflow run not found
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    /// Task queue row not found
    #[error("task {task_order} of workflow run {workflow_run_id} not found")]
    QueuedTaskNotFound {
        workflow_run_id: Uuid,
        task_order: i32,
    },

    /// Executor not found
    #[error("executor not found: {0}")]
    ExecutorNotFound(Uuid),

    /// Operation precondition not met; no state was changed
    #[error("{0}")]
    Precondition(String),

    /// An invariant or constraint would be violated; transaction aborted
    #[error("{0}")]
    Validation(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Notification subscription failure
    #[error("subscription error: {0}")]
    Subscription(String),
}

impl StoreError {
    /// Precondition failure with a formatted message
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Validation failure with a formatted message
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<conveyor_core::RuleError> for StoreError {
    fn from(e: conveyor_core::RuleError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<conveyor_core::ScheduleError> for StoreError {
    fn from(e: conveyor_core::ScheduleError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<conveyor_core::StatusParseError> for StoreError {
    fn from(e: conveyor_core::StatusParseError) -> Self {
        Self::Database(e.to_string())
    }
}
