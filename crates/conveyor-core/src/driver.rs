//! Remote task-service driver contract
//!
//! The core dispatches tasks to remote services but never executes task
//! bodies. Implementations invoke the task's effective URL with the opaque
//! parameter blob and decode the service's verdict.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::NextTask;
use crate::rule::TaskRule;

/// Verdict returned by a remote task service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Opaque output text recorded on the task-queue row
    #[serde(default)]
    pub output: Option<String>,
    /// True when the service wants the task parked as `Paused`
    #[serde(default)]
    pub paused: bool,
    /// Rule findings to append before completion
    #[serde(default)]
    pub rules: Vec<TaskRule>,
}

/// Driver errors. Transport failures are surfaced to the dispatcher, which
/// records them via `fail_task_run`; they are not core errors.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("invalid task service response: {0}")]
    InvalidResponse(String),
}

impl DriverError {
    /// The message recorded as the failed task's output
    pub fn into_failure_message(self) -> String {
        self.to_string()
    }
}

/// Contract the executor runtime uses to invoke remote task services
#[async_trait]
pub trait TaskServiceDriver: Send + Sync + 'static {
    /// Invoke the task's effective URL with its parameters and return the
    /// service's verdict.
    async fn run_task(&self, task: &NextTask) -> Result<TaskOutcome, DriverError>;
}
