//! Status domains for tasks, workflow runs, executors and jobs
//!
//! These are fixed sets mirrored by CHECK constraints in the store schema.
//! The textual forms are the stable wire/storage representation.

use serde::{Deserialize, Serialize};

/// Status of a single task-queue row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Waiting,
    Running,
    Paused,
    Failed,
    #[serde(rename = "Rule Broken")]
    RuleBroken,
    Complete,
    Canceled,
}

impl TaskStatus {
    /// Stable textual form used in storage and payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Failed => "Failed",
            Self::RuleBroken => "Rule Broken",
            Self::Complete => "Complete",
            Self::Canceled => "Canceled",
        }
    }

    /// True while this task blocks its siblings: no other task of the run may
    /// be leased until the row leaves one of these states.
    pub fn blocks_run(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Paused | Self::Failed | Self::RuleBroken
        )
    }

    /// States a task of a *leasable* workflow run may be in
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Waiting | Self::Complete)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => Ok(Self::Waiting),
            "Running" => Ok(Self::Running),
            "Paused" => Ok(Self::Paused),
            "Failed" => Ok(Self::Failed),
            "Rule Broken" => Ok(Self::RuleBroken),
            "Complete" => Ok(Self::Complete),
            "Canceled" => Ok(Self::Canceled),
            other => Err(StatusParseError::new("task status", other)),
        }
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowRunStatus {
    Waiting,
    Scheduled,
    Running,
    Paused,
    Failed,
    Complete,
    Canceled,
}

impl WorkflowRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Failed => "Failed",
            Self::Complete => "Complete",
            Self::Canceled => "Canceled",
        }
    }

    /// True while the run is in the hands of the dispatch machinery
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }

    /// A run in any non-active status settles its owning job: the scheduler is
    /// notified so it can call `complete_job`.
    pub fn settles_job(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowRunStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => Ok(Self::Waiting),
            "Scheduled" => Ok(Self::Scheduled),
            "Running" => Ok(Self::Running),
            "Paused" => Ok(Self::Paused),
            "Failed" => Ok(Self::Failed),
            "Complete" => Ok(Self::Complete),
            "Canceled" => Ok(Self::Canceled),
            other => Err(StatusParseError::new("workflow run status", other)),
        }
    }
}

/// Status of a registered executor session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorStatus {
    Active,
    Canceled,
    Shutdown,
}

impl ExecutorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Canceled => "Canceled",
            Self::Shutdown => "Shutdown",
        }
    }
}

impl std::fmt::Display for ExecutorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutorStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Active" => Ok(Self::Active),
            "Canceled" => Ok(Self::Canceled),
            "Shutdown" => Ok(Self::Shutdown),
            other => Err(StatusParseError::new("executor status", other)),
        }
    }
}

/// Signal published on an executor's status topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorSignal {
    Cancel,
    Shutdown,
}

impl ExecutorSignal {
    /// Payload form carried on the `exec_status_*` topic
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Shutdown => "shutdown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cancel" => Some(Self::Cancel),
            "shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// How a job decides its next run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    Interval,
    Scheduled,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interval => "Interval",
            Self::Scheduled => "Scheduled",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Interval" => Ok(Self::Interval),
            "Scheduled" => Ok(Self::Scheduled),
            other => Err(StatusParseError::new("job type", other)),
        }
    }
}

/// Raised when a stored status string falls outside its domain
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {domain}: {value}")]
pub struct StatusParseError {
    domain: &'static str,
    value: String,
}

impl StatusParseError {
    fn new(domain: &'static str, value: &str) -> Self {
        Self {
            domain,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_task_status_round_trip() {
        for status in [
            TaskStatus::Waiting,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Failed,
            TaskStatus::RuleBroken,
            TaskStatus::Complete,
            TaskStatus::Canceled,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert_eq!(TaskStatus::RuleBroken.as_str(), "Rule Broken");
    }

    #[test]
    fn test_task_status_blocks_run() {
        assert!(TaskStatus::Running.blocks_run());
        assert!(TaskStatus::Paused.blocks_run());
        assert!(TaskStatus::Failed.blocks_run());
        assert!(TaskStatus::RuleBroken.blocks_run());
        assert!(!TaskStatus::Waiting.blocks_run());
        assert!(!TaskStatus::Complete.blocks_run());
        assert!(!TaskStatus::Canceled.blocks_run());
    }

    #[test]
    fn test_run_status_settles_job() {
        assert!(!WorkflowRunStatus::Scheduled.settles_job());
        assert!(!WorkflowRunStatus::Running.settles_job());
        assert!(WorkflowRunStatus::Complete.settles_job());
        assert!(WorkflowRunStatus::Failed.settles_job());
        assert!(WorkflowRunStatus::Paused.settles_job());
        assert!(WorkflowRunStatus::Canceled.settles_job());
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(TaskStatus::from_str("Done").is_err());
        assert!(WorkflowRunStatus::from_str("running").is_err());
    }

    #[test]
    fn test_executor_signal_parse() {
        assert_eq!(ExecutorSignal::parse("cancel"), Some(ExecutorSignal::Cancel));
        assert_eq!(
            ExecutorSignal::parse("shutdown"),
            Some(ExecutorSignal::Shutdown)
        );
        assert_eq!(ExecutorSignal::parse("stop"), None);
    }
}
