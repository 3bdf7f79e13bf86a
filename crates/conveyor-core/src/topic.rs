//! Notification topics
//!
//! Topic names are literal, stable identifiers; per-executor topics embed the
//! executor id. Delivery is best-effort on commit; subscribers reconcile by
//! polling the authoritative views.

use uuid::Uuid;

/// A notification topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A workflow run has been assigned to this executor; payload = run id
    WorkflowRunScheduled(Uuid),
    /// A run previously owned by this executor was canceled; payload = run id
    WorkflowRunCanceled(Uuid),
    /// Executor status change; payload = `cancel` | `shutdown`
    ExecutorStatus(Uuid),
    /// A run's progress changed; payload = run id
    WorkflowRunProgress,
    /// A job changed or needs settling; payload = job id or empty
    Jobs,
}

impl Topic {
    /// The literal channel name used on the wire
    pub fn channel(&self) -> String {
        match self {
            Self::WorkflowRunScheduled(executor_id) => format!("wr_scheduled_{executor_id}"),
            Self::WorkflowRunCanceled(executor_id) => format!("wr_canceled_{executor_id}"),
            Self::ExecutorStatus(executor_id) => format!("exec_status_{executor_id}"),
            Self::WorkflowRunProgress => "wr_progress".to_string(),
            Self::Jobs => "jobs".to_string(),
        }
    }

    /// Parse a channel name back into a topic
    pub fn parse_channel(channel: &str) -> Option<Self> {
        match channel {
            "wr_progress" => return Some(Self::WorkflowRunProgress),
            "jobs" => return Some(Self::Jobs),
            _ => {}
        }
        if let Some(id) = channel.strip_prefix("wr_scheduled_") {
            return id.parse().ok().map(Self::WorkflowRunScheduled);
        }
        if let Some(id) = channel.strip_prefix("wr_canceled_") {
            return id.parse().ok().map(Self::WorkflowRunCanceled);
        }
        if let Some(id) = channel.strip_prefix("exec_status_") {
            return id.parse().ok().map(Self::ExecutorStatus);
        }
        None
    }
}

/// A topic-addressed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub topic: Topic,
    pub payload: String,
}

impl Notification {
    pub fn new(topic: Topic, payload: impl Into<String>) -> Self {
        Self {
            topic,
            payload: payload.into(),
        }
    }

    /// Payload parsed as a UUID, for run- and job-addressed topics
    pub fn payload_id(&self) -> Option<Uuid> {
        self.payload.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_round_trip() {
        let executor_id = Uuid::now_v7();
        for topic in [
            Topic::WorkflowRunScheduled(executor_id),
            Topic::WorkflowRunCanceled(executor_id),
            Topic::ExecutorStatus(executor_id),
            Topic::WorkflowRunProgress,
            Topic::Jobs,
        ] {
            assert_eq!(Topic::parse_channel(&topic.channel()), Some(topic));
        }
    }

    #[test]
    fn test_unknown_channel() {
        assert_eq!(Topic::parse_channel("wr_scheduled_not-a-uuid"), None);
        assert_eq!(Topic::parse_channel("unrelated"), None);
    }

    #[test]
    fn test_payload_id() {
        let run_id = Uuid::now_v7();
        let n = Notification::new(Topic::WorkflowRunProgress, run_id.to_string());
        assert_eq!(n.payload_id(), Some(run_id));

        let n = Notification::new(Topic::Jobs, "");
        assert_eq!(n.payload_id(), None);
    }
}
