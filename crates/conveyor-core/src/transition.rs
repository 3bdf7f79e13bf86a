//! Status-transition planning
//!
//! The side effects of every workflow-run status change (executor
//! auto-assignment, topic notifications, job settling) are decided here, in
//! one place, and applied by both store backends inside the mutating
//! transaction. This mirrors a before-status-update trigger without
//! duplicating its rules at each call site.

use uuid::Uuid;

use crate::status::{TaskStatus, WorkflowRunStatus};
use crate::topic::{Notification, Topic};

/// The run state the planner needs to see before the status write
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub workflow_run_id: Uuid,
    pub status: WorkflowRunStatus,
    pub executor_id: Option<Uuid>,
    /// Job referencing this run via `current_workflow_run_id`, if any
    pub owning_job: Option<Uuid>,
}

/// Effects to apply alongside a run status change
#[derive(Debug, Clone, Default)]
pub struct TransitionPlan {
    /// Executor to stamp on the row before the write (Scheduled transitions)
    pub assign_executor: Option<Uuid>,
    pub notifications: Vec<Notification>,
}

/// Plan the side effects of moving `run` to `new_status`.
///
/// `candidate_executor` is the `next_executor()` pick, consulted only on a
/// transition to `Scheduled` while the run has no owner.
pub fn plan_status_change(
    run: &RunSnapshot,
    new_status: WorkflowRunStatus,
    candidate_executor: Option<Uuid>,
) -> TransitionPlan {
    let mut plan = TransitionPlan::default();

    if new_status == WorkflowRunStatus::Scheduled && run.executor_id.is_none() {
        if let Some(executor_id) = candidate_executor {
            plan.assign_executor = Some(executor_id);
            plan.notifications.push(Notification::new(
                Topic::WorkflowRunScheduled(executor_id),
                run.workflow_run_id.to_string(),
            ));
        }
    }

    if new_status == WorkflowRunStatus::Canceled {
        if let Some(old_executor) = run.executor_id {
            plan.notifications.push(Notification::new(
                Topic::WorkflowRunCanceled(old_executor),
                run.workflow_run_id.to_string(),
            ));
        }
    }

    if let Some(job_id) = run.owning_job {
        if new_status.settles_job() {
            plan.notifications
                .push(Notification::new(Topic::Jobs, job_id.to_string()));
        }
    }

    plan
}

/// Notification for a progress write, if the value actually changed
pub fn plan_progress_change(
    workflow_run_id: Uuid,
    old: Option<i16>,
    new: Option<i16>,
) -> Option<Notification> {
    if old == new {
        return None;
    }
    Some(Notification::new(
        Topic::WorkflowRunProgress,
        workflow_run_id.to_string(),
    ))
}

/// Terminal status for a completing task: a failed rule overrides everything,
/// then the paused flag, then plain completion.
pub fn task_terminal_status(any_rule_failed: bool, is_paused: bool) -> TaskStatus {
    if any_rule_failed {
        TaskStatus::RuleBroken
    } else if is_paused {
        TaskStatus::Paused
    } else {
        TaskStatus::Complete
    }
}

/// Task-status distribution of one run, input to the completion cascade
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskTally {
    pub total: usize,
    pub complete: usize,
    pub failed: usize,
    pub rule_broken: usize,
    pub paused: usize,
    pub canceled: usize,
}

impl TaskTally {
    pub fn count(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Complete => self.complete += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::RuleBroken => self.rule_broken += 1,
            TaskStatus::Paused => self.paused += 1,
            TaskStatus::Canceled => self.canceled += 1,
            TaskStatus::Waiting | TaskStatus::Running => {}
        }
    }
}

/// The `complete_workflow_run` cascade: run status and progress from the
/// task-queue distribution.
pub fn settle_run(tally: &TaskTally) -> (WorkflowRunStatus, Option<i16>) {
    if tally.total > 0 && tally.complete == tally.total {
        (WorkflowRunStatus::Complete, Some(100))
    } else if tally.failed > 0 {
        (WorkflowRunStatus::Failed, None)
    } else if tally.rule_broken > 0 {
        (WorkflowRunStatus::Paused, Some(100))
    } else if tally.paused > 0 {
        (WorkflowRunStatus::Paused, Some(100))
    } else if tally.canceled > 0 {
        (WorkflowRunStatus::Canceled, None)
    } else {
        (WorkflowRunStatus::Paused, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(
        status: WorkflowRunStatus,
        executor_id: Option<Uuid>,
        owning_job: Option<Uuid>,
    ) -> RunSnapshot {
        RunSnapshot {
            workflow_run_id: Uuid::now_v7(),
            status,
            executor_id,
            owning_job,
        }
    }

    #[test]
    fn test_scheduled_assigns_executor_and_notifies() {
        let executor_id = Uuid::now_v7();
        let run = snapshot(WorkflowRunStatus::Waiting, None, None);

        let plan = plan_status_change(&run, WorkflowRunStatus::Scheduled, Some(executor_id));

        assert_eq!(plan.assign_executor, Some(executor_id));
        assert_eq!(plan.notifications.len(), 1);
        assert_eq!(
            plan.notifications[0].topic,
            Topic::WorkflowRunScheduled(executor_id)
        );
        assert_eq!(
            plan.notifications[0].payload,
            run.workflow_run_id.to_string()
        );
    }

    #[test]
    fn test_scheduled_with_owner_keeps_executor() {
        let owner = Uuid::now_v7();
        let other = Uuid::now_v7();
        let run = snapshot(WorkflowRunStatus::Waiting, Some(owner), None);

        let plan = plan_status_change(&run, WorkflowRunStatus::Scheduled, Some(other));

        assert_eq!(plan.assign_executor, None);
        assert!(plan.notifications.is_empty());
    }

    #[test]
    fn test_scheduled_without_live_executor_stays_unassigned() {
        let run = snapshot(WorkflowRunStatus::Waiting, None, None);
        let plan = plan_status_change(&run, WorkflowRunStatus::Scheduled, None);
        assert_eq!(plan.assign_executor, None);
        assert!(plan.notifications.is_empty());
    }

    #[test]
    fn test_cancel_notifies_old_executor() {
        let executor_id = Uuid::now_v7();
        let run = snapshot(WorkflowRunStatus::Running, Some(executor_id), None);

        let plan = plan_status_change(&run, WorkflowRunStatus::Canceled, None);

        assert_eq!(plan.notifications.len(), 1);
        assert_eq!(
            plan.notifications[0].topic,
            Topic::WorkflowRunCanceled(executor_id)
        );
    }

    #[test]
    fn test_terminal_status_settles_owning_job() {
        let job_id = Uuid::now_v7();
        let run = snapshot(WorkflowRunStatus::Running, None, Some(job_id));

        let plan = plan_status_change(&run, WorkflowRunStatus::Complete, None);
        assert_eq!(plan.notifications.len(), 1);
        assert_eq!(plan.notifications[0].topic, Topic::Jobs);
        assert_eq!(plan.notifications[0].payload, job_id.to_string());

        // Scheduled and Running do not settle
        let plan = plan_status_change(&run, WorkflowRunStatus::Running, None);
        assert!(plan.notifications.is_empty());
    }

    #[test]
    fn test_progress_change_only_on_difference() {
        let run_id = Uuid::now_v7();
        assert!(plan_progress_change(run_id, Some(50), Some(50)).is_none());
        assert!(plan_progress_change(run_id, None, None).is_none());

        let n = plan_progress_change(run_id, Some(50), Some(100)).unwrap();
        assert_eq!(n.topic, Topic::WorkflowRunProgress);
        assert_eq!(n.payload, run_id.to_string());
    }

    #[test]
    fn test_task_terminal_status_rule_overrides_pause() {
        assert_eq!(task_terminal_status(true, true), TaskStatus::RuleBroken);
        assert_eq!(task_terminal_status(true, false), TaskStatus::RuleBroken);
        assert_eq!(task_terminal_status(false, true), TaskStatus::Paused);
        assert_eq!(task_terminal_status(false, false), TaskStatus::Complete);
    }

    #[test]
    fn test_settle_run_cascade_order() {
        let mut tally = TaskTally::default();
        tally.count(TaskStatus::Complete);
        tally.count(TaskStatus::Complete);
        assert_eq!(settle_run(&tally), (WorkflowRunStatus::Complete, Some(100)));

        // Failed beats everything below it
        let mut tally = TaskTally::default();
        tally.count(TaskStatus::Failed);
        tally.count(TaskStatus::RuleBroken);
        tally.count(TaskStatus::Paused);
        assert_eq!(settle_run(&tally), (WorkflowRunStatus::Failed, None));

        // Rule Broken pauses the run at full progress
        let mut tally = TaskTally::default();
        tally.count(TaskStatus::Complete);
        tally.count(TaskStatus::RuleBroken);
        assert_eq!(settle_run(&tally), (WorkflowRunStatus::Paused, Some(100)));

        let mut tally = TaskTally::default();
        tally.count(TaskStatus::Paused);
        assert_eq!(settle_run(&tally), (WorkflowRunStatus::Paused, Some(100)));

        let mut tally = TaskTally::default();
        tally.count(TaskStatus::Canceled);
        assert_eq!(settle_run(&tally), (WorkflowRunStatus::Canceled, None));

        // Nothing notable: waiting tasks only
        let mut tally = TaskTally::default();
        tally.count(TaskStatus::Waiting);
        assert_eq!(settle_run(&tally), (WorkflowRunStatus::Paused, None));
    }
}
