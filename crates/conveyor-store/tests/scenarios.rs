//! End-to-end scenarios for the dispatch engine, driven through the
//! in-memory store (identical semantics to the PostgreSQL backend).

use std::time::Duration;

use chrono::{NaiveTime, Utc};
use uuid::Uuid;

use conveyor_core::{
    ExecutorStatus, JobPlan, Notification, ScheduleEntry, TaskRule, TaskStatus, Topic,
    WorkflowRunStatus, EXECUTOR_CANCELED_OUTPUT,
};
use conveyor_store::{
    ExecutorStore, JobStore, MemoryEngineStore, NewJob, NewTask, NotificationHub, RunStore,
    StoreError, Subscription, WorkflowStore,
};

struct Fixture {
    store: MemoryEngineStore,
    workflow_id: Uuid,
}

/// One workflow with `task_count` ordered tasks on a single service
async fn fixture(task_count: i32) -> Fixture {
    let store = MemoryEngineStore::new();
    let service = store
        .create_task_service("loader", "http://loader:8080/")
        .await
        .unwrap();
    let workflow = store.create_workflow("nightly-refresh").await.unwrap();
    for order in 1..=task_count {
        let task = store
            .create_task(NewTask {
                name: format!("step-{order}"),
                description: format!("step {order} of the refresh"),
                task_service_id: service.service_id,
                url: format!("/steps/{order}"),
            })
            .await
            .unwrap();
        store
            .insert_workflow_task(conveyor_core::WorkflowTask {
                workflow_id: workflow.workflow_id,
                task_order: order,
                task_id: task.task_id,
                parameters: Some(serde_json::json!({"step": order})),
            })
            .await
            .unwrap();
    }
    Fixture {
        store,
        workflow_id: workflow.workflow_id,
    }
}

async fn recv(subscription: &mut Box<dyn Subscription>) -> Notification {
    tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("subscription closed")
}

async fn task_status(store: &MemoryEngineStore, run_id: Uuid, order: i32) -> TaskStatus {
    store
        .get_workflow_run(run_id)
        .await
        .unwrap()
        .tasks
        .into_iter()
        .find(|t| t.task_order == order)
        .unwrap()
        .status
}

// S1 - happy path: initialize, schedule, start, two task completions, run
// completes with progress 100 and no owner.
#[tokio::test]
async fn happy_path_two_tasks() {
    let Fixture { store, workflow_id } = fixture(2).await;
    let executor_id = store.register_executor().await.unwrap();
    let mut scheduled = store
        .subscribe(&[Topic::WorkflowRunScheduled(executor_id)])
        .await
        .unwrap();

    let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();
    let run = store.get_workflow_run(run_id).await.unwrap().run;
    assert_eq!(run.status, WorkflowRunStatus::Waiting);
    assert_eq!(run.executor_id, None);

    store.schedule_workflow_run(run_id).await.unwrap();
    let run = store.get_workflow_run(run_id).await.unwrap().run;
    assert_eq!(run.status, WorkflowRunStatus::Scheduled);
    assert_eq!(run.executor_id, Some(executor_id));

    let notification = recv(&mut scheduled).await;
    assert_eq!(notification.topic, Topic::WorkflowRunScheduled(executor_id));
    assert_eq!(notification.payload_id(), Some(run_id));

    let leased = store
        .lease_next_workflow_run(executor_id)
        .await
        .unwrap()
        .expect("run should be leasable");
    assert!(leased.is_valid);

    store.start_workflow_run(run_id, executor_id).await.unwrap();
    let run = store.get_workflow_run(run_id).await.unwrap().run;
    assert_eq!(run.status, WorkflowRunStatus::Running);
    assert_eq!(run.progress, Some(0));

    // T1
    let next = store.acquire_next_task(run_id).await.unwrap().unwrap();
    assert_eq!(next.task_order, 1);
    assert_eq!(next.url, "http://loader:8080/steps/1");
    assert_eq!(next.parameters, Some(serde_json::json!({"step": 1})));
    store
        .complete_task_run(run_id, 1, false, None)
        .await
        .unwrap();
    assert_eq!(task_status(&store, run_id, 1).await, TaskStatus::Complete);
    let run = store.get_workflow_run(run_id).await.unwrap().run;
    assert_eq!(run.progress, Some(50));

    // T2
    let next = store.acquire_next_task(run_id).await.unwrap().unwrap();
    assert_eq!(next.task_order, 2);
    store
        .complete_task_run(run_id, 2, false, Some("loaded 41 rows".to_string()))
        .await
        .unwrap();
    let run = store.get_workflow_run(run_id).await.unwrap().run;
    assert_eq!(run.progress, Some(100));

    assert!(store.acquire_next_task(run_id).await.unwrap().is_none());

    store.complete_workflow_run(run_id).await.unwrap();
    let run = store.get_workflow_run(run_id).await.unwrap().run;
    assert_eq!(run.status, WorkflowRunStatus::Complete);
    assert_eq!(run.progress, Some(100));
    assert_eq!(run.executor_id, None);
}

// S2 - failure halts the run until retry archives and resets the task.
#[tokio::test]
async fn failure_then_retry() {
    let Fixture { store, workflow_id } = fixture(1).await;
    let executor_id = store.register_executor().await.unwrap();

    let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();
    store.schedule_workflow_run(run_id).await.unwrap();
    store.start_workflow_run(run_id, executor_id).await.unwrap();

    store.acquire_next_task(run_id).await.unwrap().unwrap();
    store.fail_task_run(run_id, 1, "boom").await.unwrap();

    let view = store.get_workflow_run(run_id).await.unwrap();
    assert_eq!(view.tasks[0].status, TaskStatus::Failed);
    assert_eq!(view.tasks[0].output.as_deref(), Some("boom"));

    // A failed sibling blocks the dispatcher
    assert!(store.acquire_next_task(run_id).await.unwrap().is_none());

    store.retry_task(run_id, 1).await.unwrap();
    let archived = store.archived_tasks(run_id);
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].entry.status, TaskStatus::Failed);
    assert_eq!(archived[0].entry.output.as_deref(), Some("boom"));

    let view = store.get_workflow_run(run_id).await.unwrap();
    assert_eq!(view.run.status, WorkflowRunStatus::Scheduled);
    assert_eq!(view.tasks[0].status, TaskStatus::Waiting);
    assert_eq!(view.tasks[0].output, None);
    assert_eq!(view.tasks[0].task_start, None);
    assert_eq!(view.tasks[0].task_end, None);

    // Dispatcher re-leases the task
    let next = store.acquire_next_task(run_id).await.unwrap().unwrap();
    assert_eq!(next.task_order, 1);
}

// S3 - a failed rule overrides completion and pauses the run at 100%.
#[tokio::test]
async fn rule_broken_overrides_completion() {
    let Fixture { store, workflow_id } = fixture(1).await;
    let executor_id = store.register_executor().await.unwrap();

    let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();
    store.schedule_workflow_run(run_id).await.unwrap();
    store.start_workflow_run(run_id, executor_id).await.unwrap();
    store.acquire_next_task(run_id).await.unwrap().unwrap();

    store
        .append_task_rule(run_id, 1, TaskRule::passed("row-count"))
        .await
        .unwrap();
    store
        .append_task_rule(run_id, 1, TaskRule::broken("limit", "over the cap"))
        .await
        .unwrap();
    store
        .complete_task_run(run_id, 1, false, None)
        .await
        .unwrap();

    let view = store.get_workflow_run(run_id).await.unwrap();
    let task = &view.tasks[0];
    assert_eq!(task.status, TaskStatus::RuleBroken);
    assert_eq!(task.progress, Some(100));
    let rules = task.rules.as_ref().unwrap();
    assert_eq!(rules.len(), 2);

    store.complete_workflow_run(run_id).await.unwrap();
    let run = store.get_workflow_run(run_id).await.unwrap().run;
    assert_eq!(run.status, WorkflowRunStatus::Paused);
    assert_eq!(run.progress, Some(100));
}

// S4 - executor loss: the reaper cancels the executor, its run, and its
// running task with the fixed output message.
#[tokio::test]
async fn reaper_recovers_vanished_executor() {
    let Fixture { store, workflow_id } = fixture(1).await;
    let executor_id = store.register_executor().await.unwrap();

    let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();
    store.schedule_workflow_run(run_id).await.unwrap();
    store.start_workflow_run(run_id, executor_id).await.unwrap();
    store.acquire_next_task(run_id).await.unwrap().unwrap();

    store.kill_session(executor_id);
    let reaped = store.clean_executors().await.unwrap();
    assert_eq!(reaped, vec![executor_id]);

    let executor = store.get_executor(executor_id).await.unwrap();
    assert_eq!(executor.status, ExecutorStatus::Canceled);
    assert!(executor.exec_end.is_some());

    let view = store.get_workflow_run(run_id).await.unwrap();
    assert_eq!(view.run.status, WorkflowRunStatus::Canceled);
    assert_eq!(view.run.executor_id, None);
    assert_eq!(view.tasks[0].status, TaskStatus::Canceled);
    assert_eq!(
        view.tasks[0].output.as_deref(),
        Some(EXECUTOR_CANCELED_OUTPUT)
    );

    // A second pass finds nothing
    assert!(store.clean_executors().await.unwrap().is_empty());
}

// S5 - two-phase move: bookmark the earliest waiting task, restore it, and
// let the transition hand the run to the least-loaded live executor.
#[tokio::test]
async fn move_hands_off_between_executors() {
    let Fixture { store, workflow_id } = fixture(2).await;
    let first = store.register_executor().await.unwrap();
    let second = store.register_executor().await.unwrap();

    let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();
    store.schedule_workflow_run(run_id).await.unwrap();
    let owner = store
        .get_workflow_run(run_id)
        .await
        .unwrap()
        .run
        .executor_id
        .unwrap();
    let other = if owner == first { second } else { first };

    store.start_workflow_run(run_id, owner).await.unwrap();
    store.acquire_next_task(run_id).await.unwrap().unwrap();
    store
        .complete_task_run(run_id, 1, false, None)
        .await
        .unwrap();

    let mut scheduled = store
        .subscribe(&[
            Topic::WorkflowRunScheduled(first),
            Topic::WorkflowRunScheduled(second),
        ])
        .await
        .unwrap();

    store.start_workflow_run_move(run_id).await.unwrap();
    assert_eq!(task_status(&store, run_id, 2).await, TaskStatus::Paused);
    // The bookmark blocks dispatch while the run is in transit
    assert!(store.acquire_next_task(run_id).await.unwrap().is_none());

    store.complete_workflow_run_move(run_id).await.unwrap();
    let run = store.get_workflow_run(run_id).await.unwrap().run;
    assert_eq!(run.status, WorkflowRunStatus::Scheduled);
    assert_eq!(task_status(&store, run_id, 2).await, TaskStatus::Waiting);

    // The owner still held the moved run when the new executor was picked,
    // so the idle one wins the tie.
    assert_eq!(run.executor_id, Some(other));
    let notification = recv(&mut scheduled).await;
    assert_eq!(notification.topic, Topic::WorkflowRunScheduled(other));
    assert_eq!(notification.payload_id(), Some(run_id));
}

// S6 - weekly-scheduled job: run_job advances next_run to the earliest
// future slot; a Complete run settles the job and unpauses it.
#[tokio::test]
async fn weekly_job_fires_and_settles() {
    let Fixture { store, workflow_id } = fixture(1).await;
    let executor_id = store.register_executor().await.unwrap();

    let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
    let job = store
        .create_job(NewJob {
            workflow_id,
            maintainer: "data-eng".to_string(),
            plan: JobPlan::Weekly(vec![
                ScheduleEntry::new(1, midnight),
                ScheduleEntry::new(2, midnight),
            ]),
            next_run: Utc::now() + chrono::Duration::minutes(5),
        })
        .await
        .unwrap();

    let queued = store.queued_jobs().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].job_id, job.job_id);

    let mut jobs_topic = store.subscribe(&[Topic::Jobs]).await.unwrap();

    let run_id = store.run_job(job.job_id).await.unwrap();
    let view = store.get_job(job.job_id).await.unwrap();
    assert_eq!(view.job.current_workflow_run_id, Some(run_id));
    assert_eq!(view.current_run_status, Some(WorkflowRunStatus::Scheduled));

    // next_run moved to a Monday or Tuesday midnight strictly in the future
    let next_run = view.job.next_run;
    assert!(next_run > Utc::now());
    let weekday = chrono::Datelike::weekday(&next_run).number_from_monday();
    assert!(weekday == 1 || weekday == 2, "weekday was {weekday}");
    assert_eq!(next_run.time(), midnight);

    // A job with an active run is out of the due-set
    assert!(store.queued_jobs().await.unwrap().is_empty());

    // Settling is refused while the run is active
    let err = store.complete_job(job.job_id).await.unwrap_err();
    assert!(matches!(err, StoreError::Precondition(_)));

    // Drive the run to completion
    store.start_workflow_run(run_id, executor_id).await.unwrap();
    store.acquire_next_task(run_id).await.unwrap().unwrap();
    store
        .complete_task_run(run_id, 1, false, None)
        .await
        .unwrap();
    store.complete_workflow_run(run_id).await.unwrap();

    // The terminal transition published the job for settling
    loop {
        let notification = recv(&mut jobs_topic).await;
        if notification.payload_id() == Some(job.job_id) {
            break;
        }
    }

    let outcome = store.complete_job(job.job_id).await.unwrap();
    assert_eq!(outcome, None);
    let view = store.get_job(job.job_id).await.unwrap();
    assert_eq!(view.job.current_workflow_run_id, None);
    assert!(!view.job.is_paused);
    assert!(!store.queued_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn interval_job_advances_from_previous_slot() {
    let Fixture { store, workflow_id } = fixture(1).await;
    store.register_executor().await.unwrap();

    let first_slot = Utc::now() + chrono::Duration::minutes(1);
    let job = store
        .create_job(NewJob {
            workflow_id,
            maintainer: "data-eng".to_string(),
            plan: JobPlan::Interval(chrono::Duration::hours(6)),
            next_run: first_slot,
        })
        .await
        .unwrap();

    store.run_job(job.job_id).await.unwrap();
    let view = store.get_job(job.job_id).await.unwrap();
    assert_eq!(view.job.next_run, first_slot + chrono::Duration::hours(6));
}

#[tokio::test]
async fn failed_run_pauses_its_job() {
    let Fixture { store, workflow_id } = fixture(1).await;
    let executor_id = store.register_executor().await.unwrap();

    let job = store
        .create_job(NewJob {
            workflow_id,
            maintainer: "data-eng".to_string(),
            plan: JobPlan::Interval(chrono::Duration::hours(1)),
            next_run: Utc::now() + chrono::Duration::minutes(1),
        })
        .await
        .unwrap();

    let run_id = store.run_job(job.job_id).await.unwrap();
    store.start_workflow_run(run_id, executor_id).await.unwrap();
    store.acquire_next_task(run_id).await.unwrap().unwrap();
    store.fail_task_run(run_id, 1, "out of disk").await.unwrap();
    store.complete_workflow_run(run_id).await.unwrap();

    let outcome = store.complete_job(job.job_id).await.unwrap();
    let reason = outcome.expect("a failed run should pause the job");
    assert!(reason.contains("Failed"));

    let view = store.get_job(job.job_id).await.unwrap();
    assert!(view.job.is_paused);
    // The failed run is kept for inspection
    assert_eq!(view.job.current_workflow_run_id, Some(run_id));
    assert!(store.queued_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn restart_archives_and_resets_every_task() {
    let Fixture { store, workflow_id } = fixture(2).await;
    let executor_id = store.register_executor().await.unwrap();

    let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();
    store.schedule_workflow_run(run_id).await.unwrap();
    store.start_workflow_run(run_id, executor_id).await.unwrap();

    store.acquire_next_task(run_id).await.unwrap().unwrap();
    store
        .complete_task_run(run_id, 1, false, Some("done".to_string()))
        .await
        .unwrap();
    store.acquire_next_task(run_id).await.unwrap().unwrap();
    store.fail_task_run(run_id, 2, "flaky service").await.unwrap();

    // Running runs cannot restart
    let err = store.restart_workflow_run(run_id).await.unwrap_err();
    assert!(matches!(err, StoreError::Precondition(_)));

    store.complete_workflow_run(run_id).await.unwrap();
    assert_eq!(
        store.get_workflow_run(run_id).await.unwrap().run.status,
        WorkflowRunStatus::Failed
    );

    store.restart_workflow_run(run_id).await.unwrap();
    let view = store.get_workflow_run(run_id).await.unwrap();
    assert_eq!(view.run.status, WorkflowRunStatus::Waiting);
    assert_eq!(view.run.executor_id, None);
    assert_eq!(view.run.progress, None);
    for task in &view.tasks {
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.output, None);
        assert_eq!(task.task_start, None);
        assert_eq!(task.task_end, None);
    }
    assert_eq!(store.archived_tasks(run_id).len(), 2);
}

#[tokio::test]
async fn paused_task_blocks_until_manually_completed() {
    let Fixture { store, workflow_id } = fixture(2).await;
    let executor_id = store.register_executor().await.unwrap();

    let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();
    store.schedule_workflow_run(run_id).await.unwrap();
    store.start_workflow_run(run_id, executor_id).await.unwrap();

    store.acquire_next_task(run_id).await.unwrap().unwrap();
    store
        .complete_task_run(run_id, 1, true, Some("waiting on sign-off".to_string()))
        .await
        .unwrap();
    assert_eq!(task_status(&store, run_id, 1).await, TaskStatus::Paused);

    // The paused task halts dispatch
    assert!(store.acquire_next_task(run_id).await.unwrap().is_none());

    store.complete_workflow_run(run_id).await.unwrap();
    assert_eq!(
        store.get_workflow_run(run_id).await.unwrap().run.status,
        WorkflowRunStatus::Paused
    );

    store.complete_task(run_id, 1).await.unwrap();
    let view = store.get_workflow_run(run_id).await.unwrap();
    assert_eq!(view.run.status, WorkflowRunStatus::Scheduled);
    assert_eq!(task_status(&store, run_id, 1).await, TaskStatus::Complete);

    // Dispatch resumes at the next order
    let next = store.acquire_next_task(run_id).await.unwrap().unwrap();
    assert_eq!(next.task_order, 2);
}

#[tokio::test]
async fn start_task_run_is_idempotent() {
    let Fixture { store, workflow_id } = fixture(1).await;
    let executor_id = store.register_executor().await.unwrap();

    let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();
    store.schedule_workflow_run(run_id).await.unwrap();
    store.start_workflow_run(run_id, executor_id).await.unwrap();

    let next = store.acquire_next_task(run_id).await.unwrap().unwrap();
    // Replaying the start of a Running task is a no-op
    store
        .start_task_run(run_id, next.task_order)
        .await
        .unwrap();
    assert_eq!(task_status(&store, run_id, 1).await, TaskStatus::Running);

    // But completion strictly requires Running
    store
        .complete_task_run(run_id, 1, false, None)
        .await
        .unwrap();
    let err = store
        .complete_task_run(run_id, 1, false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Precondition(_)));
}

#[tokio::test]
async fn preconditions_reject_invalid_transitions() {
    let Fixture { store, workflow_id } = fixture(1).await;
    let executor_id = store.register_executor().await.unwrap();

    let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();

    // Cancel is fine from Waiting
    store.cancel_workflow_run(run_id).await.unwrap();
    assert_eq!(
        store.get_workflow_run(run_id).await.unwrap().run.status,
        WorkflowRunStatus::Canceled
    );

    // A canceled run cannot be scheduled
    let err = store.schedule_workflow_run(run_id).await.unwrap_err();
    assert!(matches!(err, StoreError::Precondition(_)));

    // Fresh run for the task-level checks
    let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();
    store.schedule_workflow_run(run_id).await.unwrap();
    store.start_workflow_run(run_id, executor_id).await.unwrap();
    store.acquire_next_task(run_id).await.unwrap().unwrap();

    // Blank fail messages are rejected with no state change
    let err = store.fail_task_run(run_id, 1, "  ").await.unwrap_err();
    assert!(matches!(err, StoreError::Precondition(_)));
    assert_eq!(task_status(&store, run_id, 1).await, TaskStatus::Running);

    // Retry requires Failed or Rule Broken
    let err = store.retry_task(run_id, 1).await.unwrap_err();
    assert!(matches!(err, StoreError::Precondition(_)));

    // Rules must carry a name
    let err = store
        .append_task_rule(
            run_id,
            1,
            TaskRule {
                name: "  ".to_string(),
                failed: false,
                message: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));

    // Progress is bounded
    let err = store.set_task_progress(run_id, 1, 101).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    store.set_task_progress(run_id, 1, 60).await.unwrap();
}

#[tokio::test]
async fn executor_signals_publish_on_status_topic() {
    let store = MemoryEngineStore::new();
    let executor_id = store.register_executor().await.unwrap();
    let mut status_topic = store
        .subscribe(&[Topic::ExecutorStatus(executor_id)])
        .await
        .unwrap();

    store.shutdown_executor(executor_id).await.unwrap();
    let notification = recv(&mut status_topic).await;
    assert_eq!(notification.payload, "shutdown");

    // Already signaled: not Active any more
    let err = store.cancel_executor(executor_id).await.unwrap_err();
    assert!(matches!(err, StoreError::Precondition(_)));
}

#[tokio::test]
async fn close_executor_cancels_owned_work() {
    let Fixture { store, workflow_id } = fixture(1).await;
    let executor_id = store.register_executor().await.unwrap();

    let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();
    store.schedule_workflow_run(run_id).await.unwrap();
    store.start_workflow_run(run_id, executor_id).await.unwrap();
    store.acquire_next_task(run_id).await.unwrap().unwrap();

    let mut canceled = store
        .subscribe(&[Topic::WorkflowRunCanceled(executor_id)])
        .await
        .unwrap();

    store.close_executor(executor_id, true).await.unwrap();

    let executor = store.get_executor(executor_id).await.unwrap();
    assert_eq!(executor.status, ExecutorStatus::Canceled);
    assert!(executor.exec_end.is_some());

    let view = store.get_workflow_run(run_id).await.unwrap();
    assert_eq!(view.run.status, WorkflowRunStatus::Canceled);
    assert_eq!(view.run.executor_id, None);
    assert_eq!(view.tasks[0].status, TaskStatus::Canceled);
    assert_eq!(
        view.tasks[0].output.as_deref(),
        Some(EXECUTOR_CANCELED_OUTPUT)
    );

    let notification = recv(&mut canceled).await;
    assert_eq!(notification.payload_id(), Some(run_id));
}

#[tokio::test]
async fn invalid_run_lease_reports_unsettled_tasks() {
    let Fixture { store, workflow_id } = fixture(2).await;
    let executor_id = store.register_executor().await.unwrap();

    let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();
    store.schedule_workflow_run(run_id).await.unwrap();
    store.start_workflow_run(run_id, executor_id).await.unwrap();
    store.acquire_next_task(run_id).await.unwrap().unwrap();
    store.fail_task_run(run_id, 1, "boom").await.unwrap();

    // Force the run back into the scheduled pool with a failed task in place
    store.retry_task(run_id, 1).await.unwrap();
    store.acquire_next_task(run_id).await.unwrap().unwrap();
    store.fail_task_run(run_id, 1, "boom again").await.unwrap();
    // retry_task put the run in Scheduled; the failed task makes it invalid
    let leased = store
        .lease_next_workflow_run(executor_id)
        .await
        .unwrap()
        .expect("scheduled run should lease");
    assert!(!leased.is_valid);

    // The caller decides: settle it through the completion cascade
    store.complete_workflow_run(run_id).await.unwrap();
    assert_eq!(
        store.get_workflow_run(run_id).await.unwrap().run.status,
        WorkflowRunStatus::Failed
    );
}

#[tokio::test]
async fn purge_drops_run_queue_and_archive() {
    let Fixture { store, workflow_id } = fixture(1).await;
    let executor_id = store.register_executor().await.unwrap();

    let run_id = store.initialize_workflow_run(workflow_id).await.unwrap();
    store.schedule_workflow_run(run_id).await.unwrap();
    store.start_workflow_run(run_id, executor_id).await.unwrap();

    // Active runs cannot be purged
    let err = store.purge_workflow_run(run_id).await.unwrap_err();
    assert!(matches!(err, StoreError::Precondition(_)));

    store.acquire_next_task(run_id).await.unwrap().unwrap();
    store.fail_task_run(run_id, 1, "boom").await.unwrap();
    store.retry_task(run_id, 1).await.unwrap();
    store.cancel_workflow_run(run_id).await.unwrap();

    store.purge_workflow_run(run_id).await.unwrap();
    assert!(matches!(
        store.get_workflow_run(run_id).await,
        Err(StoreError::RunNotFound(_))
    ));
    assert!(store.archived_tasks(run_id).is_empty());
}
