//! Executor runtime
//!
//! Registers an executor session, subscribes to its topics, and loops:
//! lease the next workflow run, start it, dispatch each task to the remote
//! service, report the verdict, and settle the run. Wake-ups come from the
//! notification bus with interval polling as the fallback.
//!
//! Cancellation is store-mediated: a `cancel` signal closes the executor
//! (which cancels its runs and tasks in the store) and the loops stop
//! touching them; a `shutdown` signal drains the current run first.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use conveyor_core::{ExecutorSignal, LeasedRun, TaskServiceDriver, Topic};
use conveyor_store::{EngineStore, StoreError};

use crate::config::ExecutorConfig;

/// Executor runtime errors
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Runtime already started
    #[error("executor runtime is already started")]
    AlreadyStarted,

    /// Runtime not started
    #[error("executor runtime is not started")]
    NotStarted,
}

struct Shared {
    store: Arc<dyn EngineStore>,
    driver: Arc<dyn TaskServiceDriver>,
    executor_id: Uuid,
    /// Forced stop: the store has already canceled our runs
    cancel_requested: AtomicBool,
    /// Graceful stop: finish the current run, then close
    drain_requested: AtomicBool,
    /// Whether `close_executor` has been issued for this session
    closed: AtomicBool,
    /// Runs canceled out from under us mid-flight
    canceled_runs: Mutex<HashSet<Uuid>>,
    work_notify: Notify,
}

impl Shared {
    async fn close_once(&self, is_cancelled: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.store.close_executor(self.executor_id, is_cancelled).await {
            error!(executor_id = %self.executor_id, "failed to close executor: {e}");
        }
    }
}

/// The in-process executor runtime
///
/// # Example
///
/// ```ignore
/// use conveyor_engine::{ExecutorConfig, ExecutorRuntime, HttpTaskDriver};
///
/// let runtime = ExecutorRuntime::new(store, Arc::new(HttpTaskDriver::new()), ExecutorConfig::default());
/// let executor_id = runtime.start().await?;
/// // ... later
/// runtime.shutdown().await?;
/// ```
pub struct ExecutorRuntime {
    store: Arc<dyn EngineStore>,
    driver: Arc<dyn TaskServiceDriver>,
    config: ExecutorConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    shared: Mutex<Option<Arc<Shared>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutorRuntime {
    pub fn new(
        store: Arc<dyn EngineStore>,
        driver: Arc<dyn TaskServiceDriver>,
        config: ExecutorConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            driver,
            config,
            shutdown_tx,
            shutdown_rx,
            shared: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// The registered executor id, once started
    pub fn executor_id(&self) -> Option<Uuid> {
        self.shared.lock().as_ref().map(|s| s.executor_id)
    }

    /// Register with the store and spawn the control and work loops
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<Uuid, ExecutorError> {
        if self.shared.lock().is_some() {
            return Err(ExecutorError::AlreadyStarted);
        }

        let executor_id = self.store.register_executor().await?;
        let subscription = self
            .store
            .subscribe(&[
                Topic::WorkflowRunScheduled(executor_id),
                Topic::WorkflowRunCanceled(executor_id),
                Topic::ExecutorStatus(executor_id),
            ])
            .await?;

        let shared = Arc::new(Shared {
            store: Arc::clone(&self.store),
            driver: Arc::clone(&self.driver),
            executor_id,
            cancel_requested: AtomicBool::new(false),
            drain_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            canceled_runs: Mutex::new(HashSet::new()),
            work_notify: Notify::new(),
        });
        *self.shared.lock() = Some(Arc::clone(&shared));

        info!(%executor_id, "executor runtime starting");
        let control = tokio::spawn(control_loop(
            Arc::clone(&shared),
            subscription,
            self.shutdown_rx.clone(),
        ));
        let work = tokio::spawn(work_loop(
            Arc::clone(&shared),
            self.config.clone(),
            self.shutdown_rx.clone(),
        ));
        *self.handles.lock() = vec![control, work];

        Ok(executor_id)
    }

    /// Graceful local shutdown: stop the loops and close the executor
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), ExecutorError> {
        let shared = self
            .shared
            .lock()
            .as_ref()
            .map(Arc::clone)
            .ok_or(ExecutorError::NotStarted)?;

        let _ = self.shutdown_tx.send(true);
        shared.work_notify.notify_one();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }

        shared.close_once(false).await;
        info!(executor_id = %shared.executor_id, "executor runtime stopped");
        Ok(())
    }
}

/// React to topic notifications
async fn control_loop(
    shared: Arc<Shared>,
    mut subscription: Box<dyn conveyor_store::Subscription>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = subscription.recv() => match result {
                Ok(notification) => match notification.topic {
                    Topic::WorkflowRunScheduled(_) => {
                        debug!(payload = %notification.payload, "workflow run assigned");
                        shared.work_notify.notify_one();
                    }
                    Topic::WorkflowRunCanceled(_) => {
                        if let Some(run_id) = notification.payload_id() {
                            info!(%run_id, "workflow run canceled by the store");
                            shared.canceled_runs.lock().insert(run_id);
                        }
                    }
                    Topic::ExecutorStatus(_) => {
                        match ExecutorSignal::parse(&notification.payload) {
                            Some(ExecutorSignal::Cancel) => {
                                warn!("cancel signal received; closing executor");
                                shared.cancel_requested.store(true, Ordering::SeqCst);
                                shared.close_once(true).await;
                                shared.work_notify.notify_one();
                                break;
                            }
                            Some(ExecutorSignal::Shutdown) => {
                                info!("shutdown signal received; draining");
                                shared.drain_requested.store(true, Ordering::SeqCst);
                                shared.work_notify.notify_one();
                            }
                            None => {
                                warn!(payload = %notification.payload, "unknown executor signal");
                            }
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    // Losing the subscription is survivable: the work loop
                    // keeps polling. Back off so a dead bus does not spin.
                    warn!("subscription error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
    debug!("control loop exited");
}

/// Lease and process runs until stopped
async fn work_loop(shared: Arc<Shared>, config: ExecutorConfig, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if shared.cancel_requested.load(Ordering::SeqCst) {
            break;
        }

        // Drain everything currently leasable
        loop {
            if shared.cancel_requested.load(Ordering::SeqCst) || *shutdown_rx.borrow() {
                break;
            }
            match shared.store.lease_next_workflow_run(shared.executor_id).await {
                Ok(Some(leased)) => process_run(&shared, leased).await,
                Ok(None) => break,
                Err(e) => {
                    error!("failed to lease workflow run: {e}");
                    break;
                }
            }
        }

        if shared.cancel_requested.load(Ordering::SeqCst) {
            break;
        }
        if shared.drain_requested.load(Ordering::SeqCst) {
            shared.close_once(false).await;
            break;
        }
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            _ = shared.work_notify.notified() => {}
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
    debug!("work loop exited");
}

/// Drive one leased run to rest
async fn process_run(shared: &Shared, leased: LeasedRun) {
    let run_id = leased.run.workflow_run_id;

    if !leased.is_valid {
        // Some task is outside {Waiting, Complete}: settle the run through
        // the completion cascade instead of executing it.
        warn!(%run_id, "leased run has unsettled tasks; settling");
        if let Err(e) = shared.store.complete_workflow_run(run_id).await {
            error!(%run_id, "failed to settle invalid run: {e}");
        }
        return;
    }

    match shared.store.start_workflow_run(run_id, shared.executor_id).await {
        Ok(()) => {}
        Err(StoreError::Precondition(message)) => {
            // The run changed hands between lease and start
            debug!(%run_id, %message, "run no longer startable");
            return;
        }
        Err(e) => {
            error!(%run_id, "failed to start workflow run: {e}");
            return;
        }
    }
    info!(%run_id, "workflow run started");

    loop {
        if shared.cancel_requested.load(Ordering::SeqCst) {
            // close_executor already canceled the run and its tasks
            return;
        }
        if shared.canceled_runs.lock().remove(&run_id) {
            info!(%run_id, "abandoning canceled workflow run");
            return;
        }

        let next = match shared.store.acquire_next_task(run_id).await {
            Ok(Some(next)) => next,
            Ok(None) => break,
            Err(e) => {
                error!(%run_id, "failed to acquire next task: {e}");
                return;
            }
        };
        debug!(%run_id, task_order = next.task_order, url = %next.url, "dispatching task");

        let report = match shared.driver.run_task(&next).await {
            Ok(outcome) => {
                let mut result = Ok(());
                for rule in outcome.rules {
                    if let Err(e) = shared
                        .store
                        .append_task_rule(run_id, next.task_order, rule)
                        .await
                    {
                        result = Err(e);
                        break;
                    }
                }
                match result {
                    Ok(()) => {
                        shared
                            .store
                            .complete_task_run(run_id, next.task_order, outcome.paused, outcome.output)
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            Err(driver_error) => {
                // Transport failures are recorded on the task, not raised
                warn!(%run_id, task_order = next.task_order, "task service failed: {driver_error}");
                shared
                    .store
                    .fail_task_run(run_id, next.task_order, &driver_error.into_failure_message())
                    .await
            }
        };

        match report {
            Ok(()) => {}
            Err(StoreError::Precondition(message)) => {
                // The task changed state under us (canceled, reaped)
                warn!(%run_id, task_order = next.task_order, %message, "task report rejected");
                return;
            }
            Err(e) => {
                error!(%run_id, task_order = next.task_order, "failed to report task result: {e}");
                return;
            }
        }
    }

    if let Err(e) = shared.store.complete_workflow_run(run_id).await {
        error!(%run_id, "failed to complete workflow run: {e}");
        return;
    }
    info!(%run_id, "workflow run settled");
}
