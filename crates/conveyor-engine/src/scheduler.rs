//! Job scheduler loop
//!
//! Driven by the `jobs` topic with interval polling as the fallback. Each
//! tick settles jobs whose current run reached a terminal status, then fires
//! the due members of the queued-jobs view.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use conveyor_core::Topic;
use conveyor_store::{EngineStore, StoreError};

use crate::config::SchedulerConfig;

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Scheduler already started
    #[error("job scheduler is already started")]
    AlreadyStarted,
}

/// The long-running job scheduler
pub struct JobScheduler {
    store: Arc<dyn EngineStore>,
    config: SchedulerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn EngineStore>, config: SchedulerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            config,
            shutdown_tx,
            shutdown_rx,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the scheduler loop
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.handle.lock().is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let subscription = self.store.subscribe(&[Topic::Jobs]).await?;
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut subscription = subscription;
            info!("job scheduler started");
            loop {
                if let Err(e) = tick(store.as_ref()).await {
                    error!("scheduler tick failed: {e}");
                }

                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    result = subscription.recv() => {
                        if let Err(e) = result {
                            warn!("jobs subscription error: {e}");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
            debug!("scheduler loop exited");
        });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the scheduler loop
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("job scheduler stopped");
    }
}

/// One scheduler pass: settle terminated runs, then fire due jobs
pub async fn tick(store: &dyn EngineStore) -> Result<(), SchedulerError> {
    // Settle jobs whose current run is no longer active
    for view in store.list_jobs().await? {
        let job_id = view.job.job_id;
        let Some(status) = view.current_run_status else {
            continue;
        };
        if !status.settles_job() {
            continue;
        }
        match store.complete_job(job_id).await {
            Ok(None) => info!(%job_id, "job settled"),
            Ok(Some(reason)) => warn!(%job_id, %reason, "job paused"),
            // Another scheduler instance may have raced us
            Err(StoreError::Precondition(message)) => debug!(%job_id, %message, "settle skipped"),
            Err(e) => return Err(e.into()),
        }
    }

    // Fire the due members of the queued set
    let now = Utc::now();
    for job in store.queued_jobs().await? {
        if job.next_run > now {
            break;
        }
        match store.run_job(job.job_id).await {
            Ok(workflow_run_id) => {
                info!(job_id = %job.job_id, %workflow_run_id, "fired job");
            }
            Err(StoreError::Precondition(message)) => {
                debug!(job_id = %job.job_id, %message, "job not runnable");
            }
            Err(e) => {
                error!(job_id = %job.job_id, "failed to run job: {e}");
            }
        }
    }
    Ok(())
}
