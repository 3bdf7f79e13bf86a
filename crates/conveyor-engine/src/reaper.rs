//! Executor-liveness reaper loop
//!
//! Periodically runs `clean_executors`, the only mechanism that recovers
//! from an executor process vanishing without calling close.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use conveyor_store::EngineStore;

use crate::config::ReaperConfig;

/// Interval loop around `clean_executors`
pub struct ExecutorReaper {
    store: Arc<dyn EngineStore>,
    config: ReaperConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutorReaper {
    pub fn new(store: Arc<dyn EngineStore>, config: ReaperConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            config,
            shutdown_tx,
            shutdown_rx,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the reaper loop
    pub fn start(&self) {
        if self.handle.lock().is_some() {
            return;
        }
        let store = Arc::clone(&self.store);
        let interval = self.config.interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.clean_executors().await {
                            Ok(reaped) => {
                                if !reaped.is_empty() {
                                    warn!(count = reaped.len(), "reaped vanished executors");
                                }
                            }
                            Err(e) => {
                                error!("executor reaping failed: {e}");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("reaper loop exited");
        });
        *self.handle.lock() = Some(handle);
        info!("executor reaper started");
    }

    /// Stop the reaper loop
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("executor reaper stopped");
    }
}
