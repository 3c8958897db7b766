//! Background durability loop for the counter store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::counter::PersistentKeyCounter;
use crate::error::{ClickrankError, Result};

/// Handle to a running periodic sync task.
///
/// Dropping the handle leaves the task running for the rest of the process;
/// call [`shutdown`](Self::shutdown) to stop it with a final flush.
pub struct SyncTask {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl SyncTask {
    /// Stop the loop and wait for its final flush.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.handle
            .await
            .map_err(|e| ClickrankError::Internal(format!("sync task failed: {}", e)))
    }
}

impl PersistentKeyCounter {
    /// Start a task that flushes the store every `interval`.
    ///
    /// Each flush runs on the blocking pool and holds the store lock only for
    /// the commit itself. Failures are logged and retried on the next tick.
    pub fn run_periodic_sync(self: &Arc<Self>, interval: Duration) -> SyncTask {
        let counter = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Starting counter sync loop");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut detached = false;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match flush_blocking(&counter).await {
                            Ok(()) => {}
                            Err(e @ ClickrankError::RolledBack(_)) => {
                                warn!(error = %e, "Counter sync lost pending increments");
                            }
                            Err(e) => warn!(error = %e, "Counter sync failed, retrying next interval"),
                        }
                    }
                    signal = &mut shutdown_rx, if !detached => {
                        if signal.is_ok() {
                            break;
                        }
                        debug!("Sync handle dropped, loop continues for the process lifetime");
                        detached = true;
                    }
                }
            }

            match flush_blocking(&counter).await {
                Ok(()) => info!("Counter sync loop stopped after final flush"),
                Err(e) => warn!(error = %e, "Final counter flush failed"),
            }
        });

        SyncTask {
            shutdown_tx,
            handle,
        }
    }
}

async fn flush_blocking(counter: &Arc<PersistentKeyCounter>) -> Result<()> {
    let counter = Arc::clone(counter);
    tokio::task::spawn_blocking(move || counter.flush())
        .await
        .map_err(|e| ClickrankError::Internal(format!("flush task failed: {}", e)))?
}
