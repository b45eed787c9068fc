//! The event loop: full sync, then apply change batches as they arrive.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vcm_common::{HypervisorApi, VcmResult};

use crate::dispatcher::Dispatcher;
use crate::reconciler::Reconciler;

/// Waits for hypervisor changes and dispatches them under the lock.
pub struct EventMonitor {
    hypervisor: Arc<dyn HypervisorApi>,
    reconciler: Arc<Mutex<Reconciler>>,
    dispatcher: Arc<Dispatcher>,
}

impl EventMonitor {
    pub fn new(
        hypervisor: Arc<dyn HypervisorApi>,
        reconciler: Arc<Mutex<Reconciler>>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            hypervisor,
            reconciler,
            dispatcher,
        }
    }

    pub fn reconciler(&self) -> Arc<Mutex<Reconciler>> {
        self.reconciler.clone()
    }

    /// Runs until cancelled or until the connection is lost.
    ///
    /// Cancellation is only observed while waiting for the next batch: a
    /// full sync or a batch, once started, runs to completion. The lock is
    /// not held while waiting.
    pub async fn run(&self, cancel: CancellationToken) -> VcmResult<()> {
        self.reconciler.lock().await.full_sync().await?;
        info!("Watching for changes");

        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Event monitor stopping");
                    return Ok(());
                }
                batch = self.hypervisor.wait_for_change_batch() => batch?,
            };

            let Some(batch) = batch.filter(|b| !b.is_empty()) else {
                continue;
            };
            debug!(updates = batch.updates.len(), "applying change batch");
            let mut reconciler = self.reconciler.lock().await;
            self.dispatcher.dispatch(&mut reconciler, &batch).await?;
        }
    }
}
