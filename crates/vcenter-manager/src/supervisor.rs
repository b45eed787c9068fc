//! Liveness supervision of the event monitor.
//!
//! The monitor runs as a spawned task. The supervisor probes the
//! hypervisor session on a fixed interval; when a probe fails or times
//! out, or the monitor itself gives up, the task is stopped, the session
//! re-established with exponential backoff and the monitor restarted.
//! A restart always begins with a full sync, so no state carries over.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vcm_common::{Backoff, HypervisorApi, VcmResult};

use crate::config::ManagerConfig;
use crate::dispatcher::Dispatcher;
use crate::monitor::EventMonitor;
use crate::reconciler::Reconciler;
use crate::services::{Clients, Settings};

/// Why the monitor stopped.
#[derive(Debug)]
enum Exit {
    Shutdown,
    /// The session looks dead; the task is still running.
    ProbeFailed(String),
    /// The task finished on its own.
    TaskEnded(String),
}

pub struct Supervisor {
    hypervisor: Arc<dyn HypervisorApi>,
    monitor: Arc<EventMonitor>,
    liveness_timeout: Duration,
    probe_interval: Duration,
    backoff: Backoff,
    restarts: u32,
}

impl Supervisor {
    pub fn new(
        hypervisor: Arc<dyn HypervisorApi>,
        monitor: Arc<EventMonitor>,
        liveness_timeout: Duration,
        probe_interval: Duration,
        backoff: Backoff,
    ) -> Self {
        Self {
            hypervisor,
            monitor,
            liveness_timeout,
            probe_interval,
            backoff,
            restarts: 0,
        }
    }

    /// Wires the whole manager from its configuration.
    pub fn from_config(config: &ManagerConfig, clients: Clients) -> VcmResult<Self> {
        let settings = Arc::new(Settings::from_config(config)?);
        let hypervisor = clients.hypervisor.clone();
        let reconciler = Arc::new(Mutex::new(Reconciler::new(clients, settings)));
        let monitor = EventMonitor::new(
            hypervisor.clone(),
            reconciler,
            Arc::new(Dispatcher::with_default_handlers()),
        );

        Ok(Self::new(
            hypervisor,
            Arc::new(monitor),
            config.liveness_timeout(),
            config.probe_interval(),
            config.backoff(),
        ))
    }

    pub fn reconciler(&self) -> Arc<Mutex<Reconciler>> {
        self.monitor.reconciler()
    }

    /// Number of times the monitor was restarted.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Runs the monitor until `shutdown` is cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) -> VcmResult<()> {
        loop {
            let cancel = shutdown.child_token();
            let monitor = self.monitor.clone();
            let task_cancel = cancel.clone();
            let mut task = tokio::spawn(async move { monitor.run(task_cancel).await });

            let exit = self.watch(&mut task, &shutdown).await;
            cancel.cancel();

            match exit {
                Exit::Shutdown => {
                    self.stop(task).await;
                    info!("Supervisor stopped");
                    return Ok(());
                }
                Exit::ProbeFailed(reason) => {
                    warn!(%reason, "Hypervisor session unhealthy, restarting event monitor");
                    self.stop(task).await;
                }
                Exit::TaskEnded(reason) => {
                    warn!(%reason, "Event monitor stopped, restarting");
                }
            }

            if !self.reconnect(&shutdown).await {
                info!("Supervisor stopped during reconnect");
                return Ok(());
            }
            self.restarts += 1;
        }
    }

    /// Probes the session until it fails, the task ends or shutdown.
    async fn watch(
        &self,
        task: &mut JoinHandle<VcmResult<()>>,
        shutdown: &CancellationToken,
    ) -> Exit {
        let mut ticker = interval(self.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Exit::Shutdown,
                result = &mut *task => {
                    return Exit::TaskEnded(match result {
                        Ok(Ok(())) => "event monitor returned".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => format!("event monitor task failed: {}", e),
                    });
                }
                _ = ticker.tick() => {
                    match timeout(self.liveness_timeout, self.hypervisor.probe()).await {
                        Ok(Ok(())) => debug!("liveness probe ok"),
                        Ok(Err(e)) => return Exit::ProbeFailed(e.to_string()),
                        Err(_) => {
                            return Exit::ProbeFailed(format!(
                                "liveness probe timed out after {:?}",
                                self.liveness_timeout
                            ))
                        }
                    }
                }
            }
        }
    }

    /// Waits for a cancelled task to finish its current batch, aborting it
    /// if it is stuck in a call.
    async fn stop(&self, mut task: JoinHandle<VcmResult<()>>) {
        if timeout(self.liveness_timeout, &mut task).await.is_err() {
            warn!("Event monitor did not stop in time, aborting");
            task.abort();
        }
    }

    /// Re-establishes the session, backing off between attempts. Returns
    /// false when shut down first.
    async fn reconnect(&mut self, shutdown: &CancellationToken) -> bool {
        loop {
            let delay = self.backoff.next_delay();
            info!(
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to hypervisor"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = sleep(delay) => {}
            }

            match self.hypervisor.reconnect().await {
                Ok(()) => {
                    info!("Reconnected to hypervisor");
                    self.backoff.reset();
                    return true;
                }
                Err(e) => error!(error = %e, "Reconnect failed"),
            }
        }
    }
}
