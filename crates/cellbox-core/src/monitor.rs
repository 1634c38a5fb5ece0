//! Sandbox health monitor: a periodic liveness probe of the VMM process,
//! fanned out to watchers over a broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use cellbox_hypervisor::Hypervisor;

/// Default probe interval.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// What the monitor tells its watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The VMM process stopped answering.
    HypervisorDown {
        /// Sandbox the VM belongs to.
        sandbox_id: String,
        /// Probe failure message.
        reason: String,
    },
}

/// Watches the sandbox VM and broadcasts failures.
pub struct SandboxMonitor {
    sender: broadcast::Sender<MonitorEvent>,
    task: Option<JoinHandle<()>>,
}

impl SandboxMonitor {
    /// Starts probing `hypervisor` every `interval`.
    #[must_use]
    pub fn start(
        sandbox_id: &str,
        hypervisor: Arc<dyn Hypervisor>,
        interval: Duration,
    ) -> Self {
        let (sender, _) = broadcast::channel(8);
        let probe_sender = sender.clone();
        let sandbox_id = sandbox_id.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = hypervisor.get_pids().await {
                    warn!(sandbox = %sandbox_id, error = %e, "liveness probe failed");
                    let _ = probe_sender.send(MonitorEvent::HypervisorDown {
                        sandbox_id: sandbox_id.clone(),
                        reason: e.to_string(),
                    });
                    break;
                }
            }
            debug!(sandbox = %sandbox_id, "monitor loop ended");
        });
        Self {
            sender,
            task: Some(task),
        }
    }

    /// A new watcher; it receives every event sent after subscription.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    /// Stops the probe loop.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SandboxMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
