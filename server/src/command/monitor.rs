//! Stall monitor for outstanding tasks

use super::correlator::{StalledTask, TaskCorrelator};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};

/// Periodically reports tasks that have been outstanding for too long
///
/// Purely observational: stalled tasks are left running. Their bound comes
/// from the handler itself (the OS command timeout) or from shutdown.
pub struct StallMonitor {
    correlator: TaskCorrelator,
    threshold: Duration,
    check_interval: Duration,
}

impl StallMonitor {
    pub fn new(correlator: TaskCorrelator, threshold: Duration) -> Self {
        Self {
            correlator,
            threshold,
            check_interval: Duration::from_millis(1000), // Check every second
        }
    }

    #[cfg(test)]
    pub fn with_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// Run the monitoring loop forever
    pub async fn run(&self) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.check().await;
        }
    }

    /// One pass over the outstanding tasks
    pub async fn check(&self) -> Vec<StalledTask> {
        let stalled = self.correlator.stalled(self.threshold).await;

        for task in &stalled {
            warn!(
                task_id = %task.task_id,
                caller = %task.caller,
                command_type = %task.command_type,
                age_ms = task.age.as_millis() as u64,
                "Task outstanding longer than expected"
            );
        }
        if stalled.is_empty() {
            let outstanding = self.correlator.len().await;
            if outstanding > 0 {
                debug!(outstanding, "Outstanding tasks within threshold");
            }
        }

        stalled
    }
}
