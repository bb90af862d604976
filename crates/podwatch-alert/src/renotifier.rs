//! Background reminder loop for alerts that stay firing.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::evaluator::AlertEvaluator;

const RENOTIFY_INTERVAL: Duration = Duration::from_secs(60);

impl AlertEvaluator {
    /// Runs the one-minute re-notification tick until shutdown.
    pub async fn run_renotifier(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(RENOTIFY_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.process_renotifications() {
                        Ok(sent) if sent > 0 => {
                            tracing::debug!(sent, "Sent periodic alert reminders");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "Re-notification pass failed");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Stopping alert re-notifier");
                    break;
                }
            }
        }
    }
}
