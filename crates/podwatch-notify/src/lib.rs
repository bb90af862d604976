//! Notification sink for alert lifecycle events.
//!
//! The evaluator and the re-notifier talk to an opaque [`Notifier`]; the
//! default implementation posts embed-style JSON to a chat webhook. Delivery
//! failures are the caller's to log and drop; they never block alert
//! persistence.

pub mod error;
mod webhook;

pub use error::{NotifyError, Result};
pub use webhook::WebhookNotifier;

use std::fmt;

use async_trait::async_trait;
use podwatch_store::{AlertEntry, RuleEntry};

/// Which lifecycle transition a notification announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEvent {
    Triggered,
    Ongoing,
    Resolved,
    Dismissed,
}

impl fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertEvent::Triggered => write!(f, "triggered"),
            AlertEvent::Ongoing => write!(f, "ongoing"),
            AlertEvent::Resolved => write!(f, "resolved"),
            AlertEvent::Dismissed => write!(f, "dismissed"),
        }
    }
}

/// Sink for alert notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: AlertEvent, rule: &RuleEntry, alert: &AlertEntry) -> Result<()>;
}

/// Fallback sink used when no webhook is configured; events only hit the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: AlertEvent, rule: &RuleEntry, alert: &AlertEntry) -> Result<()> {
        tracing::info!(
            event = %event,
            rule_id = %rule.id,
            target = %rule.target,
            metric = %rule.metric,
            value = alert.current_value,
            threshold = rule.threshold,
            "Alert notification"
        );
        Ok(())
    }
}
