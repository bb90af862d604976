//! Threshold-rule evaluation against ingested snapshots.
//!
//! Every snapshot drives a per-`(node, target, metric)` state machine with
//! dwell time and resolve hysteresis; transitions persist alerts through the
//! store and fan notifications out through the [`podwatch_notify::Notifier`].
//! A background re-notifier paces reminders for alerts that stay firing.

pub mod error;
mod evaluator;
mod renotifier;


pub use error::{EvaluatorError, Result};
pub use evaluator::{AlertEvaluator, FsmState};
