//! Persistence for threshold rules and firing alerts.
//!
//! The [`AlertStore`] trait is the narrow API the evaluator and the HTTP
//! control plane mutate through; [`SqliteAlertStore`] is the default
//! implementation. The single-firing invariant — at most one `firing` alert
//! per `(rule_id, target, metric)` — is enforced both by the
//! `get_firing_by_rule` guard in the evaluator and a partial unique index in
//! the schema.

pub mod error;
mod sqlite;

#[cfg(test)]
mod tests;

pub use error::{Result, StoreError};
pub use sqlite::SqliteAlertStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Rule target for node-scoped rules; pod rules use `pod:<name>`.
pub const TARGET_NODE: &str = "node";
/// Prefix marking a pod-scoped rule target.
pub const TARGET_POD_PREFIX: &str = "pod:";

/// Which derived metric a rule evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Cpu,
    Memory,
    Network,
    Disk,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Cpu => write!(f, "cpu"),
            MetricKind::Memory => write!(f, "memory"),
            MetricKind::Network => write!(f, "network"),
            MetricKind::Disk => write!(f, "disk"),
        }
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(MetricKind::Cpu),
            "memory" => Ok(MetricKind::Memory),
            "network" => Ok(MetricKind::Network),
            "disk" => Ok(MetricKind::Disk),
            _ => Err(format!("unknown metric kind: {s}")),
        }
    }
}

/// Threshold comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessEqual,
}

impl CompareOp {
    /// Applies the operator: `value <op> threshold`.
    pub fn check(self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Greater => value > threshold,
            CompareOp::GreaterEqual => value >= threshold,
            CompareOp::Less => value < threshold,
            CompareOp::LessEqual => value <= threshold,
        }
    }

    /// Whether the value has cleared the hysteresis band: strictly below the
    /// resolve threshold for `>`-family operators, strictly above for the
    /// `<`-family.
    pub fn cleared(self, value: f64, resolve_threshold: f64) -> bool {
        match self {
            CompareOp::Greater | CompareOp::GreaterEqual => value < resolve_threshold,
            CompareOp::Less | CompareOp::LessEqual => value > resolve_threshold,
        }
    }

    /// Whether `resolve_threshold` lies on the resolving side of `threshold`
    /// for this operator.
    pub fn resolve_orientation_ok(self, threshold: f64, resolve_threshold: f64) -> bool {
        match self {
            CompareOp::Greater | CompareOp::GreaterEqual => resolve_threshold <= threshold,
            CompareOp::Less | CompareOp::LessEqual => resolve_threshold >= threshold,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompareOp::Greater => write!(f, ">"),
            CompareOp::GreaterEqual => write!(f, ">="),
            CompareOp::Less => write!(f, "<"),
            CompareOp::LessEqual => write!(f, "<="),
        }
    }
}

impl FromStr for CompareOp {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            ">" => Ok(CompareOp::Greater),
            ">=" => Ok(CompareOp::GreaterEqual),
            "<" => Ok(CompareOp::Less),
            "<=" => Ok(CompareOp::LessEqual),
            _ => Err(format!("unknown operator: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertStatus::Firing => write!(f, "firing"),
            AlertStatus::Resolved => write!(f, "resolved"),
        }
    }
}

impl FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "firing" => Ok(AlertStatus::Firing),
            "resolved" => Ok(AlertStatus::Resolved),
            _ => Err(format!("unknown alert status: {s}")),
        }
    }
}

/// A persisted threshold rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEntry {
    pub id: String,
    pub node_name: String,
    /// `"node"` or `"pod:<name>"`.
    pub target: String,
    pub metric: MetricKind,
    pub operator: CompareOp,
    pub threshold: f64,
    /// Lower (or upper, for `<`-family operators) edge of the hysteresis
    /// band; `None` degenerates to the threshold itself.
    pub resolve_threshold: Option<f64>,
    /// Dwell: how long the condition must hold before an alert fires.
    pub duration_seconds: i64,
    pub notify_frequency_minutes: i64,
    /// Opaque string handed to the notifier verbatim (chat mentions).
    pub mention_tag: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for rule creation; id and timestamps are assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub node_name: String,
    pub target: String,
    pub metric: MetricKind,
    pub operator: CompareOp,
    pub threshold: f64,
    #[serde(default)]
    pub resolve_threshold: Option<f64>,
    #[serde(default = "default_duration_seconds")]
    pub duration_seconds: i64,
    #[serde(default = "default_notify_frequency_minutes")]
    pub notify_frequency_minutes: i64,
    #[serde(default)]
    pub mention_tag: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_duration_seconds() -> i64 {
    60
}

fn default_notify_frequency_minutes() -> i64 {
    5
}

fn default_enabled() -> bool {
    true
}

/// Partial update for an existing rule. `resolve_threshold` is doubly
/// optional so a request can clear it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub operator: Option<CompareOp>,
    pub threshold: Option<f64>,
    #[serde(default, with = "double_option")]
    pub resolve_threshold: Option<Option<f64>>,
    pub duration_seconds: Option<i64>,
    pub notify_frequency_minutes: Option<i64>,
    pub mention_tag: Option<String>,
    pub enabled: Option<bool>,
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, T>(value: &Option<Option<T>>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match value {
            Some(inner) => inner.serialize(s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, T>(d: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(d).map(Some)
    }
}

/// A persisted alert, firing or historical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEntry {
    pub id: String,
    pub rule_id: String,
    pub node_name: String,
    pub target: String,
    pub metric: MetricKind,
    pub status: AlertStatus,
    pub current_value: f64,
    pub threshold_value: f64,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub notification_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for alert creation; id and timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub rule_id: String,
    pub node_name: String,
    pub target: String,
    pub metric: MetricKind,
    pub current_value: f64,
    pub threshold_value: f64,
    pub started_at: DateTime<Utc>,
}

/// A firing alert joined with its rule, for the re-notifier.
#[derive(Debug, Clone)]
pub struct FiringAlert {
    pub alert: AlertEntry,
    pub rule: RuleEntry,
}

/// Transactional persistence of rules and alerts with indexed lookups.
///
/// Implementations must be `Send + Sync`: the store is shared between the
/// stream ingress path, the re-notifier and the HTTP API.
pub trait AlertStore: Send + Sync {
    fn insert_rule(&self, rule: NewRule) -> Result<RuleEntry>;
    fn update_rule(&self, id: &str, update: RuleUpdate) -> Result<RuleEntry>;
    /// Marks the rule deleted without dropping the row (history keeps its
    /// foreign references).
    fn soft_delete_rule(&self, id: &str) -> Result<()>;
    fn get_rule(&self, id: &str) -> Result<Option<RuleEntry>>;
    fn list_rules_by_node(&self, node_name: &str) -> Result<Vec<RuleEntry>>;
    fn list_enabled_rules_by_node(&self, node_name: &str) -> Result<Vec<RuleEntry>>;

    /// Creates a firing alert. Returns `None` when one is already firing for
    /// the same `(rule_id, target, metric)` key.
    fn create_alert(&self, alert: NewAlert) -> Result<Option<AlertEntry>>;
    /// Sets status to resolved and stamps `resolved_at`.
    fn resolve_alert(&self, id: &str) -> Result<()>;
    fn get_alert(&self, id: &str) -> Result<Option<AlertEntry>>;
    fn get_firing_by_rule(
        &self,
        rule_id: &str,
        target: &str,
        metric: MetricKind,
    ) -> Result<Option<AlertEntry>>;
    fn list_firing_by_node(&self, node_name: &str) -> Result<Vec<AlertEntry>>;
    fn list_history_by_node(
        &self,
        node_name: &str,
        days: i64,
        limit: usize,
    ) -> Result<Vec<AlertEntry>>;
    /// Stamps `last_notified_at` and increments the notification counter.
    fn update_notification(&self, id: &str) -> Result<()>;
    /// All firing alerts joined with their rules, for the re-notifier.
    fn list_firing_with_rule(&self) -> Result<Vec<FiringAlert>>;
}
