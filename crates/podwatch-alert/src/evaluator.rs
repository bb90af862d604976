use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use podwatch_common::types::NodeSnapshot;
use podwatch_notify::{AlertEvent, Notifier};
use podwatch_store::{
    AlertStore, MetricKind, NewAlert, RuleEntry, TARGET_NODE, TARGET_POD_PREFIX,
};

use crate::error::{EvaluatorError, Result};

/// Per-rule floor between consecutive notifications, on top of the rule's
/// own cadence.
const NOTIFY_FLOOR: Duration = Duration::from_secs(30);

/// Evaluation states are evicted this long after their last update.
const STATE_TTL: Duration = Duration::from_secs(600);

const MIB: f64 = 1024.0 * 1024.0;

/// State machine position for one `(node, target, metric)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Idle,
    Pending,
    Firing,
    Resolving,
}

#[derive(Debug, Clone)]
pub(crate) struct EvaluationState {
    pub(crate) rule_id: String,
    pub(crate) state: FsmState,
    pub(crate) current_value: f64,
    pub(crate) threshold: f64,
    pub(crate) first_seen: DateTime<Utc>,
    pub(crate) last_checked: DateTime<Utc>,
    touched: Instant,
}

type EvalKey = (String, String, MetricKind);

struct EvalInner {
    states: HashMap<EvalKey, EvaluationState>,
    last_notified: HashMap<String, Instant>,
}

/// Single-writer evaluator; shared between the stream ingress path, the
/// re-notifier and the HTTP control plane.
pub struct AlertEvaluator {
    store: Arc<dyn AlertStore>,
    notifier: Arc<dyn Notifier>,
    inner: Mutex<EvalInner>,
}

impl AlertEvaluator {
    pub fn new(store: Arc<dyn AlertStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            inner: Mutex::new(EvalInner {
                states: HashMap::new(),
                last_notified: HashMap::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn AlertStore> {
        &self.store
    }

    /// Evaluates every enabled rule bound to the snapshot's node. One failing
    /// rule never stops evaluation of its siblings.
    pub fn evaluate_snapshot(&self, snapshot: &NodeSnapshot) {
        let rules = match self.store.list_enabled_rules_by_node(&snapshot.node_name) {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!(
                    node_name = %snapshot.node_name,
                    error = %e,
                    "Failed to load rules for snapshot"
                );
                return;
            }
        };

        for rule in rules {
            if let Err(e) = self.evaluate_rule(&rule, snapshot) {
                tracing::warn!(
                    rule_id = %rule.id,
                    node_name = %snapshot.node_name,
                    error = %e,
                    "Rule evaluation failed"
                );
            }
        }

        self.prune_stale_states();
    }

    /// Current FSM position for one key, if the key has been evaluated
    /// recently.
    pub fn state_of(&self, node_name: &str, target: &str, metric: MetricKind) -> Option<FsmState> {
        self.evaluation_state(node_name, target, metric)
            .map(|s| s.state)
    }

    pub(crate) fn evaluation_state(
        &self,
        node_name: &str,
        target: &str,
        metric: MetricKind,
    ) -> Option<EvaluationState> {
        let inner = self.inner.lock().unwrap();
        inner
            .states
            .get(&(node_name.to_string(), target.to_string(), metric))
            .cloned()
    }

    fn evaluate_rule(&self, rule: &RuleEntry, snapshot: &NodeSnapshot) -> Result<()> {
        let value = extract_metric_value(rule, snapshot)?;
        let triggered = rule.operator.check(value, rule.threshold);
        // Transitions run on sample time so dwell measures the monitored
        // node's timeline, not ingest latency.
        let now = snapshot.timestamp;

        let key = (
            snapshot.node_name.clone(),
            rule.target.clone(),
            rule.metric,
        );

        let previous = {
            let mut inner = self.inner.lock().unwrap();
            let state = inner
                .states
                .entry(key.clone())
                .or_insert_with(|| EvaluationState {
                    rule_id: rule.id.clone(),
                    state: FsmState::Idle,
                    current_value: value,
                    threshold: rule.threshold,
                    first_seen: now,
                    last_checked: now,
                    touched: Instant::now(),
                });
            state.rule_id = rule.id.clone();
            state.current_value = value;
            state.threshold = rule.threshold;
            state.last_checked = now;
            state.touched = Instant::now();
            state.state
        };

        let next = match (previous, triggered) {
            (FsmState::Idle, false) => FsmState::Idle,
            (FsmState::Idle, true) => {
                self.set_first_seen(&key, now);
                FsmState::Pending
            }
            (FsmState::Pending, true) => {
                let first_seen = self.first_seen(&key);
                if (now - first_seen).num_seconds() >= rule.duration_seconds {
                    self.fire_alert(rule, value, now)?;
                    FsmState::Firing
                } else {
                    FsmState::Pending
                }
            }
            (FsmState::Pending, false) => FsmState::Idle,
            (FsmState::Firing, true) => FsmState::Firing,
            (FsmState::Firing, false) => {
                let resolve_threshold = rule.resolve_threshold.unwrap_or(rule.threshold);
                if rule.operator.cleared(value, resolve_threshold) {
                    self.resolve_alert(rule, value)?;
                    FsmState::Resolving
                } else {
                    // Inside the hysteresis band.
                    FsmState::Firing
                }
            }
            (FsmState::Resolving, _) => FsmState::Idle,
        };

        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.states.get_mut(&key) {
            state.state = next;
        }
        Ok(())
    }

    fn first_seen(&self, key: &EvalKey) -> DateTime<Utc> {
        let inner = self.inner.lock().unwrap();
        inner
            .states
            .get(key)
            .map(|s| s.first_seen)
            .unwrap_or_else(Utc::now)
    }

    fn set_first_seen(&self, key: &EvalKey, at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.states.get_mut(key) {
            state.first_seen = at;
        }
    }

    /// Dwell satisfied: persist the alert (unless one is already firing for
    /// this key) and send the triggered notification if the limiter allows.
    fn fire_alert(&self, rule: &RuleEntry, value: f64, now: DateTime<Utc>) -> Result<()> {
        if self
            .store
            .get_firing_by_rule(&rule.id, &rule.target, rule.metric)?
            .is_some()
        {
            return Ok(());
        }

        let Some(alert) = self.store.create_alert(NewAlert {
            rule_id: rule.id.clone(),
            node_name: rule.node_name.clone(),
            target: rule.target.clone(),
            metric: rule.metric,
            current_value: value,
            threshold_value: rule.threshold,
            started_at: now,
        })?
        else {
            // Lost the race against another ingest path; the firing alert
            // exists, which is all the invariant asks for.
            return Ok(());
        };

        tracing::info!(
            rule_id = %rule.id,
            alert_id = %alert.id,
            target = %rule.target,
            metric = %rule.metric,
            value,
            "Alert firing"
        );

        let window = Duration::from_secs(rule.notify_frequency_minutes.max(0) as u64 * 60);
        if self.can_notify(&rule.id, window) {
            self.store.update_notification(&alert.id)?;
            self.dispatch(AlertEvent::Triggered, rule.clone(), alert);
        }
        Ok(())
    }

    fn resolve_alert(&self, rule: &RuleEntry, value: f64) -> Result<()> {
        let Some(mut alert) = self
            .store
            .get_firing_by_rule(&rule.id, &rule.target, rule.metric)?
        else {
            return Ok(());
        };

        self.store.resolve_alert(&alert.id)?;
        tracing::info!(
            rule_id = %rule.id,
            alert_id = %alert.id,
            value,
            "Alert resolved"
        );

        // Resolution notifications bypass the anti-spam floor.
        alert.current_value = value;
        self.store.update_notification(&alert.id)?;
        self.dispatch(AlertEvent::Resolved, rule.clone(), alert);
        Ok(())
    }

    /// Manually dismisses a firing alert from the control plane. Returns
    /// `false` when the alert is unknown or no longer firing.
    pub fn dismiss(&self, alert_id: &str) -> Result<bool> {
        let Some(alert) = self.store.get_alert(alert_id)? else {
            return Ok(false);
        };
        if alert.status != podwatch_store::AlertStatus::Firing {
            return Ok(false);
        }

        self.store.resolve_alert(&alert.id)?;

        // Drop the FSM state so the rule may arm again on the next sample.
        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .states
                .remove(&(alert.node_name.clone(), alert.target.clone(), alert.metric));
        }

        if let Some(rule) = self.store.get_rule(&alert.rule_id)? {
            self.dispatch(AlertEvent::Dismissed, rule, alert);
        }
        Ok(true)
    }

    /// One pass of the re-notifier: remind about every firing alert whose
    /// cadence window has elapsed. Returns how many reminders were sent.
    pub fn process_renotifications(&self) -> Result<usize> {
        let firing = self.store.list_firing_with_rule()?;
        let now = Utc::now();
        let mut sent = 0;

        for entry in firing {
            if !needs_renotification(
                entry.alert.last_notified_at,
                entry.rule.notify_frequency_minutes,
                now,
            ) {
                continue;
            }
            if !self.can_notify(&entry.rule.id, NOTIFY_FLOOR) {
                continue;
            }
            self.store.update_notification(&entry.alert.id)?;
            self.dispatch(AlertEvent::Ongoing, entry.rule, entry.alert);
            sent += 1;
        }
        Ok(sent)
    }

    /// Per-rule notification gate. `min_gap` is the caller's cadence window
    /// (the rule's frequency for triggered transitions); the 30 s anti-spam
    /// floor always applies on top. Resolutions and dismissals bypass this
    /// entirely.
    fn can_notify(&self, rule_id: &str, min_gap: Duration) -> bool {
        let gap = min_gap.max(NOTIFY_FLOOR);
        let mut inner = self.inner.lock().unwrap();
        if let Some(last) = inner.last_notified.get(rule_id) {
            if last.elapsed() < gap {
                return false;
            }
        }
        inner
            .last_notified
            .insert(rule_id.to_string(), Instant::now());
        true
    }

    /// Fire-and-forget notification; failures are logged and dropped so the
    /// ingest path never blocks on the webhook.
    fn dispatch(
        &self,
        event: AlertEvent,
        rule: RuleEntry,
        alert: podwatch_store::AlertEntry,
    ) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(event, &rule, &alert).await {
                tracing::warn!(
                    event = %event,
                    rule_id = %rule.id,
                    error = %e,
                    "Notification delivery failed"
                );
            }
        });
    }

    fn prune_stale_states(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.states.retain(|_, s| s.touched.elapsed() < STATE_TTL);
        inner
            .last_notified
            .retain(|_, at| at.elapsed() < STATE_TTL);
    }
}

/// Whether a firing alert is due another reminder.
pub(crate) fn needs_renotification(
    last_notified_at: Option<DateTime<Utc>>,
    notify_frequency_minutes: i64,
    now: DateTime<Utc>,
) -> bool {
    match last_notified_at {
        None => true,
        Some(last) => now - last >= chrono::Duration::minutes(notify_frequency_minutes),
    }
}

/// Pulls the rule's metric out of the snapshot.
pub(crate) fn extract_metric_value(rule: &RuleEntry, snapshot: &NodeSnapshot) -> Result<f64> {
    if rule.target == TARGET_NODE {
        return Ok(match rule.metric {
            MetricKind::Cpu => snapshot.cpu.cpu_percent,
            MetricKind::Memory => snapshot.memory.memory_percent,
            MetricKind::Network => snapshot.network.total_rate,
            MetricKind::Disk => snapshot.disk.total_rate,
        });
    }

    if let Some(pod_name) = rule.target.strip_prefix(TARGET_POD_PREFIX) {
        let pod = snapshot
            .pod(pod_name)
            .ok_or_else(|| EvaluatorError::PodMissing {
                node: snapshot.node_name.clone(),
                pod: pod_name.to_string(),
            })?;
        return Ok(match rule.metric {
            MetricKind::Cpu => pod.cpu.cpu_percent,
            MetricKind::Memory => pod.memory.mem_percent,
            MetricKind::Network => (pod.network.rx_bytes + pod.network.tx_bytes) as f64 / MIB,
            MetricKind::Disk => (pod.disk.read_bytes + pod.disk.write_bytes) as f64 / MIB,
        });
    }

    Err(EvaluatorError::UnsupportedMetric {
        target: rule.target.clone(),
        metric: rule.metric.to_string(),
    })
}
