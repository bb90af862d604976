use crate::{
    AlertStatus, AlertStore, CompareOp, MetricKind, NewAlert, NewRule, RuleUpdate,
    SqliteAlertStore, StoreError,
};
use chrono::Utc;

fn setup() -> SqliteAlertStore {
    SqliteAlertStore::open_in_memory().unwrap()
}

fn cpu_rule(node: &str) -> NewRule {
    NewRule {
        node_name: node.to_string(),
        target: "node".to_string(),
        metric: MetricKind::Cpu,
        operator: CompareOp::Greater,
        threshold: 80.0,
        resolve_threshold: Some(60.0),
        duration_seconds: 10,
        notify_frequency_minutes: 5,
        mention_tag: "@oncall".to_string(),
        enabled: true,
    }
}

fn firing_alert(rule_id: &str, node: &str) -> NewAlert {
    NewAlert {
        rule_id: rule_id.to_string(),
        node_name: node.to_string(),
        target: "node".to_string(),
        metric: MetricKind::Cpu,
        current_value: 92.5,
        threshold_value: 80.0,
        started_at: Utc::now(),
    }
}

#[test]
fn insert_and_get_rule() {
    let store = setup();
    let rule = store.insert_rule(cpu_rule("worker-1")).unwrap();

    let fetched = store.get_rule(&rule.id).unwrap().unwrap();
    assert_eq!(fetched.node_name, "worker-1");
    assert_eq!(fetched.metric, MetricKind::Cpu);
    assert_eq!(fetched.operator, CompareOp::Greater);
    assert_eq!(fetched.resolve_threshold, Some(60.0));
    assert_eq!(fetched.mention_tag, "@oncall");
}

#[test]
fn insert_rejects_bad_resolve_orientation() {
    let store = setup();
    let mut rule = cpu_rule("worker-1");
    // For '>' the resolve threshold must sit at or below the threshold.
    rule.resolve_threshold = Some(90.0);
    assert!(matches!(
        store.insert_rule(rule),
        Err(StoreError::Conflict(_))
    ));

    let mut rule = cpu_rule("worker-1");
    rule.operator = CompareOp::Less;
    rule.threshold = 10.0;
    rule.resolve_threshold = Some(5.0);
    assert!(matches!(
        store.insert_rule(rule),
        Err(StoreError::Conflict(_))
    ));
}

#[test]
fn insert_rejects_zero_notify_frequency() {
    let store = setup();
    let mut rule = cpu_rule("worker-1");
    rule.notify_frequency_minutes = 0;
    assert!(matches!(
        store.insert_rule(rule),
        Err(StoreError::Conflict(_))
    ));
}

#[test]
fn update_rule_applies_partial_fields() {
    let store = setup();
    let rule = store.insert_rule(cpu_rule("worker-1")).unwrap();

    let updated = store
        .update_rule(
            &rule.id,
            RuleUpdate {
                threshold: Some(85.0),
                enabled: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.threshold, 85.0);
    assert!(!updated.enabled);
    // Untouched fields survive.
    assert_eq!(updated.resolve_threshold, Some(60.0));
    assert_eq!(updated.duration_seconds, 10);
}

#[test]
fn update_validates_combined_state() {
    let store = setup();
    let rule = store.insert_rule(cpu_rule("worker-1")).unwrap();

    // Lowering the threshold under the resolve threshold flips orientation.
    let result = store.update_rule(
        &rule.id,
        RuleUpdate {
            threshold: Some(50.0),
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(StoreError::Conflict(_))));
}

#[test]
fn soft_delete_hides_rule_from_lookups() {
    let store = setup();
    let rule = store.insert_rule(cpu_rule("worker-1")).unwrap();

    store.soft_delete_rule(&rule.id).unwrap();
    assert!(store.get_rule(&rule.id).unwrap().is_none());
    assert!(store.list_rules_by_node("worker-1").unwrap().is_empty());
    assert!(matches!(
        store.soft_delete_rule(&rule.id),
        Err(StoreError::NotFound { .. })
    ));
}

#[test]
fn enabled_listing_filters_disabled_rules() {
    let store = setup();
    store.insert_rule(cpu_rule("worker-1")).unwrap();
    let mut disabled = cpu_rule("worker-1");
    disabled.enabled = false;
    disabled.metric = MetricKind::Memory;
    store.insert_rule(disabled).unwrap();

    assert_eq!(store.list_rules_by_node("worker-1").unwrap().len(), 2);
    let enabled = store.list_enabled_rules_by_node("worker-1").unwrap();
    assert_eq!(enabled.len(), 1);
    assert_eq!(enabled[0].metric, MetricKind::Cpu);
}

#[test]
fn rule_writes_invalidate_cached_listings() {
    let store = setup();
    let rule = store.insert_rule(cpu_rule("worker-1")).unwrap();

    // Prime both cache keys.
    assert_eq!(store.list_rules_by_node("worker-1").unwrap().len(), 1);
    assert_eq!(store.list_enabled_rules_by_node("worker-1").unwrap().len(), 1);

    store
        .update_rule(
            &rule.id,
            RuleUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .unwrap();

    assert!(store.list_enabled_rules_by_node("worker-1").unwrap().is_empty());
    assert_eq!(store.list_rules_by_node("worker-1").unwrap().len(), 1);
}

#[test]
fn single_firing_alert_per_rule_key() {
    let store = setup();
    let rule = store.insert_rule(cpu_rule("worker-1")).unwrap();

    let first = store.create_alert(firing_alert(&rule.id, "worker-1")).unwrap();
    assert!(first.is_some());

    // Second firing alert for the same (rule, target, metric) is refused by
    // the partial unique index and reported as a no-op.
    let second = store.create_alert(firing_alert(&rule.id, "worker-1")).unwrap();
    assert!(second.is_none());

    let firing = store.list_firing_by_node("worker-1").unwrap();
    assert_eq!(firing.len(), 1);
}

#[test]
fn resolving_frees_the_firing_slot() {
    let store = setup();
    let rule = store.insert_rule(cpu_rule("worker-1")).unwrap();

    let alert = store
        .create_alert(firing_alert(&rule.id, "worker-1"))
        .unwrap()
        .unwrap();
    store.resolve_alert(&alert.id).unwrap();

    let resolved = store.get_alert(&alert.id).unwrap().unwrap();
    assert_eq!(resolved.status, AlertStatus::Resolved);
    assert!(resolved.resolved_at.is_some());

    assert!(store
        .get_firing_by_rule(&rule.id, "node", MetricKind::Cpu)
        .unwrap()
        .is_none());

    // A new incident for the same key may now fire.
    assert!(store
        .create_alert(firing_alert(&rule.id, "worker-1"))
        .unwrap()
        .is_some());
}

#[test]
fn notification_update_stamps_and_counts() {
    let store = setup();
    let rule = store.insert_rule(cpu_rule("worker-1")).unwrap();
    let alert = store
        .create_alert(firing_alert(&rule.id, "worker-1"))
        .unwrap()
        .unwrap();

    assert!(alert.last_notified_at.is_none());
    store.update_notification(&alert.id).unwrap();
    store.update_notification(&alert.id).unwrap();

    let updated = store.get_alert(&alert.id).unwrap().unwrap();
    assert_eq!(updated.notification_count, 2);
    assert!(updated.last_notified_at.is_some());
}

#[test]
fn firing_with_rule_joins_notify_frequency() {
    let store = setup();
    let rule = store.insert_rule(cpu_rule("worker-1")).unwrap();
    store
        .create_alert(firing_alert(&rule.id, "worker-1"))
        .unwrap()
        .unwrap();

    let joined = store.list_firing_with_rule().unwrap();
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].rule.notify_frequency_minutes, 5);
    assert_eq!(joined[0].alert.rule_id, rule.id);
}

#[test]
fn history_is_bounded_by_days_and_limit() {
    let store = setup();
    let rule = store.insert_rule(cpu_rule("worker-1")).unwrap();

    for i in 0..3 {
        let mut alert = firing_alert(&rule.id, "worker-1");
        alert.started_at = Utc::now() - chrono::Duration::hours(i);
        let created = store.create_alert(alert).unwrap().unwrap();
        store.resolve_alert(&created.id).unwrap();
    }

    let history = store.list_history_by_node("worker-1", 7, 2).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].started_at >= history[1].started_at);

    assert!(store.list_history_by_node("worker-1", 7, 100).unwrap().len() >= 3);
    assert!(store.list_history_by_node("other", 7, 100).unwrap().is_empty());
}
