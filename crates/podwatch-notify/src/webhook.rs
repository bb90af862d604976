//! Webhook channel posting embed-style JSON messages.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use podwatch_store::{AlertEntry, MetricKind, RuleEntry};
use serde_json::{json, Value};

use crate::error::{NotifyError, Result};
use crate::{AlertEvent, Notifier};

const COLOR_RED: u32 = 15_158_332;
const COLOR_ORANGE: u32 = 15_105_570;
const COLOR_GREEN: u32 = 3_066_993;
const COLOR_GRAY: u32 = 9_807_270;

pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("default TLS backend available"),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: AlertEvent, rule: &RuleEntry, alert: &AlertEntry) -> Result<()> {
        let body = render_message(event, rule, alert);
        let response = self.client.post(&self.url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(
            event = %event,
            rule_id = %rule.id,
            alert_id = %alert.id,
            "Webhook notification delivered"
        );
        Ok(())
    }
}

fn metric_unit(metric: MetricKind) -> &'static str {
    match metric {
        MetricKind::Cpu | MetricKind::Memory => "%",
        MetricKind::Network | MetricKind::Disk => " MiB/s",
    }
}

fn event_heading(event: AlertEvent) -> (&'static str, u32) {
    match event {
        AlertEvent::Triggered => ("ALERT TRIGGERED", COLOR_RED),
        AlertEvent::Ongoing => ("ALERT ONGOING", COLOR_ORANGE),
        AlertEvent::Resolved => ("ALERT RESOLVED", COLOR_GREEN),
        AlertEvent::Dismissed => ("ALERT DISMISSED", COLOR_GRAY),
    }
}

/// Builds the embed payload. The rule's mention tag rides along verbatim in
/// the top-level `content` field.
fn render_message(event: AlertEvent, rule: &RuleEntry, alert: &AlertEntry) -> Value {
    let (title, color) = event_heading(event);
    let unit = metric_unit(rule.metric);
    let active_for = (Utc::now() - alert.started_at).num_seconds().max(0);

    json!({
        "content": rule.mention_tag,
        "embeds": [{
            "title": title,
            "description": format!("Alert {event} for {}", rule.target),
            "color": color,
            "timestamp": Utc::now().to_rfc3339(),
            "fields": [
                { "name": "Node", "value": rule.node_name, "inline": true },
                { "name": "Target", "value": rule.target, "inline": true },
                { "name": "Metric", "value": rule.metric.to_string(), "inline": true },
                {
                    "name": "Current Value",
                    "value": format!("{:.2}{unit}", alert.current_value),
                    "inline": true
                },
                {
                    "name": "Threshold",
                    "value": format!("{} {:.2}{unit}", rule.operator, rule.threshold),
                    "inline": true
                },
                { "name": "Active For", "value": format!("{active_for}s"), "inline": true },
            ],
        }],
    })
}
